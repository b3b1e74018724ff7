//! Register access port supplied by the caller.
//!
//! The runtime never owns hardware access. It only reads and writes 32-bit
//! registers through a [`RegisterPort`], at addresses derived from an
//! [`ActivatorLayout`].

use std::{fmt, io, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::error::{DrmError, Result};

/// Offset of the status register within an activator's range.
pub const STATUS_OFFSET: u64 = 0x0;
/// Offset of the free-running coin counter within an activator's range.
pub const COUNTER_OFFSET: u64 = 0x4;

pub const STATUS_ACTIVE_BIT: u32 = 1 << 0;
pub const STATUS_READY_BIT: u32 = 1 << 1;

/// Capability pair used to reach the FPGA registers.
pub trait RegisterPort: Send + Sync {
    fn read(&self, address: u64) -> io::Result<u32>;
    fn write(&self, address: u64, value: u32) -> io::Result<()>;
}

impl<P: RegisterPort + ?Sized> RegisterPort for Arc<P> {
    fn read(&self, address: u64) -> io::Result<u32> {
        (**self).read(address)
    }

    fn write(&self, address: u64, value: u32) -> io::Result<()> {
        (**self).write(address, value)
    }
}

/// Adapts a pair of read/write callbacks into a [`RegisterPort`].
pub struct CallbackPort<R, W> {
    read: R,
    write: W,
}

impl<R, W> CallbackPort<R, W>
where
    R: Fn(u64) -> io::Result<u32> + Send + Sync,
    W: Fn(u64, u32) -> io::Result<()> + Send + Sync,
{
    pub fn new(read: R, write: W) -> Self {
        Self { read, write }
    }
}

impl<R, W> RegisterPort for CallbackPort<R, W>
where
    R: Fn(u64) -> io::Result<u32> + Send + Sync,
    W: Fn(u64, u32) -> io::Result<()> + Send + Sync,
{
    fn read(&self, address: u64) -> io::Result<u32> {
        (self.read)(address)
    }

    fn write(&self, address: u64, value: u32) -> io::Result<()> {
        (self.write)(address, value)
    }
}

impl<R, W> fmt::Debug for CallbackPort<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackPort").finish_non_exhaustive()
    }
}

/// Where the activators live in the register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActivatorLayout {
    pub base_address: u64,
    pub address_range: u64,
    pub count: u32,
}

impl Default for ActivatorLayout {
    fn default() -> Self {
        Self {
            base_address: 0,
            address_range: 0x10,
            count: 1,
        }
    }
}

impl ActivatorLayout {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.count > 1 && self.address_range <= COUNTER_OFFSET {
            return Err(DrmError::bad_arg(format!(
                "Activator address_range ({:#x}) is too small to hold the status and counter registers",
                self.address_range
            )));
        }
        Ok(())
    }

    pub fn activator_base(&self, index: u32) -> u64 {
        self.base_address + u64::from(index) * self.address_range
    }

    pub fn status_address(&self, index: u32) -> u64 {
        self.activator_base(index) + STATUS_OFFSET
    }

    pub fn counter_address(&self, index: u32) -> u64 {
        self.activator_base(index) + COUNTER_OFFSET
    }
}

/// Decoded activator status register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActivatorStatus {
    pub active: bool,
    pub ready: bool,
}

impl From<u32> for ActivatorStatus {
    fn from(value: u32) -> Self {
        Self {
            active: value & STATUS_ACTIVE_BIT != 0,
            ready: value & STATUS_READY_BIT != 0,
        }
    }
}

pub(crate) fn read_register(port: &dyn RegisterPort, address: u64) -> Result<u32> {
    port.read(address).map_err(|err| DrmError::HardwareAccess {
        address,
        message: format!("read failed: {err}"),
    })
}

pub(crate) fn write_register(port: &dyn RegisterPort, address: u64, value: u32) -> Result<()> {
    port.write(address, value)
        .map_err(|err| DrmError::HardwareAccess {
            address,
            message: format!("write of {value:#x} failed: {err}"),
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn addresses_follow_layout() {
        let layout = ActivatorLayout {
            base_address: 0x1_0000,
            address_range: 0x100,
            count: 3,
        };

        assert_eq!(layout.status_address(0), 0x1_0000);
        assert_eq!(layout.counter_address(0), 0x1_0004);
        assert_eq!(layout.status_address(2), 0x1_0200);
        layout.validate().unwrap();
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let layout = ActivatorLayout {
            base_address: 0,
            address_range: 4,
            count: 2,
        };
        assert!(layout.validate().is_err());
    }

    #[test]
    fn status_bits_decode() {
        assert_eq!(
            ActivatorStatus::from(0b10),
            ActivatorStatus {
                active: false,
                ready: true
            }
        );
        assert!(ActivatorStatus::from(0b01).active);
    }

    #[test]
    fn callback_port_errors_become_hardware_errors() {
        let written = Mutex::new(Vec::new());
        let port = CallbackPort::new(
            |address| {
                if address == 0xdead {
                    Err(io::Error::other("bus error"))
                } else {
                    Ok(7)
                }
            },
            |address, value| {
                written.lock().unwrap().push((address, value));
                Ok(())
            },
        );

        assert_eq!(read_register(&port, 0x4).unwrap(), 7);
        let err = read_register(&port, 0xdead).unwrap_err();
        assert!(err.to_string().contains("0xdead"));
        assert!(err.to_string().contains("[errCode=10006]"));

        write_register(&port, 0x0, 1).unwrap();
        assert_eq!(*written.lock().unwrap(), vec![(0x0, 1)]);
    }
}
