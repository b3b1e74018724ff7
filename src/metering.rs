use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::error::Result;
use crate::register::{
    ActivatorLayout, ActivatorStatus, RegisterPort, STATUS_ACTIVE_BIT, read_register,
    write_register,
};

/// Number of recent deltas kept per activator for diagnostics.
const RECENT_DELTAS: usize = 64;

/// Counter state of one activator.
///
/// Every register access for the activator happens while this slot is locked.
#[derive(Debug, Default)]
pub(crate) struct ActivatorCounter {
    last_raw: Option<u32>,
    cumulative: u64,
    recent_deltas: VecDeque<u64>,
}

impl ActivatorCounter {
    /// Applies a raw sample, returning the delta since the previous one.
    ///
    /// A raw value lower than the previous one is taken as a wrap of the
    /// 32-bit counter.
    fn apply(&mut self, raw: u32) -> u64 {
        let delta = match self.last_raw {
            None => 0,
            Some(prev) => wrapping_delta(prev, raw),
        };

        self.last_raw = Some(raw);
        self.cumulative += delta;

        if delta > 0 {
            if self.recent_deltas.len() == RECENT_DELTAS {
                self.recent_deltas.pop_front();
            }
            self.recent_deltas.push_back(delta);
        }

        delta
    }

    fn rebaseline(&mut self, raw: u32) {
        self.last_raw = Some(raw);
        self.cumulative = 0;
        self.recent_deltas.clear();
    }
}

pub(crate) fn wrapping_delta(prev: u32, curr: u32) -> u64 {
    if curr >= prev {
        u64::from(curr - prev)
    } else {
        u64::from(u32::MAX - prev) + u64::from(curr) + 1
    }
}

/// Converts raw activator counter samples into a monotonic usage figure.
pub struct MeteringAccumulator {
    port: Arc<dyn RegisterPort>,
    layout: ActivatorLayout,
    activators: Vec<Mutex<ActivatorCounter>>,
    cumulative: AtomicU64,
}

impl std::fmt::Debug for MeteringAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteringAccumulator")
            .field("layout", &self.layout)
            .field("cumulative", &self.cumulative())
            .finish_non_exhaustive()
    }
}

impl MeteringAccumulator {
    pub fn new(port: Arc<dyn RegisterPort>, layout: ActivatorLayout) -> Self {
        Self {
            port,
            layout,
            activators: (0..layout.count)
                .map(|_| Mutex::new(ActivatorCounter::default()))
                .collect(),
            cumulative: AtomicU64::new(0),
        }
    }

    pub fn num_activators(&self) -> u32 {
        self.layout.count
    }

    /// Cumulative usage since the last reset.
    pub fn cumulative(&self) -> u64 {
        self.cumulative.load(Ordering::Acquire)
    }

    /// Samples every activator counter and folds the deltas into the total.
    ///
    /// Returns the new total.
    #[instrument(level = "trace", skip(self))]
    pub async fn sample(&self) -> Result<u64> {
        for (index, slot) in (0u32..).zip(&self.activators) {
            let mut counter = slot.lock().await;
            let raw = read_register(self.port.as_ref(), self.layout.counter_address(index))?;
            let delta = counter.apply(raw);

            if delta > 0 {
                // Published while the slot is held so a reader never sees a
                // delta in the activator total but not in the global one.
                self.cumulative.fetch_add(delta, Ordering::AcqRel);
                trace!(activator = index, raw, delta, "Metering delta applied");
            }
        }

        Ok(self.cumulative())
    }

    /// Zeroes the total and takes the current raw counters as the new origin.
    pub async fn reset(&self) -> Result<()> {
        for (index, slot) in (0u32..).zip(&self.activators) {
            let mut counter = slot.lock().await;
            let raw = read_register(self.port.as_ref(), self.layout.counter_address(index))?;

            debug!(
                activator = index,
                old_cumulative = counter.cumulative,
                baseline = raw,
                "Resetting metering counter"
            );
            counter.rebaseline(raw);
        }

        self.cumulative.store(0, Ordering::Release);
        Ok(())
    }

    /// Recent non-zero deltas observed on one activator, oldest first.
    #[cfg(test)]
    pub(crate) async fn recent_deltas(&self, index: u32) -> Vec<u64> {
        match self.activators.get(index as usize) {
            Some(slot) => slot.lock().await.recent_deltas.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Sets or clears the active flag of every activator.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        for (index, slot) in (0u32..).zip(&self.activators) {
            let _counter = slot.lock().await;
            let address = self.layout.status_address(index);
            let status = read_register(self.port.as_ref(), address)?;
            let value = if enabled {
                status | STATUS_ACTIVE_BIT
            } else {
                status & !STATUS_ACTIVE_BIT
            };

            if value != status {
                write_register(self.port.as_ref(), address, value)?;
            }
        }

        debug!(enabled, activators = self.layout.count, "Activator gating updated");
        Ok(())
    }

    /// Best-effort variant of [`Self::set_enabled`] for paths that must not fail.
    pub(crate) async fn try_set_enabled(&self, enabled: bool) {
        if let Err(err) = self.set_enabled(enabled).await {
            warn!(enabled, "Failed to update activator gating: {err}");
        }
    }

    pub async fn statuses(&self) -> Result<Vec<ActivatorStatus>> {
        let mut statuses = Vec::with_capacity(self.activators.len());

        for (index, slot) in (0u32..).zip(&self.activators) {
            let _counter = slot.lock().await;
            let value = read_register(self.port.as_ref(), self.layout.status_address(index))?;
            statuses.push(ActivatorStatus::from(value));
        }

        Ok(statuses)
    }
}
