//! Licensing runtime for FPGA accelerators.
//!
//! A [`DrmManager`] decides whether the activators of a design may run. It
//! meters their usage through a caller-supplied [`RegisterPort`] and keeps a
//! license valid against the License Web Service, or installs a node-locked
//! license from disk.

pub mod config;
pub mod error;
pub mod license;
pub mod logging;
pub mod metering;
pub mod register;
mod reporter;
pub mod ws_client;

pub use config::{Config, Credentials, RetryPolicy, Settings};
pub use error::{DrmError, ErrorCode, ErrorEvent, Result, error_code, error_details};
pub use license::{DrmManager, ParameterKey, StateName};
pub use register::{ActivatorLayout, ActivatorStatus, CallbackPort, RegisterPort};
pub use reporter::ErrorObserver;
