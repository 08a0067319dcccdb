//! Host-side control session for devices in recovery or DFU mode
//!
//! Finds a device by vendor and product code, claims and opens it, decodes
//! the identity string it reports, and exchanges control requests over its
//! default pipe, including asynchronous requests cancelled after a deadline.
//!
//! # Example
//!
//! ```no_run
//! use host::usb::{AcquirePolicy, OpenPolicy, RecoveryClient, RusbBackend};
//! use protocol::DeviceMode;
//!
//! let backend = RusbBackend::new()?;
//! let mut client = RecoveryClient::new(backend, OpenPolicy::default(), AcquirePolicy::default());
//! let session = client.acquire_within_seconds(DeviceMode::Dfu, 10)?;
//! if let Some(info) = session.device_info() {
//!     println!("{}", info);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;

pub use config::HostConfig;
pub use error::{AcquisitionError, Result, SessionError};
