//! Session error types

use protocol::UsbStatus;
use std::time::Duration;
use thiserror::Error;

/// Why a session could not be established
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquisitionError {
    #[error("Device enumeration failed: {0}")]
    Enumerate(UsbStatus),

    #[error("No device found for {vendor_id:#06x}:{product_id:#06x}")]
    NoDevice { vendor_id: u16, product_id: u16 },

    #[error("Interface claim failed after {attempts} attempts: {last}")]
    ClaimExhausted { attempts: u32, last: UsbStatus },

    #[error("Device open rejected: {0}")]
    OpenRejected(UsbStatus),

    #[error("Device reports product {actual:#06x}, expected {expected:#06x}")]
    ModeMismatch { expected: u16, actual: u16 },

    #[error("Setting configuration failed: {0}")]
    Configuration(UsbStatus),

    #[error("Registering completion source failed: {0}")]
    EventSource(UsbStatus),
}

/// Errors returned by session-scoped operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("No session acquired after {attempts} attempts")]
    AcquisitionTimeout { attempts: u32 },

    #[error("Set configuration rejected: {0}")]
    Configuration(UsbStatus),

    #[error("Control transfer failed: {0}")]
    Transfer(UsbStatus),

    #[error("Control transfer timed out after {timeout:?}")]
    TransferTimeout { timeout: Duration },

    #[error("Device reset failed: {0}")]
    Reset(UsbStatus),

    #[error("Session is not open")]
    InvalidSession,
}

pub type Result<T> = std::result::Result<T, SessionError>;
