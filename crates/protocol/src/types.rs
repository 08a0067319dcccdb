//! Shared type definitions
//!
//! Status codes reported by the host USB stack and the operating modes a
//! device can be enumerated in.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Vendor identifier every supported device enumerates with
pub const APPLE_VENDOR_ID: u16 = 0x05ac;

/// Host USB stack status codes
///
/// Maps to libusb error and transfer status codes. See rusb::Error for details.
#[derive(Debug, Clone, Copy, Error, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum UsbStatus {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("pipe stalled")]
    Pipe,
    /// Pending request was aborted
    #[error("request aborted")]
    Aborted,
    /// Device was disconnected
    #[error("no such device")]
    NoDevice,
    /// Device or entity not found
    #[error("entity not found")]
    NotFound,
    /// Device stopped answering (typically mid-reset)
    #[error("device not responding")]
    NotResponding,
    /// Device is busy
    #[error("resource busy")]
    Busy,
    /// Buffer overflow
    #[error("overflow")]
    Overflow,
    /// I/O error
    #[error("input/output error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied")]
    Access,
    /// Operation not supported by this host
    #[error("operation not supported")]
    NotSupported,
    /// Any other raw status code
    #[error("status code {0}")]
    Other(i32),
}

/// Device operating mode, identified by the product code it enumerates with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceMode {
    /// Low-level "WTF" loader mode
    WtfMode,
    /// Boot ROM DFU mode
    Dfu,
    /// Boot loader recovery mode, one of four product slots
    Recovery(u8),
    /// Any other product code
    Other(u16),
}

impl DeviceMode {
    pub const WTF_PRODUCT_ID: u16 = 0x1222;
    pub const DFU_PRODUCT_ID: u16 = 0x1227;
    pub const RECOVERY_PRODUCT_BASE: u16 = 0x1280;

    /// Product code the device enumerates with in this mode
    pub fn product_id(self) -> u16 {
        match self {
            Self::WtfMode => Self::WTF_PRODUCT_ID,
            Self::Dfu => Self::DFU_PRODUCT_ID,
            Self::Recovery(slot) => Self::RECOVERY_PRODUCT_BASE + u16::from(slot & 0x03),
            Self::Other(pid) => pid,
        }
    }

    /// Classify a product code
    pub fn from_product_id(pid: u16) -> Self {
        match pid {
            Self::WTF_PRODUCT_ID => Self::WtfMode,
            Self::DFU_PRODUCT_ID => Self::Dfu,
            0x1280..=0x1283 => Self::Recovery((pid - Self::RECOVERY_PRODUCT_BASE) as u8),
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WtfMode => write!(f, "WTF ({:#06x})", self.product_id()),
            Self::Dfu => write!(f, "DFU ({:#06x})", self.product_id()),
            Self::Recovery(_) => write!(f, "Recovery ({:#06x})", self.product_id()),
            Self::Other(pid) => write!(f, "Unknown ({:#06x})", pid),
        }
    }
}

impl FromStr for DeviceMode {
    type Err = String;

    /// Accepts `dfu`, `wtf`, `recovery` (slot 1) or a product code such as `0x1281`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "dfu" => Ok(Self::Dfu),
            "wtf" => Ok(Self::WtfMode),
            "recovery" => Ok(Self::Recovery(1)),
            _ => {
                let hex = s
                    .strip_prefix("0x")
                    .ok_or_else(|| format!("Unknown device mode '{}'", s))?;
                u16::from_str_radix(hex, 16)
                    .map(Self::from_product_id)
                    .map_err(|_| format!("Invalid product code '{}'", s))
            }
        }
    }
}
