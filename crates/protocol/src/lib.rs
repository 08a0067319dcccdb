//! Protocol library for recovery-usb
//!
//! This crate holds the hardware-independent pieces of the recovery-mode
//! control protocol: the control setup packet layout, host status codes,
//! device modes, and the decoder for the identity string a device reports.
//!
//! # Example
//!
//! ```
//! use protocol::DeviceInfo;
//!
//! let info = DeviceInfo::parse("CPID:8010 BDID:0C SRTG:[iBoot-2696.0.0.1.33]");
//! assert_eq!(info.cpid, 0x8010);
//! assert_eq!(info.srtg.as_deref(), Some("iBoot-2696.0.0.1.33"));
//! ```
//!
//! # Setup packets
//!
//! ```
//! use protocol::ControlSetup;
//!
//! let setup = ControlSetup::string_descriptor(6, 0x040a, 0x100);
//! assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x06, 0x03, 0x0a, 0x04, 0x00, 0x01]);
//! ```

pub mod descriptor;
pub mod devinfo;
pub mod error;
pub mod setup;
pub mod types;

pub use descriptor::string_descriptor_ascii;
pub use devinfo::DeviceInfo;
pub use error::{ProtocolError, Result};
pub use setup::{
    ControlSetup, DESCRIPTOR_TYPE_STRING, DIRECTION_IN, DIRECTION_OUT, MAX_RESPONSE_LEN,
    REQUEST_GET_DESCRIPTOR,
};
pub use types::{APPLE_VENDOR_ID, DeviceMode, UsbStatus};
