//! USB subsystem
//!
//! Session lifecycle and control transfers over a device's default pipe.
//!
//! - [`backend`]: traits the rest of the crate talks to the host stack through
//! - [`device`], [`manager`]: libusb implementation of those traits
//! - [`transfers`]: the control transfer engine
//! - [`session`]: opening, identifying and resetting one device
//! - [`acquire`]: single-owner session handling and the acquisition loop

pub mod acquire;
pub mod backend;
pub mod device;
pub mod manager;
pub mod session;
pub mod transfers;

pub use acquire::{AcquirePolicy, RecoveryClient};
pub use backend::{
    CandidateInfo, Completion, CompletionReceiver, CompletionSender, TransferStatus, TransferTag,
    UsbBackend, UsbDevice,
};
pub use device::RusbDevice;
pub use manager::{RusbBackend, RusbCandidate};
pub use session::{DeviceSession, OpenPolicy};
pub use transfers::{AsyncTransfer, ControlPipe, ControlRequest, LoopPolicy, PendingTransfer};
