//! Host USB stack abstraction
//!
//! The session and transfer engine only talk to the hardware through these
//! two traits. [`crate::usb::RusbBackend`] implements them on top of libusb;
//! `test_utils::ScriptedBackend` (feature `test-utils`) replays
//! scripted outcomes in tests.

use protocol::{ControlSetup, UsbStatus};
use std::time::Duration;

/// Correlates an asynchronous submission with its completion
pub type TransferTag = u64;

/// Sending half of a session's completion channel
pub type CompletionSender = async_channel::Sender<Completion>;

/// Receiving half of a session's completion channel
pub type CompletionReceiver = async_channel::Receiver<Completion>;

/// Terminal state of an asynchronous request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransferStatus {
    /// No completion observed yet
    #[default]
    Pending,
    /// Transport finished the request
    Completed,
    /// Request was cut short by an abort of the default pipe
    Aborted,
    /// Transport reported an error
    Failed(UsbStatus),
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Completion notification delivered from inside an event loop iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub tag: TransferTag,
    pub status: TransferStatus,
    pub actual_length: usize,
    /// Data stage bytes actually transferred (IN requests only)
    pub data: Vec<u8>,
}

/// Summary of an enumerated device, before it is claimed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
    pub location_id: u32,
}

/// Device matching and claiming
pub trait UsbBackend {
    type Device: UsbDevice;
    type Candidate;

    /// Devices with `vendor_id` (and `product_id`, if given), in enumeration order
    fn enumerate(
        &self,
        vendor_id: u16,
        product_id: Option<u16>,
    ) -> Result<Vec<Self::Candidate>, UsbStatus>;

    fn describe(&self, candidate: &Self::Candidate) -> CandidateInfo;

    /// Create a device interface for a candidate; may fail transiently right
    /// after the device arrives
    fn claim(&self, candidate: &Self::Candidate) -> Result<Self::Device, UsbStatus>;
}

/// A claimed device interface
///
/// Dropping the value releases the interface.
pub trait UsbDevice {
    /// Product code the device currently reports
    fn product_id(&self) -> u16;

    fn location_id(&self) -> u32;

    /// Identity string from the serial number slot; older firmware has none
    fn serial_string(&mut self) -> Option<String>;

    fn open(&mut self) -> Result<(), UsbStatus>;

    fn close(&mut self) -> Result<(), UsbStatus>;

    fn set_configuration(&mut self, value: u8) -> Result<(), UsbStatus>;

    /// Blocking control request; `None` waits indefinitely
    ///
    /// `data` is exactly `setup.length` bytes.
    fn control(
        &mut self,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, UsbStatus>;

    /// Queue a control request; its [`Completion`] is delivered through the
    /// registered event source during a later [`UsbDevice::run_loop_once`]
    fn submit_control(
        &mut self,
        setup: ControlSetup,
        data: Vec<u8>,
        tag: TransferTag,
    ) -> Result<(), UsbStatus>;

    /// Abort whatever is pending on the default control pipe
    fn abort_default_pipe(&mut self) -> Result<(), UsbStatus>;

    fn reset(&mut self) -> Result<(), UsbStatus>;

    fn reenumerate(&mut self) -> Result<(), UsbStatus>;

    fn register_event_source(&mut self, completions: CompletionSender) -> Result<(), UsbStatus>;

    fn deregister_event_source(&mut self);

    /// Run one iteration of the event loop, returning once completions were
    /// dispatched or `timeout` elapsed
    fn run_loop_once(&mut self, timeout: Duration) -> Result<(), UsbStatus>;
}
