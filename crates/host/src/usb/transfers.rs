//! Control transfer execution
//!
//! All requests travel over the device's default control pipe. Three
//! families are offered:
//! - synchronous ([`ControlPipe::transfer`], [`ControlPipe::transfer_with_timeout`])
//! - asynchronous submission with caller-driven completion
//!   ([`ControlPipe::transfer_async`], [`ControlPipe::poll`], [`ControlPipe::run_loop_once`])
//! - deadline cancellation: submit, sleep, abort the pipe, then collect the
//!   aborted completion ([`ControlPipe::transfer_async_with_cancel`] and its
//!   fire-and-forget relatives)
//!
//! Only one asynchronous request may be in flight per pipe. Aborting is
//! pipe-wide, not per request.

use crate::error::{Result, SessionError};
use crate::usb::backend::{
    Completion, CompletionReceiver, TransferStatus, TransferTag, UsbDevice,
};
use protocol::{ControlSetup, UsbStatus};
use std::time::Duration;
use tracing::{debug, warn};

/// Bound on event loop re-entry while waiting for a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPolicy {
    /// Longest single loop iteration
    pub slice: Duration,
    /// Iterations before giving up on a completion
    pub max_iterations: u32,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            slice: Duration::from_millis(10),
            max_iterations: 500,
        }
    }
}

/// Request header fields; the length comes from the data buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
        }
    }

    /// Setup packet for a data stage of `len` bytes, clamped to `u16::MAX`
    pub fn setup(&self, len: usize) -> ControlSetup {
        ControlSetup::new(
            self.request_type,
            self.request,
            self.value,
            self.index,
            len.min(u16::MAX as usize) as u16,
        )
    }
}

/// Completion record for one asynchronous request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsyncTransfer {
    pub status: TransferStatus,
    pub actual_length: usize,
}

/// Handle to a submitted asynchronous request
#[derive(Debug)]
pub struct PendingTransfer {
    tag: TransferTag,
    record: AsyncTransfer,
    data: Vec<u8>,
}

impl PendingTransfer {
    fn new(tag: TransferTag) -> Self {
        Self {
            tag,
            record: AsyncTransfer::default(),
            data: Vec::new(),
        }
    }

    pub fn tag(&self) -> TransferTag {
        self.tag
    }

    pub fn record(&self) -> AsyncTransfer {
        self.record
    }

    pub fn is_finished(&self) -> bool {
        self.record.status.is_terminal()
    }

    /// Bytes received by an IN request, once finished
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn complete(&mut self, completion: Completion) {
        self.record = AsyncTransfer {
            status: completion.status,
            actual_length: completion.actual_length,
        };
        self.data = completion.data;
    }
}

/// The default control pipe of an open device, together with the receiving
/// end of its completion channel
pub struct ControlPipe<D: UsbDevice> {
    device: D,
    completions: CompletionReceiver,
    loop_policy: LoopPolicy,
    next_tag: TransferTag,
}

impl<D: UsbDevice> ControlPipe<D> {
    /// Register a completion source on an opened device
    ///
    /// On failure the device is closed and released.
    pub(crate) fn attach(mut device: D, loop_policy: LoopPolicy) -> std::result::Result<Self, UsbStatus> {
        let (tx, rx) = async_channel::unbounded();
        if let Err(status) = device.register_event_source(tx) {
            warn!("Failed to register completion source: {}", status);
            if let Err(e) = device.close() {
                debug!("Close after failed registration: {}", e);
            }
            return Err(status);
        }

        Ok(Self {
            device,
            completions: rx,
            loop_policy,
            next_tag: 1,
        })
    }

    /// Close the device, deregister the completion source, release the device
    ///
    /// `close` already gives up the handle and its interface; the device
    /// value is only dropped after deregistration because that needs it.
    pub(crate) fn release(mut self) {
        if let Err(e) = self.device.close() {
            warn!("Error closing device: {}", e);
        }
        self.device.deregister_event_source();
        self.completions.close();
        drop(self.device);
    }

    pub(crate) fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn loop_policy(&self) -> LoopPolicy {
        self.loop_policy
    }

    /// Blocking transfer with no timeout
    pub fn transfer(&mut self, request: ControlRequest, data: &mut [u8]) -> Result<usize> {
        let setup = request.setup(data.len());
        debug!(
            "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
            setup.request_type, setup.request, setup.value, setup.index, setup.length
        );

        let len = setup.length as usize;
        match self.device.control(setup, &mut data[..len], None) {
            Ok(n) => {
                debug!("Control transfer succeeded: {} bytes", n);
                Ok(n)
            }
            Err(status) => {
                warn!("Control transfer failed: {}", status);
                Err(SessionError::Transfer(status))
            }
        }
    }

    /// Blocking transfer bounded by `timeout` for both the data stage and
    /// overall completion
    pub fn transfer_with_timeout(
        &mut self,
        request: ControlRequest,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let setup = request.setup(data.len());
        debug!(
            "Control transfer: request={:#x}, value={:#x}, length={}, timeout={}ms",
            setup.request,
            setup.value,
            setup.length,
            timeout.as_millis()
        );

        let len = setup.length as usize;
        match self.device.control(setup, &mut data[..len], Some(timeout)) {
            Ok(n) => Ok(n),
            Err(UsbStatus::Timeout) => {
                debug!("Control transfer timed out after {:?}", timeout);
                Err(SessionError::TransferTimeout { timeout })
            }
            Err(status) => {
                warn!("Control transfer failed: {}", status);
                Err(SessionError::Transfer(status))
            }
        }
    }

    /// Submit without waiting
    ///
    /// For OUT requests `data` is the payload; for IN requests only its
    /// length matters. The transport works on its own copy.
    pub fn transfer_async(
        &mut self,
        request: ControlRequest,
        data: &[u8],
    ) -> Result<PendingTransfer> {
        let setup = request.setup(data.len());
        let tag = self.next_tag;
        self.next_tag += 1;

        let payload = data[..setup.length as usize].to_vec();
        self.device
            .submit_control(setup, payload, tag)
            .map_err(|status| {
                debug!("Async submission {} rejected: {}", tag, status);
                SessionError::Transfer(status)
            })?;

        debug!(
            "Submitted async transfer {}: request={:#x}, value={:#x}, length={}",
            tag, setup.request, setup.value, setup.length
        );
        Ok(PendingTransfer::new(tag))
    }

    /// Pick up completions already delivered, without entering the loop
    ///
    /// Completions for other tags are left over from fire-and-forget
    /// requests and are discarded.
    pub fn poll(&mut self, pending: &mut PendingTransfer) -> bool {
        while let Ok(completion) = self.completions.try_recv() {
            if completion.tag == pending.tag {
                debug!(
                    "Transfer {} finished: {:?}, {} bytes",
                    completion.tag, completion.status, completion.actual_length
                );
                pending.complete(completion);
            } else {
                debug!("Discarding stale completion for transfer {}", completion.tag);
            }
        }
        pending.is_finished()
    }

    /// Run one event loop iteration, then poll
    pub fn run_loop_once(&mut self, pending: &mut PendingTransfer) -> Result<bool> {
        self.device
            .run_loop_once(self.loop_policy.slice)
            .map_err(SessionError::Transfer)?;
        Ok(self.poll(pending))
    }

    /// Abort whatever is pending on the default pipe
    pub fn abort(&mut self) -> Result<()> {
        self.device
            .abort_default_pipe()
            .map_err(SessionError::Transfer)
    }

    /// Submit, sleep for `deadline`, abort, then re-enter the event loop
    /// until the request's completion arrives
    ///
    /// Returns the length recorded by the completion. If the abort cannot be
    /// issued, or the completion does not show up within the loop bound, the
    /// length recorded so far (usually zero) is returned instead. Data an IN
    /// request received before the abort is copied into `data`.
    pub fn transfer_async_with_cancel(
        &mut self,
        request: ControlRequest,
        data: &mut [u8],
        deadline: Duration,
    ) -> Result<usize> {
        let mut pending = self.transfer_async(request, data)?;
        std::thread::sleep(deadline);

        if let Err(status) = self.device.abort_default_pipe() {
            warn!("Abort of transfer {} failed: {}", pending.tag, status);
            self.poll(&mut pending);
            return Ok(pending.record.actual_length);
        }

        if !self.wait_for(&mut pending) {
            warn!(
                "Transfer {} not completed after {} loop iterations",
                pending.tag, self.loop_policy.max_iterations
            );
        }

        let copied = pending.data.len().min(data.len());
        data[..copied].copy_from_slice(&pending.data[..copied]);
        Ok(pending.record.actual_length)
    }

    /// Submit and return whatever length is known right away
    ///
    /// For callers that drive the event loop themselves. Submission errors
    /// are logged, not returned.
    pub fn transfer_async_no_error(&mut self, request: ControlRequest, data: &[u8]) -> usize {
        match self.transfer_async(request, data) {
            Ok(mut pending) => {
                self.poll(&mut pending);
                pending.record.actual_length
            }
            Err(e) => {
                debug!("Fire-and-forget submission failed: {}", e);
                0
            }
        }
    }

    /// Like [`ControlPipe::transfer_async_with_cancel`], but returns right
    /// after the abort without waiting for the aborted completion
    pub fn transfer_async_with_cancel_no_loop(
        &mut self,
        request: ControlRequest,
        data: &[u8],
        deadline: Duration,
    ) -> usize {
        let pending = match self.transfer_async(request, data) {
            Ok(pending) => Some(pending),
            Err(e) => {
                debug!("Fire-and-forget submission failed: {}", e);
                None
            }
        };

        std::thread::sleep(deadline);
        if let Err(status) = self.device.abort_default_pipe() {
            debug!("Abort failed: {}", status);
        }

        match pending {
            Some(mut pending) => {
                self.poll(&mut pending);
                pending.record.actual_length
            }
            None => 0,
        }
    }

    /// Re-enter the loop until `pending` finishes or the bound runs out
    fn wait_for(&mut self, pending: &mut PendingTransfer) -> bool {
        for _ in 0..self.loop_policy.max_iterations {
            if self.poll(pending) {
                return true;
            }
            match self.device.run_loop_once(self.loop_policy.slice) {
                Ok(()) => {}
                Err(UsbStatus::NoDevice) => {
                    debug!("Device gone while waiting for transfer {}", pending.tag);
                    break;
                }
                Err(e) => debug!("Event loop iteration failed: {}", e),
            }
        }
        self.poll(pending)
    }
}
