//! Device session lifecycle
//!
//! A [`DeviceSession`] owns one claimed device and its completion channel.
//! It is either fully open or fully closed: [`DeviceSession::open`] returns
//! only once every step succeeded, and releases everything it acquired on
//! the way when a step fails.

use crate::error::{AcquisitionError, Result, SessionError};
use crate::usb::backend::{UsbBackend, UsbDevice};
use crate::usb::transfers::{ControlPipe, ControlRequest, LoopPolicy, PendingTransfer};
use protocol::{
    APPLE_VENDOR_ID, ControlSetup, DeviceInfo, DeviceMode, MAX_RESPONSE_LEN, UsbStatus,
    string_descriptor_ascii,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Language id used for identity descriptor probes
pub const IDENTITY_LANGUAGE: u16 = 0x040a;

/// String descriptor slots that carry the identity string, newest firmware first
pub const IDENTITY_DESCRIPTOR_INDICES: [u8; 3] = [0x06, 0x04, 0x03];

/// How a session is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenPolicy {
    pub vendor_id: u16,
    /// Attempts at creating the device interface
    pub claim_attempts: u32,
    pub claim_retry_delay: Duration,
    /// Configuration selected once the device is open
    pub configuration: u8,
    pub event_loop: LoopPolicy,
}

impl Default for OpenPolicy {
    fn default() -> Self {
        Self {
            vendor_id: APPLE_VENDOR_ID,
            claim_attempts: 5,
            claim_retry_delay: Duration::from_micros(1),
            configuration: 1,
            event_loop: LoopPolicy::default(),
        }
    }
}

/// Exclusive ownership of one open device
pub struct DeviceSession<D: UsbDevice> {
    pipe: Option<ControlPipe<D>>,
    mode: u16,
    location_id: u32,
    info: DeviceInfo,
    has_serial_string: bool,
}

impl<D: UsbDevice> DeviceSession<D> {
    /// Open the first device enumerating as `mode`
    ///
    /// Steps, in order: enumerate, claim (with retry), read and decode the
    /// identity string if there is one, check the reported mode, open,
    /// select the configuration, register the completion source.
    pub fn open<B>(backend: &B, mode: DeviceMode, policy: &OpenPolicy) -> Result<Self>
    where
        B: UsbBackend<Device = D>,
    {
        let product_id = mode.product_id();
        let candidate = backend
            .enumerate(policy.vendor_id, Some(product_id))
            .map_err(AcquisitionError::Enumerate)?
            .into_iter()
            .next()
            .ok_or(AcquisitionError::NoDevice {
                vendor_id: policy.vendor_id,
                product_id,
            })?;

        let mut device = claim_with_retry(backend, &candidate, policy)?;

        let (info, has_serial_string) = match device.serial_string() {
            Some(serial) => {
                debug!("Identity string: {}", serial);
                (DeviceInfo::parse(&serial), true)
            }
            None => {
                debug!("Device exposes no identity string");
                (DeviceInfo::default(), false)
            }
        };

        let actual = device.product_id();
        let location_id = device.location_id();
        if actual != product_id {
            return Err(AcquisitionError::ModeMismatch {
                expected: product_id,
                actual,
            }
            .into());
        }

        device.open().map_err(|status| {
            warn!("Device open rejected: {}", status);
            AcquisitionError::OpenRejected(status)
        })?;

        if let Err(status) = device.set_configuration(policy.configuration) {
            warn!(
                "Setting configuration {} failed: {}",
                policy.configuration, status
            );
            if let Err(e) = device.close() {
                debug!("Close after failed configuration: {}", e);
            }
            return Err(AcquisitionError::Configuration(status).into());
        }

        let pipe =
            ControlPipe::attach(device, policy.event_loop).map_err(AcquisitionError::EventSource)?;

        info!(
            "Opened {} device at location {:#010x}",
            DeviceMode::from_product_id(actual),
            location_id
        );

        Ok(Self {
            pipe: Some(pipe),
            mode: actual,
            location_id,
            info,
            has_serial_string,
        })
    }

    /// Release the device and its completion channel
    ///
    /// Idempotent. Teardown errors are logged, never returned.
    pub fn close(&mut self) {
        if let Some(pipe) = self.pipe.take() {
            pipe.release();
            self.info = DeviceInfo::default();
            self.has_serial_string = false;
            info!("Closed device session (mode {:#06x})", self.mode);
        }
    }

    pub fn is_open(&self) -> bool {
        self.pipe.is_some()
    }

    /// Product code read at open time
    pub fn mode(&self) -> u16 {
        self.mode
    }

    pub fn location_id(&self) -> u32 {
        self.location_id
    }

    /// Decoded identity, or `None` once the session is closed
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.pipe.as_ref().map(|_| &self.info)
    }

    pub fn has_serial_string(&self) -> bool {
        self.has_serial_string
    }

    fn pipe(&mut self) -> Result<&mut ControlPipe<D>> {
        self.pipe.as_mut().ok_or(SessionError::InvalidSession)
    }

    /// Probe the identity descriptor slots when the open-time string was
    /// missing or incomplete
    ///
    /// Slots are read newest-first and stop once a security tag is known.
    /// Results accumulate into the session's identity. Returns whether an
    /// identity string is now available.
    pub fn query_self_identity(&mut self) -> Result<bool> {
        let pipe = self.pipe.as_mut().ok_or(SessionError::InvalidSession)?;

        for index in IDENTITY_DESCRIPTOR_INDICES {
            if self.info.srtg.is_some() {
                break;
            }

            let setup =
                ControlSetup::string_descriptor(index, IDENTITY_LANGUAGE, MAX_RESPONSE_LEN as u16);
            let request =
                ControlRequest::new(setup.request_type, setup.request, setup.value, setup.index);
            let mut buf = [0u8; MAX_RESPONSE_LEN];

            let len = match pipe.transfer(request, &mut buf) {
                Ok(len) => len,
                Err(e) => {
                    debug!("Identity descriptor {:#06x} unavailable: {}", setup.value, e);
                    break;
                }
            };

            match string_descriptor_ascii(&buf[..len]) {
                Ok(ascii) => {
                    debug!(
                        "Identity descriptor {:#06x}: {}",
                        setup.value,
                        String::from_utf8_lossy(&ascii)
                    );
                    self.info.merge_from(DeviceInfo::parse_bytes(&ascii));
                }
                Err(e) => debug!("Identity descriptor {:#06x} malformed: {}", setup.value, e),
            }
        }

        if self.info.srtg.is_some() {
            self.has_serial_string = true;
        }
        Ok(self.has_serial_string)
    }

    pub fn set_configuration(&mut self, value: u8) -> Result<()> {
        self.pipe()?
            .device_mut()
            .set_configuration(value)
            .map_err(|status| {
                warn!("Set configuration {} rejected: {}", value, status);
                SessionError::Configuration(status)
            })
    }

    /// Reset the device and ask the host to re-enumerate it
    ///
    /// The device is expected to disappear; open a fresh session afterwards.
    pub fn reset_and_reenumerate(&mut self) -> Result<()> {
        let device = self.pipe()?.device_mut();

        match device.reset() {
            Ok(()) => debug!("Device reset"),
            Err(UsbStatus::NotResponding) => debug!("Device stopped responding during reset"),
            Err(status) => {
                warn!("Device reset failed: {}", status);
                return Err(SessionError::Reset(status));
            }
        }

        if let Err(status) = device.reenumerate() {
            debug!("Re-enumeration request failed (ignored): {}", status);
        }
        Ok(())
    }

    pub fn transfer(&mut self, request: ControlRequest, data: &mut [u8]) -> Result<usize> {
        self.pipe()?.transfer(request, data)
    }

    pub fn transfer_with_timeout(
        &mut self,
        request: ControlRequest,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.pipe()?.transfer_with_timeout(request, data, timeout)
    }

    pub fn transfer_async(
        &mut self,
        request: ControlRequest,
        data: &[u8],
    ) -> Result<PendingTransfer> {
        self.pipe()?.transfer_async(request, data)
    }

    pub fn poll(&mut self, pending: &mut PendingTransfer) -> Result<bool> {
        Ok(self.pipe()?.poll(pending))
    }

    pub fn run_loop_once(&mut self, pending: &mut PendingTransfer) -> Result<bool> {
        self.pipe()?.run_loop_once(pending)
    }

    pub fn abort(&mut self) -> Result<()> {
        self.pipe()?.abort()
    }

    pub fn transfer_async_with_cancel(
        &mut self,
        request: ControlRequest,
        data: &mut [u8],
        deadline: Duration,
    ) -> Result<usize> {
        self.pipe()?
            .transfer_async_with_cancel(request, data, deadline)
    }

    pub fn transfer_async_no_error(&mut self, request: ControlRequest, data: &[u8]) -> Result<usize> {
        Ok(self.pipe()?.transfer_async_no_error(request, data))
    }

    pub fn transfer_async_with_cancel_no_loop(
        &mut self,
        request: ControlRequest,
        data: &[u8],
        deadline: Duration,
    ) -> Result<usize> {
        Ok(self
            .pipe()?
            .transfer_async_with_cancel_no_loop(request, data, deadline))
    }
}

impl<D: UsbDevice> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create the device interface, retrying while it is not yet claimable
fn claim_with_retry<B: UsbBackend>(
    backend: &B,
    candidate: &B::Candidate,
    policy: &OpenPolicy,
) -> Result<B::Device> {
    let attempts = policy.claim_attempts.max(1);
    let mut last = UsbStatus::NotFound;

    for attempt in 1..=attempts {
        match backend.claim(candidate) {
            Ok(device) => {
                debug!("Claimed device on attempt {}", attempt);
                return Ok(device);
            }
            Err(status) => {
                debug!("Claim attempt {}/{} failed: {}", attempt, attempts, status);
                last = status;
                if attempt < attempts {
                    std::thread::sleep(policy.claim_retry_delay);
                }
            }
        }
    }

    Err(AcquisitionError::ClaimExhausted { attempts, last }.into())
}
