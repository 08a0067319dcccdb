//! libusb-backed device interface
//!
//! Wraps a rusb device handle. Synchronous requests go through rusb's
//! control helpers; asynchronous requests are submitted as raw libusb
//! transfers so they can be cancelled while in flight. Completions are
//! dispatched from `libusb_handle_events` on the thread that calls
//! [`UsbDevice::run_loop_once`].

use crate::usb::backend::{
    Completion, CompletionSender, TransferStatus, TransferTag, UsbDevice,
};
use protocol::{ControlSetup, UsbStatus};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, UsbContext, constants, ffi};
use std::os::raw::{c_int, c_void};
use std::ptr::NonNull;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Loop iterations spent draining cancelled transfers on close
const DRAIN_ITERATIONS: u32 = 100;
const DRAIN_SLICE: Duration = Duration::from_millis(10);

/// Per-transfer state handed to libusb as `user_data`
struct TransferState {
    tag: TransferTag,
    is_in: bool,
    /// Setup packet followed by the data stage
    buffer: Vec<u8>,
    completions: CompletionSender,
    finished: bool,
}

struct InFlight {
    transfer: NonNull<ffi::libusb_transfer>,
    state: NonNull<TransferState>,
}

impl InFlight {
    fn is_finished(&self) -> bool {
        // SAFETY: state stays allocated until `free`; the callback runs on
        // this thread inside handle_events, never concurrently with us.
        unsafe { self.state.as_ref().finished }
    }

    /// SAFETY: the transfer must have finished (callback already ran).
    unsafe fn free(self) {
        unsafe {
            ffi::libusb_free_transfer(self.transfer.as_ptr());
            drop(Box::from_raw(self.state.as_ptr()));
        }
    }
}

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb passes back the transfer we submitted, whose user_data
    // points at a live TransferState owned by the device's in-flight list.
    unsafe {
        let Some(mut state) = NonNull::new((*transfer).user_data.cast::<TransferState>()) else {
            return;
        };
        let state = state.as_mut();

        let status = map_transfer_status((*transfer).status);
        let actual_length = (*transfer).actual_length.max(0) as usize;
        let data = if state.is_in {
            let end = (ControlSetup::SIZE + actual_length).min(state.buffer.len());
            state.buffer[ControlSetup::SIZE..end].to_vec()
        } else {
            Vec::new()
        };

        state.finished = true;
        let _ = state.completions.try_send(Completion {
            tag: state.tag,
            status,
            actual_length,
            data,
        });
    }
}

/// A claimed device backed by libusb
pub struct RusbDevice {
    context: Context,
    device: Device<Context>,
    descriptor: DeviceDescriptor,
    handle: Option<DeviceHandle<Context>>,
    location_id: u32,
    completions: Option<CompletionSender>,
    in_flight: Vec<InFlight>,
}

impl RusbDevice {
    pub(crate) fn new(
        context: Context,
        device: Device<Context>,
        handle: DeviceHandle<Context>,
    ) -> Result<Self, UsbStatus> {
        let descriptor = device.device_descriptor().map_err(map_rusb_error)?;
        let location_id = location_id(&device);

        Ok(Self {
            context,
            device,
            descriptor,
            handle: Some(handle),
            location_id,
            completions: None,
            in_flight: Vec::new(),
        })
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn address(&self) -> u8 {
        self.device.address()
    }

    fn handle(&self) -> Result<&DeviceHandle<Context>, UsbStatus> {
        self.handle.as_ref().ok_or(UsbStatus::NoDevice)
    }

    fn handle_mut(&mut self) -> Result<&mut DeviceHandle<Context>, UsbStatus> {
        self.handle.as_mut().ok_or(UsbStatus::NoDevice)
    }

    /// Free every transfer whose callback has run
    fn reap(&mut self) {
        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(InFlight::is_finished);
        for transfer in finished {
            // SAFETY: partitioned on is_finished
            unsafe { transfer.free() };
        }
        self.in_flight = pending;
    }

    fn cancel_all(&mut self) -> Result<(), UsbStatus> {
        let mut result = Ok(());
        for transfer in self.in_flight.iter().filter(|t| !t.is_finished()) {
            // SAFETY: the transfer is allocated and submitted
            let rc = unsafe { ffi::libusb_cancel_transfer(transfer.transfer.as_ptr()) };
            if rc != 0 && rc != constants::LIBUSB_ERROR_NOT_FOUND {
                result = Err(map_libusb_error(rc));
            }
        }
        result
    }
}

impl UsbDevice for RusbDevice {
    fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    fn location_id(&self) -> u32 {
        self.location_id
    }

    fn serial_string(&mut self) -> Option<String> {
        let handle = self.handle.as_ref()?;
        match handle.read_serial_number_string_ascii(&self.descriptor) {
            Ok(serial) => Some(serial),
            Err(e) => {
                debug!("No serial number string: {}", e);
                None
            }
        }
    }

    fn open(&mut self) -> Result<(), UsbStatus> {
        let handle = self.handle_mut()?;

        // Not supported on every platform; only the default pipe is used anyway
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }

        let config = handle.active_configuration().map_err(map_rusb_error)?;
        debug!("Device open, active configuration {}", config);
        Ok(())
    }

    fn close(&mut self) -> Result<(), UsbStatus> {
        if self.handle.is_none() {
            return Ok(());
        }

        let result = self.cancel_all();
        for _ in 0..DRAIN_ITERATIONS {
            self.reap();
            if self.in_flight.is_empty() {
                break;
            }
            if let Err(e) = self.context.handle_events(Some(DRAIN_SLICE)) {
                debug!("Event handling while draining transfers: {}", e);
            }
        }
        self.reap();

        if !self.in_flight.is_empty() {
            error!(
                "{} transfers still pending at close; leaking them",
                self.in_flight.len()
            );
            self.in_flight.clear();
        }

        self.handle = None;
        debug!(
            "Closed device on bus {:03} address {:03}",
            self.bus_number(),
            self.address()
        );
        result
    }

    fn set_configuration(&mut self, value: u8) -> Result<(), UsbStatus> {
        self.handle_mut()?
            .set_active_configuration(value)
            .map_err(map_rusb_error)
    }

    fn control(
        &mut self,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, UsbStatus> {
        let handle = self.handle()?;
        // libusb treats a zero timeout as unlimited
        let timeout = timeout.unwrap_or(Duration::ZERO);

        let result = if setup.is_in() {
            handle.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            )
        } else {
            handle.write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            )
        };

        result.map_err(map_rusb_error)
    }

    fn submit_control(
        &mut self,
        setup: ControlSetup,
        data: Vec<u8>,
        tag: TransferTag,
    ) -> Result<(), UsbStatus> {
        self.reap();
        let dev_handle = self.handle()?.as_raw();
        let completions = self.completions.clone().ok_or(UsbStatus::InvalidParam)?;

        let total = ControlSetup::SIZE + setup.length as usize;
        let mut buffer = Vec::with_capacity(total);
        buffer.extend_from_slice(&setup.to_bytes());
        if !setup.is_in() {
            buffer.extend_from_slice(&data);
        }
        buffer.resize(total, 0);

        // SAFETY: zero iso packets requested for a control transfer
        let transfer = NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) })
            .ok_or(UsbStatus::Other(constants::LIBUSB_ERROR_NO_MEM))?;
        let state = NonNull::from(Box::leak(Box::new(TransferState {
            tag,
            is_in: setup.is_in(),
            buffer,
            completions,
            finished: false,
        })));

        // SAFETY: transfer is freshly allocated; state outlives the transfer
        // because both are freed together in InFlight::free.
        let rc = unsafe {
            let t = transfer.as_ptr();
            let s = state.as_ptr();
            (*t).dev_handle = dev_handle;
            (*t).flags = 0;
            (*t).endpoint = 0;
            (*t).transfer_type = constants::LIBUSB_TRANSFER_TYPE_CONTROL;
            (*t).timeout = 0;
            (*t).buffer = (*s).buffer.as_mut_ptr();
            (*t).length = (*s).buffer.len() as c_int;
            (*t).callback = transfer_callback;
            (*t).user_data = s.cast::<c_void>();
            ffi::libusb_submit_transfer(t)
        };

        if rc != 0 {
            // SAFETY: never submitted, so libusb holds no reference
            unsafe {
                ffi::libusb_free_transfer(transfer.as_ptr());
                drop(Box::from_raw(state.as_ptr()));
            }
            return Err(map_libusb_error(rc));
        }

        self.in_flight.push(InFlight { transfer, state });
        Ok(())
    }

    fn abort_default_pipe(&mut self) -> Result<(), UsbStatus> {
        self.handle()?;
        self.cancel_all()
    }

    fn reset(&mut self) -> Result<(), UsbStatus> {
        match self.handle_mut()?.reset() {
            Ok(()) => Ok(()),
            // The device re-enumerated before libusb could re-attach to it
            Err(rusb::Error::NotFound) | Err(rusb::Error::NoDevice) => {
                Err(UsbStatus::NotResponding)
            }
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    fn reenumerate(&mut self) -> Result<(), UsbStatus> {
        // libusb's port reset already makes the device re-enumerate
        Err(UsbStatus::NotSupported)
    }

    fn register_event_source(&mut self, completions: CompletionSender) -> Result<(), UsbStatus> {
        self.handle()?;
        self.completions = Some(completions);
        Ok(())
    }

    fn deregister_event_source(&mut self) {
        self.completions = None;
    }

    fn run_loop_once(&mut self, timeout: Duration) -> Result<(), UsbStatus> {
        let result = match self.context.handle_events(Some(timeout)) {
            Ok(()) | Err(rusb::Error::Interrupted) => Ok(()),
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                Err(map_rusb_error(e))
            }
        };
        self.reap();
        result
    }
}

impl Drop for RusbDevice {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Error releasing device: {}", e);
        }
    }
}

/// Bus number in the top byte, then one nibble per hub port
pub(crate) fn location_id(device: &Device<Context>) -> u32 {
    let mut location = u32::from(device.bus_number()) << 24;
    if let Ok(ports) = device.port_numbers() {
        for (depth, port) in ports.iter().take(6).enumerate() {
            location |= u32::from(port & 0x0f) << (20 - 4 * depth);
        }
    }
    location
}

/// Map rusb::Error to protocol::UsbStatus
pub fn map_rusb_error(err: rusb::Error) -> UsbStatus {
    match err {
        rusb::Error::Timeout => UsbStatus::Timeout,
        rusb::Error::Pipe => UsbStatus::Pipe,
        rusb::Error::NoDevice => UsbStatus::NoDevice,
        rusb::Error::NotFound => UsbStatus::NotFound,
        rusb::Error::Busy => UsbStatus::Busy,
        rusb::Error::Overflow => UsbStatus::Overflow,
        rusb::Error::Io => UsbStatus::Io,
        rusb::Error::InvalidParam => UsbStatus::InvalidParam,
        rusb::Error::Access => UsbStatus::Access,
        rusb::Error::NotSupported => UsbStatus::NotSupported,
        rusb::Error::Interrupted => UsbStatus::Other(constants::LIBUSB_ERROR_INTERRUPTED),
        rusb::Error::NoMem => UsbStatus::Other(constants::LIBUSB_ERROR_NO_MEM),
        _ => UsbStatus::Other(constants::LIBUSB_ERROR_OTHER),
    }
}

/// Map a raw libusb error code to protocol::UsbStatus
pub fn map_libusb_error(code: c_int) -> UsbStatus {
    match code {
        constants::LIBUSB_ERROR_TIMEOUT => UsbStatus::Timeout,
        constants::LIBUSB_ERROR_PIPE => UsbStatus::Pipe,
        constants::LIBUSB_ERROR_NO_DEVICE => UsbStatus::NoDevice,
        constants::LIBUSB_ERROR_NOT_FOUND => UsbStatus::NotFound,
        constants::LIBUSB_ERROR_BUSY => UsbStatus::Busy,
        constants::LIBUSB_ERROR_OVERFLOW => UsbStatus::Overflow,
        constants::LIBUSB_ERROR_IO => UsbStatus::Io,
        constants::LIBUSB_ERROR_INVALID_PARAM => UsbStatus::InvalidParam,
        constants::LIBUSB_ERROR_ACCESS => UsbStatus::Access,
        constants::LIBUSB_ERROR_NOT_SUPPORTED => UsbStatus::NotSupported,
        other => UsbStatus::Other(other),
    }
}

/// Map a libusb transfer status to a completion status
pub fn map_transfer_status(status: c_int) -> TransferStatus {
    match status {
        constants::LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        constants::LIBUSB_TRANSFER_CANCELLED => TransferStatus::Aborted,
        constants::LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::Failed(UsbStatus::Timeout),
        constants::LIBUSB_TRANSFER_STALL => TransferStatus::Failed(UsbStatus::Pipe),
        constants::LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::Failed(UsbStatus::NoDevice),
        constants::LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Failed(UsbStatus::Overflow),
        constants::LIBUSB_TRANSFER_ERROR => TransferStatus::Failed(UsbStatus::Io),
        other => TransferStatus::Failed(UsbStatus::Other(other)),
    }
}
