//! Scripted USB backend for testing
//!
//! [`ScriptedBackend`] replays per-device outcomes from a [`DeviceScript`]
//! and records every call it sees in a shared [`Event`] journal, so tests
//! can assert on ordering (claim before open, close before the next claim)
//! and on counts (acquisition attempts, loop iterations).

use crate::usb::backend::{
    CandidateInfo, Completion, CompletionSender, TransferStatus, TransferTag, UsbBackend,
    UsbDevice,
};
use protocol::{APPLE_VENDOR_ID, ControlSetup, REQUEST_GET_DESCRIPTOR, UsbStatus};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

/// One observed backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Enumerate { product_id: Option<u16> },
    Claim { product_id: u16 },
    SerialString,
    Open,
    Close,
    SetConfiguration(u8),
    RegisterEventSource,
    DeregisterEventSource,
    Control { value: u16, length: u16 },
    Submit { tag: TransferTag },
    Abort,
    RunLoop,
    Reset,
    Reenumerate,
    /// The device interface was dropped
    Release,
}

pub type Journal = Rc<RefCell<Vec<Event>>>;

/// What happens to an asynchronous submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncBehavior {
    /// Stays pending until aborted, then completes as aborted with `length`
    /// bytes transferred
    AbortedAfterAbort { length: usize },
    /// Completes normally on the next loop iteration
    CompleteOnLoop { length: usize },
    /// No completion is ever delivered
    Never,
}

/// Scripted outcomes for one device
#[derive(Debug, Clone)]
pub struct DeviceScript {
    pub vendor_id: u16,
    /// Product code the device enumerates with
    pub product_id: u16,
    /// Product code read back after claiming; defaults to `product_id`
    pub reported_product_id: Option<u16>,
    pub location_id: u32,
    pub serial: Option<String>,
    /// Claims that fail before one succeeds
    pub claim_failures: u32,
    pub claim_error: UsbStatus,
    pub open_result: Result<(), UsbStatus>,
    pub configuration_result: Result<(), UsbStatus>,
    pub event_source_result: Result<(), UsbStatus>,
    /// Raw string descriptors keyed by wValue; other GET_DESCRIPTOR
    /// requests stall
    pub descriptors: HashMap<u16, Vec<u8>>,
    /// Forces every synchronous request to fail
    pub control_error: Option<UsbStatus>,
    pub submit_result: Result<(), UsbStatus>,
    pub abort_result: Result<(), UsbStatus>,
    pub async_behavior: AsyncBehavior,
    pub reset_result: Result<(), UsbStatus>,
    pub reenumerate_result: Result<(), UsbStatus>,
}

impl DeviceScript {
    /// A device that cooperates with every request
    pub fn new(product_id: u16) -> Self {
        Self {
            vendor_id: APPLE_VENDOR_ID,
            product_id,
            reported_product_id: None,
            location_id: 0x1420_0000,
            serial: None,
            claim_failures: 0,
            claim_error: UsbStatus::Busy,
            open_result: Ok(()),
            configuration_result: Ok(()),
            event_source_result: Ok(()),
            descriptors: HashMap::new(),
            control_error: None,
            submit_result: Ok(()),
            abort_result: Ok(()),
            async_behavior: AsyncBehavior::AbortedAfterAbort { length: 0 },
            reset_result: Ok(()),
            reenumerate_result: Ok(()),
        }
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    /// Register an ASCII string as the descriptor at `index` (language 0x040a)
    pub fn with_string_descriptor(mut self, index: u8, text: &str) -> Self {
        self.descriptors
            .insert(0x0300 | u16::from(index), encode_string_descriptor(text));
        self
    }

    pub fn with_async_behavior(mut self, behavior: AsyncBehavior) -> Self {
        self.async_behavior = behavior;
        self
    }
}

/// Encode `text` as a UTF-16LE string descriptor
pub fn encode_string_descriptor(text: &str) -> Vec<u8> {
    let units: Vec<u16> = text.encode_utf16().take(126).collect();
    let mut raw = Vec::with_capacity(2 + units.len() * 2);
    raw.push((2 + units.len() * 2) as u8);
    raw.push(protocol::DESCRIPTOR_TYPE_STRING);
    for unit in units {
        raw.extend_from_slice(&unit.to_le_bytes());
    }
    raw
}

/// In-memory host stack
pub struct ScriptedBackend {
    journal: Journal,
    devices: Vec<DeviceScript>,
    /// Enumerations that find nothing before the devices show up
    arrive_after: u32,
    enumerations: Cell<u32>,
    claim_failures: RefCell<Vec<u32>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            journal: Rc::new(RefCell::new(Vec::new())),
            devices: Vec::new(),
            arrive_after: 0,
            enumerations: Cell::new(0),
            claim_failures: RefCell::new(Vec::new()),
        }
    }

    pub fn with_device(mut self, script: DeviceScript) -> Self {
        self.claim_failures.get_mut().push(script.claim_failures);
        self.devices.push(script);
        self
    }

    /// Hide every device for the first `enumerations` enumerations
    pub fn arriving_after(mut self, enumerations: u32) -> Self {
        self.arrive_after = enumerations;
        self
    }

    pub fn journal(&self) -> Journal {
        Rc::clone(&self.journal)
    }

    /// Snapshot of the journal
    pub fn events(&self) -> Vec<Event> {
        self.journal.borrow().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.journal.borrow().iter().filter(|e| *e == event).count()
    }

    pub fn clear_events(&self) {
        self.journal.borrow_mut().clear();
    }

    fn record(&self, event: Event) {
        self.journal.borrow_mut().push(event);
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbBackend for ScriptedBackend {
    type Device = ScriptedDevice;
    type Candidate = usize;

    fn enumerate(&self, vendor_id: u16, product_id: Option<u16>) -> Result<Vec<usize>, UsbStatus> {
        self.record(Event::Enumerate { product_id });
        let seen = self.enumerations.get() + 1;
        self.enumerations.set(seen);
        if seen <= self.arrive_after {
            return Ok(Vec::new());
        }

        Ok(self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| {
                d.vendor_id == vendor_id && product_id.is_none_or(|p| p == d.product_id)
            })
            .map(|(i, _)| i)
            .collect())
    }

    fn describe(&self, candidate: &usize) -> CandidateInfo {
        let script = &self.devices[*candidate];
        CandidateInfo {
            vendor_id: script.vendor_id,
            product_id: script.product_id,
            bus_number: 20,
            address: *candidate as u8 + 1,
            location_id: script.location_id,
        }
    }

    fn claim(&self, candidate: &usize) -> Result<ScriptedDevice, UsbStatus> {
        let script = &self.devices[*candidate];
        self.record(Event::Claim {
            product_id: script.product_id,
        });

        let mut failures = self.claim_failures.borrow_mut();
        if failures[*candidate] > 0 {
            failures[*candidate] -= 1;
            return Err(script.claim_error);
        }

        Ok(ScriptedDevice::new(script.clone(), self.journal()))
    }
}

struct Submitted {
    tag: TransferTag,
    setup: ControlSetup,
}

/// Claimed device replaying a [`DeviceScript`]
pub struct ScriptedDevice {
    script: DeviceScript,
    journal: Journal,
    completions: Option<CompletionSender>,
    in_flight: Vec<Submitted>,
    /// Completions handed out on the next loop iteration
    ready: Vec<Completion>,
}

impl ScriptedDevice {
    fn new(script: DeviceScript, journal: Journal) -> Self {
        Self {
            script,
            journal,
            completions: None,
            in_flight: Vec::new(),
            ready: Vec::new(),
        }
    }

    fn record(&self, event: Event) {
        self.journal.borrow_mut().push(event);
    }

    fn finish(submitted: Submitted, status: TransferStatus, length: usize) -> Completion {
        let actual_length = length.min(submitted.setup.length as usize);
        let data = if submitted.setup.is_in() {
            (0..actual_length).map(|i| i as u8).collect()
        } else {
            Vec::new()
        };
        Completion {
            tag: submitted.tag,
            status,
            actual_length,
            data,
        }
    }
}

impl UsbDevice for ScriptedDevice {
    fn product_id(&self) -> u16 {
        self.script
            .reported_product_id
            .unwrap_or(self.script.product_id)
    }

    fn location_id(&self) -> u32 {
        self.script.location_id
    }

    fn serial_string(&mut self) -> Option<String> {
        self.record(Event::SerialString);
        self.script.serial.clone()
    }

    fn open(&mut self) -> Result<(), UsbStatus> {
        self.record(Event::Open);
        self.script.open_result
    }

    fn close(&mut self) -> Result<(), UsbStatus> {
        self.record(Event::Close);
        self.in_flight.clear();
        Ok(())
    }

    fn set_configuration(&mut self, value: u8) -> Result<(), UsbStatus> {
        self.record(Event::SetConfiguration(value));
        self.script.configuration_result
    }

    fn control(
        &mut self,
        setup: ControlSetup,
        data: &mut [u8],
        _timeout: Option<Duration>,
    ) -> Result<usize, UsbStatus> {
        self.record(Event::Control {
            value: setup.value,
            length: setup.length,
        });

        if let Some(status) = self.script.control_error {
            return Err(status);
        }

        if setup.is_in() && setup.request == REQUEST_GET_DESCRIPTOR {
            let raw = self
                .script
                .descriptors
                .get(&setup.value)
                .ok_or(UsbStatus::Pipe)?;
            let n = raw.len().min(data.len());
            data[..n].copy_from_slice(&raw[..n]);
            return Ok(n);
        }

        Ok(data.len())
    }

    fn submit_control(
        &mut self,
        setup: ControlSetup,
        _data: Vec<u8>,
        tag: TransferTag,
    ) -> Result<(), UsbStatus> {
        self.record(Event::Submit { tag });
        self.script.submit_result?;
        self.in_flight.push(Submitted { tag, setup });
        Ok(())
    }

    fn abort_default_pipe(&mut self) -> Result<(), UsbStatus> {
        self.record(Event::Abort);
        self.script.abort_result?;

        if let AsyncBehavior::AbortedAfterAbort { length } = self.script.async_behavior {
            for submitted in self.in_flight.drain(..) {
                self.ready
                    .push(Self::finish(submitted, TransferStatus::Aborted, length));
            }
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), UsbStatus> {
        self.record(Event::Reset);
        self.script.reset_result
    }

    fn reenumerate(&mut self) -> Result<(), UsbStatus> {
        self.record(Event::Reenumerate);
        self.script.reenumerate_result
    }

    fn register_event_source(&mut self, completions: CompletionSender) -> Result<(), UsbStatus> {
        self.record(Event::RegisterEventSource);
        self.script.event_source_result?;
        self.completions = Some(completions);
        Ok(())
    }

    fn deregister_event_source(&mut self) {
        self.record(Event::DeregisterEventSource);
        self.completions = None;
    }

    fn run_loop_once(&mut self, _timeout: Duration) -> Result<(), UsbStatus> {
        self.record(Event::RunLoop);

        if let AsyncBehavior::CompleteOnLoop { length } = self.script.async_behavior {
            for submitted in self.in_flight.drain(..) {
                self.ready
                    .push(Self::finish(submitted, TransferStatus::Completed, length));
            }
        }

        if let Some(sender) = &self.completions {
            for completion in self.ready.drain(..) {
                let _ = sender.try_send(completion);
            }
        }
        Ok(())
    }
}

impl Drop for ScriptedDevice {
    fn drop(&mut self) {
        self.record(Event::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_string_descriptor() {
        let raw = encode_string_descriptor("AB");
        assert_eq!(raw, vec![6, 0x03, b'A', 0, b'B', 0]);
    }

    #[test]
    fn test_arrival_delay() {
        let backend = ScriptedBackend::new()
            .with_device(DeviceScript::new(0x1227))
            .arriving_after(2);

        assert!(backend.enumerate(APPLE_VENDOR_ID, Some(0x1227)).unwrap().is_empty());
        assert!(backend.enumerate(APPLE_VENDOR_ID, Some(0x1227)).unwrap().is_empty());
        assert_eq!(backend.enumerate(APPLE_VENDOR_ID, Some(0x1227)).unwrap(), vec![0]);
        assert!(backend.enumerate(APPLE_VENDOR_ID, Some(0x1281)).unwrap().is_empty());
    }

    #[test]
    fn test_claim_failures_then_success() {
        let mut script = DeviceScript::new(0x1227);
        script.claim_failures = 1;
        let backend = ScriptedBackend::new().with_device(script);

        assert_eq!(backend.claim(&0).err(), Some(UsbStatus::Busy));
        let device = backend.claim(&0).unwrap();
        drop(device);

        assert_eq!(backend.count(&Event::Claim { product_id: 0x1227 }), 2);
        assert_eq!(backend.count(&Event::Release), 1);
    }
}
