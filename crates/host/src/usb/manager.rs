//! libusb device enumeration
//!
//! Matches attached devices by vendor and product code and opens handles
//! on them. Hot-plug is not used: acquisition polls enumeration instead.

use crate::usb::backend::{CandidateInfo, UsbBackend};
use crate::usb::device::{self, RusbDevice, map_rusb_error};
use protocol::UsbStatus;
use rusb::{Context, Device, UsbContext};
use tracing::{debug, info};

/// A matching device that has not been opened yet
#[derive(Clone)]
pub struct RusbCandidate {
    device: Device<Context>,
    vendor_id: u16,
    product_id: u16,
}

/// Host USB stack backed by a libusb context
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    /// Create a backend with its own libusb context
    pub fn new() -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        info!("libusb {} initialized", version_string());
        Ok(Self { context })
    }

    /// Check a descriptor's codes against a vendor and optional product filter
    fn matches(vid: u16, pid: u16, vendor_id: u16, product_id: Option<u16>) -> bool {
        vid == vendor_id && product_id.is_none_or(|p| p == pid)
    }
}

impl UsbBackend for RusbBackend {
    type Device = RusbDevice;
    type Candidate = RusbCandidate;

    fn enumerate(
        &self,
        vendor_id: u16,
        product_id: Option<u16>,
    ) -> Result<Vec<RusbCandidate>, UsbStatus> {
        let devices = self.context.devices().map_err(map_rusb_error)?;

        let mut candidates = Vec::new();
        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    debug!(
                        "Skipping device without descriptor: bus={}, addr={}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            if !Self::matches(desc.vendor_id(), desc.product_id(), vendor_id, product_id) {
                continue;
            }

            debug!(
                "Matched device: bus={}, addr={}, vid={:#06x}, pid={:#06x}",
                device.bus_number(),
                device.address(),
                desc.vendor_id(),
                desc.product_id()
            );
            candidates.push(RusbCandidate {
                device,
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
            });
        }

        Ok(candidates)
    }

    fn describe(&self, candidate: &RusbCandidate) -> CandidateInfo {
        CandidateInfo {
            vendor_id: candidate.vendor_id,
            product_id: candidate.product_id,
            bus_number: candidate.device.bus_number(),
            address: candidate.device.address(),
            location_id: device::location_id(&candidate.device),
        }
    }

    fn claim(&self, candidate: &RusbCandidate) -> Result<RusbDevice, UsbStatus> {
        let handle = candidate.device.open().map_err(map_rusb_error)?;
        RusbDevice::new(self.context.clone(), candidate.device.clone(), handle)
    }
}

fn version_string() -> String {
    let version = rusb::version();
    format!(
        "{}.{}.{}.{}",
        version.major(),
        version.minor(),
        version.micro(),
        version.nano()
    )
}
