//! USB control request setup packet
//!
//! Every request on the default control pipe starts with the standard
//! 8-byte setup packet:
//!
//! | offset | field           | size |
//! |--------|-----------------|------|
//! | 0      | bmRequestType   | 1    |
//! | 1      | bRequest        | 1    |
//! | 2      | wValue (LE)     | 2    |
//! | 4      | wIndex (LE)     | 2    |
//! | 6      | wLength (LE)    | 2    |
//!
//! Values are held in host byte order and converted to little-endian only
//! when the packet is serialized for the transport.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Direction bit of bmRequestType: device-to-host
pub const DIRECTION_IN: u8 = 0x80;
/// Direction bit of bmRequestType: host-to-device
pub const DIRECTION_OUT: u8 = 0x00;

/// Standard request: GET_DESCRIPTOR
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
/// Descriptor type: STRING
pub const DESCRIPTOR_TYPE_STRING: u8 = 0x03;

/// Largest response any request in this crate expects
pub const MAX_RESPONSE_LEN: usize = 256;

/// A control request setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    /// Size of the serialized packet in bytes
    pub const SIZE: usize = 8;

    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Standard GET_DESCRIPTOR(STRING) request for string `index` in `language`
    pub fn string_descriptor(index: u8, language: u16, length: u16) -> Self {
        Self::new(
            DIRECTION_IN,
            REQUEST_GET_DESCRIPTOR,
            (u16::from(DESCRIPTOR_TYPE_STRING) << 8) | u16::from(index),
            language,
            length,
        )
    }

    /// True when data flows from device to host
    pub fn is_in(&self) -> bool {
        (self.request_type & DIRECTION_IN) != 0
    }

    /// Serialize to the on-wire little-endian layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.request_type;
        buf[1] = self.request;
        LittleEndian::write_u16(&mut buf[2..4], self.value);
        LittleEndian::write_u16(&mut buf[4..6], self.index);
        LittleEndian::write_u16(&mut buf[6..8], self.length);
        buf
    }

}
