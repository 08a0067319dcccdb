//! String descriptor payload extraction
//!
//! A string descriptor is `bLength`, `bDescriptorType`, then UTF-16LE code
//! units. The identity strings we care about are plain ASCII, so only the
//! low byte of each code unit is kept.

use crate::error::{ProtocolError, Result};
use crate::setup::MAX_RESPONSE_LEN;

const HEADER_LEN: usize = 2;

/// Narrow a raw string descriptor into ASCII bytes
///
/// The declared `bLength` is clamped to both the bytes actually received and
/// [`MAX_RESPONSE_LEN`]. The descriptor type byte is not checked since some
/// firmware reports it inconsistently.
pub fn string_descriptor_ascii(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < HEADER_LEN {
        return Err(ProtocolError::BufferTooSmall {
            needed: HEADER_LEN,
            available: raw.len(),
        });
    }

    let declared = raw[0] as usize;
    if declared < HEADER_LEN {
        return Err(ProtocolError::InvalidDescriptor {
            descriptor_type: raw[1],
            length: raw[0],
        });
    }

    let end = declared.min(raw.len()).min(MAX_RESPONSE_LEN);
    Ok(raw[HEADER_LEN..end].iter().step_by(2).copied().collect())
}
