//! Device identity decoding
//!
//! Recovery-mode firmware describes itself with a loosely structured ASCII
//! string such as:
//!
//! ```text
//! CPID:8010 CPRV:11 CPFM:03 SCEP:01 BDID:0C ECID:001A2B3C4D5E6F70 IBFL:3C SRTG:[iBoot-2696.0.0.1.33]
//! ```
//!
//! The exact set of tags and their order differ between firmware
//! generations, so decoding never fails: every tag that cannot be found
//! leaves its field at the default.

use crate::setup::MAX_RESPONSE_LEN;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decoded identity snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Security domain (`SDOM`)
    pub sdom: u32,
    /// Chip identifier (`CPID`)
    pub cpid: u32,
    /// Chip revision (`CPRV`)
    pub cprv: u32,
    /// Chip fuse mode (`CPFM`)
    pub cpfm: u32,
    /// Security epoch (`SCEP`)
    pub scep: u32,
    /// Board identifier (`BDID`)
    pub bdid: u32,
    /// Boot flags (`IBFL`)
    pub ibfl: u32,
    /// Exclusive chip identifier (`ECID`)
    pub ecid: u64,
    /// A serial number field (`SRNM:[`) is present
    pub has_srnm: bool,
    /// The "pwned" marker (`PWND:[`) is present
    pub has_pwnd: bool,
    /// Security tag (`SRTG:[...]`) with the brackets stripped
    pub srtg: Option<String>,
}

impl DeviceInfo {
    /// Decode an identity string
    ///
    /// The input is authoritative: every field reflects only this string.
    /// Use [`DeviceInfo::merge_from`] to accumulate across several strings.
    pub fn parse(raw: &str) -> Self {
        Self::parse_bytes(raw.as_bytes())
    }

    /// Decode an identity string from raw bytes
    ///
    /// Scanning stops at the first NUL and never looks past
    /// [`MAX_RESPONSE_LEN`] bytes.
    pub fn parse_bytes(raw: &[u8]) -> Self {
        let raw = bounded(raw);

        Self {
            sdom: hex_field(raw, b"SDOM:", 8) as u32,
            cpid: hex_field(raw, b"CPID:", 8) as u32,
            cprv: hex_field(raw, b"CPRV:", 8) as u32,
            cpfm: hex_field(raw, b"CPFM:", 8) as u32,
            scep: hex_field(raw, b"SCEP:", 8) as u32,
            bdid: hex_field(raw, b"BDID:", 8) as u32,
            ibfl: hex_field(raw, b"IBFL:", 8) as u32,
            ecid: hex_field(raw, b"ECID:", 16),
            has_srnm: find(raw, b"SRNM:[").is_some(),
            has_pwnd: find(raw, b"PWND:[").is_some(),
            srtg: bracketed_field(raw, b"SRTG:["),
        }
    }

    /// Fold a later decode into this one
    ///
    /// Non-zero numeric fields from `newer` win, flags are sticky once set,
    /// and the security tag is only replaced when `newer` carries one.
    pub fn merge_from(&mut self, newer: DeviceInfo) {
        fn take<T: Default + PartialEq>(slot: &mut T, value: T) {
            if value != T::default() {
                *slot = value;
            }
        }

        take(&mut self.sdom, newer.sdom);
        take(&mut self.cpid, newer.cpid);
        take(&mut self.cprv, newer.cprv);
        take(&mut self.cpfm, newer.cpfm);
        take(&mut self.scep, newer.scep);
        take(&mut self.bdid, newer.bdid);
        take(&mut self.ibfl, newer.ibfl);
        take(&mut self.ecid, newer.ecid);
        self.has_srnm |= newer.has_srnm;
        self.has_pwnd |= newer.has_pwnd;
        if newer.srtg.is_some() {
            self.srtg = newer.srtg;
        }
    }

    /// True when nothing at all was decoded
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CPID:{:04X} CPRV:{:02X} CPFM:{:02X} SCEP:{:02X} BDID:{:02X} ECID:{:016X} IBFL:{:02X} SDOM:{:02X}",
            self.cpid, self.cprv, self.cpfm, self.scep, self.bdid, self.ecid, self.ibfl, self.sdom
        )?;
        if let Some(srtg) = &self.srtg {
            write!(f, " SRTG:[{}]", srtg)?;
        }
        if self.has_pwnd {
            write!(f, " PWND")?;
        }
        Ok(())
    }
}

fn bounded(raw: &[u8]) -> &[u8] {
    let raw = &raw[..raw.len().min(MAX_RESPONSE_LEN)];
    match raw.iter().position(|&b| b == 0) {
        Some(nul) => &raw[..nul],
        None => raw,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Hex value following `tag`, scanned like `%x`: leading whitespace and a
/// `0x` prefix are skipped, digits stop at the first non-hex byte.
fn hex_field(raw: &[u8], tag: &[u8], max_digits: usize) -> u64 {
    let Some(pos) = find(raw, tag) else {
        return 0;
    };

    let mut rest = &raw[pos + tag.len()..];
    while let [first, tail @ ..] = rest {
        if !first.is_ascii_whitespace() {
            break;
        }
        rest = tail;
    }
    if let [b'0', b'x' | b'X', digit, ..] = rest {
        if digit.is_ascii_hexdigit() {
            rest = &rest[2..];
        }
    }

    rest.iter()
        .take_while(|b| b.is_ascii_hexdigit())
        .take(max_digits)
        .fold(0u64, |acc, &b| {
            (acc << 4) | u64::from(char::from(b).to_digit(16).unwrap_or(0))
        })
}

/// Text between `tag` and the next `]`; an empty value counts as absent.
fn bracketed_field(raw: &[u8], tag: &[u8]) -> Option<String> {
    let pos = find(raw, tag)?;
    let value: Vec<u8> = raw[pos + tag.len()..]
        .iter()
        .copied()
        .take_while(|&b| b != b']')
        .collect();

    if value.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&value).into_owned())
    }
}
