use serde::Deserialize;
use std::fmt::Display;
use thiserror::Error;

const ADAFRUIT_VID: u16 = 0x239a;
const SEEED_VID: u16 = 0x2886;

const KNOWN_BOOTLOADERS: &[KnownBootloader] = &[
    // nice!nano v2 and other boards running the Adafruit nRF52 bootloader
    KnownBootloader {
        id: UsbId::new(ADAFRUIT_VID, 0x00b3),
        name: "Adafruit nRF52 UF2 bootloader",
    },
    // Seeed XIAO nRF52840 (BLE / BLE Sense)
    KnownBootloader {
        id: UsbId::new(SEEED_VID, 0x0045),
        name: "Seeed XIAO nRF52840 UF2 bootloader",
    },
];

#[derive(Copy, Clone, Debug)]
struct KnownBootloader {
    id: UsbId,
    name: &'static str,
}

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl UsbId {
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Parse a single 16-bit ID written in hex, with or without a `0x` prefix. Case is ignored, which
/// matches the way udev and `lsusb` sometimes disagree on capitalization.
pub fn parse_hex_id(s: &str) -> Result<u16, IdError> {
    let trimmed = s.trim().trim_matches('"');
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() || digits.len() > 4 {
        return Err(IdError::InvalidHex(s.to_owned()));
    }

    u16::from_str_radix(digits, 16).map_err(|_| IdError::InvalidHex(s.to_owned()))
}

/// A 16-bit ID as it appears in configuration files, i.e. as a hex string such as `"00b3"`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct HexId(pub u16);

impl TryFrom<String> for HexId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_hex_id(&value).map(HexId)
    }
}

impl Display for HexId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum IdError {
    #[error("'{0}' is not a 16-bit hexadecimal USB ID")]
    InvalidHex(String),
}

/// Identifies a class of bootloader devices: the USB ID its mass-storage interface enumerates
/// with, plus a name for humans.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSignature {
    pub id: UsbId,
    pub name: String,
}

impl Display for DeviceSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Look up a human-readable name for a bootloader we know about, for listings. Returns [None]
/// for anything else; that doesn't mean the device can't be flashed, only that we haven't seen it.
pub fn known_bootloader(id: UsbId) -> Option<&'static str> {
    KNOWN_BOOTLOADERS
        .iter()
        .find(|candidate| candidate.id == id)
        .map(|candidate| candidate.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hex_ids_ignore_case() {
        assert_eq!(parse_hex_id("239A"), Ok(0x239a));
        assert_eq!(parse_hex_id("00B3"), parse_hex_id("00b3"));
    }

    #[test]
    fn display_round_trips_through_lowercase_hex() {
        let id = UsbId::new(0x239a, 0x00b3);
        assert_eq!(id.to_string(), "239a:00b3");
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(matches!(parse_hex_id("zz"), Err(IdError::InvalidHex(_))));
        assert!(matches!(parse_hex_id(""), Err(IdError::InvalidHex(_))));
        assert!(matches!(parse_hex_id("123456"), Err(IdError::InvalidHex(_))));
    }

    #[test]
    fn accepts_prefixed_and_quoted_hex() {
        assert_eq!(parse_hex_id("0x00b3"), Ok(0x00b3));
        assert_eq!(parse_hex_id("\"239a\""), Ok(0x239a));
    }

    #[test]
    fn knows_supported_bootloaders() {
        assert!(known_bootloader(UsbId::new(0x239a, 0x00b3)).is_some());
        assert!(known_bootloader(UsbId::new(0x2886, 0x0045)).is_some());
        assert_eq!(known_bootloader(UsbId::new(0x05a7, 0x40fe)), None);
    }
}
