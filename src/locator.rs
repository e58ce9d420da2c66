use crate::device_ids::{DeviceSignature, UsbId, parse_hex_id};
use log::debug;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

// Some buses report IDs under the generic keys, USB storage usually under the USB-specific ones,
// and plenty of devices set both. Any of them may match.
const VENDOR_KEYS: &[&str] = &["ID_VENDOR_ID", "ID_USB_VENDOR_ID"];
const PRODUCT_KEYS: &[&str] = &["ID_MODEL_ID", "ID_USB_MODEL_ID"];
const MODEL_KEYS: &[&str] = &["ID_MODEL", "ID_USB_MODEL"];

/// A block device node and the udev metadata describing it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub removable: bool,
    pub properties: BTreeMap<String, String>,
}

impl BlockDevice {
    /// Build from the output of `udevadm info --query=property` (`KEY=value` lines) or
    /// `udevadm info --query=all` (`E: KEY=value` lines mixed with other records, which are
    /// ignored).
    pub fn from_udev(path: impl Into<PathBuf>, removable: bool, output: &str) -> Self {
        let properties = output
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                let line = line.strip_prefix("E: ").unwrap_or(line);
                let (key, value) = line.split_once('=')?;
                if key.is_empty() || key.contains(char::is_whitespace) {
                    return None;
                }
                Some((key.to_owned(), value.trim_matches('"').to_owned()))
            })
            .collect();

        Self {
            path: path.into(),
            removable,
            properties,
        }
    }

    fn ids(&self, keys: &[&str]) -> Vec<u16> {
        keys.iter()
            .filter_map(|key| self.properties.get(*key))
            .filter_map(|value| parse_hex_id(value).ok())
            .collect()
    }

    /// Every vendor ID this device reports, across all key variants.
    pub fn vendor_ids(&self) -> Vec<u16> {
        self.ids(VENDOR_KEYS)
    }

    /// Every product ID this device reports, across all key variants.
    pub fn product_ids(&self) -> Vec<u16> {
        self.ids(PRODUCT_KEYS)
    }

    /// The device's USB ID, if it reports both halves.
    pub fn usb_id(&self) -> Option<UsbId> {
        Some(UsbId::new(
            *self.vendor_ids().first()?,
            *self.product_ids().first()?,
        ))
    }

    pub fn model(&self) -> Option<&str> {
        MODEL_KEYS
            .iter()
            .find_map(|key| self.properties.get(*key))
            .map(String::as_str)
    }

    /// Whether any reported vendor ID and any reported product ID equal the signature's.
    pub fn matches(&self, signature: &DeviceSignature) -> bool {
        self.vendor_ids().contains(&signature.id.vid)
            && self.product_ids().contains(&signature.id.pid)
    }
}

/// Source of candidate block devices. Implemented over sysfs and udev for real hardware, and by
/// test doubles.
pub trait DeviceProbe {
    /// List the block devices currently attached, in a stable order. Must not change any state.
    fn block_devices(&self) -> std::io::Result<Vec<BlockDevice>>;
}

/// A bootloader volume found on this host. Only meaningful while the board stays plugged in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub path: PathBuf,
}

impl Display for DiscoveredDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Why a candidate was or wasn't selected.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Match(DeviceSignature),
    Mismatch(UsbId),
    NoUsbIds,
}

impl Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Verdict::Match(signature) => write!(f, "matches {signature}"),
            Verdict::Mismatch(id) => write!(f, "{id} matches no known bootloader"),
            Verdict::NoUsbIds => write!(f, "reports no USB vendor/product ID"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub device: BlockDevice,
    pub verdict: Verdict,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to enumerate block devices")]
    Probe(#[from] std::io::Error),

    #[error("no block device matches {signature}; is the board in bootloader mode?")]
    NoDevices { signature: DeviceSignature },

    #[error("multiple block devices match {signature}: {}", .paths.join(", "))]
    MultipleDevices {
        signature: DeviceSignature,
        paths: Vec<String>,
    },
}

/// Check every attached block device against `signatures`. Each candidate is logged at debug
/// level along with the reason it was accepted or rejected.
pub fn scan(
    probe: &impl DeviceProbe,
    signatures: &[DeviceSignature],
) -> Result<Vec<Candidate>, Error> {
    let devices = probe.block_devices()?;
    debug!("Considering {} block device(s)", devices.len());

    Ok(devices
        .into_iter()
        .map(|device| {
            let verdict = match signatures.iter().find(|s| device.matches(s)) {
                Some(signature) => Verdict::Match(signature.clone()),
                None => match device.usb_id() {
                    Some(id) => Verdict::Mismatch(id),
                    None => Verdict::NoUsbIds,
                },
            };

            debug!(
                "{} (removable: {}, model: {}): {verdict}",
                device.path.display(),
                device.removable,
                device.model().unwrap_or("unknown"),
            );

            Candidate { device, verdict }
        })
        .collect())
}

/// Find the single block device matching `signature`. Finding none is an error, and so is finding
/// more than one: picking arbitrarily could flash the wrong board.
pub fn locate(
    probe: &impl DeviceProbe,
    signature: &DeviceSignature,
) -> Result<DiscoveredDevice, Error> {
    let mut matches = scan(probe, std::slice::from_ref(signature))?
        .into_iter()
        .filter(|c| matches!(c.verdict, Verdict::Match(_)))
        .map(|c| c.device.path);

    match (matches.next(), matches.next()) {
        (None, _) => Err(Error::NoDevices {
            signature: signature.clone(),
        }),
        (Some(path), None) => Ok(DiscoveredDevice { path }),
        (Some(first), Some(second)) => {
            let paths = [first, second]
                .into_iter()
                .chain(matches)
                .map(|p| p.display().to_string())
                .collect();
            Err(Error::MultipleDevices {
                signature: signature.clone(),
                paths,
            })
        }
    }
}
