use crate::device_ids::{DeviceSignature, HexId, UsbId};
use crate::uf2_file::Uf2Family;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DEVICE: &str = "corne_ergokeeb";
pub const DEFAULT_RESULTS_DIR: &str = "results";
/// Filename the UF2 bootloader treats as "new firmware, flash me".
pub const DEFAULT_DESTINATION_NAME: &str = "CURRENT.UF2";
/// Seconds to leave the bootloader volume mounted after copying.
pub const DEFAULT_READY_TIME: u64 = 20;

const BUILTIN_DEVICES: &str = include_str!("../etc/devices.toml");

/// All known device profiles, keyed by nickname.
#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceTable {
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceProfile>,
}

impl DeviceTable {
    /// The table shipped with the tool.
    pub fn builtin() -> Result<Self> {
        BUILTIN_DEVICES.parse()
    }

    /// Read a table from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        data.parse()
    }

    /// Look up a profile by nickname.
    pub fn get(&self, name: &str) -> Result<&DeviceProfile> {
        self.devices
            .get(name)
            .ok_or_else(|| ConfigError::UnknownDevice {
                name: name.to_owned(),
                available: self.devices.keys().cloned().collect::<Vec<_>>().join(", "),
            })
    }

    /// Signatures of every profile, for scanning against all of them at once.
    pub fn signatures(&self) -> Vec<DeviceSignature> {
        self.devices
            .iter()
            .map(|(name, profile)| profile.signature(name))
            .collect()
    }
}

impl FromStr for DeviceTable {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let table: DeviceTable = toml::de::from_str(data)?;
        for (name, profile) in &table.devices {
            if profile.keyboard_name.trim().is_empty() {
                return Err(ConfigError::MissingKeyboardName(name.clone()));
            }
        }
        Ok(table)
    }
}

impl Display for DeviceTable {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for (name, profile) in &self.devices {
            writeln!(
                fmt,
                "{name}: vendor_id={} product_id={} keyboard_name={}",
                profile.vendor_id, profile.product_id, profile.keyboard_name
            )?;
            if let Some(description) = &profile.description {
                writeln!(fmt, "    {description}")?;
            }
            if let Some(family) = profile.family {
                writeln!(fmt, "    UF2 family: {family}")?;
            }
            for (variant, files) in &profile.firmware {
                writeln!(fmt, "    firmware.{variant}: {files}")?;
            }
        }
        Ok(())
    }
}

/// One keyboard's controller and how its firmware images are named.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceProfile {
    /// Base name of firmware images produced by the build, e.g. `ergokeeb_corne`.
    pub keyboard_name: String,

    pub description: Option<String>,

    /// USB vendor ID of the controller's bootloader.
    pub vendor_id: HexId,

    /// USB product ID of the controller's bootloader.
    pub product_id: HexId,

    /// UF2 family the controller's bootloader accepts. Unset means "don't check".
    pub family: Option<Uf2Family>,

    /// Explicit firmware filenames, keyed by variant (`standard`, `nice_view_gem`).
    #[serde(default)]
    pub firmware: BTreeMap<String, FirmwareFiles>,
}

impl DeviceProfile {
    pub fn usb_id(&self) -> UsbId {
        UsbId::new(self.vendor_id.0, self.product_id.0)
    }

    /// The bootloader signature for this profile. The description doubles as the display name.
    pub fn signature(&self, nickname: &str) -> DeviceSignature {
        DeviceSignature {
            id: self.usb_id(),
            name: self
                .description
                .clone()
                .unwrap_or_else(|| nickname.to_owned()),
        }
    }
}

/// Firmware filenames for one variant: one per half, or a single image (e.g. for a dongle build
/// where only the central is flashed).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FirmwareFiles {
    Single(String),
    PerSide {
        left: Option<String>,
        right: Option<String>,
    },
}

impl Display for FirmwareFiles {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            FirmwareFiles::Single(file) => write!(fmt, "{file}"),
            FirmwareFiles::PerSide { left, right } => write!(
                fmt,
                "left={} right={}",
                left.as_deref().unwrap_or("-"),
                right.as_deref().unwrap_or("-")
            ),
        }
    }
}

/// Everything one invocation needs, resolved once at startup and passed down by reference.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory the build drops `.uf2` images into.
    pub results_dir: PathBuf,

    /// Where the bootloader volume gets mounted.
    pub mount_point: PathBuf,

    /// Name the image is copied to on the bootloader volume.
    pub destination_name: String,

    /// How long to keep the volume mounted after copying, so the bootloader can start consuming
    /// the image before the filesystem goes away.
    pub settle: Duration,

    /// Prefix mount, copy and unmount with `sudo`.
    pub use_sudo: bool,

    pub devices: DeviceTable,
}

impl Settings {
    /// Settings with every knob at its default.
    pub fn new(devices: DeviceTable) -> Self {
        Self {
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            mount_point: default_mount_point(),
            destination_name: DEFAULT_DESTINATION_NAME.to_owned(),
            settle: Duration::from_secs(DEFAULT_READY_TIME),
            use_sudo: true,
            devices,
        }
    }

    /// Full path of the image on the mounted bootloader volume.
    pub fn destination(&self) -> PathBuf {
        self.mount_point.join(&self.destination_name)
    }
}

/// `~/mnt/corne`, or `/mnt/corne` when there is no home directory.
pub fn default_mount_point() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("mnt").join("corne"))
        .unwrap_or_else(|| PathBuf::from("/mnt/corne"))
}

/// Configuration error types.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to parse device table")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read device table {}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no keyboard_name specified for device '{0}'")]
    MissingKeyboardName(String),

    #[error("device '{name}' not found in device table (available: {available})")]
    UnknownDevice { name: String, available: String },
}

type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn builtin_table_parses() {
        let table = DeviceTable::builtin().unwrap();
        let corne = table.get(DEFAULT_DEVICE).unwrap();

        assert_eq!(corne.keyboard_name, "ergokeeb_corne");
        assert_eq!(corne.usb_id(), UsbId::new(0x239a, 0x00b3));
        assert_eq!(corne.family, Some(Uf2Family::Nrf52840));

        let xiao = table.get("corne_xiao").unwrap();
        assert_eq!(xiao.usb_id(), UsbId::new(0x2886, 0x0045));
    }

    #[test]
    fn parses_firmware_overrides() {
        let table: DeviceTable = indoc! {r#"
            [devices.corne_dongle]
            keyboard_name = "corne"
            vendor_id = "239A"
            product_id = "0x00B3"

            [devices.corne_dongle.firmware]
            standard = { left = "corne_with_dongle_left.uf2", right = "corne_with_dongle_right.uf2" }
            dongle = "corne_dongle.uf2"
        "#}
        .parse()
        .unwrap();

        let profile = table.get("corne_dongle").unwrap();
        assert_eq!(profile.usb_id(), UsbId::new(0x239a, 0x00b3));
        assert_eq!(profile.family, None);
        assert_eq!(
            profile.firmware.get("standard"),
            Some(&FirmwareFiles::PerSide {
                left: Some("corne_with_dongle_left.uf2".into()),
                right: Some("corne_with_dongle_right.uf2".into()),
            })
        );
        assert_eq!(
            profile.firmware.get("dongle"),
            Some(&FirmwareFiles::Single("corne_dongle.uf2".into()))
        );
    }

    #[test]
    fn rejects_bad_hex_ids() {
        let result = indoc! {r#"
            [devices.bad]
            keyboard_name = "bad"
            vendor_id = "nope"
            product_id = "00b3"
        "#}
        .parse::<DeviceTable>();

        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_empty_keyboard_name() {
        let result = indoc! {r#"
            [devices.nameless]
            keyboard_name = ""
            vendor_id = "239a"
            product_id = "00b3"
        "#}
        .parse::<DeviceTable>();

        assert!(matches!(result, Err(ConfigError::MissingKeyboardName(name)) if name == "nameless"));
    }

    #[test]
    fn unknown_device_lists_available_ones() {
        let table = DeviceTable::builtin().unwrap();
        let err = table.get("lily58").unwrap_err();

        assert_eq!(
            err.to_string(),
            "device 'lily58' not found in device table (available: corne_ergokeeb, corne_xiao)"
        );
    }

    #[test]
    fn signature_falls_back_to_nickname() {
        let table: DeviceTable = indoc! {r#"
            [devices.plain]
            keyboard_name = "plain"
            vendor_id = "239a"
            product_id = "00b3"
        "#}
        .parse()
        .unwrap();

        let signature = table.get("plain").unwrap().signature("plain");
        assert_eq!(signature.name, "plain");
        assert_eq!(signature.to_string(), "plain (239a:00b3)");
    }

    #[test]
    fn displays_table() {
        let table = DeviceTable::builtin().unwrap();
        let shown = table.to_string();

        assert!(shown.contains("corne_ergokeeb: vendor_id=239a product_id=00b3 keyboard_name=ergokeeb_corne"));
        assert!(shown.contains("UF2 family: nRF52840 (0xada52840)"));
    }

    #[test]
    fn destination_joins_mount_point() {
        let mut settings = Settings::new(DeviceTable::default());
        settings.mount_point = PathBuf::from("/tmp/corne");

        assert_eq!(settings.destination(), PathBuf::from("/tmp/corne/CURRENT.UF2"));
        assert_eq!(settings.settle, Duration::from_secs(20));
    }
}
