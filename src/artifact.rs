use crate::config::{DeviceProfile, FirmwareFiles};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Which half of the split keyboard an image is for.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Side {
    #[default]
    Left,
    Right,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "left" => Ok(Side::Left),
            "right" => Ok(Side::Right),
            other => Err(ParseError::Side(other.to_owned())),
        }
    }
}

/// Firmware build variant. The alternate build drives the nice!view "gem" display layout.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Variant {
    #[default]
    Standard,
    AlternateDisplay,
}

impl Variant {
    /// Name used on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Standard => "default",
            Variant::AlternateDisplay => "gem",
        }
    }

    /// Key of this variant in a profile's `firmware` table.
    pub fn config_key(self) -> &'static str {
        match self {
            Variant::Standard => "standard",
            Variant::AlternateDisplay => "nice_view_gem",
        }
    }

    /// Suffix appended to conventionally named images, if any.
    fn file_suffix(self) -> Option<&'static str> {
        match self {
            Variant::Standard => None,
            Variant::AlternateDisplay => Some("gem"),
        }
    }
}

impl Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Variant::Standard),
            "gem" => Ok(Variant::AlternateDisplay),
            other => Err(ParseError::Variant(other.to_owned())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Side must be 'left' or 'right', got '{0}'")]
    Side(String),

    #[error("Variant must be 'default' or 'gem', got '{0}'")]
    Variant(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("no firmware file specified for {side} side with variant {variant}")]
    NoFileForSide { side: Side, variant: Variant },
}

/// A firmware image produced by the build, ready to be flashed onto one half.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareArtifact {
    pub path: PathBuf,
    pub side: Side,
    pub variant: Variant,
}

impl FirmwareArtifact {
    /// Work out where the build put the image for `side` and `variant`. A filename listed in the
    /// profile's `firmware` table wins; otherwise the build's naming convention applies:
    /// `<keyboard>_<side>.uf2`, plus `_gem` before the extension for the alternate-display build.
    pub fn resolve(
        results_dir: &Path,
        profile: &DeviceProfile,
        side: Side,
        variant: Variant,
    ) -> Result<Self, ResolveError> {
        let file_name = match profile.firmware.get(variant.config_key()) {
            Some(FirmwareFiles::Single(file)) => file.clone(),
            Some(FirmwareFiles::PerSide { left, right }) => {
                let file = match side {
                    Side::Left => left,
                    Side::Right => right,
                };
                file.clone()
                    .ok_or(ResolveError::NoFileForSide { side, variant })?
            }
            None => conventional_name(&profile.keyboard_name, side, variant),
        };

        Ok(Self {
            path: results_dir.join(file_name),
            side,
            variant,
        })
    }
}

fn conventional_name(keyboard: &str, side: Side, variant: Variant) -> String {
    match variant.file_suffix() {
        Some(suffix) => format!("{keyboard}_{side}_{suffix}.uf2"),
        None => format!("{keyboard}_{side}.uf2"),
    }
}
