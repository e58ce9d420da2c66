use byteorder::{ByteOrder, LE};
use log::{trace, warn};
use num_enum::TryFromPrimitive;
use serde::Deserialize;
use std::fmt::Display;
use std::io::Read;
use thiserror::Error;

pub const BLOCK_SIZE: usize = 512;
pub const MAX_PAYLOAD_SIZE: u32 = 476;

const MAGIC_START0: u32 = 0x0a32_4655; // "UF2\n"
const MAGIC_START1: u32 = 0x9e5d_5157;
const MAGIC_END: u32 = 0x0ab1_6f30;

const FLAG_NOT_MAIN_FLASH: u32 = 0x0000_0001;
const FLAG_FAMILY_ID_PRESENT: u32 = 0x0000_2000;

/// Chip families from the UF2 family registry that ZMK-capable controllers use. Bootloaders
/// silently ignore blocks tagged with a family they don't recognize, so flashing an image for the
/// wrong family "succeeds" without changing anything.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Uf2Family {
    Nrf52840 = 0xada5_2840,
    Nrf52 = 0x1b57_745f,
    Rp2040 = 0xe48b_ff56,
    Samd21 = 0x68ed_2b88,
    Samd51 = 0x5511_4460,
}

impl Display for Uf2Family {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Uf2Family::Nrf52840 => "nRF52840",
            Uf2Family::Nrf52 => "nRF52",
            Uf2Family::Rp2040 => "RP2040",
            Uf2Family::Samd21 => "SAMD21",
            Uf2Family::Samd51 => "SAMD51",
        };
        write!(f, "{name} ({:#010x})", *self as u32)
    }
}

/// Summary of a validated UF2 image.
#[derive(Debug, Clone, PartialEq)]
pub struct Uf2Info {
    pub block_count: usize,
    /// Bytes that will land in main flash (blocks flagged "not main flash" are excluded).
    pub payload_bytes: u64,
    /// Distinct family IDs seen, in order of first appearance. Empty if no block carries one.
    pub family_ids: Vec<u32>,
    /// IEEE CRC32 of the whole file, for identifying builds in logs.
    pub crc32: u32,
}

impl Uf2Info {
    /// Whether any block in the image targets `family`. Images without family tags are accepted
    /// by every bootloader, so they count as targeting anything.
    pub fn targets(&self, family: Uf2Family) -> bool {
        self.family_ids.is_empty() || self.family_ids.contains(&(family as u32))
    }

    /// Human-readable list of families in the image.
    pub fn describe_families(&self) -> String {
        if self.family_ids.is_empty() {
            return "no family ID".to_owned();
        }

        self.family_ids
            .iter()
            .map(|&id| match Uf2Family::try_from(id) {
                Ok(family) => family.to_string(),
                Err(_) => format!("unknown ({id:#010x})"),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Structural problems with a UF2 file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Uf2Error {
    #[error("file is empty")]
    Empty,

    #[error("file is {len} bytes, which is not a multiple of the 512-byte UF2 block size")]
    NotBlockAligned { len: u64 },

    #[error("block {block} has a bad start magic; are you sure this is a UF2 file?")]
    BadStartMagic { block: usize },

    #[error("block {block} has a bad end magic")]
    BadEndMagic { block: usize },

    #[error("block {block} claims a {size}-byte payload, more than the 476 allowed")]
    PayloadTooLarge { block: usize, size: u32 },

    #[error("block {block} is numbered {block_no} of {num_blocks}")]
    BadBlockNumber {
        block: usize,
        block_no: u32,
        num_blocks: u32,
    },
}

/// All errors (parse and I/O) that can happen while reading a UF2 file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid UF2 firmware image")]
    Uf2Error(#[from] Uf2Error),

    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

/// Read and validate every block of a UF2 file, returning a summary. Nothing is written anywhere.
pub fn parse(file: &mut impl Read) -> Result<Uf2Info, Error> {
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    if data.is_empty() {
        return Err(Uf2Error::Empty.into());
    }
    if data.len() % BLOCK_SIZE != 0 {
        return Err(Uf2Error::NotBlockAligned {
            len: data.len() as u64,
        }
        .into());
    }

    let mut payload_bytes = 0u64;
    let mut family_ids = Vec::new();

    for (block, raw) in data.chunks_exact(BLOCK_SIZE).enumerate() {
        if LE::read_u32(&raw[0..4]) != MAGIC_START0 || LE::read_u32(&raw[4..8]) != MAGIC_START1 {
            return Err(Uf2Error::BadStartMagic { block }.into());
        }
        if LE::read_u32(&raw[BLOCK_SIZE - 4..]) != MAGIC_END {
            return Err(Uf2Error::BadEndMagic { block }.into());
        }

        let flags = LE::read_u32(&raw[8..12]);
        let target_addr = LE::read_u32(&raw[12..16]);
        let payload_size = LE::read_u32(&raw[16..20]);
        let block_no = LE::read_u32(&raw[20..24]);
        let num_blocks = LE::read_u32(&raw[24..28]);
        let family_or_size = LE::read_u32(&raw[28..32]);

        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(Uf2Error::PayloadTooLarge {
                block,
                size: payload_size,
            }
            .into());
        }
        if block_no >= num_blocks {
            return Err(Uf2Error::BadBlockNumber {
                block,
                block_no,
                num_blocks,
            }
            .into());
        }

        if flags & FLAG_NOT_MAIN_FLASH == 0 {
            payload_bytes += payload_size as u64;
        }
        if flags & FLAG_FAMILY_ID_PRESENT != 0 && !family_ids.contains(&family_or_size) {
            family_ids.push(family_or_size);
        }

        trace!(
            "UF2 block {block_no}/{num_blocks}: {payload_size} bytes at {target_addr:#010x}, flags {flags:#010x}"
        );
    }

    if family_ids.len() > 1 {
        warn!(
            "Image contains blocks for {} different chip families",
            family_ids.len()
        );
    }

    Ok(Uf2Info {
        block_count: data.len() / BLOCK_SIZE,
        payload_bytes,
        family_ids,
        crc32: crc32fast::hash(&data),
    })
}
