use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

/// Fixed magic closing every table file.
pub const MAGIC: u64 = 0x677265676F727968;

/// Encoded footer size in bytes: six u64 fields.
pub const FOOTER_SIZE: usize = 48;

/// Trailer of a table file, describing its block geometry and totals.
///
/// All fields are unsigned 64-bit little-endian, so files move between
/// hosts regardless of endianness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Size in bytes of each data block.
    pub block_size: u64,
    /// Number of data blocks in the file.
    pub block_count: u64,
    /// Total entry count across all blocks.
    pub entry_count: u64,
    /// Sum of raw key sizes, before prefix compression.
    pub key_bytes: u64,
    /// Sum of raw value sizes.
    pub value_bytes: u64,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        (&mut buf[0..8]).write_u64::<LittleEndian>(self.block_size).unwrap();
        (&mut buf[8..16]).write_u64::<LittleEndian>(self.block_count).unwrap();
        (&mut buf[16..24]).write_u64::<LittleEndian>(self.entry_count).unwrap();
        (&mut buf[24..32]).write_u64::<LittleEndian>(self.key_bytes).unwrap();
        (&mut buf[32..40]).write_u64::<LittleEndian>(self.value_bytes).unwrap();
        (&mut buf[40..48]).write_u64::<LittleEndian>(MAGIC).unwrap();
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_SIZE {
            return errdata!("table footer truncated: {} bytes", buf.len());
        }
        let mut reader = &buf[buf.len() - FOOTER_SIZE..];
        let footer = Self {
            block_size: reader.read_u64::<LittleEndian>()?,
            block_count: reader.read_u64::<LittleEndian>()?,
            entry_count: reader.read_u64::<LittleEndian>()?,
            key_bytes: reader.read_u64::<LittleEndian>()?,
            value_bytes: reader.read_u64::<LittleEndian>()?,
        };
        let magic = reader.read_u64::<LittleEndian>()?;
        if magic != MAGIC {
            return errdata!("bad table magic {magic:#x}");
        }
        Ok(footer)
    }
}
