//! Serializes a frozen memtable into an immutable sorted table file.
//!
//! Entries stream into fixed-size blocks in ascending key order. Each entry
//! starts with a 16-byte header (`prefix_bytes: u32, suffix_bytes: u32,
//! value_bytes: u64`), followed by the key suffix and value, each
//! zero-padded to the next 8-byte boundary. The first entry of a block, and
//! any entry sharing no leading byte with the current prefix, is an "index
//! key": it carries the full key and anchors the prefix for the entries
//! after it. Every block ends with the block-relative offsets of its index
//! keys followed by their count, zero fill bridging the gap so that each
//! block occupies exactly `block_size` bytes.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::Result;
use crate::memtable::Memtable;

use super::footer::Footer;

/// Bytes in an entry header.
pub(crate) const ENTRY_HEADER_SIZE: usize = 16;

/// Zero padding needed after `n` bytes to reach the next 8-byte boundary.
/// Never zero: already-aligned data still pads by a full word.
pub(crate) fn padding(n: usize) -> usize {
    8 - (n % 8)
}

fn entry_size(suffix_len: usize, value_len: usize) -> usize {
    ENTRY_HEADER_SIZE + suffix_len + padding(suffix_len) + value_len + padding(value_len)
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(a, b)| a == b).count()
}

/// Streams `table` into a new file at `path`, returning the footer that was
/// written. The memtable must already be frozen.
pub(crate) fn write_table(path: &Path, block_size: usize, table: &Memtable) -> Result<Footer> {
    if !table.locked() {
        return errinput!("memtable must be frozen before building a table");
    }

    let mut writer = BufWriter::new(File::create(path)?);

    let mut block_count: u64 = 0;
    let mut entry_count: u64 = 0;
    let mut key_bytes: u64 = 0;
    let mut value_bytes: u64 = 0;

    let mut block_bytes: usize = 0;
    let mut index_offsets: Vec<u64> = Vec::new();
    let mut prefix: Vec<u8> = Vec::new();

    table.for_each(|key, value| {
        key_bytes += key.len() as u64;
        value_bytes += value.len() as u64;
        entry_count += 1;

        // An entry must fit an otherwise empty block along with its own
        // index offset and the trailing count word.
        let index_form = entry_size(key.len(), value.len());
        if index_form + 16 > block_size {
            return errinput!(
                "entry of {} key and {} value bytes exceeds block size {block_size}",
                key.len(),
                value.len()
            );
        }

        let mut shared = shared_prefix_length(&prefix, key);
        let mut entry_bytes = entry_size(key.len() - shared, value.len());

        // Close the block when this entry plus the index bookkeeping it
        // implies would overflow: its own bytes, the offset slot it may add,
        // the offsets already recorded, and the count word.
        let offset_slots = index_offsets.len() + usize::from(shared == 0) + 1;
        if block_bytes + entry_bytes + 8 * offset_slots > block_size {
            close_block(&mut writer, block_size, block_bytes, &index_offsets)?;
            block_count += 1;
            block_bytes = 0;
            index_offsets.clear();
            prefix.clear();
            shared = 0;
            entry_bytes = index_form;
        }

        if shared == 0 {
            index_offsets.push(block_bytes as u64);
            prefix.clear();
            prefix.extend_from_slice(key);
        }
        let suffix = &key[shared..];

        writer.write_u32::<LittleEndian>(shared as u32)?;
        writer.write_u32::<LittleEndian>(suffix.len() as u32)?;
        writer.write_u64::<LittleEndian>(value.len() as u64)?;
        writer.write_all(suffix)?;
        write_zeros(&mut writer, padding(suffix.len()))?;
        writer.write_all(value)?;
        write_zeros(&mut writer, padding(value.len()))?;
        block_bytes += entry_bytes;

        Ok(())
    })?;

    if block_bytes > 0 {
        close_block(&mut writer, block_size, block_bytes, &index_offsets)?;
        block_count += 1;
    }

    let footer = Footer {
        block_size: block_size as u64,
        block_count,
        entry_count,
        key_bytes,
        value_bytes,
    };
    writer.write_all(&footer.encode())?;
    writer.flush()?;

    Ok(footer)
}

/// Zero-fills up to the footer region, then writes the recorded index
/// offsets and their count, completing a block of exactly `block_size` bytes.
fn close_block<W: Write>(
    writer: &mut W,
    block_size: usize,
    block_bytes: usize,
    index_offsets: &[u64],
) -> Result<()> {
    let footer_bytes = 8 * (index_offsets.len() + 1);
    write_zeros(writer, block_size - footer_bytes - block_bytes)?;
    for offset in index_offsets {
        writer.write_u64::<LittleEndian>(*offset)?;
    }
    writer.write_u64::<LittleEndian>(index_offsets.len() as u64)?;
    Ok(())
}

fn write_zeros<W: Write>(writer: &mut W, mut count: usize) -> Result<()> {
    const ZEROS: [u8; 4096] = [0u8; 4096];
    while count > 0 {
        let n = count.min(ZEROS.len());
        writer.write_all(&ZEROS[..n])?;
        count -= n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_never_zero() {
        assert_eq!(padding(0), 8);
        assert_eq!(padding(1), 7);
        assert_eq!(padding(7), 1);
        assert_eq!(padding(8), 8);
        assert_eq!(padding(9), 7);
        assert_eq!(padding(16), 8);
    }

    #[test]
    fn test_shared_prefix_length() {
        assert_eq!(shared_prefix_length(b"", b"apple"), 0);
        assert_eq!(shared_prefix_length(b"apple", b"applet"), 5);
        assert_eq!(shared_prefix_length(b"apple", b"banana"), 0);
        assert_eq!(shared_prefix_length(b"apple", b"apricot"), 2);
    }
}
