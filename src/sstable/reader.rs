//! Point lookup against a table file via memory mapping.
//!
//! The file is mapped read-only for the duration of one lookup and unmapped
//! on return. Lookup walks three levels: a linear scan of block first-keys
//! to pick the block, the block's trailing index-offset array to pick the
//! prefix sub-run, and a bounded forward scan of that sub-run. Every access
//! is validated against the mapped region, so a corrupt file surfaces
//! `InvalidData` rather than out-of-bounds reads.

use std::fs::File;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;

use crate::error::{Error, Result};

use super::footer::{Footer, FOOTER_SIZE};
use super::writer::{padding, ENTRY_HEADER_SIZE};

/// Looks up `key` in the table file at `path`, copying its value out on a hit.
pub(crate) fn lookup(path: &Path, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let file = File::open(path)?;
    // Safety: table files are immutable once their footer is written; the
    // store never maps a file that is still being built.
    let mmap = unsafe { Mmap::map(&file) }
        .map_err(|e| Error::IO(format!("failed to map table file: {e}")))?;

    let footer = Footer::decode(&mmap)?;
    let block_size = footer.block_size as usize;
    let block_count = footer.block_count as usize;
    let claimed = (footer.block_count)
        .checked_mul(footer.block_size)
        .and_then(|n| n.checked_add(FOOTER_SIZE as u64));
    if block_size == 0 || !claimed.is_some_and(|n| n <= mmap.len() as u64) {
        return errdata!("table file shorter than its footer claims");
    }

    // Pick the last block whose first key is <= the query. Block first
    // entries are always index keys carrying the full key.
    let mut block = 0;
    while block < block_count {
        let base = block * block_size;
        let first = index_key_at(&mmap, base, base + block_size)?;
        if key < first {
            break;
        }
        block += 1;
    }
    if block == 0 {
        // Smaller than the first key of the first block (or no blocks).
        return Ok(None);
    }
    let base = (block - 1) * block_size;

    // Walk the block's index offsets: the sub-run begins at the greatest
    // index key <= the query.
    let index_count = read_u64_at(&mmap, base + block_size - 8)? as usize;
    if index_count == 0 || index_count >= block_size / 8 {
        return errdata!("block index count {index_count} out of range");
    }
    let footer_start = base + block_size - 8 * (index_count + 1);

    let mut offset = 0usize;
    let mut prefix: &[u8] = &[];
    for i in 0..index_count {
        let candidate = read_u64_at(&mmap, footer_start + 8 * i)? as usize;
        if base + candidate >= footer_start {
            return errdata!("block index offset {candidate} out of range");
        }
        let index_key = index_key_at(&mmap, base + candidate, footer_start)?;
        if key < index_key {
            break;
        }
        offset = candidate;
        prefix = index_key;
    }

    // Scan the sub-run: stop on a match, the next index key, or the footer.
    let start = base + offset;
    let mut pos = start;
    loop {
        if pos + ENTRY_HEADER_SIZE > footer_start {
            return Ok(None);
        }
        let prefix_bytes = read_u32_at(&mmap, pos)? as usize;
        let suffix_bytes = read_u32_at(&mmap, pos + 4)? as usize;
        let value_len = read_u64_at(&mmap, pos + 8)?;
        if pos != start && prefix_bytes == 0 {
            // Start of the next sub-run (or the block's zero fill).
            return Ok(None);
        }
        if prefix_bytes > prefix.len() {
            return errdata!("entry prefix length {prefix_bytes} exceeds index key");
        }
        if value_len > footer.block_size {
            return errdata!("entry value length {value_len} exceeds block size");
        }
        let value_bytes = value_len as usize;

        let suffix_end = pos + ENTRY_HEADER_SIZE + suffix_bytes;
        let value_start = suffix_end + padding(suffix_bytes);
        let value_end = value_start + value_bytes;
        if value_end > footer_start {
            return errdata!("entry extends past block footer");
        }

        let suffix = &mmap[pos + ENTRY_HEADER_SIZE..suffix_end];
        if key.len() == prefix_bytes + suffix_bytes
            && key[..prefix_bytes] == prefix[..prefix_bytes]
            && &key[prefix_bytes..] == suffix
        {
            return Ok(Some(mmap[value_start..value_end].to_vec()));
        }

        pos = value_end + padding(value_bytes);
    }
}

/// Reads the full key of the index entry at `pos`, which must carry
/// `prefix_bytes == 0`.
fn index_key_at(mmap: &[u8], pos: usize, limit: usize) -> Result<&[u8]> {
    if pos + ENTRY_HEADER_SIZE > limit {
        return errdata!("index entry header out of bounds");
    }
    let prefix_bytes = read_u32_at(mmap, pos)?;
    if prefix_bytes != 0 {
        return errdata!("index entry has a shared prefix");
    }
    let suffix_bytes = read_u32_at(mmap, pos + 4)? as usize;
    let end = pos + ENTRY_HEADER_SIZE + suffix_bytes;
    if end > limit {
        return errdata!("index entry key out of bounds");
    }
    Ok(&mmap[pos + ENTRY_HEADER_SIZE..end])
}

fn read_u32_at(mmap: &[u8], pos: usize) -> Result<u32> {
    let Some(mut bytes) = mmap.get(pos..pos + 4) else {
        return errdata!("read past end of table file");
    };
    Ok(bytes.read_u32::<LittleEndian>()?)
}

fn read_u64_at(mmap: &[u8], pos: usize) -> Result<u64> {
    let Some(mut bytes) = mmap.get(pos..pos + 8) else {
        return errdata!("read past end of table file");
    };
    Ok(bytes.read_u64::<LittleEndian>()?)
}
