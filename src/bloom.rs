//! Bloom filter for approximate set membership.
//!
//! Answers "is this key in the set?" with no false negatives: a `false`
//! from [`BloomFilter::may_contain`] is definitive, a `true` may be a false
//! positive at the configured rate. Intended as a fast reject for table
//! lookups on the not-found path; the current read path does not consult
//! it yet, so the filter stands alone.
//!
//! Rather than k independent hash functions, the filter splits one 128-bit
//! xxh3 hash into two 64-bit halves and derives bit positions by double
//! hashing: `h_i(key) = h1 + i * h2 (mod num_bits)`.

use xxhash_rust::xxh3::xxh3_128;

use crate::error::Result;

/// Space-efficient probabilistic set of keys.
pub struct BloomFilter {
    bits: Vec<u64>,
    num_hashes: u32,
    num_bits: u64,
}

impl BloomFilter {
    /// Creates a filter sized to hold `capacity` keys at the target false
    /// positive rate (e.g. 0.01 for 1%).
    pub fn new(capacity: usize, false_positive_rate: f64) -> Result<Self> {
        if capacity == 0 {
            return errinput!("filter capacity must be positive");
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return errinput!("false positive rate must be in (0, 1), got {false_positive_rate}");
        }

        let bits_per_key = -1.44 * false_positive_rate.log2();
        let num_bits = ((capacity as f64 * bits_per_key).ceil() as u64).max(64);
        let num_hashes = ((bits_per_key * std::f64::consts::LN_2).ceil() as u32).max(1);

        Ok(Self {
            bits: vec![0u64; num_bits.div_ceil(64) as usize],
            num_hashes,
            num_bits,
        })
    }

    /// Adds a key to the filter.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = split_hash(key);
        for i in 0..self.num_hashes {
            let bit = self.position(h1, h2, i);
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// Returns false iff the key is definitely not in the filter.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = split_hash(key);
        for i in 0..self.num_hashes {
            let bit = self.position(h1, h2, i);
            if self.bits[(bit / 64) as usize] & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Serializes the filter for embedding in a table file.
    ///
    /// Layout, little-endian: `num_hashes: u32 | num_bits: u64 | words`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.bits.len() * 8);
        buf.extend_from_slice(&self.num_hashes.to_le_bytes());
        buf.extend_from_slice(&self.num_bits.to_le_bytes());
        for word in &self.bits {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return errdata!("bloom filter truncated: {} bytes", data.len());
        }
        let num_hashes = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let num_bits = u64::from_le_bytes(data[4..12].try_into().unwrap());

        let words = num_bits.div_ceil(64) as usize;
        if data.len() != 12 + words * 8 || num_hashes == 0 || num_bits == 0 {
            return errdata!("bloom filter layout mismatch");
        }

        let bits = data[12..]
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
            .collect();

        Ok(Self {
            bits,
            num_hashes,
            num_bits,
        })
    }

    fn position(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }
}

fn split_hash(key: &[u8]) -> (u64, u64) {
    let hash = xxh3_128(key);
    (hash as u64, (hash >> 64) as u64)
}
