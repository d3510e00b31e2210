//! quorum bloom filter
//!
//! a write-once probabilistic set of participant addresses. false negatives are
//! impossible, false positives occur at roughly the configured rate as long as
//! no more than `capacity` items are inserted.
//!
//! one hash scheme: sha-256 of the item split into two 64-bit words, then
//! kirsch-mitzenmacher double hashing `h1 + i * h2 mod m`. the scheme id and a
//! format version travel in the serialized header so a filter produced by a
//! different scheme is rejected instead of silently answering wrong.
//!
//! ## encoding (little endian)
//!
//! ```text
//! 0      1       2           6          10        18          26      30
//! | ver  | sch   | hashes u32 | cap u32  | fpr f64 | bits u64  | n u32 | bit array ...
//! ```

use core::f64::consts::LN_2;

use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// current serialized format version
pub const FILTER_FORMAT_VERSION: u8 = 1;

/// serialized header size in bytes
pub const FILTER_HEADER_LEN: usize = 30;

/// upper bound on hash functions, keeps adversarial headers cheap to reject
pub const MAX_HASH_COUNT: u32 = 32;

/// hash scheme identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HashScheme {
    /// sha-256, two 64-bit words, double hashing
    Sha256Double = 1,
}

impl HashScheme {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Sha256Double),
            _ => None,
        }
    }
}

/// sizing of a filter, derived from capacity and target false-positive rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub capacity: u32,
    pub false_positive_rate: f64,
    pub bit_count: u64,
    pub hash_count: u32,
}

impl FilterParams {
    /// optimal bit and hash counts for `capacity` items at rate `false_positive_rate`
    pub fn optimal(capacity: u32, false_positive_rate: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidFilterParams("capacity must be at least 1".into()));
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(Error::InvalidFilterParams(format!(
                "false positive rate must be in (0, 1), got {}",
                false_positive_rate
            )));
        }

        let n = capacity as f64;
        let m = (-n * false_positive_rate.ln() / (LN_2 * LN_2)).ceil().max(8.0) as u64;
        let k = ((m as f64 / n) * LN_2).round().clamp(1.0, MAX_HASH_COUNT as f64) as u32;

        Ok(Self {
            capacity,
            false_positive_rate,
            bit_count: m,
            hash_count: k,
        })
    }

    fn byte_len(&self) -> usize {
        self.bit_count.div_ceil(8) as usize
    }
}

/// bloom filter over participant addresses
#[derive(Debug, Clone, PartialEq)]
pub struct QuorumFilter {
    params: FilterParams,
    bits: Vec<u8>,
    inserted: u32,
}

impl QuorumFilter {
    pub fn new(capacity: u32, false_positive_rate: f64) -> Result<Self> {
        let params = FilterParams::optimal(capacity, false_positive_rate)?;
        Ok(Self {
            bits: vec![0u8; params.byte_len()],
            params,
            inserted: 0,
        })
    }

    pub fn params(&self) -> &FilterParams {
        &self.params
    }

    pub fn hash_count(&self) -> u32 {
        self.params.hash_count
    }

    pub fn capacity(&self) -> u32 {
        self.params.capacity
    }

    pub fn false_positive_rate(&self) -> f64 {
        self.params.false_positive_rate
    }

    pub fn bit_count(&self) -> u64 {
        self.params.bit_count
    }

    /// number of `add` calls, duplicates included
    pub fn inserted(&self) -> u32 {
        self.inserted
    }

    /// more items than the filter was sized for; the real false-positive rate
    /// is above the configured one
    pub fn is_oversubscribed(&self) -> bool {
        self.inserted > self.params.capacity
    }

    pub fn add(&mut self, item: impl AsRef<[u8]>) {
        for idx in bit_indices(item.as_ref(), &self.params) {
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
        self.inserted = self.inserted.saturating_add(1);
    }

    pub fn contains(&self, item: impl AsRef<[u8]>) -> bool {
        bit_indices(item.as_ref(), &self.params)
            .all(|idx| self.bits[(idx / 8) as usize] & (1 << (idx % 8)) != 0)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FILTER_HEADER_LEN + self.bits.len());
        out.push(FILTER_FORMAT_VERSION);
        out.push(HashScheme::Sha256Double as u8);
        out.extend_from_slice(&self.params.hash_count.to_le_bytes());
        out.extend_from_slice(&self.params.capacity.to_le_bytes());
        out.extend_from_slice(&self.params.false_positive_rate.to_bits().to_le_bytes());
        out.extend_from_slice(&self.params.bit_count.to_le_bytes());
        out.extend_from_slice(&self.inserted.to_le_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    /// decode a filter, rejecting unknown formats and headers whose hash or bit
    /// counts disagree with what capacity and rate imply
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILTER_HEADER_LEN {
            return Err(Error::MalformedFilter(format!(
                "need at least {} header bytes, got {}",
                FILTER_HEADER_LEN,
                bytes.len()
            )));
        }

        let version = bytes[0];
        let scheme = bytes[1];
        if version != FILTER_FORMAT_VERSION || HashScheme::from_byte(scheme).is_none() {
            return Err(Error::UnsupportedFilterFormat { version, scheme });
        }

        let hash_count = u32::from_le_bytes(read_array(&bytes[2..6]));
        let capacity = u32::from_le_bytes(read_array(&bytes[6..10]));
        let fpr = f64::from_bits(u64::from_le_bytes(read_array(&bytes[10..18])));
        let bit_count = u64::from_le_bytes(read_array(&bytes[18..26]));
        let inserted = u32::from_le_bytes(read_array(&bytes[26..30]));

        let expected = FilterParams::optimal(capacity, fpr)?;
        if expected.hash_count != hash_count || expected.bit_count != bit_count {
            return Err(Error::FilterMismatch {
                expected: format!("{} hashes over {} bits", expected.hash_count, expected.bit_count),
                found: format!("{} hashes over {} bits", hash_count, bit_count),
            });
        }

        let bits = &bytes[FILTER_HEADER_LEN..];
        if bits.len() != expected.byte_len() {
            return Err(Error::MalformedFilter(format!(
                "expected {} bit-array bytes, got {}",
                expected.byte_len(),
                bits.len()
            )));
        }

        Ok(Self {
            params: expected,
            bits: bits.to_vec(),
            inserted,
        })
    }

    /// decode and require the hash count and capacity the caller was told to expect
    pub fn from_bytes_expecting(bytes: &[u8], hash_count: u32, capacity: u32) -> Result<Self> {
        let filter = Self::from_bytes(bytes)?;
        if filter.hash_count() != hash_count || filter.capacity() != capacity {
            return Err(Error::FilterMismatch {
                expected: format!("{} hashes, capacity {}", hash_count, capacity),
                found: format!("{} hashes, capacity {}", filter.hash_count(), filter.capacity()),
            });
        }
        Ok(filter)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| Error::MalformedFilter(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

fn bit_indices(item: &[u8], params: &FilterParams) -> impl Iterator<Item = u64> {
    let hash = Sha256::digest(item);
    let h1 = u64::from_le_bytes(read_array(&hash[0..8]));
    // odd step so successive probes never collapse onto one bit
    let h2 = u64::from_le_bytes(read_array(&hash[8..16])) | 1;
    let m = params.bit_count;
    (0..params.hash_count as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
}
