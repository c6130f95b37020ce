//! Weak rolling checksum, strong digest, and the hash-table index used to
//! locate candidate matches during diff encoding.
//!
//! The weak sum is a classic two-half rolling checksum (`a` = byte sum,
//! `b` = weighted byte sum), and the upper half (`b`) is what gets used as
//! a hash key, not the whole 32 bits.

use openssl::hash::{Hasher, MessageDigest};

/// 32-bit rolling checksum over a fixed-size window: `a` in the low 16
/// bits, `b` in the high 16 bits. `b` alone is used for hash-table lookups.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingChecksum {
    a: u16,
    b: u16,
    window: u32,
}

impl RollingChecksum {
    /// Compute the checksum for the initial window `data`.
    pub fn new(data: &[u8]) -> Self {
        let len = data.len() as u32;
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        for (i, &byte) in data.iter().enumerate() {
            a = a.wrapping_add(byte as u32);
            b = b.wrapping_add((len - i as u32) * byte as u32);
        }
        Self {
            a: a as u16,
            b: b as u16,
            window: len,
        }
    }

    /// The full 32-bit checksum, `a` in the low half and `b` in the high
    /// half.
    pub fn value(&self) -> u32 {
        (self.a as u32) | ((self.b as u32) << 16)
    }

    /// The component used as a hash-table key.
    pub fn hash_key(&self) -> u16 {
        self.b
    }

    /// Slide the window forward by one byte: `leaving` drops off the front,
    /// `entering` joins at the back.
    pub fn roll(&mut self, leaving: u8, entering: u8) {
        let len = self.window;
        let mut a = self.a as u32;
        let mut b = self.b as u32;
        a = a.wrapping_sub(leaving as u32).wrapping_add(entering as u32);
        b = b.wrapping_sub(len.wrapping_mul(leaving as u32)).wrapping_add(a);
        self.a = a as u16;
        self.b = b as u16;
    }

    /// Slide the window forward by `leaving.len()` bytes at once
    /// (`leaving.len()` must equal `entering.len()`). Used when the diff
    /// scanner jumps the window forward after a match instead of
    /// advancing byte by byte.
    pub fn roll_many(&mut self, leaving: &[u8], entering: &[u8]) {
        debug_assert_eq!(leaving.len(), entering.len());
        for (&l, &e) in leaving.iter().zip(entering.iter()) {
            self.roll(l, e);
        }
    }
}

/// 128-bit cryptographic digest over a full block's content (MD5, per
/// boxbackup's original choice -- collision resistance against an
/// adversary isn't the property being relied on here, only the false
/// positive rate against the weak checksum's hash-bucket collisions).
pub type StrongChecksum = [u8; 16];

pub fn strong_checksum(data: &[u8]) -> anyhow::Result<StrongChecksum> {
    let mut hasher = Hasher::new(MessageDigest::md5())?;
    hasher.update(data)?;
    let digest = hasher.finish()?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// One entry in [`ChecksumIndex`]: the old file's block number together
/// with the strong checksum needed to confirm a weak-checksum hit.
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    pub block_index: u64,
    pub strong: StrongChecksum,
}

/// Hash table over a previously uploaded file's block index, keyed by the
/// weak checksum's upper 16 bits, with chaining for collisions. Built once
/// per candidate block size during diff encoding (see
/// [`crate::codec::diff`]).
#[derive(Debug, Default)]
pub struct ChecksumIndex {
    buckets: std::collections::HashMap<u16, Vec<IndexEntry>>,
}

impl ChecksumIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, weak_hash_key: u16, entry: IndexEntry) {
        self.buckets.entry(weak_hash_key).or_default().push(entry);
    }

    /// All entries chained under the given weak-checksum hash key. The
    /// caller must verify each candidate with the strong checksum before
    /// accepting it as a match.
    pub fn candidates(&self, weak_hash_key: u16) -> &[IndexEntry] {
        self.buckets
            .get(&weak_hash_key)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_matches_fresh_computation() {
        let data = b"the quick brown fox jumps over the lazy dog!!!!";
        let window = 8;
        let mut rc = RollingChecksum::new(&data[0..window]);
        for start in 1..=(data.len() - window) {
            rc.roll(data[start - 1], data[start + window - 1]);
            let fresh = RollingChecksum::new(&data[start..start + window]);
            assert_eq!(rc.value(), fresh.value(), "mismatch at start={}", start);
        }
    }

    #[test]
    fn roll_many_matches_jump() {
        let data = b"0123456789abcdef0123456789abcdef";
        let window = 4;
        let mut rc = RollingChecksum::new(&data[0..window]);
        rc.roll_many(&data[0..window], &data[window..2 * window]);
        let fresh = RollingChecksum::new(&data[window..2 * window]);
        assert_eq!(rc.value(), fresh.value());
    }

    #[test]
    fn strong_checksum_is_deterministic() {
        let a = strong_checksum(b"payload").unwrap();
        let b = strong_checksum(b"payload").unwrap();
        let c = strong_checksum(b"different").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn index_chains_collisions() {
        let mut idx = ChecksumIndex::new();
        idx.insert(42, IndexEntry { block_index: 0, strong: [0; 16] });
        idx.insert(42, IndexEntry { block_index: 1, strong: [1; 16] });
        assert_eq!(idx.candidates(42).len(), 2);
        assert!(idx.candidates(7).is_empty());
    }
}
