//! Pluggable key/value storage for the VTLB's generational ring. A
//! [`Bucket`] is the storage backend; [`HashBucket`] is the one
//! implementation provided, an open-addressed table with bounded linear
//! probing.

use crate::error::{HammertimeError, Result};

/// Sentinel key marking an empty slot. `u64::MAX` is never a legal virtual
/// address or `DRAMAddr`-as-key value in this crate's usage.
pub const EMPTY_KEY: u64 = u64::MAX;

/// Opaque reference to a slot a previous [`Bucket::search`] landed on.
/// `probe` is how many linear-probe steps it took to get there; callers
/// don't need to interpret it, but the VTLB uses it for instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    pub slot: u32,
    pub probe: u32,
}

/// A key/value store with fast, capacity-bounded lookup. Implementations
/// may reject keys once a fixed probe budget is exhausted rather than
/// growing, trading completeness for O(1) worst-case search.
pub trait Bucket {
    /// Looks up `key`. Returns whether it was found, and a handle usable
    /// with [`Bucket::get`]/[`Bucket::insert`] regardless of which.
    fn search(&self, key: u64) -> (bool, Handle);
    /// Reads the value at `handle`, if the handle's slot is in range.
    fn get(&self, handle: Handle) -> Option<u64>;
    /// Writes `key`/`val` at `handle`, if the handle's slot is in range.
    fn insert(&mut self, key: u64, val: u64, handle: Handle);
    /// Empties every slot.
    fn clear(&mut self);
}

/// A hash function mapping a key into `0..size`.
pub type HashFn = fn(key: u64, size: u32) -> u32;

/// `key % size`. Fast and fine when keys are already well distributed.
pub fn hash_trivial(key: u64, size: u32) -> u32 {
    (key % size as u64) as u32
}

/// Thomas Wang's 64-bit-to-32-bit integer hash, for keys (like physical
/// addresses) with structure in their low bits that a trivial modulo would
/// preserve into clustering.
pub fn hash_twang6432(key: u64, size: u32) -> u32 {
    let mut key = key;
    key = (!key).wrapping_add(key << 18);
    key ^= key >> 31;
    key = key.wrapping_mul(21);
    key ^= key >> 11;
    key = key.wrapping_add(key << 6);
    key ^= key >> 22;
    (key % size as u64) as u32
}

/// Open-addressed hash table with bounded linear probing.
pub struct HashBucket {
    entries: Vec<(u64, u64)>,
    probe_limit: u32,
    hash_fn: HashFn,
}

impl HashBucket {
    /// Creates a table with `size` slots, probing at most `probe_limit`
    /// slots per operation before giving up.
    pub fn new(size: u32, probe_limit: u32, hash_fn: HashFn) -> Result<HashBucket> {
        if size == 0 {
            return Err(HammertimeError::AllocationFailure(
                "bucket size must be nonzero".into(),
            ));
        }
        Ok(HashBucket {
            entries: vec![(EMPTY_KEY, 0); size as usize],
            probe_limit,
            hash_fn,
        })
    }

    pub fn size(&self) -> u32 {
        self.entries.len() as u32
    }
}

impl Bucket for HashBucket {
    fn search(&self, key: u64) -> (bool, Handle) {
        let sz = self.entries.len() as u32;
        let start = (self.hash_fn)(key, sz);
        let mut probe = self.probe_limit;
        let mut slot = start;
        for i in 0..self.probe_limit {
            let idx = (start as u64 + i as u64) % sz as u64;
            let entry_key = self.entries[idx as usize].0;
            if entry_key == key {
                return (true, Handle { slot: idx as u32, probe: i });
            } else if entry_key == EMPTY_KEY {
                slot = idx as u32;
                probe = i;
                return (false, Handle { slot, probe });
            }
        }
        (false, Handle { slot, probe })
    }

    fn get(&self, handle: Handle) -> Option<u64> {
        self.entries
            .get(handle.slot as usize)
            .map(|(_, val)| *val)
    }

    fn insert(&mut self, key: u64, val: u64, handle: Handle) {
        if let Some(entry) = self.entries.get_mut(handle.slot as usize) {
            *entry = (key, val);
        }
    }

    fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = (EMPTY_KEY, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_search_finds_the_key() {
        let mut b = HashBucket::new(16, 4, hash_trivial).unwrap();
        let (found, h) = b.search(42);
        assert!(!found);
        b.insert(42, 1337, h);
        let (found, h2) = b.search(42);
        assert!(found);
        assert_eq!(b.get(h2), Some(1337));
    }

    #[test]
    fn clear_empties_every_slot() {
        let mut b = HashBucket::new(4, 4, hash_trivial).unwrap();
        let (_, h) = b.search(7);
        b.insert(7, 9, h);
        b.clear();
        let (found, _) = b.search(7);
        assert!(!found);
    }

    #[test]
    fn search_probes_past_collisions() {
        let mut b = HashBucket::new(4, 4, |_, _| 0).unwrap();
        let (_, h0) = b.search(1);
        b.insert(1, 100, h0);
        let (found, h1) = b.search(2);
        assert!(!found);
        assert_eq!(h1.slot, 1);
        b.insert(2, 200, h1);
        let (found, h2) = b.search(2);
        assert!(found);
        assert_eq!(b.get(h2), Some(200));
    }

    #[test]
    fn search_gives_up_after_probe_limit() {
        let mut b = HashBucket::new(4, 2, |_, _| 0).unwrap();
        let (_, h0) = b.search(1);
        b.insert(1, 1, h0);
        let (_, h1) = b.search(2);
        b.insert(2, 2, h1);
        let (found, h2) = b.search(3);
        assert!(!found);
        assert_eq!(h2.probe, 2);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(HashBucket::new(0, 4, hash_trivial).is_err());
    }
}
