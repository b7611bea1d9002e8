//! Virtual Translation Lookahead Buffer: a generational cache of
//! virtual-to-physical page translations, backed by [`Bucket`]s, falling
//! back to a raw `/proc/[pid]/pagemap` read on a full miss.
//!
//! Unlike an ordinary cache it tracks elapsed time explicitly (fed by the
//! caller, not a wall clock) so that every hit is provably based on
//! information no older than a configured trust window. Multiple
//! generations smooth out the hit-rate cliff a single expiring cache would
//! show.

use crate::bucket::{hash_twang6432, Bucket, HashBucket};
use crate::error::{HammertimeError, Result};
use crate::pagemap::PagemapReader;

/// Running hit/miss counters. Cheap enough to keep unconditionally; call
/// [`Vtlb::clear_stats`] to reset between measurement windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct VtlbStats {
    pub nreq: u64,
    pub nhit: u64,
    pub hit_time_ns: i64,
    pub miss_time_ns: i64,
    pub probe_sum: u64,
}

impl VtlbStats {
    pub fn hitrate(&self) -> f64 {
        self.nhit as f64 / self.nreq as f64
    }

    pub fn avg_hit_time(&self) -> f64 {
        self.hit_time_ns as f64 / self.nhit as f64
    }

    pub fn avg_miss_time(&self) -> f64 {
        self.miss_time_ns as f64 / (self.nreq - self.nhit) as f64
    }

    pub fn avg_probe(&self) -> f64 {
        self.probe_sum as f64 / self.nreq as f64
    }
}

/// Generational VTLB. `B` is the bucket type used for every generation;
/// use [`HashBucket`] unless a caller needs a custom storage backend.
pub struct Vtlb<B: Bucket = HashBucket> {
    generations: Vec<B>,
    head: usize,
    tail: usize,
    actgen: u32,
    ngen: u32,
    saved_time: i64,
    gen_age_limit: i64,
    push_limit: i64,
    pagemap: Option<PagemapReader>,
    stats: VtlbStats,
}

impl Vtlb<HashBucket> {
    /// Creates a VTLB with `num_gen` generations of `gensize`-slot hash
    /// buckets. Trust window bounds are given in microseconds: a cached
    /// entry is never trusted past `max_trust_us`, and generations don't
    /// rotate faster than `min_trust_us` allows.
    pub fn new(
        gensize: u32,
        num_gen: u32,
        min_trust_us: u64,
        max_trust_us: u64,
        pagemap: Option<PagemapReader>,
    ) -> Result<Self> {
        if gensize == 0 || num_gen == 0 || max_trust_us == 0 || min_trust_us > max_trust_us {
            return Err(HammertimeError::InvalidConfig(
                "vtlb: gensize/num_gen/max_trust_us must be nonzero and min_trust_us <= max_trust_us"
                    .into(),
            ));
        }
        let mut generations = Vec::with_capacity(num_gen as usize);
        for _ in 0..num_gen {
            generations.push(HashBucket::new(gensize, 64, hash_twang6432)?);
        }
        Ok(Vtlb::from_buckets(
            generations,
            min_trust_us,
            max_trust_us,
            pagemap,
        ))
    }
}

impl<B: Bucket> Vtlb<B> {
    /// Creates a VTLB from caller-supplied, already-constructed buckets
    /// (one per generation).
    pub fn from_buckets(
        generations: Vec<B>,
        min_trust_us: u64,
        max_trust_us: u64,
        pagemap: Option<PagemapReader>,
    ) -> Self {
        let num_gen = generations.len() as u32;
        Vtlb {
            generations,
            head: 0,
            tail: 0,
            actgen: 0,
            ngen: num_gen,
            saved_time: 0,
            gen_age_limit: (max_trust_us * 1000 / num_gen as u64) as i64,
            push_limit: (min_trust_us * 1000 / num_gen as u64) as i64,
            pagemap,
            stats: VtlbStats::default(),
        }
    }

    fn genpop(&mut self) {
        self.generations[self.tail].clear();
        if self.actgen > 0 {
            self.tail = (self.tail + 1) % self.ngen as usize;
            self.actgen -= 1;
        }
    }

    fn genpush(&mut self) {
        self.head = (self.head + 1) % self.ngen as usize;
        self.actgen += 1;
        if self.actgen == self.ngen {
            self.genpop();
        }
    }

    fn handle_timed(&mut self, mut timed: i64) -> i64 {
        let max_trust = self.ngen as i64 * self.gen_age_limit;
        if timed > max_trust {
            self.flush();
            return timed;
        }
        let initial_actgen = self.actgen as i64;
        while timed > max_trust - initial_actgen * self.gen_age_limit {
            self.genpop();
            timed -= self.gen_age_limit;
        }
        if timed > self.push_limit {
            self.genpush();
        }
        timed
    }

    /// Advances internal time state by `delta` nanoseconds.
    pub fn update_timedelta(&mut self, delta: i64) {
        let mut timev = delta;
        if self.saved_time != 0 {
            timev += self.saved_time;
        }
        let rem = self.handle_timed(timev);
        self.saved_time = if rem > self.push_limit { 0 } else { rem };
    }

    /// Advances internal time state to the absolute timestamp `timev`
    /// (nanoseconds). A timestamp earlier than the last seen one flushes
    /// the cache rather than trust stale entries.
    pub fn update_timestamp(&mut self, timev: i64) {
        let timed = timev - self.saved_time;
        if timed < 0 {
            self.flush();
            self.saved_time = timev;
        } else if timed > self.push_limit {
            self.handle_timed(timed);
            self.saved_time = timev;
        }
    }

    /// Inserts or replaces `vpfn -> pfn` in the most recent generation.
    pub fn update(&mut self, vpfn: u64, pfn: u64) {
        let (_, handle) = self.generations[self.head].search(vpfn);
        self.generations[self.head].insert(vpfn, pfn, handle);
    }

    /// Looks up `vpfn` in the cache only, with no pagemap fallback.
    pub fn search(&mut self, vpfn: u64) -> Option<u64> {
        self.stats.nreq += 1;

        let (hit, head_handle) = self.generations[self.head].search(vpfn);
        if hit {
            self.stats.nhit += 1;
            self.stats.probe_sum += head_handle.probe as u64;
            return self.generations[self.head].get(head_handle);
        }

        let mut gen = self.head;
        for _ in 0..self.actgen {
            gen = (gen + self.ngen as usize - 1) % self.ngen as usize;
            let (hit, handle) = self.generations[gen].search(vpfn);
            self.stats.probe_sum += handle.probe as u64;
            if hit {
                self.stats.nhit += 1;
                return self.generations[gen].get(handle);
            }
        }
        self.stats.probe_sum += head_handle.probe as u64;
        None
    }

    /// Looks up `vpfn`, falling back to a raw pagemap read and caching the
    /// result on a cache miss. Requires a pagemap reader to have been
    /// supplied at construction.
    pub fn lookup(&mut self, vpfn: u64) -> Result<u64> {
        if let Some(hit) = self.search(vpfn) {
            return Ok(hit);
        }
        let pagemap = self
            .pagemap
            .as_mut()
            .ok_or_else(|| HammertimeError::InvalidConfig("vtlb has no pagemap fallback".into()))?;
        let physaddr = pagemap.read(vpfn << 12)?;
        self.update(vpfn, physaddr >> 12);
        Ok(physaddr)
    }

    /// Empties every generation.
    pub fn flush(&mut self) {
        while self.actgen > 0 {
            self.genpop();
        }
        self.genpop();
    }

    /// Swaps in a new pagemap reader (e.g. after the traced process execs).
    pub fn set_pagemap(&mut self, pagemap: Option<PagemapReader>) {
        self.pagemap = pagemap;
    }

    pub fn stats(&self) -> VtlbStats {
        self.stats
    }

    pub fn clear_stats(&mut self) {
        self.stats = VtlbStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_vtlb() -> Vtlb<HashBucket> {
        Vtlb::new(8, 4, 1_000, 10_000, None).unwrap()
    }

    #[test]
    fn update_then_search_hits_in_head() {
        let mut v = small_vtlb();
        v.update(1, 100);
        assert_eq!(v.search(1), Some(100));
    }

    #[test]
    fn search_finds_entries_in_older_generations() {
        let mut v = small_vtlb();
        v.update(1, 100);
        v.update_timedelta(3_000_000);
        assert_eq!(v.search(1), Some(100));
    }

    #[test]
    fn exceeding_max_trust_flushes_everything() {
        let mut v = small_vtlb();
        v.update(1, 100);
        v.update_timedelta(1_000_000_000);
        assert_eq!(v.search(1), None);
    }

    #[test]
    fn stats_track_hits_and_requests() {
        let mut v = small_vtlb();
        v.update(1, 100);
        v.search(1);
        v.search(2);
        let s = v.stats();
        assert_eq!(s.nreq, 2);
        assert_eq!(s.nhit, 1);
    }

    #[test]
    fn lookup_without_pagemap_errors_on_miss() {
        let mut v = small_vtlb();
        assert!(v.lookup(42).is_err());
    }

    #[test]
    fn timestamp_going_backwards_flushes() {
        let mut v = small_vtlb();
        v.update(1, 100);
        v.update_timestamp(5_000);
        v.update_timestamp(1_000);
        assert_eq!(v.search(1), None);
    }
}
