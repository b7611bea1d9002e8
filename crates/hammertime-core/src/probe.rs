//! Probe output: the interleaved stream of memory-operation and time-update
//! entries a probe produces and a consumer drains.
//!
//! Entries share one binary format keyed on a single discriminant: a memory
//! operation entry starts with a real physical address, while a time-update
//! entry starts with `u64::MAX` followed by a signed nanosecond value (a
//! timestamp if non-negative, a delta if negative). The two kinds can be
//! freely interspersed; a reader must always check the discriminant.
//!
//! The stream itself lives in a fixed-size circular byte buffer behind a
//! mutex, addressed by a monotonic, never-wrapping `head` modulo the
//! buffer's `data_size` - the same handshake a probe and its consumer would
//! use across threads or processes. A consumer that falls more than
//! `data_size` bytes behind the producer has lost the entries that fell off
//! the back of the ring; it can only recover the window still retained.

use std::sync::{Condvar, Mutex};

use crate::error::{HammertimeError, Result};

/// Include the virtual address alongside the physical address of a memory op.
pub const FLAG_VIRTADDR: u32 = 1;
/// Include a [`MemOpStats`] record alongside a memory op.
pub const FLAG_OPSTATS: u32 = 2;

const TIME_DISCRIMINANT: u64 = u64::MAX;

/// Wire size in bytes of a [`MemOpStats`] record (pid + packed flags).
const MEMOPSTATS_RECORD_SIZE: usize = 8;

/// Default ring capacity for [`ProbeOutput::new`]; comfortably larger than
/// any burst a consumer should realistically fall behind by.
const DEFAULT_DATA_SIZE: usize = 1 << 16;

/// Per-operation metadata a probe can optionally attach to a memory op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOpStats {
    /// PID of the process that generated the operation.
    pub pid: i32,
    /// Set for a store, clear for a load.
    pub is_store: bool,
    /// Probe-specific flags, 24 bits.
    pub custflags: u32,
}

/// A time-update entry: either an absolute timestamp or a relative delta,
/// both in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeValue {
    /// An absolute point in time.
    Timestamp(i64),
    /// Elapsed time since the last update.
    Delta(i64),
}

/// A single decoded entry from a probe's output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEntry {
    /// A load or store.
    MemOp {
        /// Physical address of the operation.
        phys_addr: u64,
        /// Virtual address, if the stream carries [`FLAG_VIRTADDR`].
        virt_addr: Option<u64>,
        /// Per-op metadata, if the stream carries [`FLAG_OPSTATS`].
        stats: Option<MemOpStats>,
    },
    /// A time update.
    Time(TimeValue),
}

struct RingState {
    data: Vec<u8>,
    data_size: u64,
    head: u64,
    finished: bool,
    sample_loss: u8,
}

/// Writes `bytes` into the ring starting at the current head, wrapping at
/// `data_size`, and advances the head. The head itself never wraps - only
/// its use as an index into `data` does.
fn write_circular(state: &mut RingState, bytes: &[u8]) {
    for (i, b) in bytes.iter().enumerate() {
        let idx = ((state.head + i as u64) % state.data_size) as usize;
        state.data[idx] = *b;
    }
    state.head += bytes.len() as u64;
}

/// The output side of a probe. A single producer appends entries; any number
/// of consumers can poll or block on new data via [`ProbeOutput::wait_for_head`].
pub struct ProbeOutput {
    state: Mutex<RingState>,
    cond: Condvar,
    fmtflags: u32,
}

impl ProbeOutput {
    /// Creates an empty stream of [`DEFAULT_DATA_SIZE`] bytes using
    /// `fmtflags` (`FLAG_VIRTADDR`/`FLAG_OPSTATS`) to determine the shape of
    /// memory-op entries.
    pub fn new(fmtflags: u32) -> Self {
        Self::with_capacity(fmtflags, DEFAULT_DATA_SIZE)
            .expect("default probe ring capacity is always a valid size")
    }

    /// Creates an empty stream backed by a `data_size`-byte ring buffer.
    ///
    /// `data_size` must be a multiple of 8, and - if `fmtflags` sets
    /// [`FLAG_OPSTATS`] - a multiple of the wire size of a [`MemOpStats`]
    /// record, so that no entry can ever straddle the point where the ring
    /// wraps. Mirrors `probeout_check_size`'s sanity check.
    pub fn with_capacity(fmtflags: u32, data_size: usize) -> Result<Self> {
        if data_size % 8 != 0 {
            return Err(HammertimeError::InvalidConfig(format!(
                "probe ring data_size {data_size} is not a multiple of 8"
            )));
        }
        if fmtflags & FLAG_OPSTATS != 0 && data_size % MEMOPSTATS_RECORD_SIZE != 0 {
            return Err(HammertimeError::InvalidConfig(format!(
                "probe ring data_size {data_size} is not a multiple of the MemOpStats record size ({MEMOPSTATS_RECORD_SIZE})"
            )));
        }
        Ok(ProbeOutput {
            state: Mutex::new(RingState {
                data: vec![0u8; data_size],
                data_size: data_size as u64,
                head: 0,
                finished: false,
                sample_loss: 0,
            }),
            cond: Condvar::new(),
            fmtflags,
        })
    }

    /// The ring's backing capacity in bytes.
    pub fn data_size(&self) -> u64 {
        self.state.lock().unwrap().data_size
    }

    /// Appends a memory-operation entry and wakes any waiting consumer.
    ///
    /// # Panics
    ///
    /// Panics if `phys_addr` equals the time-entry discriminant
    /// (`u64::MAX`) - no real physical address can legitimately take that
    /// value.
    pub fn push_memop(&self, phys_addr: u64, virt_addr: Option<u64>, stats: Option<MemOpStats>) {
        assert_ne!(
            phys_addr, TIME_DISCRIMINANT,
            "physical address collides with the time-entry discriminant"
        );
        let mut entry = Vec::with_capacity(24);
        entry.extend_from_slice(&phys_addr.to_le_bytes());
        if self.fmtflags & FLAG_VIRTADDR != 0 {
            entry.extend_from_slice(&virt_addr.unwrap_or(0).to_le_bytes());
        }
        if self.fmtflags & FLAG_OPSTATS != 0 {
            let s = stats.unwrap_or(MemOpStats {
                pid: 0,
                is_store: false,
                custflags: 0,
            });
            entry.extend_from_slice(&s.pid.to_le_bytes());
            let packed = (s.is_store as u32) | ((s.custflags & 0x00ff_ffff) << 8);
            entry.extend_from_slice(&packed.to_le_bytes());
        }
        let mut state = self.state.lock().unwrap();
        write_circular(&mut state, &entry);
        self.cond.notify_all();
    }

    /// Appends a time-update entry and wakes any waiting consumer.
    pub fn push_time(&self, t: TimeValue) {
        let timev = match t {
            TimeValue::Timestamp(v) => v,
            TimeValue::Delta(v) => v,
        };
        let mut entry = Vec::with_capacity(16);
        entry.extend_from_slice(&TIME_DISCRIMINANT.to_le_bytes());
        entry.extend_from_slice(&timev.to_le_bytes());
        let mut state = self.state.lock().unwrap();
        write_circular(&mut state, &entry);
        self.cond.notify_all();
    }

    /// Marks the stream complete; no more entries will be produced. Wakes
    /// any consumer blocked in [`ProbeOutput::wait_for_head`].
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.finished = true;
        self.cond.notify_all();
    }

    /// Records the proportion of true memory ops estimated lost to sampling
    /// (0 = none, 255 = ~99.6%).
    pub fn set_sample_loss(&self, loss: u8) {
        self.state.lock().unwrap().sample_loss = loss;
    }

    /// The current sampling-loss estimate.
    pub fn sample_loss(&self) -> u8 {
        self.state.lock().unwrap().sample_loss
    }

    /// The current stream length in bytes.
    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    /// Blocks until the stream head advances past `cur`, or the stream
    /// finishes with nothing new. Returns `None` once there is nothing left
    /// to read; otherwise the new head.
    pub fn wait_for_head(&self, cur: u64) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        if state.head == cur && !state.finished {
            state = self
                .cond
                .wait_while(state, |s| s.head == cur && !s.finished)
                .unwrap();
        }
        if state.head == cur && state.finished {
            None
        } else {
            Some(state.head)
        }
    }

    /// Parses every whole entry in `[from, to)`. Both bounds must be values
    /// previously observed as a head (0, or returned by
    /// [`ProbeOutput::head`]/[`ProbeOutput::wait_for_head`]).
    ///
    /// If the consumer fell more than `data_size` bytes behind (the
    /// producer lapped the ring before the entries in `[from, to)` were
    /// read), the oldest entries in that range are gone; only the
    /// still-retained tail is decoded, and the loss is logged. Every entry
    /// in this format is a multiple of 8 bytes and `from`/`to` are always
    /// themselves multiples of 8, so clamping forward by `data_size` (also
    /// a multiple of 8) always lands back on an entry boundary.
    pub fn read_entries(&self, from: u64, to: u64) -> Vec<ProbeEntry> {
        let state = self.state.lock().unwrap();
        let mut from = from;
        if to - from > state.data_size {
            let lost = to - from - state.data_size;
            log::error!(
                "probe consumer fell behind by {} bytes (ring capacity {}); {} bytes of entries lost",
                to - from,
                state.data_size,
                lost
            );
            from = to - state.data_size;
        }
        let len = (to - from) as usize;
        let mut linear = Vec::with_capacity(len);
        for i in 0..len as u64 {
            let idx = ((from + i) % state.data_size) as usize;
            linear.push(state.data[idx]);
        }
        self.parse(&linear)
    }

    fn parse(&self, mut slice: &[u8]) -> Vec<ProbeEntry> {
        let mut out = Vec::new();
        while slice.len() >= 8 {
            let phys = u64::from_le_bytes(slice[0..8].try_into().unwrap());
            if phys == TIME_DISCRIMINANT {
                let timev = i64::from_le_bytes(slice[8..16].try_into().unwrap());
                out.push(ProbeEntry::Time(if timev >= 0 {
                    TimeValue::Timestamp(timev)
                } else {
                    TimeValue::Delta(timev)
                }));
                slice = &slice[16..];
                continue;
            }
            let mut off = 8;
            let virt_addr = if self.fmtflags & FLAG_VIRTADDR != 0 {
                let v = u64::from_le_bytes(slice[off..off + 8].try_into().unwrap());
                off += 8;
                Some(v)
            } else {
                None
            };
            let stats = if self.fmtflags & FLAG_OPSTATS != 0 {
                let pid = i32::from_le_bytes(slice[off..off + 4].try_into().unwrap());
                let packed = u32::from_le_bytes(slice[off + 4..off + 8].try_into().unwrap());
                off += 8;
                Some(MemOpStats {
                    pid,
                    is_store: packed & 1 != 0,
                    custflags: (packed >> 8) & 0x00ff_ffff,
                })
            } else {
                None
            };
            out.push(ProbeEntry::MemOp {
                phys_addr: phys,
                virt_addr,
                stats,
            });
            slice = &slice[off..];
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn memop_and_time_entries_interleave_and_parse() {
        let out = ProbeOutput::new(FLAG_VIRTADDR | FLAG_OPSTATS);
        out.push_memop(
            0x1000,
            Some(0x7f0000),
            Some(MemOpStats {
                pid: 42,
                is_store: true,
                custflags: 7,
            }),
        );
        out.push_time(TimeValue::Delta(-500));
        out.push_memop(0x2000, Some(0x7f1000), None);

        let head = out.head();
        let entries = out.read_entries(0, head);
        assert_eq!(entries.len(), 3);
        match entries[0] {
            ProbeEntry::MemOp {
                phys_addr,
                virt_addr,
                stats: Some(s),
            } => {
                assert_eq!(phys_addr, 0x1000);
                assert_eq!(virt_addr, Some(0x7f0000));
                assert_eq!(s.pid, 42);
                assert!(s.is_store);
                assert_eq!(s.custflags, 7);
            }
            other => panic!("unexpected entry {other:?}"),
        }
        assert_eq!(entries[1], ProbeEntry::Time(TimeValue::Delta(-500)));
        match entries[2] {
            ProbeEntry::MemOp {
                phys_addr,
                virt_addr,
                stats,
            } => {
                assert_eq!(phys_addr, 0x2000);
                assert_eq!(virt_addr, Some(0x7f1000));
                assert_eq!(
                    stats,
                    Some(MemOpStats {
                        pid: 0,
                        is_store: false,
                        custflags: 0
                    })
                );
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn no_format_flags_gives_bare_eight_byte_entries() {
        let out = ProbeOutput::new(0);
        out.push_memop(0x42, None, None);
        let entries = out.read_entries(0, out.head());
        assert_eq!(
            entries,
            vec![ProbeEntry::MemOp {
                phys_addr: 0x42,
                virt_addr: None,
                stats: None
            }]
        );
    }

    #[test]
    fn wait_for_head_unblocks_when_producer_pushes() {
        let out = Arc::new(ProbeOutput::new(0));
        let producer = out.clone();
        let handle = thread::spawn(move || {
            producer.push_memop(1, None, None);
        });
        let new_head = out.wait_for_head(0);
        handle.join().unwrap();
        assert!(new_head.is_some());
        assert!(new_head.unwrap() > 0);
    }

    #[test]
    fn wait_for_head_returns_none_once_finished_with_nothing_new() {
        let out = ProbeOutput::new(0);
        out.push_memop(1, None, None);
        let head = out.head();
        out.finish();
        assert_eq!(out.wait_for_head(head), None);
    }

    #[test]
    fn sample_loss_round_trips() {
        let out = ProbeOutput::new(0);
        out.set_sample_loss(128);
        assert_eq!(out.sample_loss(), 128);
    }

    #[test]
    fn with_capacity_rejects_a_data_size_not_a_multiple_of_eight() {
        assert!(ProbeOutput::with_capacity(0, 15).is_err());
    }

    #[test]
    fn ring_wraps_and_reuses_storage_past_capacity() {
        let out = ProbeOutput::with_capacity(0, 16).unwrap();
        for i in 0..4u64 {
            out.push_memop(i + 1, None, None);
        }
        let head = out.head();
        assert_eq!(head, 32);

        // The last two entries physically overwrote the first two; reading
        // the window they occupy must still decode them correctly.
        let entries = out.read_entries(16, head);
        assert_eq!(
            entries,
            vec![
                ProbeEntry::MemOp {
                    phys_addr: 3,
                    virt_addr: None,
                    stats: None
                },
                ProbeEntry::MemOp {
                    phys_addr: 4,
                    virt_addr: None,
                    stats: None
                },
            ]
        );
    }

    #[test]
    fn consumer_that_falls_behind_loses_the_oldest_entries() {
        let out = ProbeOutput::with_capacity(0, 16).unwrap();
        for i in 0..4u64 {
            out.push_memop(i + 1, None, None);
        }
        let head = out.head();

        // A consumer still at 0 asks for everything since the start, but
        // the ring only retained the last 16 bytes; entries 1 and 2 are gone.
        let entries = out.read_entries(0, head);
        assert_eq!(
            entries,
            vec![
                ProbeEntry::MemOp {
                    phys_addr: 3,
                    virt_addr: None,
                    stats: None
                },
                ProbeEntry::MemOp {
                    phys_addr: 4,
                    virt_addr: None,
                    stats: None
                },
            ]
        );
    }
}
