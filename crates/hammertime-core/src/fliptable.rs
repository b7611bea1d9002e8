//! Fliptables: binary lookup tables expressing which bitflips occur on a
//! particular DRAM chip when rows some fixed distance apart are hammered.
//!
//! A fliptable is generated offline from profiling data and loaded here
//! read-only via mmap; this module never writes one. Lookups either hit an
//! exact recorded range or, if requested, extrapolate from the nearest
//! same-bank range using one of three aliasing strategies.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::address::DRAMAddr;
use crate::error::{HammertimeError, Result};

const FILE_MAGIC: u32 = 0xf11b_7ab1;
const HDR_SIZE: usize = 56;
const RANGE_SIZE: usize = 16;
const HAMMERING_SIZE: usize = 8;
const FLIP_SIZE: usize = 12;

/// A single recorded bitflip: where it lands, and the pullup/pulldown
/// values the byte-flip primitive applies there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flip {
    pub location: DRAMAddr,
    pub cell_byte: u16,
    pub pullup: u8,
    pub pulldown: u8,
}

#[derive(Debug, Clone, Copy)]
struct Hammering {
    num_flips: u32,
    flip_idx: u32,
}

#[derive(Debug, Clone, Copy)]
struct Range {
    start: DRAMAddr,
    num_hammers: u32,
    ham_idx: u32,
}

/// How to handle a lookup address that falls outside every recorded range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtrapMode {
    /// No extrapolation; unknown addresses produce no bitflips.
    #[default]
    None,
    /// Alias into the nearest same-bank range, full length.
    PerBank,
    /// Same, but the range length is truncated to the nearest power of two.
    PerBankTrunc,
    /// Fit the range into a power-of-two-sized, self-aligned virtual
    /// range; requests outside that virtual range produce no bitflips.
    PerBankFit,
}

/// The result of a fliptable lookup.
#[derive(Debug, Clone)]
pub struct LookupResult {
    /// The recorded flips, empty if nothing matched.
    pub flips: Vec<Flip>,
    /// Offset to apply to flip addresses: zero on an exact hit, nonzero
    /// when `flips` came from extrapolation, absent if nothing matched.
    pub extrap_diff: Option<DRAMAddr>,
}

impl LookupResult {
    fn empty() -> Self {
        LookupResult {
            flips: Vec::new(),
            extrap_diff: None,
        }
    }
}

/// A loaded, mmap-backed fliptable.
pub struct FlipTable {
    dist: u32,
    num_ranges: u32,
    mmap: Mmap,
    range_tbl_off: u64,
    hammer_tbl_off: u64,
    flip_tbl_off: u64,
}

impl FlipTable {
    /// Row distance between the two rows a hammering in this table refers to.
    pub fn dist(&self) -> u32 {
        self.dist
    }

    /// Loads a fliptable from its binary file format.
    pub fn load(path: impl AsRef<Path>) -> Result<FlipTable> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < HDR_SIZE {
            return Err(HammertimeError::BadMagic {
                expected: FILE_MAGIC,
                actual: 0,
            });
        }

        let magic = read_u32(&mmap, 0);
        if magic != FILE_MAGIC {
            return Err(HammertimeError::BadMagic {
                expected: FILE_MAGIC,
                actual: magic,
            });
        }
        let dist = read_u32(&mmap, 4);
        let range_tbl_off = read_u64(&mmap, 16);
        let hammer_tbl_off = read_u64(&mmap, 24);
        let flip_tbl_off = read_u64(&mmap, 32);
        let num_ranges = read_u32(&mmap, 40);

        Ok(FlipTable {
            dist,
            num_ranges,
            mmap,
            range_tbl_off,
            hammer_tbl_off,
            flip_tbl_off,
        })
    }

    fn range_at(&self, i: u32) -> Range {
        let off = self.range_tbl_off as usize + i as usize * RANGE_SIZE;
        Range {
            start: read_dramaddr(&self.mmap, off),
            num_hammers: read_u32(&self.mmap, off + 8),
            ham_idx: read_u32(&self.mmap, off + 12),
        }
    }

    fn hammering_at(&self, i: u32) -> Hammering {
        let off = self.hammer_tbl_off as usize + i as usize * HAMMERING_SIZE;
        Hammering {
            num_flips: read_u32(&self.mmap, off),
            flip_idx: read_u32(&self.mmap, off + 4),
        }
    }

    fn flips_at(&self, idx: u32, count: u32) -> Vec<Flip> {
        (0..count)
            .map(|i| {
                let off = self.flip_tbl_off as usize + (idx + i) as usize * FLIP_SIZE;
                Flip {
                    location: read_dramaddr(&self.mmap, off),
                    cell_byte: read_u16(&self.mmap, off + 8),
                    pullup: self.mmap[off + 10],
                    pulldown: self.mmap[off + 11],
                }
            })
            .collect()
    }

    /// Looks up the hammering pattern targeting `addr`. Falls back to
    /// `extrap` when `addr` isn't an exact hit in any recorded range.
    pub fn lookup(&self, addr: DRAMAddr, extrap: ExtrapMode) -> LookupResult {
        if self.num_ranges == 0 {
            return LookupResult::empty();
        }

        let mut p: u32 = 0;
        let mut left = self.num_ranges / 2;
        let mut right = self.num_ranges / 2 + (self.num_ranges % 2);

        while right != 0 {
            let idx = p + left;
            let range = self.range_at(idx);
            if addr.same_bank(&range.start) {
                let d = addr.rowdiff(&range.start).unwrap();
                if d > 0 && (d as u32) < range.num_hammers {
                    let h = self.hammering_at(range.ham_idx + d as u32);
                    return LookupResult {
                        flips: self.flips_at(h.flip_idx, h.num_flips),
                        extrap_diff: Some(DRAMAddr::default()),
                    };
                }
            }
            if dramaddr_cmp(&addr, &range.start).is_gt() {
                p = idx;
                left = right / 2;
                right = if right == 1 { 0 } else { right / 2 + (right % 2) };
            } else {
                right = left / 2 + (left % 2);
                left /= 2;
            }
        }

        match extrap {
            ExtrapMode::PerBank | ExtrapMode::PerBankTrunc | ExtrapMode::PerBankFit => {
                let candidate = self.range_at(p);
                if addr.same_bank(&candidate.start) {
                    return self.extrap_row(addr, &candidate, extrap);
                }
                if p + 1 < self.num_ranges {
                    let next = self.range_at(p + 1);
                    if addr.same_bank(&next.start) {
                        return self.extrap_row(addr, &next, extrap);
                    }
                }
                LookupResult::empty()
            }
            ExtrapMode::None => LookupResult::empty(),
        }
    }

    fn extrap_row(&self, addr: DRAMAddr, r: &Range, extrap: ExtrapMode) -> LookupResult {
        let rsz = match extrap {
            ExtrapMode::PerBankTrunc => bitsize(r.num_hammers) >> 1,
            ExtrapMode::PerBank => r.num_hammers,
            ExtrapMode::PerBankFit => {
                let full = bitsize(r.num_hammers);
                if 4 * r.num_hammers < 3 * full {
                    full >> 1
                } else {
                    full
                }
            }
            ExtrapMode::None => return LookupResult::empty(),
        };
        if rsz == 0 {
            return LookupResult::empty();
        }

        let d = if extrap == ExtrapMode::PerBankFit {
            let mask = rsz - 1;
            let adj = r.start.row as u32 & mask;
            let mut vstart = r.start;
            vstart.row &= !(mask as u16);
            let raw = addr.rowdiff(&vstart).unwrap();
            let d = raw.rem_euclid(rsz as i32) as u32;
            if d < adj || d > adj + r.num_hammers {
                return LookupResult::empty();
            }
            d - adj
        } else {
            let raw = addr.rowdiff(&r.start).unwrap();
            raw.rem_euclid(rsz as i32) as u32
        };

        let h = self.hammering_at(r.ham_idx + d);
        let diff = addr.diff(&r.start.addrows(d as i32));
        LookupResult {
            flips: self.flips_at(h.flip_idx, h.num_flips),
            extrap_diff: Some(diff),
        }
    }
}

fn dramaddr_cmp(a: &DRAMAddr, b: &DRAMAddr) -> std::cmp::Ordering {
    a.cmp(b)
}

fn bitsize(x: u32) -> u32 {
    let mut ret = 1u32;
    while ret <= x {
        ret <<= 1;
    }
    ret
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn read_dramaddr(buf: &[u8], off: usize) -> DRAMAddr {
    DRAMAddr {
        chan: buf[off],
        dimm: buf[off + 1],
        rank: buf[off + 2],
        bank: buf[off + 3],
        row: read_u16(buf, off + 4),
        col: read_u16(buf, off + 6),
    }
}
