//! DRAM address mapping: the second resolver stage, translating a
//! memory-controller address into a [`DRAMAddr`] (channel/dimm/rank/bank/row/col).

use crate::address::{DRAMAddr, MemAddr};

fn bit(n: u32, x: u64) -> u64 {
    (x >> n) & 1
}

fn ls_bitmask(n: u32) -> u64 {
    (1u64 << n) - 1
}

/// Pulls bit `n` out of `x`, closing the gap by shifting everything above it
/// down by one. Used to consume a single selector bit (dimm/rank) out of the
/// middle of the address before bank hashing.
fn pop_bit(n: u32, x: u64) -> u64 {
    (x & ls_bitmask(n)) + ((x >> (n + 1)) << n)
}

/// Which optional address-selection bits a geometry uses. Each flag widens
/// the addressable space by one bit (two ranks per dimm, two dimms per
/// channel, two channels per controller).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct GeometryFlags {
    pub rank_select: bool,
    pub dimm_select: bool,
    pub chan_select: bool,
}

/// Controller options specific to Intel Sandy Bridge/Ivy Bridge/Haswell
/// DDR3 controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct IntelCntrlOpts {
    /// Enables address-pin mirroring on the second rank. The original
    /// implementation gates this with `flags | RANKMIRROR && bit0(rank)`,
    /// which due to operator precedence is actually `flags | (RANKMIRROR &&
    /// bit0(rank))` — always true whenever an options struct is present at
    /// all. That is almost certainly not the intended behaviour, and the
    /// only way to construct these options is with the flag set, so the
    /// distinction never surfaces in practice; this implementation uses the
    /// evidently-intended `rank_mirror && bit0(rank)` gate.
    pub rank_mirror: bool,
}

/// Selects the memory controller's column/bank/row hashing scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mapper {
    /// Simple column/bank/row slicing, DDR3 geometry (8 banks).
    #[default]
    NaiveDdr3,
    /// Simple column/bank/row slicing, DDR4 geometry (16 banks).
    NaiveDdr4,
    /// Intel Sandy Bridge DDR3 XOR bank hashing.
    IntelSandyDdr3,
    /// Intel Ivy Bridge/Haswell DDR3 XOR bank hashing.
    IntelIvyHaswellDdr3,
}

impl Mapper {
    /// Maps a memory-controller address to a DRAM coordinate.
    pub fn map(&self, addr: MemAddr, geom: GeometryFlags, opts: Option<&IntelCntrlOpts>) -> DRAMAddr {
        match self {
            Mapper::NaiveDdr3 => DRAMAddr {
                chan: 0,
                dimm: 0,
                rank: 0,
                col: ((addr >> 3) & ls_bitmask(10)) as u16,
                bank: ((addr >> 13) & ls_bitmask(3)) as u8,
                row: (addr >> 16) as u16,
            },
            Mapper::NaiveDdr4 => DRAMAddr {
                chan: 0,
                dimm: 0,
                rank: 0,
                col: ((addr >> 3) & ls_bitmask(10)) as u16,
                bank: ((addr >> 13) & ls_bitmask(4)) as u8,
                row: (addr >> 17) as u16,
            },
            Mapper::IntelSandyDdr3 => map_sandy(addr, geom, opts),
            Mapper::IntelIvyHaswellDdr3 => map_ivyhaswell(addr, geom, opts),
        }
    }

    /// Reverses [`Mapper::map`].
    pub fn map_reverse(
        &self,
        addr: DRAMAddr,
        geom: GeometryFlags,
        opts: Option<&IntelCntrlOpts>,
    ) -> MemAddr {
        match self {
            Mapper::NaiveDdr3 => {
                ((addr.row as u64) << 16) + ((addr.bank as u64) << 13) + ((addr.col as u64) << 3)
            }
            Mapper::NaiveDdr4 => {
                ((addr.row as u64) << 17) + ((addr.bank as u64) << 13) + ((addr.col as u64) << 3)
            }
            Mapper::IntelSandyDdr3 => map_reverse_sandy(addr, geom, opts),
            Mapper::IntelIvyHaswellDdr3 => map_reverse_ivyhaswell(addr, geom, opts),
        }
    }

    /// Smallest contiguous memory-address span guaranteed to stay within a
    /// single row, given a geometry and controller options.
    pub fn granularity(&self, geom: GeometryFlags, opts: Option<&IntelCntrlOpts>) -> u64 {
        let mirrored = opts.is_some_and(|o| o.rank_mirror);
        match self {
            Mapper::NaiveDdr3 | Mapper::NaiveDdr4 => 1 << 13,
            Mapper::IntelSandyDdr3 => {
                if mirrored {
                    1 << 6
                } else if geom.chan_select {
                    1 << 6
                } else {
                    1 << 13
                }
            }
            Mapper::IntelIvyHaswellDdr3 => {
                if mirrored {
                    1 << 6
                } else if geom.chan_select {
                    1 << 7
                } else {
                    1 << 13
                }
            }
        }
    }

    /// Total addressable memory span for a geometry, in bytes.
    pub fn max_memory(&self, geom: GeometryFlags) -> u64 {
        let mut membits = 16 + 10 + 3;
        membits += match self {
            Mapper::NaiveDdr3 | Mapper::IntelSandyDdr3 | Mapper::IntelIvyHaswellDdr3 => 3,
            Mapper::NaiveDdr4 => 4,
        };
        membits += geom.rank_select as u32 + geom.dimm_select as u32 + geom.chan_select as u32;
        1u64 << membits
    }
}

/// Swaps row bits 3<->4, 5<->6, 7<->8; column bits 3<->4, 5<->6, 7<->8; bank
/// bits 0<->1. Involutive: applying it twice is the identity.
fn ddr3_rank_mirror(addr: DRAMAddr) -> DRAMAddr {
    let row = addr.row as u64;
    let col = addr.col as u64;
    let bank = addr.bank as u64;

    let new_row = (row & 0xfe07)
        | (bit(7, row) << 8)
        | (bit(8, row) << 7)
        | (bit(5, row) << 6)
        | (bit(6, row) << 5)
        | (bit(3, row) << 4)
        | (bit(4, row) << 3);
    let new_col = (col & 0xfe07)
        | (bit(7, col) << 8)
        | (bit(8, col) << 7)
        | (bit(5, col) << 6)
        | (bit(6, col) << 5)
        | (bit(3, col) << 4)
        | (bit(4, col) << 3);
    let new_bank = (bank & 0xfffc) | (bit(0, bank) << 1) | bit(1, bank);

    DRAMAddr {
        row: new_row as u16,
        col: new_col as u16,
        bank: new_bank as u8,
        ..addr
    }
}

fn apply_rank_mirror(addr: DRAMAddr, opts: Option<&IntelCntrlOpts>) -> DRAMAddr {
    match opts {
        Some(o) if o.rank_mirror && bit(0, addr.rank as u64) == 1 => ddr3_rank_mirror(addr),
        _ => addr,
    }
}

fn map_sandy(addr: MemAddr, geom: GeometryFlags, opts: Option<&IntelCntrlOpts>) -> DRAMAddr {
    let mut retval = DRAMAddr::default();
    let mut addr = addr >> 3;

    if geom.chan_select {
        let mut col = addr & ls_bitmask(3);
        addr >>= 3;
        retval.chan = bit(0, addr) as u8;
        addr >>= 1;
        col += (addr & ls_bitmask(7)) << 3;
        addr >>= 7;
        retval.col = col as u16;
    } else {
        retval.col = (addr & ls_bitmask(10)) as u16;
        addr >>= 10;
    }

    if geom.dimm_select {
        retval.dimm += bit(3, addr) as u8;
        addr = pop_bit(3, addr);
    }
    if geom.rank_select {
        retval.rank += bit(3, addr) as u8;
        addr = pop_bit(3, addr);
    }

    let mut bank = 0u64;
    for i in 0..3 {
        bank += (bit(0, addr) ^ bit(3, addr)) << i;
        addr >>= 1;
    }
    retval.bank = bank as u8;

    retval.row = (addr & ls_bitmask(16)) as u16;

    apply_rank_mirror(retval, opts)
}

fn map_reverse_sandy(addr: DRAMAddr, geom: GeometryFlags, opts: Option<&IntelCntrlOpts>) -> MemAddr {
    let addr = apply_rank_mirror(addr, opts);

    let mut retval = (addr.row as u64) & ls_bitmask(16);
    if geom.rank_select {
        retval <<= 1;
        retval |= addr.rank as u64 & 1;
    }
    if geom.dimm_select {
        retval <<= 1;
        retval |= addr.dimm as u64 & 1;
    }
    for i in (0..=2).rev() {
        retval <<= 1;
        retval |= bit(i, addr.bank as u64) ^ bit(i, addr.row as u64);
    }
    if geom.chan_select {
        retval <<= 7;
        retval |= (addr.col as u64 >> 3) & ls_bitmask(7);
        retval <<= 1;
        retval |= addr.chan as u64 & 1;
        retval <<= 3;
        retval |= addr.col as u64 & ls_bitmask(3);
    } else {
        retval <<= 10;
        retval |= addr.col as u64 & ls_bitmask(10);
    }
    retval <<= 3;
    retval
}

fn map_ivyhaswell(addr: MemAddr, geom: GeometryFlags, opts: Option<&IntelCntrlOpts>) -> DRAMAddr {
    let mut retval = DRAMAddr::default();
    let mut addr = addr >> 3;

    if geom.chan_select {
        let mut col = addr & ls_bitmask(4);
        addr >>= 4;
        retval.chan = (bit(0, addr)
            ^ bit(1, addr)
            ^ bit(2, addr)
            ^ bit(5, addr)
            ^ bit(6, addr)
            ^ bit(11, addr)
            ^ bit(12, addr)) as u8;
        addr >>= 1;
        col += (addr & ls_bitmask(6)) << 4;
        addr >>= 6;
        retval.col = col as u16;
    } else {
        retval.col = (addr & ls_bitmask(10)) as u16;
        addr >>= 10;
    }

    if geom.dimm_select {
        retval.dimm += bit(2, addr) as u8;
        addr = pop_bit(2, addr);
    }
    if geom.rank_select {
        retval.rank += (bit(2, addr) ^ bit(6, addr)) as u8;
        addr = pop_bit(2, addr);
    }

    let mut bank = 0u64;
    for i in 0..2 {
        bank += (bit(0, addr) ^ bit(3, addr)) << i;
        addr >>= 1;
    }
    let hi_bit = if geom.rank_select { 4 } else { 3 };
    bank += (bit(0, addr) ^ bit(hi_bit, addr)) << 2;
    addr >>= 1;
    retval.bank = bank as u8;

    retval.row = (addr & ls_bitmask(16)) as u16;

    apply_rank_mirror(retval, opts)
}

fn map_reverse_ivyhaswell(
    addr: DRAMAddr,
    geom: GeometryFlags,
    opts: Option<&IntelCntrlOpts>,
) -> MemAddr {
    let addr = apply_rank_mirror(addr, opts);

    let mut retval = (addr.row as u64) & ls_bitmask(16);
    if geom.rank_select {
        retval <<= 1;
        retval |= bit(2, addr.bank as u64) ^ bit(3, addr.row as u64);
        retval <<= 1;
        retval |= (addr.rank as u64 & 1) ^ bit(2, addr.row as u64);
    } else {
        retval <<= 1;
        retval |= bit(2, addr.bank as u64) ^ bit(2, addr.row as u64);
    }
    if geom.dimm_select {
        retval <<= 1;
        retval |= addr.dimm as u64 & 1;
    }
    for i in (0..=1).rev() {
        retval <<= 1;
        retval |= bit(i, addr.bank as u64) ^ bit(i, addr.row as u64);
    }
    if geom.chan_select {
        retval <<= 6;
        retval |= (addr.col as u64 >> 4) & ls_bitmask(6);
        retval <<= 1;
        retval |= (addr.chan as u64 & 1)
            ^ bit(1, retval)
            ^ bit(2, retval)
            ^ bit(5, retval)
            ^ bit(6, retval)
            ^ bit(11, retval)
            ^ bit(12, retval);
        retval <<= 4;
        retval |= addr.col as u64 & ls_bitmask(4);
    } else {
        retval <<= 10;
        retval |= addr.col as u64 & ls_bitmask(10);
    }
    retval <<= 3;
    retval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naive_ddr3_round_trips() {
        let geom = GeometryFlags::default();
        let m = Mapper::NaiveDdr3;
        for memaddr in [0u64, 0x1234, 0x7fff_ffff, 0xdead_beef_0] {
            let d = m.map(memaddr, geom, None);
            assert_eq!(m.map_reverse(d, geom, None), memaddr & !0b111);
        }
    }

    #[test]
    fn naive_ddr4_has_four_bank_bits() {
        let geom = GeometryFlags::default();
        let d = Mapper::NaiveDdr4.map(0xf_2000, geom, None);
        assert_eq!(d.bank, 0xf);
    }

    #[test]
    fn sandy_round_trips_with_full_geometry() {
        let geom = GeometryFlags {
            rank_select: true,
            dimm_select: true,
            chan_select: true,
        };
        let m = Mapper::IntelSandyDdr3;
        for memaddr in [0u64, 0x1_0000_0000, 0x3_ffff_fff8, 0x12345678] {
            let d = m.map(memaddr, geom, None);
            assert_eq!(m.map_reverse(d, geom, None), memaddr & !0b111);
        }
    }

    #[test]
    fn sandy_rank_mirror_round_trips() {
        let geom = GeometryFlags {
            rank_select: true,
            dimm_select: false,
            chan_select: true,
        };
        let opts = IntelCntrlOpts { rank_mirror: true };
        let m = Mapper::IntelSandyDdr3;
        for memaddr in [0x1_0000_0000u64, 0x1_dead_be80, 0x1_0000_0008] {
            let d = m.map(memaddr, geom, Some(&opts));
            assert_eq!(m.map_reverse(d, geom, Some(&opts)), memaddr & !0b111);
        }
    }

    #[test]
    fn ivyhaswell_round_trips_with_full_geometry() {
        let geom = GeometryFlags {
            rank_select: true,
            dimm_select: true,
            chan_select: true,
        };
        let m = Mapper::IntelIvyHaswellDdr3;
        for memaddr in [0u64, 0x1_0000_0000, 0x3_ffff_fff8, 0xabcdef0] {
            let d = m.map(memaddr, geom, None);
            assert_eq!(m.map_reverse(d, geom, None), memaddr & !0b111);
        }
    }

    #[test]
    fn rank_mirror_is_involutive() {
        let addr = DRAMAddr::new(0, 0, 1, 0b101, 0b1_1111_1111, 0b1_1111_1111);
        let once = ddr3_rank_mirror(addr);
        let twice = ddr3_rank_mirror(once);
        assert_eq!(addr, twice);
    }

    #[test]
    fn granularity_shrinks_under_rank_mirror() {
        let geom = GeometryFlags::default();
        let opts = IntelCntrlOpts { rank_mirror: true };
        assert_eq!(
            Mapper::IntelSandyDdr3.granularity(geom, Some(&opts)),
            1 << 6
        );
        assert_eq!(Mapper::IntelSandyDdr3.granularity(geom, None), 1 << 13);
    }

    #[test]
    fn max_memory_grows_with_geometry_bits() {
        let bare = GeometryFlags::default();
        let full = GeometryFlags {
            rank_select: true,
            dimm_select: true,
            chan_select: true,
        };
        assert_eq!(
            Mapper::NaiveDdr3.max_memory(full) / Mapper::NaiveDdr3.max_memory(bare),
            8
        );
    }
}
