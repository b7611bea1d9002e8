use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// A DIMM-level coordinate: `(channel, dimm, rank, bank, row, column)`.
///
/// Ordering is derived in field declaration order, which gives the
/// big-endian tuple order required by the resolver (`chan` most
/// significant, `col` least). Row and column arithmetic wraps at their
/// native width (16 bits): wraparound on row addition is part of the
/// bijection the mappers implement, not a bug to be guarded against.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DRAMAddr {
    pub chan: u8,
    pub dimm: u8,
    pub rank: u8,
    pub bank: u8,
    pub row: u16,
    pub col: u16,
}

/// Sentinel `DRAMAddr` used to mark end-of-buffer conditions. All fields
/// zero; distinguishable only by the calling context, since an all-zero
/// coordinate is otherwise a perfectly legal address.
pub const BAD_DRAMADDR: DRAMAddr = DRAMAddr {
    chan: 0,
    dimm: 0,
    rank: 0,
    bank: 0,
    row: 0,
    col: 0,
};

impl Display for DRAMAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:x} {:x} {:x} {:x} {:04x} {:03x})",
            self.chan, self.dimm, self.rank, self.bank, self.row, self.col
        )
    }
}

impl DRAMAddr {
    /// Creates a new `DRAMAddr` from its six components.
    pub fn new(chan: u8, dimm: u8, rank: u8, bank: u8, row: u16, col: u16) -> Self {
        DRAMAddr {
            chan,
            dimm,
            rank,
            bank,
            row,
            col,
        }
    }

    /// True if `self` and `other` address the same channel/dimm/rank/bank,
    /// ignoring row and column.
    pub fn same_bank(&self, other: &DRAMAddr) -> bool {
        self.chan == other.chan
            && self.dimm == other.dimm
            && self.rank == other.rank
            && self.bank == other.bank
    }

    /// True if `self` and `other` are in the same bank and the same row.
    pub fn same_row(&self, other: &DRAMAddr) -> bool {
        self.same_bank(other) && self.row == other.row
    }

    /// True if `other` is the row immediately following `self` in the same bank.
    pub fn succ_rows(&self, other: &DRAMAddr) -> bool {
        self.same_bank(other) && self.row.wrapping_add(1) == other.row
    }

    /// Row distance `self.row - other.row` if both addresses share a bank,
    /// `None` otherwise.
    pub fn rowdiff(&self, other: &DRAMAddr) -> Option<i32> {
        self.same_bank(other)
            .then(|| self.row as i32 - other.row as i32)
    }

    /// Returns `self` with `delta` rows added, wrapping at 16 bits.
    pub fn addrows(&self, delta: i32) -> DRAMAddr {
        DRAMAddr {
            row: self.row.wrapping_add(delta as u16),
            ..*self
        }
    }

    /// Componentwise difference, wrapping at each field's native width.
    pub fn diff(&self, other: &DRAMAddr) -> DRAMAddr {
        DRAMAddr {
            chan: self.chan.wrapping_sub(other.chan),
            dimm: self.dimm.wrapping_sub(other.dimm),
            rank: self.rank.wrapping_sub(other.rank),
            bank: self.bank.wrapping_sub(other.bank),
            row: self.row.wrapping_sub(other.row),
            col: self.col.wrapping_sub(other.col),
        }
    }

    /// Componentwise sum, wrapping at each field's native width.
    pub fn add(&self, other: &DRAMAddr) -> DRAMAddr {
        DRAMAddr {
            chan: self.chan.wrapping_add(other.chan),
            dimm: self.dimm.wrapping_add(other.dimm),
            rank: self.rank.wrapping_add(other.rank),
            bank: self.bank.wrapping_add(other.bank),
            row: self.row.wrapping_add(other.row),
            col: self.col.wrapping_add(other.col),
        }
    }

    /// `self` with `col` forced to zero, the normal form used for
    /// row-granularity tallying.
    pub fn with_col_zero(&self) -> DRAMAddr {
        DRAMAddr { col: 0, ..*self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_big_endian_tuple_order() {
        let a = DRAMAddr::new(0, 0, 0, 0, 5, 9);
        let b = DRAMAddr::new(0, 0, 0, 1, 0, 0);
        assert!(a < b, "bank is more significant than row/col");

        let c = DRAMAddr::new(1, 0, 0, 0, 0, 0);
        let d = DRAMAddr::new(0, 255, 255, 255, 65535, 65535);
        assert!(c > d, "chan is the most significant field");
    }

    #[test]
    fn same_bank_ignores_row_and_col() {
        let a = DRAMAddr::new(1, 2, 3, 4, 10, 20);
        let b = DRAMAddr::new(1, 2, 3, 4, 99, 1);
        assert!(a.same_bank(&b));
        assert!(!a.same_row(&b));
    }

    #[test]
    fn rowdiff_is_none_across_banks() {
        let a = DRAMAddr::new(0, 0, 0, 0, 10, 0);
        let b = DRAMAddr::new(0, 0, 0, 1, 10, 0);
        assert_eq!(a.rowdiff(&b), None);
        assert_eq!(a.rowdiff(&a), Some(0));
    }

    #[test]
    fn addrows_wraps_at_16_bits() {
        let a = DRAMAddr::new(0, 0, 0, 0, u16::MAX, 0);
        assert_eq!(a.addrows(1).row, 0);
        let b = DRAMAddr::new(0, 0, 0, 0, 0, 0);
        assert_eq!(b.addrows(-1).row, u16::MAX);
    }
}
