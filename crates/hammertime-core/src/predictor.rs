//! Predictors: black boxes that consume memory operations and elapsed time,
//! and emit predicted bitflips.
//!
//! [`FliptablePredictor`] is the one predictor provided: it tallies
//! row-granularity accesses in a generational [`Vtlb`] and, once a pair of
//! rows `dist` apart both cross a threshold within a refresh interval,
//! looks up the resulting bitflips in a [`FlipTable`].

use crate::address::DRAMAddr;
use crate::bucket::HashBucket;
use crate::error::{HammertimeError, Result};
use crate::fliptable::{ExtrapMode, FlipTable};
use crate::vtlb::Vtlb;

const REFRESH_INTERVAL_US: u64 = 64_000;
const REFRESH_TOLERANCE_US: u64 = 2_000;
const TALLY_GENSIZE: u32 = 512_000;

/// Which rowhammer access pattern a [`FliptablePredictor`] looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HammerMode {
    /// A single aggressor row hammered in isolation.
    SingleSided,
    /// Two aggressor rows hammered together, victim between them.
    DoubleSided,
}

impl HammerMode {
    fn dist(&self) -> i32 {
        match self {
            HammerMode::SingleSided => 0,
            HammerMode::DoubleSided => 2,
        }
    }
}

/// The pullup/pulldown bitflip a predictor asks the caller to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitFlipArg {
    pub cell_off: u16,
    pub pullup: u8,
    pub pulldown: u8,
}

/// A single predicted bitflip request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictorRequest {
    pub addr: DRAMAddr,
    pub flip: BitFlipArg,
}

/// A component that watches memory operations and elapsed time and emits
/// predicted bitflips.
pub trait Predictor {
    /// Advances internal time state by `delta_ns` nanoseconds.
    fn advance_time(&mut self, delta_ns: i64) -> Vec<PredictorRequest>;
    /// Logs a memory operation at `addr`.
    fn log_op(&mut self, addr: DRAMAddr) -> Vec<PredictorRequest>;
}

/// A tally-and-lookup predictor backed by a [`FlipTable`].
pub struct FliptablePredictor<'a> {
    ft: &'a FlipTable,
    counts: Vtlb<HashBucket>,
    thresh: u64,
    dist: i32,
    extrap: ExtrapMode,
}

impl<'a> FliptablePredictor<'a> {
    /// Builds a predictor for `mode` against `ft`. `ft`'s configured row
    /// distance must match the one implied by `mode`, since the table's
    /// recorded hammerings were only ever profiled at that spacing.
    pub fn new(
        ft: &'a FlipTable,
        mode: HammerMode,
        flip_thresh: u64,
        extrap: ExtrapMode,
    ) -> Result<Self> {
        let dist = mode.dist();
        if dist as u32 != ft.dist() {
            return Err(HammertimeError::InvalidConfig(format!(
                "fliptable dist {} does not match hammer mode distance {}",
                ft.dist(),
                dist
            )));
        }
        let counts = Vtlb::new(
            TALLY_GENSIZE,
            1,
            REFRESH_INTERVAL_US,
            REFRESH_INTERVAL_US + REFRESH_TOLERANCE_US,
            None,
        )?;
        Ok(FliptablePredictor {
            ft,
            counts,
            thresh: flip_thresh,
            dist,
            extrap,
        })
    }

    fn lookup(&self, addr: DRAMAddr) -> Vec<PredictorRequest> {
        let result = self.ft.lookup(addr, self.extrap);
        let Some(ediff) = result.extrap_diff else {
            return Vec::new();
        };
        result
            .flips
            .into_iter()
            .map(|f| PredictorRequest {
                addr: f.location.add(&ediff),
                flip: BitFlipArg {
                    cell_off: f.cell_byte,
                    pullup: f.pullup,
                    pulldown: f.pulldown,
                },
            })
            .collect()
    }
}

/// Packs a row-granularity DRAM coordinate into the tally's lookup key.
/// Column is ignored: the tally operates at row granularity.
fn tally_key(addr: &DRAMAddr) -> u64 {
    (addr.chan as u64)
        | (addr.dimm as u64) << 8
        | (addr.rank as u64) << 16
        | (addr.bank as u64) << 24
        | (addr.row as u64) << 32
}

impl<'a> Predictor for FliptablePredictor<'a> {
    fn advance_time(&mut self, delta_ns: i64) -> Vec<PredictorRequest> {
        self.counts.update_timedelta(delta_ns);
        Vec::new()
    }

    fn log_op(&mut self, addr: DRAMAddr) -> Vec<PredictorRequest> {
        let addr = addr.with_col_zero();
        let key = tally_key(&addr);

        let tally = match self.counts.search(key) {
            None => {
                self.counts.update(key, 1);
                return Vec::new();
            }
            Some(t) => t + 1,
        };
        self.counts.update(key, tally);

        if tally < self.thresh {
            return Vec::new();
        }

        let lower = addr.addrows(-self.dist);
        let lower_key = tally_key(&lower);
        if let Some(lt) = self.counts.search(lower_key) {
            if lt >= self.thresh {
                self.counts.update(lower_key, 0);
                self.counts.update(key, 0);
                return self.lookup(lower);
            }
        }

        let upper = addr.addrows(self.dist);
        let upper_key = tally_key(&upper);
        if let Some(ut) = self.counts.search(upper_key) {
            if ut >= self.thresh {
                self.counts.update(upper_key, 0);
                self.counts.update(key, 0);
                return self.lookup(addr);
            }
        }

        Vec::new()
    }
}
