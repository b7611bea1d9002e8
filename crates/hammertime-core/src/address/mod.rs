//! Address value types shared across the resolver pipeline.
//!
//! [`PhysAddr`] and [`MemAddr`] are the two 64-bit integer address spaces the
//! resolver bridges (CPU-visible vs. memory-controller-visible); [`DRAMAddr`]
//! is the DIMM-level coordinate each ultimately resolves to or from.

mod dram_addr;

pub use self::dram_addr::DRAMAddr;

/// A CPU-visible physical address.
pub type PhysAddr = u64;

/// A memory-controller-visible address, after router translation.
pub type MemAddr = u64;

/// Sentinel marking "no valid translation" in 64-bit integer address form.
pub const BAD_ADDR: u64 = u64::MAX;
