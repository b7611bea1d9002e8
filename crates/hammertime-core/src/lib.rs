//! # Hammertime Core
//!
//! `hammertime-core` emulates DRAM rowhammer bitflips in software: given a
//! physical address stream and a recorded fliptable of real hammering
//! results, it resolves addresses down to DRAM coordinates, tallies row
//! accesses, and predicts which bits would have flipped on real hardware.
//!
//! ## Architecture Overview
//!
//! Address resolution is a pipeline of three independently swappable stages,
//! composed by [`memsys::MemorySystem`]:
//!
//! - [`router::Router`] - physical address <-> memory controller address.
//! - [`mapper::Mapper`] - memory controller address <-> [`address::DRAMAddr`].
//! - [`remap::Remap`] - on-DIMM row remapping.
//!
//! Row-access tracking runs through a generational cache:
//!
//! - [`bucket::Bucket`] - open-addressed hash table with bounded probing.
//! - [`vtlb::Vtlb`] - a ring of buckets aged by elapsed time, backed by
//!   [`pagemap::PagemapReader`] on a cache miss.
//!
//! Recorded hammering results and the prediction pipeline:
//!
//! - [`fliptable::FlipTable`] - mmap'd binary table of which rows flip when
//!   hammered, with extrapolation across untested rows.
//! - [`predictor::Predictor`] - consumes row accesses and elapsed time,
//!   emits predicted bitflips; [`predictor::FliptablePredictor`] is the
//!   fliptable-backed implementation.
//!
//! Tying it together:
//!
//! - [`probe::ProbeOutput`] - the interleaved memory-op/time-update stream a
//!   probe produces and a consumer drains.
//! - [`memfile::MemFile`] - byte-granular flips through a raw memory file.
//! - [`flip_loop`] - the main loops that drain a probe, run the predictor,
//!   and apply flips to physical ([`flip_loop::pmem_flip_loop`]) or virtual
//!   ([`flip_loop::vmem_flip_loop`]) memory.
//!
//! ## Platform Support
//!
//! This framework is designed for x86_64 Linux systems with access to
//! physical memory information through `/proc/self/pagemap` and related
//! interfaces. Some operations require elevated privileges (root access).

#![warn(missing_docs)]

pub mod address;
pub mod bucket;
pub mod error;
pub mod flip_loop;
pub mod fliptable;
pub mod mapper;
pub mod memfile;
pub mod memsys;
pub mod pagemap;
pub mod predictor;
pub mod probe;
pub mod remap;
pub mod router;
pub mod util;
pub mod vtlb;

pub use crate::error::{HammertimeError, Result};
