use thiserror::Error;

/// The error kinds used across the resolver/fliptable/predictor core.
///
/// The resolver itself never fails (it is total over its input domain); this
/// enum covers the fallible edges: file I/O, pagemap lookups and
/// configuration parsing.
#[derive(Debug, Error)]
pub enum HammertimeError {
    /// File read/write or mmap failure (fliptable load, pagemap read, memfile flip).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fliptable magic number did not match the expected value.
    #[error("bad fliptable magic: expected {expected:#x}, got {actual:#x}")]
    BadMagic {
        /// The magic value the loader requires.
        expected: u32,
        /// The magic value actually present in the file.
        actual: u32,
    },

    /// A configuration value could not be interpreted: an unknown
    /// controller/router/remap name in a `MemorySystem` description, or a
    /// predictor mode that disagrees with the fliptable it was built from.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A `Bucket` or `VTLB` could not be constructed (invalid capacity).
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// A pagemap entry's present bit was clear. Distinct from `Io` so
    /// callers can tell "no translation" apart from "couldn't ask".
    #[error("virtual address not mapped")]
    NotMapped,
}

/// Result alias for fallible operations in this crate.
pub type Result<T> = std::result::Result<T, HammertimeError>;
