//! Small shared constants used by the pagemap reader and address helpers.

mod constants;

pub use self::constants::*;
