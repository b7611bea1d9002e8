/// Page shift value (12 bits) for 4KB pages, used by the pagemap reader and
/// the virtual/physical reverse lookups (both key on `addr >> PAGE_SHIFT`).
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting the in-page offset.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
