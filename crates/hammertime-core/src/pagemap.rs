//! Raw `/proc/[pid]/pagemap` reader.
//!
//! Deliberately bypasses any higher-level pagemap crate: callers need to
//! distinguish "present bit clear" ([`HammertimeError::NotMapped`]) from an
//! outright I/O failure, which only a byte-offset read of the raw format
//! can give cleanly.

use std::fs::{File, OpenOptions};
#[cfg(not(unix))]
use std::io::{Read, Seek, SeekFrom};
#[cfg(unix)]
use std::os::unix::fs::FileExt;

use crate::error::{HammertimeError, Result};
use crate::util::PAGE_SHIFT;

const PAGEMAP_ENTRY_BYTES: u64 = 8;
const PFN_MASK: u64 = (1 << 55) - 1;
const PRESENT_BIT: u64 = 1 << 63;

/// An open handle on a process's pagemap file.
pub struct PagemapReader {
    file: File,
}

impl PagemapReader {
    /// Opens `/proc/<pid>/pagemap`, or `/proc/self/pagemap` if `pid` is `None`.
    pub fn open(pid: Option<u32>) -> Result<Self> {
        let path = match pid {
            Some(pid) => format!("/proc/{pid}/pagemap"),
            None => "/proc/self/pagemap".to_string(),
        };
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(PagemapReader { file })
    }

    /// Wraps an already-open pagemap file descriptor/handle.
    pub fn from_file(file: File) -> Self {
        PagemapReader { file }
    }

    /// Translates a virtual address to a physical address. Returns
    /// [`HammertimeError::NotMapped`] if the page's present bit is clear.
    pub fn read(&mut self, vaddr: u64) -> Result<u64> {
        let offset = (vaddr >> PAGE_SHIFT) * PAGEMAP_ENTRY_BYTES;
        let mut buf = [0u8; PAGEMAP_ENTRY_BYTES as usize];
        self.read_at(offset, &mut buf)?;
        let entry = u64::from_le_bytes(buf);

        if entry & PRESENT_BIT == 0 {
            return Err(HammertimeError::NotMapped);
        }
        let pfn = entry & PFN_MASK;
        let page_offset = vaddr & ((1 << PAGE_SHIFT) - 1);
        Ok((pfn << PAGE_SHIFT) | page_offset)
    }

    #[cfg(unix)]
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset).map_err(Into::into)
    }

    #[cfg(not(unix))]
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_pagemap_resolves_a_live_stack_address() {
        let mut reader = PagemapReader::open(None).expect("pagemap should be readable");
        let x: u64 = 0;
        let vaddr = &x as *const u64 as u64;
        let phys = reader.read(vaddr).expect("a live stack page should be present");
        assert_eq!(phys & ((1 << PAGE_SHIFT) - 1), vaddr & ((1 << PAGE_SHIFT) - 1));
    }
}
