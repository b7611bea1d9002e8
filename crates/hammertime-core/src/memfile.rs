//! Byte-granular memory flips through a raw memory file: `/proc/[pid]/mem`
//! for virtual memory, `/dev/mem` for physical memory (if the kernel allows
//! it).

use std::fs::{File, OpenOptions};
#[cfg(not(unix))]
use std::io::{Read, Seek, SeekFrom, Write as IoWrite};
#[cfg(unix)]
use std::os::unix::fs::FileExt;

use crate::error::Result;

/// An open, writable handle on a raw memory file.
pub struct MemFile {
    file: File,
}

impl MemFile {
    /// Opens `/proc/<pid>/mem` for reading and writing.
    pub fn open_pid_mem(pid: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{pid}/mem"))?;
        Ok(MemFile { file })
    }

    /// Opens `/dev/mem` for reading and writing. Usually requires root and a
    /// kernel built without strict `/dev/mem` access control.
    pub fn open_dev_mem() -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open("/dev/mem")?;
        Ok(MemFile { file })
    }

    /// Wraps an already-open file handle.
    pub fn from_file(file: File) -> Self {
        MemFile { file }
    }

    /// Flips bits in the byte at `offset` according to `pullup`/`pulldown`
    /// masks: bits set in `pullup` are forced to 1, bits set in `pulldown`
    /// are forced to 0. A bit set in both is pulled up; pull-up always wins
    /// over pull-down on the same bit.
    pub fn flip_bits(&mut self, offset: u64, pullup: u8, pulldown: u8) -> Result<()> {
        let mut buf = [0u8; 1];
        self.read_at(offset, &mut buf)?;
        let byte = buf[0];
        let upbuf = byte | pullup;
        buf[0] = upbuf & !(pulldown & !(byte ^ upbuf));
        self.write_at(offset, &buf)
    }

    #[cfg(unix)]
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset).map_err(Into::into)
    }

    #[cfg(unix)]
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset).map_err(Into::into)
    }

    #[cfg(not(unix))]
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn scratch_file(initial: u8) -> File {
        let path = std::env::temp_dir().join(format!(
            "hammertime-memfile-test-{:?}",
            std::thread::current().id()
        ));
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap();
        f.write_all(&[initial]).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    #[test]
    fn pullup_sets_bits_and_pulldown_clears_them() {
        let mut mf = MemFile::from_file(scratch_file(0b1010_1010));
        mf.flip_bits(0, 0b0000_0001, 0b1000_0000).unwrap();

        let mut buf = [0u8; 1];
        mf.file.seek(SeekFrom::Start(0)).unwrap();
        mf.file.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], 0b0010_1011);
    }

    #[test]
    fn pullup_wins_when_a_bit_is_in_both_masks() {
        let mut mf = MemFile::from_file(scratch_file(0b0000_0000));
        mf.flip_bits(0, 0b0000_0001, 0b0000_0001).unwrap();

        let mut buf = [0u8; 1];
        mf.file.seek(SeekFrom::Start(0)).unwrap();
        mf.file.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], 0b0000_0001);
    }
}
