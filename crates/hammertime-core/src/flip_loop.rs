//! Main loops tying a probe's output, a predictor and a [`MemorySystem`]
//! together to actually induce bitflips in a target's memory.
//!
//! [`pmem_flip_loop`] writes flips straight into physical memory (e.g.
//! `/dev/mem`) and does not care where that memory is mapped or by whom.
//! [`vmem_flip_loop`] instead targets a single process's virtual memory
//! (`/proc/<pid>/mem`), translating each predicted physical address back to
//! a virtual one through a reverse page cache built up from the probe's own
//! virtual-address stream.

use crate::bucket::{hash_twang6432, Bucket, HashBucket};
use crate::error::Result;
use crate::memfile::MemFile;
use crate::memsys::MemorySystem;
use crate::predictor::Predictor;
use crate::probe::{ProbeEntry, ProbeOutput, TimeValue, FLAG_VIRTADDR};
use crate::util::{PAGE_MASK, PAGE_SHIFT};

const MAX_FLIPS_PER_BATCH: usize = 128;
const REVTLB_SIZE: u32 = 0x4000;
const REVTLB_PROBE_LIMIT: u32 = 256;

fn apply_flips_pmem(
    msys: &MemorySystem,
    pmem: &mut MemFile,
    reqs: &[crate::predictor::PredictorRequest],
) {
    for req in reqs.iter().take(MAX_FLIPS_PER_BATCH) {
        let tpa = msys.resolve_reverse(req.addr);
        let offset = tpa + req.flip.cell_off as u64;
        if let Err(e) = pmem.flip_bits(offset, req.flip.pullup, req.flip.pulldown) {
            log::error!("error flipping bits at physical offset {offset:#x}: {e}");
        }
    }
}

/// Drains `pout` until it finishes, logging each memory op against `pred`
/// and writing any predicted flips directly into `pmem` at their resolved
/// physical offset.
pub fn pmem_flip_loop(
    pout: &ProbeOutput,
    pred: &mut dyn Predictor,
    msys: &MemorySystem,
    pmem: &mut MemFile,
) {
    let mut cur = 0u64;
    let mut last_t: i64 = 0;

    while let Some(head) = pout.wait_for_head(cur) {
        for entry in pout.read_entries(cur, head) {
            match entry {
                ProbeEntry::Time(t) => {
                    let delta = match t {
                        TimeValue::Delta(d) => -d,
                        TimeValue::Timestamp(ts) => {
                            let d = ts - last_t;
                            last_t = ts;
                            d
                        }
                    };
                    let reqs = pred.advance_time(delta);
                    apply_flips_pmem(msys, pmem, &reqs);
                }
                ProbeEntry::MemOp { phys_addr, .. } => {
                    let da = msys.resolve(phys_addr);
                    let reqs = pred.log_op(da);
                    apply_flips_pmem(msys, pmem, &reqs);
                }
            }
        }
        cur = head;
    }
}

fn apply_flips_vmem(
    msys: &MemorySystem,
    pid: u32,
    revtlb: &HashBucket,
    reqs: &[crate::predictor::PredictorRequest],
) {
    for req in reqs.iter().take(MAX_FLIPS_PER_BATCH) {
        let tpa = msys.resolve_reverse(req.addr);
        let (found, handle) = revtlb.search(tpa >> PAGE_SHIFT);
        if !found {
            log::debug!("bitflip target at phys {tpa:#x} has no known virtual mapping");
            continue;
        }
        let Some(vpage) = revtlb.get(handle) else {
            continue;
        };
        let vaddr = (vpage << PAGE_SHIFT) + (tpa & PAGE_MASK as u64);
        let offset = vaddr + req.flip.cell_off as u64;
        match MemFile::open_pid_mem(pid) {
            Ok(mut vmem) => {
                if let Err(e) = vmem.flip_bits(offset, req.flip.pullup, req.flip.pulldown) {
                    log::error!("error flipping bits at virtual offset {offset:#x}: {e}");
                }
            }
            Err(e) => log::error!("could not open /proc/{pid}/mem: {e}"),
        }
    }
}

/// Drains `pout` until it finishes, tracking the physical-to-virtual
/// mapping `pid` reports and writing predicted flips into `pid`'s virtual
/// memory. Does nothing if `pout` was not configured with
/// [`crate::probe::FLAG_VIRTADDR`], since no reverse mapping is possible
/// without virtual addresses in the stream.
pub fn vmem_flip_loop(
    pout: &ProbeOutput,
    pred: &mut dyn Predictor,
    msys: &MemorySystem,
    pid: u32,
    fmtflags: u32,
) -> Result<()> {
    if fmtflags & FLAG_VIRTADDR == 0 {
        return Ok(());
    }
    let mut revtlb = HashBucket::new(REVTLB_SIZE, REVTLB_PROBE_LIMIT, hash_twang6432)?;

    let mut cur = 0u64;
    let mut last_t: i64 = 0;

    while let Some(head) = pout.wait_for_head(cur) {
        for entry in pout.read_entries(cur, head) {
            match entry {
                ProbeEntry::Time(t) => {
                    let delta = match t {
                        TimeValue::Delta(d) => -d,
                        TimeValue::Timestamp(ts) => {
                            let d = ts - last_t;
                            last_t = ts;
                            d
                        }
                    };
                    let reqs = pred.advance_time(delta);
                    apply_flips_vmem(msys, pid, &revtlb, &reqs);
                }
                ProbeEntry::MemOp {
                    phys_addr,
                    virt_addr: Some(va),
                    ..
                } => {
                    let key = phys_addr >> PAGE_SHIFT;
                    let (_, handle) = revtlb.search(key);
                    revtlb.insert(key, va >> PAGE_SHIFT, handle);

                    let da = msys.resolve(phys_addr);
                    let reqs = pred.log_op(da);
                    apply_flips_vmem(msys, pid, &revtlb, &reqs);
                }
                ProbeEntry::MemOp { virt_addr: None, .. } => {}
            }
        }
        cur = head;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::DRAMAddr;
    use crate::predictor::{BitFlipArg, PredictorRequest};

    struct FixedPredictor {
        flip_addr: DRAMAddr,
        emitted: bool,
    }

    impl Predictor for FixedPredictor {
        fn advance_time(&mut self, _delta_ns: i64) -> Vec<PredictorRequest> {
            Vec::new()
        }
        fn log_op(&mut self, _addr: DRAMAddr) -> Vec<PredictorRequest> {
            if self.emitted {
                return Vec::new();
            }
            self.emitted = true;
            vec![PredictorRequest {
                addr: self.flip_addr,
                flip: BitFlipArg {
                    cell_off: 3,
                    pullup: 0b0000_0001,
                    pulldown: 0,
                },
            }]
        }
    }

    #[test]
    fn pmem_loop_writes_a_predicted_flip_at_the_resolved_offset() {
        let msys = MemorySystem::default();
        let flip_addr = msys.resolve(0);

        let path = std::env::temp_dir().join("hammertime-fliploop-test-pmem");
        std::fs::write(&path, [0u8; 16]).unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut pmem = MemFile::from_file(file);

        let pout = ProbeOutput::new(0);
        pout.push_memop(0, None, None);
        pout.finish();

        let mut pred = FixedPredictor {
            flip_addr,
            emitted: false,
        };

        pmem_flip_loop(&pout, &mut pred, &msys, &mut pmem);

        let expected_offset = msys.resolve_reverse(flip_addr) + 3;
        let written = std::fs::read(&path).unwrap();
        assert_eq!(written[expected_offset as usize], 0b0000_0001);
    }
}
