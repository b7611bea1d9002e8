//! Top-level description of a memory system: which router, mapper and
//! remap to compose, and their configuration. Ties the three resolver
//! stages together and provides the textual description format used to
//! configure a resolver from a file or string.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::address::{DRAMAddr, MemAddr, PhysAddr};
use crate::mapper::{GeometryFlags, IntelCntrlOpts, Mapper};
use crate::remap::Remap;
use crate::router::{RouteOpts, Router};

/// Bitset of errors accumulated while parsing a textual `MemorySystem`
/// description. Each bad line sets one bit and parsing continues past it;
/// a caller that only needs "did this succeed" can check [`LoadErrors::is_empty`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadErrors(u32);

impl LoadErrors {
    pub const CONTROLLER: LoadErrors = LoadErrors(1);
    pub const ROUTE: LoadErrors = LoadErrors(2);
    pub const REMAP: LoadErrors = LoadErrors(4);
    pub const ROUTE_OPTS: LoadErrors = LoadErrors(8);
    pub const UNKNOWN_COMMAND: LoadErrors = LoadErrors(16);
    pub const CONTROLLER_OPTS: LoadErrors = LoadErrors(32);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: LoadErrors) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for LoadErrors {
    type Output = LoadErrors;
    fn bitor(self, rhs: LoadErrors) -> LoadErrors {
        LoadErrors(self.0 | rhs.0)
    }
}

impl BitOrAssign for LoadErrors {
    fn bitor_assign(&mut self, rhs: LoadErrors) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for LoadErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoadErrors({:#x})", self.0)
    }
}

/// A complete, composable description of the address-resolution pipeline:
/// router ∘ mapper ∘ remap forward, the reverse composition in reverse.
#[derive(Debug, Clone, Default)]
pub struct MemorySystem {
    pub controller: Mapper,
    pub router: Router,
    pub dimm_remap: Remap,
    pub mem_geometry: GeometryFlags,
    pub route_opts: RouteOpts,
    pub controller_opts: Option<IntelCntrlOpts>,
}

impl MemorySystem {
    /// Resolves a physical address to its DRAM coordinate.
    pub fn resolve(&self, addr: PhysAddr) -> DRAMAddr {
        let memaddr = self.router.route(addr, &self.route_opts);
        let dramaddr = self
            .controller
            .map(memaddr, self.mem_geometry, self.controller_opts.as_ref());
        self.dimm_remap.remap(dramaddr)
    }

    /// Reverses [`MemorySystem::resolve`].
    pub fn resolve_reverse(&self, addr: DRAMAddr) -> PhysAddr {
        let unremapped = self.dimm_remap.remap_reverse(addr);
        let memaddr = self.controller.map_reverse(
            unremapped,
            self.mem_geometry,
            self.controller_opts.as_ref(),
        );
        self.router.route_reverse(memaddr, &self.route_opts)
    }

    /// Builds a memory system for a generic x86 host with a PCI hole,
    /// provided the requested RAM size fits the controller/geometry's
    /// addressable range. Mirrors the convenience constructor used to set
    /// up most real test systems instead of hand-writing a description.
    pub fn setup_x86(
        controller: Mapper,
        mem_geometry: GeometryFlags,
        controller_opts: Option<IntelCntrlOpts>,
        ramsize: MemAddr,
        pci_start: PhysAddr,
        intel_me: bool,
        dimm_remap: Remap,
    ) -> Option<MemorySystem> {
        if ramsize > controller.max_memory(mem_geometry) {
            return None;
        }
        Some(MemorySystem {
            controller,
            router: Router::X86Generic,
            dimm_remap,
            mem_geometry,
            route_opts: RouteOpts::X86 {
                remap: true,
                intel_me,
                pci_start,
                top_of_memory: ramsize,
            },
            controller_opts,
        })
    }

    /// Parses a textual memory system description (one directive per
    /// line, blank lines and `#`-prefixed comments ignored). Returns the
    /// best-effort system built so far together with the accumulated
    /// parse errors: a malformed line is skipped, not fatal.
    pub fn load_str(s: &str) -> (MemorySystem, LoadErrors) {
        let mut out = MemorySystem::default();
        let mut errs = LoadErrors::default();
        for line in s.lines() {
            errs |= handle_line(line, &mut out);
        }
        (out, errs)
    }
}

fn handle_line(line: &str, out: &mut MemorySystem) -> LoadErrors {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return LoadErrors::default();
    }
    let mut tokens = line.split_whitespace();
    let cmd = match tokens.next() {
        Some(c) => c,
        None => return LoadErrors::default(),
    };
    let arg = tokens.next().unwrap_or("");

    match cmd {
        "cntrl" => match parse_controller(arg) {
            Some(c) => {
                out.controller = c;
                LoadErrors::default()
            }
            None => LoadErrors::CONTROLLER,
        },
        "route" => match parse_router(arg) {
            Some(r) => {
                out.router = r;
                LoadErrors::default()
            }
            None => LoadErrors::ROUTE,
        },
        "remap" => match parse_remap(arg) {
            Some(r) => {
                out.dimm_remap = r;
                LoadErrors::default()
            }
            None => LoadErrors::REMAP,
        },
        "route_opts" => match parse_route_opts(arg, out.router) {
            Some(o) => {
                out.route_opts = o;
                LoadErrors::default()
            }
            None => LoadErrors::ROUTE_OPTS,
        },
        "cntrl_opts" => match parse_cntrl_opts(arg, out.controller) {
            Some(o) => {
                out.controller_opts = Some(o);
                LoadErrors::default()
            }
            None => LoadErrors::CONTROLLER_OPTS,
        },
        "chan" => {
            out.mem_geometry.chan_select = true;
            LoadErrors::default()
        }
        "dimm" => {
            out.mem_geometry.dimm_select = true;
            LoadErrors::default()
        }
        "rank" => {
            out.mem_geometry.rank_select = true;
            LoadErrors::default()
        }
        _ => LoadErrors::UNKNOWN_COMMAND,
    }
}

fn parse_controller(s: &str) -> Option<Mapper> {
    Some(match s {
        "naive_ddr3" => Mapper::NaiveDdr3,
        "naive_ddr4" => Mapper::NaiveDdr4,
        "intel_sandy" => Mapper::IntelSandyDdr3,
        "intel_ivy" | "intel_haswell" => Mapper::IntelIvyHaswellDdr3,
        _ => return None,
    })
}

fn parse_router(s: &str) -> Option<Router> {
    Some(match s {
        "passthru" => Router::Passthrough,
        "x86_generic" => Router::X86Generic,
        _ => return None,
    })
}

fn parse_remap(s: &str) -> Option<Remap> {
    Some(match s {
        "none" => Remap::None,
        "r3x0" => Remap::R3X0,
        "r3x21" => Remap::R3X21,
        "r3x210" => Remap::R3X210,
        _ => return None,
    })
}

fn parse_route_opts(s: &str, router: Router) -> Option<RouteOpts> {
    if router == Router::Passthrough {
        return None;
    }
    let mut parts = s.split(',');
    let flags: u32 = parts.next()?.parse().ok()?;
    let pci_start: u64 = parts.next()?.parse().ok()?;
    let top_of_memory: u64 = parts.next()?.parse().ok()?;
    Some(RouteOpts::X86 {
        remap: flags & 1 != 0,
        intel_me: flags & 2 != 0,
        pci_start,
        top_of_memory,
    })
}

fn parse_cntrl_opts(s: &str, controller: Mapper) -> Option<IntelCntrlOpts> {
    match controller {
        Mapper::IntelSandyDdr3 | Mapper::IntelIvyHaswellDdr3 => {
            if s == "rank_mirror" {
                Some(IntelCntrlOpts { rank_mirror: true })
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_well_formed_description() {
        let text = "\
            # a sandy bridge host, two channels\n\
            cntrl intel_sandy\n\
            route x86_generic\n\
            remap r3x0\n\
            chan\n\
            dimm\n\
            route_opts 1,3217031168,4294967296\n\
        ";
        let (sys, errs) = MemorySystem::load_str(text);
        assert!(errs.is_empty());
        assert_eq!(sys.controller, Mapper::IntelSandyDdr3);
        assert_eq!(sys.router, Router::X86Generic);
        assert_eq!(sys.dimm_remap, Remap::R3X0);
        assert!(sys.mem_geometry.chan_select);
        assert!(sys.mem_geometry.dimm_select);
        assert!(!sys.mem_geometry.rank_select);
    }

    #[test]
    fn unknown_directive_sets_a_bit_but_keeps_going() {
        let text = "cntrl naive_ddr3\nbogus wat\nremap none\n";
        let (sys, errs) = MemorySystem::load_str(text);
        assert!(errs.contains(LoadErrors::UNKNOWN_COMMAND));
        assert_eq!(sys.controller, Mapper::NaiveDdr3);
        assert_eq!(sys.dimm_remap, Remap::None);
    }

    #[test]
    fn route_opts_before_a_router_is_chosen_is_rejected() {
        let (_, errs) = MemorySystem::load_str("route_opts 1,0,100\n");
        assert!(errs.contains(LoadErrors::ROUTE_OPTS));
    }

    #[test]
    fn setup_x86_rejects_oversized_ram() {
        let geom = GeometryFlags::default();
        let huge = Mapper::NaiveDdr3.max_memory(geom) + 1;
        assert!(MemorySystem::setup_x86(
            Mapper::NaiveDdr3,
            geom,
            None,
            huge,
            0,
            false,
            Remap::None,
        )
        .is_none());
    }

    #[test]
    fn resolve_and_resolve_reverse_round_trip() {
        let sys = MemorySystem::setup_x86(
            Mapper::IntelIvyHaswellDdr3,
            GeometryFlags {
                rank_select: true,
                dimm_select: false,
                chan_select: true,
            },
            None,
            1 << 33,
            0xbfa0_0000,
            false,
            Remap::R3X21,
        )
        .unwrap();
        for phys in [0x1000u64, 0x1_0000_0000, 0x1_dead_be00] {
            let d = sys.resolve(phys);
            assert_eq!(sys.resolve_reverse(d), phys & !0b111);
        }
    }
}
