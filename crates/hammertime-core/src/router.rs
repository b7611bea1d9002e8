//! Physical-address routing: the first of the three resolver stages,
//! translating a CPU-visible [`PhysAddr`] into the address the memory
//! controller actually sees (a [`MemAddr`]).

use crate::address::{MemAddr, PhysAddr};

/// Router-specific configuration. `Passthrough` takes none; `X86Generic`
/// takes the PCI-hole parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteOpts {
    /// No routing parameters (used with [`Router::Passthrough`]).
    #[default]
    None,
    /// PCI-hole remap parameters for [`Router::X86Generic`].
    X86 {
        /// Enables the PCI-hole remap; without this the router passes through.
        remap: bool,
        /// Reserves the top 16 MiB of RAM for the Intel Management Engine.
        intel_me: bool,
        /// Start of the PCI MMIO region.
        pci_start: PhysAddr,
        /// Top of installed RAM, before any Intel ME adjustment.
        top_of_memory: PhysAddr,
    },
}

/// Selects the physical-address routing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Router {
    /// `memaddr = physaddr`, unconditionally.
    #[default]
    Passthrough,
    /// Generic x86 PCI-hole remap.
    X86Generic,
}

impl Router {
    /// Routes a physical address to a memory-controller address.
    pub fn route(&self, addr: PhysAddr, opts: &RouteOpts) -> MemAddr {
        match (self, opts) {
            (
                Router::X86Generic,
                RouteOpts::X86 {
                    remap: true,
                    intel_me,
                    pci_start,
                    top_of_memory,
                },
            ) => {
                let tom = if *intel_me {
                    top_of_memory - 16 * (1 << 20)
                } else {
                    *top_of_memory
                };
                if addr < tom {
                    addr
                } else {
                    pci_start + (addr - tom)
                }
            }
            _ => addr,
        }
    }

    /// Reverses [`Router::route`].
    ///
    /// Only guards the 32-bit PCI hole on the way back: behaviour for
    /// addresses at or above 4 GiB after routing is source-ambiguous, and
    /// the original policy (pass through unchanged) is preserved here.
    pub fn route_reverse(&self, addr: MemAddr, opts: &RouteOpts) -> PhysAddr {
        match (self, opts) {
            (
                Router::X86Generic,
                RouteOpts::X86 {
                    remap: true,
                    intel_me,
                    pci_start,
                    top_of_memory,
                },
            ) => {
                let tom = if *intel_me {
                    top_of_memory - 16 * (1 << 20)
                } else {
                    *top_of_memory
                };
                if addr > *pci_start && addr < (4u64 << 30) {
                    addr - pci_start + tom
                } else {
                    addr
                }
            }
            _ => addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_is_identity() {
        assert_eq!(Router::Passthrough.route(0x1234, &RouteOpts::None), 0x1234);
        assert_eq!(
            Router::Passthrough.route_reverse(0x1234, &RouteOpts::None),
            0x1234
        );
    }

    #[test]
    fn x86_generic_round_trips_below_and_above_the_hole() {
        let opts = RouteOpts::X86 {
            remap: true,
            intel_me: true,
            pci_start: 0xbfa0_0000,
            top_of_memory: 0x2_0000_0000,
        };
        for p in [0x1000u64, 0x1_fff0_0000, 0x1_0000_0000, 0x1_ffff_ffff] {
            let m = Router::X86Generic.route(p, &opts);
            assert_eq!(Router::X86Generic.route_reverse(m, &opts), p);
        }
    }

    #[test]
    fn x86_generic_without_remap_flag_passes_through() {
        let opts = RouteOpts::X86 {
            remap: false,
            intel_me: false,
            pci_start: 0,
            top_of_memory: 0x2_0000_0000,
        };
        assert_eq!(Router::X86Generic.route(0x1_0000_0000, &opts), 0x1_0000_0000);
    }
}
