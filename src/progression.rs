//! Packet sequencing under the five progression orders.
//!
//! The position dimension iterates precinct indices; precincts are
//! resolution-local, so position-major orders loop over the largest
//! precinct count and skip coordinates a given resolution does not have.

use crate::config::ProgressionOrder;

/// Identity of one packet within a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCoord {
    pub layer: u16,
    pub resolution: u8,
    pub component: u16,
    pub precinct: u32,
}

/// Produces every (layer, resolution, component, precinct) tuple of a tile
/// in codestream order. `precinct_count(component, resolution)` reports
/// the precinct grid size.
pub fn packet_sequence(
    order: ProgressionOrder,
    layers: u16,
    components: u16,
    resolutions: u8,
    precinct_count: &dyn Fn(u16, u8) -> u32,
) -> Vec<PacketCoord> {
    let max_precincts = (0..components)
        .flat_map(|c| (0..resolutions).map(move |r| precinct_count(c, r)))
        .max()
        .unwrap_or(0);
    let mut out = Vec::new();
    let mut push = |layer: u16, resolution: u8, component: u16, precinct: u32| {
        if precinct < precinct_count(component, resolution) {
            out.push(PacketCoord {
                layer,
                resolution,
                component,
                precinct,
            });
        }
    };

    match order {
        ProgressionOrder::Lrcp => {
            for l in 0..layers {
                for r in 0..resolutions {
                    for c in 0..components {
                        for p in 0..precinct_count(c, r) {
                            push(l, r, c, p);
                        }
                    }
                }
            }
        }
        ProgressionOrder::Rlcp => {
            for r in 0..resolutions {
                for l in 0..layers {
                    for c in 0..components {
                        for p in 0..precinct_count(c, r) {
                            push(l, r, c, p);
                        }
                    }
                }
            }
        }
        ProgressionOrder::Rpcl => {
            for r in 0..resolutions {
                for p in 0..max_precincts {
                    for c in 0..components {
                        for l in 0..layers {
                            push(l, r, c, p);
                        }
                    }
                }
            }
        }
        ProgressionOrder::Pcrl => {
            for p in 0..max_precincts {
                for c in 0..components {
                    for r in 0..resolutions {
                        for l in 0..layers {
                            push(l, r, c, p);
                        }
                    }
                }
            }
        }
        ProgressionOrder::Cprl => {
            for c in 0..components {
                for p in 0..max_precincts {
                    for r in 0..resolutions {
                        for l in 0..layers {
                            push(l, r, c, p);
                        }
                    }
                }
            }
        }
    }
    out
}
