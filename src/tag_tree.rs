//! Tag trees (ISO/IEC 15444-1 B.10.2).
//!
//! A tag tree is a quad tree over a grid of leaves where every interior
//! node holds the minimum of its children. Packet headers use them to code
//! "first inclusion layer" and "zero bit-plane count" incrementally: each
//! query against a threshold emits (or consumes) just the bits needed to
//! prove whether the leaf value is below the threshold, and state persists
//! across queries so later layers only pay for what is still unknown.

use crate::bit_io::{BitReader, BitWriter};
use crate::error::Result;

const UNKNOWN: u32 = u32::MAX;

#[derive(Clone)]
struct EncNode {
    value: u32,
    low: u32,
    known: bool,
}

/// Level dimensions from leaves (level 0) up to the 1x1 root.
fn level_dims(width: u32, height: u32) -> Vec<(u32, u32)> {
    let mut dims = vec![(width, height)];
    let (mut w, mut h) = (width, height);
    while w > 1 || h > 1 {
        w = w.div_ceil(2);
        h = h.div_ceil(2);
        dims.push((w, h));
    }
    dims
}

/// Encoder half of a tag tree. Leaf values are installed with
/// [`TagTreeEncoder::set_value`] before the first query.
pub struct TagTreeEncoder {
    dims: Vec<(u32, u32)>,
    levels: Vec<Vec<EncNode>>,
}

impl TagTreeEncoder {
    pub fn new(width: u32, height: u32) -> Self {
        let dims = level_dims(width, height);
        let levels = dims
            .iter()
            .map(|&(w, h)| {
                vec![
                    EncNode {
                        value: UNKNOWN,
                        low: 0,
                        known: false,
                    };
                    (w * h) as usize
                ]
            })
            .collect();
        Self { dims, levels }
    }

    /// Sets a leaf value and propagates the minimum towards the root.
    pub fn set_value(&mut self, x: u32, y: u32, value: u32) {
        for (lvl, &(w, _)) in self.dims.iter().enumerate() {
            let node = &mut self.levels[lvl][((y >> lvl) * w + (x >> lvl)) as usize];
            if node.value <= value {
                break;
            }
            node.value = value;
        }
    }

    /// Emits the bits proving whether `value(x, y) < threshold` and returns
    /// that predicate.
    pub fn encode(&mut self, bw: &mut BitWriter, x: u32, y: u32, threshold: u32) -> bool {
        let mut low = 0u32;
        for lvl in (0..self.dims.len()).rev() {
            let w = self.dims[lvl].0;
            let node = &mut self.levels[lvl][((y >> lvl) * w + (x >> lvl)) as usize];
            if low < node.low {
                low = node.low;
            } else {
                node.low = low;
            }
            while low < threshold {
                if low >= node.value {
                    if !node.known {
                        bw.write_bit(1);
                        node.known = true;
                    }
                    break;
                }
                bw.write_bit(0);
                low += 1;
            }
            node.low = low;
        }
        self.leaf_value(x, y) < threshold
    }

    fn leaf_value(&self, x: u32, y: u32) -> u32 {
        self.levels[0][(y * self.dims[0].0 + x) as usize].value
    }
}

#[derive(Clone)]
struct DecNode {
    value: u32,
    low: u32,
}

/// Decoder half of a tag tree; node values start unknown and are pinned
/// down as bits arrive.
pub struct TagTreeDecoder {
    dims: Vec<(u32, u32)>,
    levels: Vec<Vec<DecNode>>,
}

impl TagTreeDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        let dims = level_dims(width, height);
        let levels = dims
            .iter()
            .map(|&(w, h)| vec![DecNode { value: UNKNOWN, low: 0 }; (w * h) as usize])
            .collect();
        Self { dims, levels }
    }

    /// Consumes bits until `value(x, y) < threshold` is decided; returns
    /// the predicate.
    pub fn decode(&mut self, br: &mut BitReader<'_>, x: u32, y: u32, threshold: u32) -> Result<bool> {
        let mut low = 0u32;
        let mut leaf_value = UNKNOWN;
        for lvl in (0..self.dims.len()).rev() {
            let w = self.dims[lvl].0;
            let node = &mut self.levels[lvl][((y >> lvl) * w + (x >> lvl)) as usize];
            if low < node.low {
                low = node.low;
            } else {
                node.low = low;
            }
            while low < threshold && low < node.value {
                if br.read_bit()? == 1 {
                    node.value = low;
                } else {
                    low += 1;
                }
            }
            node.low = low;
            leaf_value = node.value;
        }
        Ok(leaf_value < threshold)
    }

    /// Fully resolves a leaf by raising the threshold until the value is
    /// pinned, then returns it. Used for zero-bit-plane counts.
    pub fn decode_value(&mut self, br: &mut BitReader<'_>, x: u32, y: u32) -> Result<u32> {
        let mut t = 1;
        while !self.decode(br, x, y, t)? {
            t += 1;
        }
        Ok(t - 1)
    }
}

impl TagTreeEncoder {
    /// Emits the bits that pin down the exact leaf value. Mirror of
    /// [`TagTreeDecoder::decode_value`].
    pub fn encode_value(&mut self, bw: &mut BitWriter, x: u32, y: u32) {
        let value = self.leaf_value(x, y);
        let mut t = 1;
        while !self.encode(bw, x, y, t) {
            t += 1;
            debug_assert!(t <= value + 1);
        }
    }
}
