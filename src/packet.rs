//! Tier-2 packet headers (ISO/IEC 15444-1 B.10).
//!
//! One packet carries, for a (layer, resolution, component, precinct)
//! tuple, the new coding passes of every code-block in the precinct. The
//! header codes inclusion through a per-band tag tree (first inclusion) or
//! a single bit (later layers), zero-bit-plane counts through a second tag
//! tree, a variable-length pass count, and one length field per new pass
//! segment under the adaptive Lblock scheme. Every pass is its own
//! terminated segment, so lengths are per pass.

use crate::bit_io::{BitReader, BitWriter};
use crate::error::{Error, Result};
use crate::tag_tree::{TagTreeDecoder, TagTreeEncoder};

const NEVER: u16 = u16::MAX;

/// Encoder-side persistent state for one (precinct, band).
pub struct BandEncState {
    incl: TagTreeEncoder,
    zbp: TagTreeEncoder,
    grid_w: u32,
    blocks: Vec<BlockEncState>,
}

struct BlockEncState {
    first_layer: u16,
    lblock: u8,
}

impl BandEncState {
    /// `zero_bit_planes` holds one value per block in raster order.
    pub fn new(grid_w: u32, grid_h: u32, zero_bit_planes: &[u32]) -> Self {
        let mut zbp = TagTreeEncoder::new(grid_w.max(1), grid_h.max(1));
        for y in 0..grid_h {
            for x in 0..grid_w {
                zbp.set_value(x, y, zero_bit_planes[(y * grid_w + x) as usize]);
            }
        }
        Self {
            incl: TagTreeEncoder::new(grid_w.max(1), grid_h.max(1)),
            zbp,
            grid_w,
            blocks: (0..grid_w * grid_h)
                .map(|_| BlockEncState {
                    first_layer: NEVER,
                    lblock: 3,
                })
                .collect(),
        }
    }
}

/// One block's contribution to the packet being written.
pub struct PacketBlockInput<'a> {
    /// New pass segments for this layer, in pass order.
    pub segments: &'a [Vec<u8>],
    /// Tagged HT (Part 15) when the codestream is in mixed mode.
    pub ht: bool,
}

/// Writes one packet header plus body. `inputs` parallels `bands`, one
/// entry per block in raster order.
pub fn write_packet(
    bands: &mut [BandEncState],
    inputs: &[Vec<PacketBlockInput<'_>>],
    layer: u16,
    mixed_mode: bool,
) -> Vec<u8> {
    let mut bw = BitWriter::new();
    let any = inputs
        .iter()
        .flatten()
        .any(|b| !b.segments.is_empty());
    if !any {
        bw.write_bit(0);
        return bw.finish();
    }
    bw.write_bit(1);

    let mut body: Vec<u8> = Vec::new();
    for (band, blocks_in) in bands.iter_mut().zip(inputs) {
        for (i, input) in blocks_in.iter().enumerate() {
            let gx = i as u32 % band.grid_w.max(1);
            let gy = i as u32 / band.grid_w.max(1);
            let contributes = !input.segments.is_empty();
            let state = &mut band.blocks[i];

            if state.first_layer == NEVER {
                if contributes {
                    state.first_layer = layer;
                    band.incl.set_value(gx, gy, layer as u32);
                }
                let included = band.incl.encode(&mut bw, gx, gy, layer as u32 + 1);
                debug_assert_eq!(included, contributes);
                if contributes {
                    band.zbp.encode_value(&mut bw, gx, gy);
                    if mixed_mode {
                        bw.write_bit(u8::from(input.ht));
                    }
                }
            } else {
                bw.write_bit(u8::from(contributes));
            }

            if contributes {
                write_pass_count(&mut bw, input.segments.len() as u32);
                let needed = input
                    .segments
                    .iter()
                    .map(|s| bit_len(s.len() as u32))
                    .max()
                    .unwrap_or(1);
                while state.lblock < needed {
                    bw.write_bit(1);
                    state.lblock += 1;
                }
                bw.write_bit(0);
                for seg in input.segments {
                    bw.write_bits(seg.len() as u32, state.lblock);
                    body.extend_from_slice(seg);
                }
            }
        }
    }

    let mut out = bw.finish();
    out.extend_from_slice(&body);
    out
}

fn bit_len(v: u32) -> u8 {
    (32 - v.leading_zeros()).max(1) as u8
}

/// Number-of-passes code (Table B-4).
fn write_pass_count(bw: &mut BitWriter, n: u32) {
    debug_assert!(n >= 1);
    match n {
        1 => bw.write_bit(0),
        2 => bw.write_bits(0b10, 2),
        3..=5 => {
            bw.write_bits(0b11, 2);
            bw.write_bits(n - 3, 2);
        }
        6..=36 => {
            bw.write_bits(0b1111, 4);
            bw.write_bits(n - 6, 5);
        }
        _ => {
            bw.write_bits(0b1_1111_1111, 9);
            bw.write_bits(n - 37, 7);
        }
    }
}

fn read_pass_count(br: &mut BitReader<'_>) -> Result<u32> {
    if br.read_bit()? == 0 {
        return Ok(1);
    }
    if br.read_bit()? == 0 {
        return Ok(2);
    }
    let v = br.read_bits(2)?;
    if v < 3 {
        return Ok(3 + v);
    }
    let v = br.read_bits(5)?;
    if v < 31 {
        return Ok(6 + v);
    }
    Ok(37 + br.read_bits(7)?)
}

/// Decoder-side persistent state for one (precinct, band).
pub struct BandDecState {
    incl: TagTreeDecoder,
    zbp: TagTreeDecoder,
    grid_w: u32,
    blocks: Vec<BlockDecState>,
}

struct BlockDecState {
    included: bool,
    lblock: u8,
}

impl BandDecState {
    pub fn new(grid_w: u32, grid_h: u32) -> Self {
        Self {
            incl: TagTreeDecoder::new(grid_w.max(1), grid_h.max(1)),
            zbp: TagTreeDecoder::new(grid_w.max(1), grid_h.max(1)),
            grid_w,
            blocks: (0..grid_w * grid_h)
                .map(|_| BlockDecState {
                    included: false,
                    lblock: 3,
                })
                .collect(),
        }
    }
}

/// One block's decoded contribution: which band/block it belongs to, the
/// first-inclusion side data, and its new segment lengths (body bytes
/// follow the header in this order).
#[derive(Debug, Clone)]
pub struct BlockContribution {
    pub band_index: usize,
    pub block_index: usize,
    pub first_inclusion: bool,
    pub zero_bit_planes: u32,
    pub ht: bool,
    pub segment_lengths: Vec<usize>,
}

/// Parses one packet header; returns the contributions and the number of
/// header bytes consumed.
pub fn read_packet(
    data: &[u8],
    bands: &mut [BandDecState],
    layer: u16,
    mixed_mode: bool,
    default_ht: bool,
) -> Result<(Vec<BlockContribution>, usize)> {
    let mut br = BitReader::new(data);
    let mut out = Vec::new();
    if br.read_bit()? == 0 {
        br.align_to_byte()?;
        return Ok((out, br.bytes_consumed()));
    }

    for (band_index, band) in bands.iter_mut().enumerate() {
        for i in 0..band.blocks.len() {
            let gx = i as u32 % band.grid_w.max(1);
            let gy = i as u32 / band.grid_w.max(1);

            let mut first_inclusion = false;
            let mut zero_bit_planes = 0;
            let mut ht = default_ht;
            let contributes = if !band.blocks[i].included {
                let inc = band.incl.decode(&mut br, gx, gy, layer as u32 + 1)?;
                if inc {
                    first_inclusion = true;
                    band.blocks[i].included = true;
                    zero_bit_planes = band.zbp.decode_value(&mut br, gx, gy)?;
                    if mixed_mode {
                        ht = br.read_bit()? == 1;
                    }
                }
                inc
            } else {
                br.read_bit()? == 1
            };

            if contributes {
                let n = read_pass_count(&mut br)?;
                let state = &mut band.blocks[i];
                while br.read_bit()? == 1 {
                    state.lblock = state
                        .lblock
                        .checked_add(1)
                        .ok_or(Error::MalformedBytestream("runaway Lblock"))?;
                    if state.lblock > 32 {
                        return Err(Error::MalformedBytestream("runaway Lblock"));
                    }
                }
                let mut segment_lengths = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    segment_lengths.push(br.read_bits(state.lblock)? as usize);
                }
                out.push(BlockContribution {
                    band_index,
                    block_index: i,
                    first_inclusion,
                    zero_bit_planes,
                    ht,
                    segment_lengths,
                });
            }
        }
    }
    br.align_to_byte()?;
    Ok((out, br.bytes_consumed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }

    #[test]
    fn pass_count_codes_roundtrip() {
        for n in [1u32, 2, 3, 4, 5, 6, 7, 36, 37, 100, 164] {
            let mut bw = BitWriter::new();
            write_pass_count(&mut bw, n);
            let bytes = bw.finish();
            let mut br = BitReader::new(&bytes);
            assert_eq!(read_pass_count(&mut br).unwrap(), n, "n = {n}");
        }
    }

    #[test]
    fn empty_packet_is_one_zero_bit() {
        let mut bands = vec![BandEncState::new(1, 1, &[0])];
        let inputs = vec![vec![PacketBlockInput {
            segments: &[],
            ht: false,
        }]];
        let bytes = write_packet(&mut bands, &inputs, 0, false);
        assert_eq!(bytes.len(), 1);

        let mut dec_bands = vec![BandDecState::new(1, 1)];
        let (contribs, used) = read_packet(&bytes, &mut dec_bands, 0, false, false).unwrap();
        assert!(contribs.is_empty());
        assert_eq!(used, 1);
    }

    #[test]
    fn single_block_two_layers_roundtrip() {
        let segs_l0 = [seg(&[1, 2, 3]), seg(&[4, 5])];
        let segs_l1 = [seg(&[6; 40])];

        let mut enc = vec![BandEncState::new(1, 1, &[2])];
        let p0 = write_packet(
            &mut enc,
            &[vec![PacketBlockInput {
                segments: &segs_l0,
                ht: false,
            }]],
            0,
            false,
        );
        let p1 = write_packet(
            &mut enc,
            &[vec![PacketBlockInput {
                segments: &segs_l1,
                ht: false,
            }]],
            1,
            false,
        );

        let mut dec = vec![BandDecState::new(1, 1)];
        let (c0, used0) = read_packet(&p0, &mut dec, 0, false, false).unwrap();
        assert_eq!(c0.len(), 1);
        assert!(c0[0].first_inclusion);
        assert_eq!(c0[0].zero_bit_planes, 2);
        assert_eq!(c0[0].segment_lengths, vec![3, 2]);
        assert_eq!(&p0[used0..used0 + 3], &[1, 2, 3]);
        assert_eq!(&p0[used0 + 3..], &[4, 5]);

        let (c1, _) = read_packet(&p1, &mut dec, 1, false, false).unwrap();
        assert!(!c1[0].first_inclusion);
        assert_eq!(c1[0].segment_lengths, vec![40]);
    }

    #[test]
    fn deferred_inclusion_and_skipped_layers() {
        // Block 0 joins at layer 0, block 1 only at layer 2.
        let s0 = [seg(&[0xAA])];
        let s1 = [seg(&[0xBB, 0xBC])];
        let empty: [Vec<u8>; 0] = [];

        let mut enc = vec![BandEncState::new(2, 1, &[1, 4])];
        let mut packets = Vec::new();
        for layer in 0..3u16 {
            let b0: &[Vec<u8>] = if layer == 0 { &s0 } else { &empty };
            let b1: &[Vec<u8>] = if layer == 2 { &s1 } else { &empty };
            packets.push(write_packet(
                &mut enc,
                &[vec![
                    PacketBlockInput { segments: b0, ht: false },
                    PacketBlockInput { segments: b1, ht: false },
                ]],
                layer,
                false,
            ));
        }

        let mut dec = vec![BandDecState::new(2, 1)];
        let (c0, _) = read_packet(&packets[0], &mut dec, 0, false, false).unwrap();
        assert_eq!(c0.len(), 1);
        assert_eq!(c0[0].block_index, 0);
        assert_eq!(c0[0].zero_bit_planes, 1);

        let (c1, _) = read_packet(&packets[1], &mut dec, 1, false, false).unwrap();
        assert!(c1.is_empty());

        let (c2, _) = read_packet(&packets[2], &mut dec, 2, false, false).unwrap();
        assert_eq!(c2.len(), 1);
        assert_eq!(c2[0].block_index, 1);
        assert!(c2[0].first_inclusion);
        assert_eq!(c2[0].zero_bit_planes, 4);
        assert_eq!(c2[0].segment_lengths, vec![2]);
    }

    #[test]
    fn mixed_mode_carries_ht_flag() {
        let s = [seg(&[1])];
        let mut enc = vec![BandEncState::new(1, 1, &[0])];
        let bytes = write_packet(
            &mut enc,
            &[vec![PacketBlockInput {
                segments: &s,
                ht: true,
            }]],
            0,
            true,
        );
        let mut dec = vec![BandDecState::new(1, 1)];
        let (c, _) = read_packet(&bytes, &mut dec, 0, true, false).unwrap();
        assert!(c[0].ht);
    }

    #[test]
    fn large_segment_grows_lblock() {
        let big = vec![0x42u8; 5000];
        let s = [big.clone()];
        let mut enc = vec![BandEncState::new(1, 1, &[0])];
        let bytes = write_packet(
            &mut enc,
            &[vec![PacketBlockInput {
                segments: &s,
                ht: false,
            }]],
            0,
            false,
        );
        let mut dec = vec![BandDecState::new(1, 1)];
        let (c, used) = read_packet(&bytes, &mut dec, 0, false, false).unwrap();
        assert_eq!(c[0].segment_lengths, vec![5000]);
        assert_eq!(bytes.len() - used, 5000);
    }
}
