//! Tier-1 High-Throughput (FBCOT) block coder, ISO/IEC 15444-15.
//!
//! The cleanup pass codes quad significance through MEL runs and VLC
//! patterns and the per-sample magnitudes/signs through MagSgn. For the
//! irreversible path the cleanup stops one plane short and raw-coded HT
//! significance-propagation and magnitude-refinement passes carry the
//! final plane, giving the rate controller three truncation points per
//! block. Every pass is an independent codeword segment, so any suffix of
//! a block's passes can be skipped without resynchronising a stream
//! machine.
//!
//! Within a cleanup segment the three sub-streams are stored
//! back-to-back, each preceded by a three-byte 7-bit length field (kept
//! below 0x80 so no marker prefix can appear at a sub-stream boundary).

pub mod mag_sgn;
pub mod mel;
pub mod vlc;

use crate::bit_io::{BitReader, BitWriter};
use crate::bit_plane_coder::{CodedBlock, CodedPass, DecodedBlock, PassKind};
use crate::error::{Error, Result};

use mag_sgn::{MagSgnDecoder, MagSgnEncoder};
use mel::{MelDecoder, MelEncoder};

/// Cleanup-pass plane: the reversible path codes every plane in the
/// cleanup; the irreversible path leaves the last plane to the HT
/// refinement passes when there is one to leave.
pub fn cup_plane(reversible: bool, num_planes: u8) -> u8 {
    if !reversible && num_planes >= 2 {
        1
    } else {
        0
    }
}

/// Number of passes an HT block codes: one cleanup, plus
/// significance-propagation and magnitude-refinement when the cleanup
/// stopped above plane zero.
pub fn total_passes_ht(reversible: bool, num_planes: u8) -> usize {
    if num_planes == 0 {
        0
    } else if cup_plane(reversible, num_planes) > 0 {
        3
    } else {
        1
    }
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    debug_assert!(len < 1 << 21);
    out.push(((len >> 14) & 0x7F) as u8);
    out.push(((len >> 7) & 0x7F) as u8);
    out.push((len & 0x7F) as u8);
}

fn read_len(data: &[u8], pos: &mut usize) -> Result<usize> {
    if *pos + 3 > data.len() {
        return Err(Error::MalformedBytestream("HT segment header truncated"));
    }
    let len = ((data[*pos] as usize) << 14) | ((data[*pos + 1] as usize) << 7) | data[*pos + 2] as usize;
    *pos += 3;
    Ok(len)
}

#[inline]
fn quad_samples(qx: u32, qy: u32, w: u32, h: u32) -> [Option<usize>; 4] {
    let mut out = [None; 4];
    for (i, (dx, dy)) in [(0u32, 0u32), (1, 0), (0, 1), (1, 1)].iter().enumerate() {
        let x = qx * 2 + dx;
        let y = qy * 2 + dy;
        if x < w && y < h {
            out[i] = Some((y * w + x) as usize);
        }
    }
    out
}

/// Significance context of a quad from already-coded neighbour quads:
/// left, above, above-left and above-right.
fn quad_context(quad_sig: &[bool], qx: u32, qy: u32, qw: u32) -> u8 {
    let at = |x: i64, y: i64| -> bool {
        if x < 0 || y < 0 || x >= qw as i64 {
            return false;
        }
        quad_sig
            .get((y * qw as i64 + x) as usize)
            .copied()
            .unwrap_or(false)
    };
    let (x, y) = (qx as i64, qy as i64);
    u8::from(at(x - 1, y) || at(x, y - 1) || at(x - 1, y - 1) || at(x + 1, y - 1))
}

#[inline]
fn update_distortion(target: f64, old: f64, new: f64, distortion: &mut f64) {
    *distortion += (target - new) * (target - new) - (target - old) * (target - old);
}

/// Encodes one code-block with the HT coder.
pub fn encode_block(
    data: &[i32],
    width: u32,
    height: u32,
    reversible: bool,
) -> Result<CodedBlock> {
    if data.len() != (width * height) as usize {
        return Err(Error::Internal("ht_block_coder: block size mismatch"));
    }

    let mut max_mag = 0u32;
    let mut initial_distortion = 0.0f64;
    for &v in data {
        let m = v.unsigned_abs();
        max_mag = max_mag.max(m);
        initial_distortion += (m as f64) * (m as f64);
    }
    let num_planes = (32 - max_mag.leading_zeros()) as u8;
    if num_planes == 0 {
        return Ok(CodedBlock {
            passes: Vec::new(),
            num_planes: 0,
            initial_distortion,
        });
    }

    let p = cup_plane(reversible, num_planes);
    let (qw, qh) = (width.div_ceil(2), height.div_ceil(2));
    let mut quad_sig = vec![false; (qw * qh) as usize];
    // Reconstruction as the decoder will see it, for the distortion curve.
    let mut recon = vec![0u32; data.len()];
    let mut distortion = initial_distortion;

    let mut mel_enc = MelEncoder::new();
    let mut vlc_bw = BitWriter::new();
    let mut ms_enc = MagSgnEncoder::new();

    for qy in 0..qh {
        for qx in 0..qw {
            let samples = quad_samples(qx, qy, width, height);
            let mut rho = 0u8;
            for (i, idx) in samples.iter().enumerate() {
                if let Some(idx) = idx {
                    if data[*idx].unsigned_abs() >> p != 0 {
                        rho |= 1 << i;
                    }
                }
            }
            let context = quad_context(&quad_sig, qx, qy, qw);
            mel_enc.encode(rho != 0);
            if rho != 0 {
                quad_sig[(qy * qw + qx) as usize] = true;
                vlc::encode_rho(&mut vlc_bw, context, rho);
                for (i, idx) in samples.iter().enumerate() {
                    if rho & (1 << i) != 0 {
                        let idx = idx.ok_or(Error::Internal("ht: rho bit outside block"))?;
                        let m = data[idx].unsigned_abs() >> p;
                        ms_enc.encode(m, data[idx] < 0);
                        let new = (m << p) as f64;
                        update_distortion(
                            data[idx].unsigned_abs() as f64,
                            recon[idx] as f64,
                            new,
                            &mut distortion,
                        );
                        recon[idx] = m << p;
                    }
                }
            }
        }
    }

    let mel_bytes = mel_enc.finish();
    let vlc_bytes = vlc_bw.finish();
    let ms_bytes = ms_enc.finish();
    let mut cup = Vec::with_capacity(mel_bytes.len() + vlc_bytes.len() + ms_bytes.len() + 6);
    write_len(&mut cup, mel_bytes.len());
    cup.extend_from_slice(&mel_bytes);
    write_len(&mut cup, vlc_bytes.len());
    cup.extend_from_slice(&vlc_bytes);
    cup.extend_from_slice(&ms_bytes);

    let mut passes = vec![CodedPass {
        kind: PassKind::Cleanup,
        data: cup,
        distortion_after: distortion,
    }];

    if p > 0 {
        // HT significance propagation at the final plane: raw bits for
        // insignificant samples with a significant neighbour; immediate
        // state updates.
        let mut sig: Vec<bool> = recon.iter().map(|&m| m != 0).collect();
        let cup_sig = sig.clone();
        let mut spp = BitWriter::new();
        let neighbor_sig = |sig: &[bool], x: i64, y: i64| -> bool {
            for (dx, dy) in [
                (-1i64, -1i64),
                (0, -1),
                (1, -1),
                (-1, 0),
                (1, 0),
                (-1, 1),
                (0, 1),
                (1, 1),
            ] {
                let (nx, ny) = (x + dx, y + dy);
                if nx >= 0
                    && ny >= 0
                    && nx < width as i64
                    && ny < height as i64
                    && sig[(ny * width as i64 + nx) as usize]
                {
                    return true;
                }
            }
            false
        };
        for y in 0..height as i64 {
            for x in 0..width as i64 {
                let idx = (y * width as i64 + x) as usize;
                if sig[idx] || !neighbor_sig(&sig, x, y) {
                    continue;
                }
                let bit = (data[idx].unsigned_abs() & 1) as u8;
                spp.write_bit(bit);
                if bit == 1 {
                    spp.write_bit(u8::from(data[idx] < 0));
                    sig[idx] = true;
                    update_distortion(
                        data[idx].unsigned_abs() as f64,
                        recon[idx] as f64,
                        1.0,
                        &mut distortion,
                    );
                    recon[idx] = 1;
                }
            }
        }
        passes.push(CodedPass {
            kind: PassKind::SigProp,
            data: spp.finish(),
            distortion_after: distortion,
        });

        // HT magnitude refinement: the final-plane bit of every sample the
        // cleanup already made significant.
        let mut mrp = BitWriter::new();
        for idx in 0..data.len() {
            if cup_sig[idx] {
                let bit = (data[idx].unsigned_abs() & 1) as u8;
                mrp.write_bit(bit);
                if bit == 1 {
                    update_distortion(
                        data[idx].unsigned_abs() as f64,
                        recon[idx] as f64,
                        (recon[idx] | 1) as f64,
                        &mut distortion,
                    );
                    recon[idx] |= 1;
                }
            }
        }
        passes.push(CodedPass {
            kind: PassKind::MagRef,
            data: mrp.finish(),
            distortion_after: distortion,
        });
    }

    Ok(CodedBlock {
        passes,
        num_planes,
        initial_distortion,
    })
}

/// Decodes HT pass segments for a block with `num_planes` magnitude
/// planes. Pass roles are fixed by `(reversible, num_planes)`; truncation
/// simply drops refinement detail.
pub fn decode_block(
    segments: &[Vec<u8>],
    width: u32,
    height: u32,
    num_planes: u8,
    reversible: bool,
) -> Result<DecodedBlock> {
    let size = (width * height) as usize;
    if num_planes == 0 || segments.is_empty() {
        return Ok(DecodedBlock {
            coefficients: vec![0; size],
            lowest_plane: 0,
        });
    }
    let p = cup_plane(reversible, num_planes);
    if segments.len() > total_passes_ht(reversible, num_planes) {
        return Err(Error::MalformedBytestream("more HT passes than the block can carry"));
    }

    let cup = &segments[0];
    let mut pos = 0usize;
    let mel_len = read_len(cup, &mut pos)?;
    if pos + mel_len > cup.len() {
        return Err(Error::MalformedBytestream("HT MEL sub-stream overruns segment"));
    }
    let mel_bytes = &cup[pos..pos + mel_len];
    pos += mel_len;
    let vlc_len = read_len(cup, &mut pos)?;
    if pos + vlc_len > cup.len() {
        return Err(Error::MalformedBytestream("HT VLC sub-stream overruns segment"));
    }
    let vlc_bytes = &cup[pos..pos + vlc_len];
    pos += vlc_len;
    let ms_bytes = &cup[pos..];

    let mut mel_dec = MelDecoder::new(mel_bytes);
    let mut vlc_br = BitReader::new(vlc_bytes);
    let mut ms_dec = MagSgnDecoder::new(ms_bytes);

    let (qw, qh) = (width.div_ceil(2), height.div_ceil(2));
    let mut quad_sig = vec![false; (qw * qh) as usize];
    let mut mags = vec![0u32; size];
    let mut neg = vec![false; size];

    for qy in 0..qh {
        for qx in 0..qw {
            let samples = quad_samples(qx, qy, width, height);
            let context = quad_context(&quad_sig, qx, qy, qw);
            if !mel_dec.decode() {
                continue;
            }
            quad_sig[(qy * qw + qx) as usize] = true;
            let rho = vlc::decode_rho(&mut vlc_br, context);
            for (i, idx) in samples.iter().enumerate() {
                if rho & (1 << i) != 0 {
                    let Some(idx) = idx else {
                        // Pattern points outside the block: corrupted VLC.
                        continue;
                    };
                    let (m, negative) = ms_dec.decode();
                    mags[*idx] = m << p;
                    neg[*idx] = negative;
                }
            }
        }
    }

    let mut lowest_plane = p;
    if p > 0 && segments.len() >= 2 {
        let mut sig: Vec<bool> = mags.iter().map(|&m| m != 0).collect();
        let mut spp = BitReader::new(&segments[1]);
        let neighbor_sig = |sig: &[bool], x: i64, y: i64| -> bool {
            for (dx, dy) in [
                (-1i64, -1i64),
                (0, -1),
                (1, -1),
                (-1, 0),
                (1, 0),
                (-1, 1),
                (0, 1),
                (1, 1),
            ] {
                let (nx, ny) = (x + dx, y + dy);
                if nx >= 0
                    && ny >= 0
                    && nx < width as i64
                    && ny < height as i64
                    && sig[(ny * width as i64 + nx) as usize]
                {
                    return true;
                }
            }
            false
        };
        // The CUP magnitudes keep their parity for the refinement pass
        // below; SPP only creates magnitude-one samples.
        let cup_sig = sig.clone();
        for y in 0..height as i64 {
            for x in 0..width as i64 {
                let idx = (y * width as i64 + x) as usize;
                if sig[idx] || !neighbor_sig(&sig, x, y) {
                    continue;
                }
                if spp.read_bit().unwrap_or(0) == 1 {
                    neg[idx] = spp.read_bit().unwrap_or(0) == 1;
                    mags[idx] = 1;
                    sig[idx] = true;
                }
            }
        }

        if segments.len() >= 3 {
            let mut mrp = BitReader::new(&segments[2]);
            for idx in 0..size {
                if cup_sig[idx] && mrp.read_bit().unwrap_or(0) == 1 {
                    mags[idx] |= 1;
                }
            }
            lowest_plane = 0;
        }
    }

    let coefficients = mags
        .iter()
        .zip(&neg)
        .map(|(&m, &n)| if n { -(m as i32) } else { m as i32 })
        .collect();
    Ok(DecodedBlock {
        coefficients,
        lowest_plane,
    })
}
