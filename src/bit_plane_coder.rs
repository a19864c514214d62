//! Tier-1 legacy (EBCOT) block coder.
//!
//! Codes one bit-plane at a time, most significant first, with three
//! passes per plane: significance propagation, magnitude refinement and
//! cleanup. Samples are visited in stripe-column order (stripes of four
//! rows, columns left to right, top to bottom inside a column).
//!
//! Every coding pass is terminated into its own codeword segment, so any
//! pass boundary is a valid truncation point and the packet header carries
//! one length per pass. MQ probability contexts persist across segments
//! unless the reset-on-pass style is selected.
//!
//! Cleanup state timing: all significance decisions of one stripe-column
//! are buffered and applied only after the whole column has been coded, so
//! the four samples (and both coder directions) share one view of the
//! neighbourhood. The other two passes update state immediately.

use crate::bit_io::{BitReader, BitWriter};
use crate::error::{Error, Result};
use crate::mq_coder::{MqContexts, MqDecoder, MqEncoder};

/// Number of Tier-1 MQ contexts: ZC 0..=8, SC 9..=13, MR 14..=16,
/// RUN 17, UNIFORM 18.
const NUM_CONTEXTS: usize = 19;
const CTX_RUN: usize = 17;
const CTX_UNI: usize = 18;

const SIG: u8 = 1 << 0;
const VISITED: u8 = 1 << 1;
const REFINED: u8 = 1 << 2;
const NEG: u8 = 1 << 3;

/// Subband orientation, which selects the zero-coding context mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubbandKind {
    #[default]
    LL,
    HL,
    LH,
    HH,
}

/// Code-block style flags from COD/COC. Termination on every pass is
/// implied and always signalled alongside these.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodingStyle {
    pub bypass: bool,
    pub reset_context: bool,
    pub vertically_causal: bool,
    pub predictable_termination: bool,
    pub segmentation_symbols: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    SigProp,
    MagRef,
    Cleanup,
}

/// One terminated coding pass: its codeword segment plus the cumulative
/// squared-error distortion remaining after the pass (used by PCRD).
#[derive(Debug, Clone)]
pub struct CodedPass {
    pub kind: PassKind,
    pub data: Vec<u8>,
    pub distortion_after: f64,
}

/// Tier-1 output for one code-block.
#[derive(Debug, Clone, Default)]
pub struct CodedBlock {
    pub passes: Vec<CodedPass>,
    /// Number of coded magnitude bit-planes (0 for an all-zero block).
    pub num_planes: u8,
    /// Distortion with no pass decoded.
    pub initial_distortion: f64,
}

/// Pass sequence for a block with `num_planes` magnitude planes: one
/// cleanup for the top plane, then SP/MR/CL triplets downward.
pub fn total_passes(num_planes: u8) -> usize {
    if num_planes == 0 {
        0
    } else {
        3 * num_planes as usize - 2
    }
}

/// Maps a pass index to its kind and bit-plane.
pub fn pass_info(index: usize, num_planes: u8) -> (PassKind, u8) {
    if index == 0 {
        return (PassKind::Cleanup, num_planes - 1);
    }
    let j = index - 1;
    let plane = num_planes - 2 - (j / 3) as u8;
    let kind = match j % 3 {
        0 => PassKind::SigProp,
        1 => PassKind::MagRef,
        _ => PassKind::Cleanup,
    };
    (kind, plane)
}

/// Whether a pass is raw-coded under the selective-bypass style: SP and MR
/// passes once four bit-planes have been coded arithmetically.
fn pass_is_raw(style: &CodingStyle, kind: PassKind, plane_from_top: u8) -> bool {
    style.bypass && kind != PassKind::Cleanup && plane_from_top >= 4
}

fn t1_contexts() -> MqContexts {
    let mut cx = MqContexts::new(NUM_CONTEXTS);
    reset_contexts(&mut cx);
    cx
}

fn reset_contexts(cx: &mut MqContexts) {
    cx.reset_all();
    cx.set(0, 4, 0);
    cx.set(CTX_RUN, 3, 0);
    cx.set(CTX_UNI, 46, 0);
}

/// Shared per-sample flag grid and context formation. Both coder
/// directions use this single implementation, which is what keeps their
/// neighbourhood views identical.
struct BlockState {
    w: i32,
    h: i32,
    flags: Vec<u8>,
    vertically_causal: bool,
}

impl BlockState {
    fn new(width: u32, height: u32, vertically_causal: bool) -> Self {
        Self {
            w: width as i32,
            h: height as i32,
            flags: vec![0; (width * height) as usize],
            vertically_causal,
        }
    }

    #[inline]
    fn idx(&self, x: i32, y: i32) -> usize {
        (y * self.w + x) as usize
    }

    #[inline]
    fn flag_at(&self, x: i32, y: i32) -> u8 {
        // Out-of-block neighbours are insignificant; under the vertically
        // causal style so is anything below the current stripe.
        if x < 0 || y < 0 || x >= self.w || y >= self.h {
            return 0;
        }
        self.flags[self.idx(x, y)]
    }

    #[inline]
    fn sig_at(&self, x: i32, y: i32, stripe_end: i32) -> bool {
        if self.vertically_causal && y >= stripe_end {
            return false;
        }
        self.flag_at(x, y) & SIG != 0
    }

    /// Counts of significant (horizontal, vertical, diagonal) neighbours.
    fn neighbor_counts(&self, x: i32, y: i32, stripe_end: i32) -> (u8, u8, u8) {
        let h = self.sig_at(x - 1, y, stripe_end) as u8 + self.sig_at(x + 1, y, stripe_end) as u8;
        let v = self.sig_at(x, y - 1, stripe_end) as u8 + self.sig_at(x, y + 1, stripe_end) as u8;
        let d = self.sig_at(x - 1, y - 1, stripe_end) as u8
            + self.sig_at(x + 1, y - 1, stripe_end) as u8
            + self.sig_at(x - 1, y + 1, stripe_end) as u8
            + self.sig_at(x + 1, y + 1, stripe_end) as u8;
        (h, v, d)
    }

    /// Zero-coding context (Table D-1).
    fn zc_context(&self, band: SubbandKind, x: i32, y: i32, stripe_end: i32) -> usize {
        let (mut h, mut v, d) = self.neighbor_counts(x, y, stripe_end);
        if band == SubbandKind::HL {
            std::mem::swap(&mut h, &mut v);
        }
        match band {
            SubbandKind::LL | SubbandKind::LH | SubbandKind::HL => match (h, v, d) {
                (2, _, _) => 8,
                (1, v, _) if v >= 1 => 7,
                (1, 0, d) if d >= 1 => 6,
                (1, 0, 0) => 5,
                (0, 2, _) => 4,
                (0, 1, _) => 3,
                (0, 0, d) if d >= 2 => 2,
                (0, 0, 1) => 1,
                _ => 0,
            },
            SubbandKind::HH => {
                let hv = h + v;
                match (d, hv) {
                    (d, _) if d >= 3 => 8,
                    (2, hv) if hv >= 1 => 7,
                    (2, 0) => 6,
                    (1, hv) if hv >= 2 => 5,
                    (1, 1) => 4,
                    (1, 0) => 3,
                    (0, hv) if hv >= 2 => 2,
                    (0, 1) => 1,
                    _ => 0,
                }
            }
        }
    }

    /// Sign-coding context and XOR flip bit (Table D-3).
    fn sc_context(&self, x: i32, y: i32, stripe_end: i32) -> (usize, u8) {
        let contrib = |cx: i32, cy: i32| -> i32 {
            if self.vertically_causal && cy >= stripe_end {
                return 0;
            }
            let f = self.flag_at(cx, cy);
            if f & SIG == 0 {
                0
            } else if f & NEG != 0 {
                -1
            } else {
                1
            }
        };
        let hc = (contrib(x - 1, y) + contrib(x + 1, y)).clamp(-1, 1);
        let vc = (contrib(x, y - 1) + contrib(x, y + 1)).clamp(-1, 1);
        match (hc, vc) {
            (1, 1) => (13, 0),
            (1, 0) => (12, 0),
            (1, -1) => (11, 0),
            (0, 1) => (10, 0),
            (0, 0) => (9, 0),
            (0, -1) => (10, 1),
            (-1, 1) => (11, 1),
            (-1, 0) => (12, 1),
            _ => (13, 1),
        }
    }

    /// Magnitude-refinement context (Table D-2).
    fn mr_context(&self, x: i32, y: i32, stripe_end: i32) -> usize {
        if self.flags[self.idx(x, y)] & REFINED != 0 {
            16
        } else {
            let (h, v, d) = self.neighbor_counts(x, y, stripe_end);
            if h + v + d > 0 {
                15
            } else {
                14
            }
        }
    }
}

/// Sink side of a single coding pass: MQ or raw.
enum PassSink {
    Mq(MqEncoder),
    Raw(BitWriter),
}

impl PassSink {
    fn put(&mut self, contexts: &mut MqContexts, cx: usize, bit: u8) {
        match self {
            PassSink::Mq(enc) => enc.encode(contexts, cx, bit),
            PassSink::Raw(bw) => bw.write_bit(bit),
        }
    }

    fn finish(self, predictable: bool) -> Vec<u8> {
        match self {
            PassSink::Mq(enc) => enc.terminate(predictable),
            PassSink::Raw(bw) => bw.finish(),
        }
    }
}

/// Source side of a single coding pass.
enum PassSource<'a> {
    Mq(MqDecoder<'a>),
    Raw(BitReader<'a>),
}

impl<'a> PassSource<'a> {
    fn get(&mut self, contexts: &mut MqContexts, cx: usize) -> Result<u8> {
        match self {
            PassSource::Mq(dec) => Ok(dec.decode(contexts, cx)),
            // A truncated raw segment decodes as zero bits; corruption is
            // caught at higher layers, matching the MQ behaviour.
            PassSource::Raw(br) => Ok(br.read_bit().unwrap_or(0)),
        }
    }
}

/// Encodes one code-block of quantizer indices.
pub fn encode_block(
    data: &[i32],
    width: u32,
    height: u32,
    band: SubbandKind,
    style: &CodingStyle,
) -> Result<CodedBlock> {
    if data.len() != (width * height) as usize {
        return Err(Error::Internal("bit_plane_coder: block size mismatch"));
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

    let mut state = BlockState::new(width, height, style.vertically_causal);
    let mut contexts = t1_contexts();
    // Running reconstruction magnitudes for the distortion curve.
    let mut recon = vec![0u32; data.len()];
    let mut distortion = initial_distortion;
    let mut passes = Vec::with_capacity(total_passes(num_planes));

    for pass_idx in 0..total_passes(num_planes) {
        let (kind, plane) = pass_info(pass_idx, num_planes);
        let plane_from_top = num_planes - 1 - plane;
        let raw = pass_is_raw(style, kind, plane_from_top);
        if style.reset_context {
            reset_contexts(&mut contexts);
        }
        let mut sink = if raw {
            PassSink::Raw(BitWriter::new())
        } else {
            PassSink::Mq(MqEncoder::new())
        };

        match kind {
            PassKind::SigProp => encode_sig_prop(
                data, &mut state, &mut contexts, &mut sink, band, plane, &mut recon,
                &mut distortion,
            ),
            PassKind::MagRef => encode_mag_ref(
                data, &mut state, &mut contexts, &mut sink, plane, &mut recon, &mut distortion,
            ),
            PassKind::Cleanup => {
                encode_cleanup(
                    data, &mut state, &mut contexts, &mut sink, band, plane, &mut recon,
                    &mut distortion,
                );
                if style.segmentation_symbols {
                    for &bit in &[1, 0, 1, 0] {
                        sink.put(&mut contexts, CTX_UNI, bit);
                    }
                }
                // The visited flags only scope one bit-plane.
                for f in state.flags.iter_mut() {
                    *f &= !VISITED;
                }
            }
        }

        passes.push(CodedPass {
            kind,
            data: sink.finish(style.predictable_termination),
            distortion_after: distortion,
        });
    }

    Ok(CodedBlock {
        passes,
        num_planes,
        initial_distortion,
    })
}

#[allow(clippy::too_many_arguments)]
fn encode_sig_prop(
    data: &[i32],
    state: &mut BlockState,
    contexts: &mut MqContexts,
    sink: &mut PassSink,
    band: SubbandKind,
    plane: u8,
    recon: &mut [u32],
    distortion: &mut f64,
) {
    let (w, h) = (state.w, state.h);
    for stripe in (0..h).step_by(4) {
        let stripe_end = (stripe + 4).min(h);
        for x in 0..w {
            for y in stripe..stripe_end {
                let idx = state.idx(x, y);
                if state.flags[idx] & (SIG | VISITED) != 0 {
                    continue;
                }
                let (hc, vc, dc) = state.neighbor_counts(x, y, stripe_end);
                if hc + vc + dc == 0 {
                    continue;
                }
                let v = data[idx];
                let bit = ((v.unsigned_abs() >> plane) & 1) as u8;
                let cx = state.zc_context(band, x, y, stripe_end);
                sink.put(contexts, cx, bit);
                state.flags[idx] |= VISITED;
                if bit == 1 {
                    let sign = u8::from(v < 0);
                    let (sc, flip) = state.sc_context(x, y, stripe_end);
                    sink.put(contexts, sc, sign ^ flip);
                    state.flags[idx] |= SIG | if sign == 1 { NEG } else { 0 };
                    update_recon(idx, 1 << plane, data, recon, distortion);
                }
            }
        }
    }
}

fn encode_mag_ref(
    data: &[i32],
    state: &mut BlockState,
    contexts: &mut MqContexts,
    sink: &mut PassSink,
    plane: u8,
    recon: &mut [u32],
    distortion: &mut f64,
) {
    let (w, h) = (state.w, state.h);
    for stripe in (0..h).step_by(4) {
        let stripe_end = (stripe + 4).min(h);
        for x in 0..w {
            for y in stripe..stripe_end {
                let idx = state.idx(x, y);
                if state.flags[idx] & SIG == 0 || state.flags[idx] & VISITED != 0 {
                    continue;
                }
                let bit = ((data[idx].unsigned_abs() >> plane) & 1) as u8;
                let cx = state.mr_context(x, y, stripe_end);
                sink.put(contexts, cx, bit);
                state.flags[idx] |= VISITED | REFINED;
                if bit == 1 {
                    update_recon(idx, recon[idx] | (1 << plane), data, recon, distortion);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_cleanup(
    data: &[i32],
    state: &mut BlockState,
    contexts: &mut MqContexts,
    sink: &mut PassSink,
    band: SubbandKind,
    plane: u8,
    recon: &mut [u32],
    distortion: &mut f64,
) {
    let (w, h) = (state.w, state.h);
    for stripe in (0..h).step_by(4) {
        let stripe_end = (stripe + 4).min(h);
        let full = stripe_end - stripe == 4;
        for x in 0..w {
            // Deferred updates: decisions for this stripe-column are
            // buffered here and applied only after the column completes.
            let mut decided: [(usize, u8); 4] = [(0, 0); 4];
            let mut decided_len = 0;

            let mut start = stripe;
            // Run-length mode: a full column of unvisited, insignificant
            // samples with an entirely insignificant neighbourhood.
            if full {
                let eligible = (stripe..stripe_end).all(|y| {
                    let idx = state.idx(x, y);
                    state.flags[idx] & (SIG | VISITED) == 0 && {
                        let (hc, vc, dc) = state.neighbor_counts(x, y, stripe_end);
                        hc + vc + dc == 0
                    }
                });
                if eligible {
                    let mut first = None;
                    for y in stripe..stripe_end {
                        if (data[state.idx(x, y)].unsigned_abs() >> plane) & 1 == 1 {
                            first = Some(y - stripe);
                            break;
                        }
                    }
                    match first {
                        None => {
                            sink.put(contexts, CTX_RUN, 0);
                            continue;
                        }
                        Some(r) => {
                            sink.put(contexts, CTX_RUN, 1);
                            sink.put(contexts, CTX_UNI, ((r >> 1) & 1) as u8);
                            sink.put(contexts, CTX_UNI, (r & 1) as u8);
                            // The first significant sample's bit is implied;
                            // code its sign, then resume normal coding below.
                            let y = stripe + r;
                            let idx = state.idx(x, y);
                            let sign = u8::from(data[idx] < 0);
                            let (sc, flip) = state.sc_context(x, y, stripe_end);
                            sink.put(contexts, sc, sign ^ flip);
                            decided[decided_len] = (idx, SIG | if sign == 1 { NEG } else { 0 });
                            decided_len += 1;
                            update_recon(idx, 1 << plane, data, recon, distortion);
                            start = y + 1;
                        }
                    }
                }
            }

            for y in start..stripe_end {
                let idx = state.idx(x, y);
                if state.flags[idx] & VISITED != 0 {
                    continue;
                }
                if state.flags[idx] & SIG != 0 {
                    continue;
                }
                let v = data[idx];
                let bit = ((v.unsigned_abs() >> plane) & 1) as u8;
                let cx = state.zc_context(band, x, y, stripe_end);
                sink.put(contexts, cx, bit);
                if bit == 1 {
                    let sign = u8::from(v < 0);
                    let (sc, flip) = state.sc_context(x, y, stripe_end);
                    sink.put(contexts, sc, sign ^ flip);
                    decided[decided_len] = (idx, SIG | if sign == 1 { NEG } else { 0 });
                    decided_len += 1;
                    update_recon(idx, 1 << plane, data, recon, distortion);
                }
            }

            for &(idx, f) in &decided[..decided_len] {
                state.flags[idx] |= f;
            }
        }
    }
}

#[inline]
fn update_recon(idx: usize, new_mag: u32, data: &[i32], recon: &mut [u32], distortion: &mut f64) {
    let target = data[idx].unsigned_abs() as f64;
    let old = recon[idx] as f64;
    let new = new_mag as f64;
    *distortion += (target - new) * (target - new) - (target - old) * (target - old);
    recon[idx] = new_mag;
}

/// Decoded block output: coefficients plus the lowest fully decoded plane
/// (nonzero when the pass list was truncated), which the dequantizer uses
/// for bin-centre reconstruction.
pub struct DecodedBlock {
    pub coefficients: Vec<i32>,
    pub lowest_plane: u8,
}

/// Decodes `segments` (one per coding pass, in pass order) for a block
/// with `num_planes` magnitude planes.
pub fn decode_block(
    segments: &[Vec<u8>],
    width: u32,
    height: u32,
    num_planes: u8,
    band: SubbandKind,
    style: &CodingStyle,
) -> Result<DecodedBlock> {
    let size = (width * height) as usize;
    let mut coeffs = vec![0i32; size];
    if num_planes == 0 || segments.is_empty() {
        return Ok(DecodedBlock {
            coefficients: coeffs,
            lowest_plane: 0,
        });
    }
    if segments.len() > total_passes(num_planes) {
        return Err(Error::MalformedBytestream("more coding passes than bit-planes allow"));
    }

    let mut state = BlockState::new(width, height, style.vertically_causal);
    let mut contexts = t1_contexts();
    let mut mags = vec![0u32; size];
    let mut lowest_plane = num_planes - 1;

    for (pass_idx, segment) in segments.iter().enumerate() {
        let (kind, plane) = pass_info(pass_idx, num_planes);
        let plane_from_top = num_planes - 1 - plane;
        let raw = pass_is_raw(style, kind, plane_from_top);
        if style.reset_context {
            reset_contexts(&mut contexts);
        }
        let mut source = if raw {
            PassSource::Raw(BitReader::new(segment))
        } else {
            PassSource::Mq(MqDecoder::new(segment))
        };

        match kind {
            PassKind::SigProp => decode_sig_prop(
                &mut state, &mut contexts, &mut source, band, plane, &mut mags,
            )?,
            PassKind::MagRef => {
                decode_mag_ref(&mut state, &mut contexts, &mut source, plane, &mut mags)?
            }
            PassKind::Cleanup => {
                decode_cleanup(&mut state, &mut contexts, &mut source, band, plane, &mut mags)?;
                if style.segmentation_symbols {
                    let mut sym = 0u8;
                    for _ in 0..4 {
                        sym = (sym << 1) | source.get(&mut contexts, CTX_UNI)?;
                    }
                    if sym != 0b1010 {
                        return Err(Error::MalformedBytestream("segmentation symbol mismatch"));
                    }
                }
                for f in state.flags.iter_mut() {
                    *f &= !VISITED;
                }
            }
        }
        lowest_plane = plane;
    }

    for i in 0..size {
        let neg = state.flags[i] & NEG != 0;
        let m = mags[i] as i32;
        coeffs[i] = if neg { -m } else { m };
    }
    Ok(DecodedBlock {
        coefficients: coeffs,
        lowest_plane,
    })
}

fn decode_sig_prop(
    state: &mut BlockState,
    contexts: &mut MqContexts,
    source: &mut PassSource<'_>,
    band: SubbandKind,
    plane: u8,
    mags: &mut [u32],
) -> Result<()> {
    let (w, h) = (state.w, state.h);
    for stripe in (0..h).step_by(4) {
        let stripe_end = (stripe + 4).min(h);
        for x in 0..w {
            for y in stripe..stripe_end {
                let idx = state.idx(x, y);
                if state.flags[idx] & (SIG | VISITED) != 0 {
                    continue;
                }
                let (hc, vc, dc) = state.neighbor_counts(x, y, stripe_end);
                if hc + vc + dc == 0 {
                    continue;
                }
                let cx = state.zc_context(band, x, y, stripe_end);
                let bit = source.get(contexts, cx)?;
                state.flags[idx] |= VISITED;
                if bit == 1 {
                    let (sc, flip) = state.sc_context(x, y, stripe_end);
                    let sign = source.get(contexts, sc)? ^ flip;
                    state.flags[idx] |= SIG | if sign == 1 { NEG } else { 0 };
                    mags[idx] = 1 << plane;
                }
            }
        }
    }
    Ok(())
}

fn decode_mag_ref(
    state: &mut BlockState,
    contexts: &mut MqContexts,
    source: &mut PassSource<'_>,
    plane: u8,
    mags: &mut [u32],
) -> Result<()> {
    let (w, h) = (state.w, state.h);
    for stripe in (0..h).step_by(4) {
        let stripe_end = (stripe + 4).min(h);
        for x in 0..w {
            for y in stripe..stripe_end {
                let idx = state.idx(x, y);
                if state.flags[idx] & SIG == 0 || state.flags[idx] & VISITED != 0 {
                    continue;
                }
                let cx = state.mr_context(x, y, stripe_end);
                let bit = source.get(contexts, cx)?;
                state.flags[idx] |= VISITED | REFINED;
                if bit == 1 {
                    mags[idx] |= 1 << plane;
                }
            }
        }
    }
    Ok(())
}

fn decode_cleanup(
    state: &mut BlockState,
    contexts: &mut MqContexts,
    source: &mut PassSource<'_>,
    band: SubbandKind,
    plane: u8,
    mags: &mut [u32],
) -> Result<()> {
    let (w, h) = (state.w, state.h);
    for stripe in (0..h).step_by(4) {
        let stripe_end = (stripe + 4).min(h);
        let full = stripe_end - stripe == 4;
        for x in 0..w {
            let mut decided: [(usize, u8); 4] = [(0, 0); 4];
            let mut decided_len = 0;

            let mut start = stripe;
            if full {
                let eligible = (stripe..stripe_end).all(|y| {
                    let idx = state.idx(x, y);
                    state.flags[idx] & (SIG | VISITED) == 0 && {
                        let (hc, vc, dc) = state.neighbor_counts(x, y, stripe_end);
                        hc + vc + dc == 0
                    }
                });
                if eligible {
                    if source.get(contexts, CTX_RUN)? == 0 {
                        continue;
                    }
                    let r = ((source.get(contexts, CTX_UNI)? << 1)
                        | source.get(contexts, CTX_UNI)?) as i32;
                    let y = stripe + r;
                    let idx = state.idx(x, y);
                    let (sc, flip) = state.sc_context(x, y, stripe_end);
                    let sign = source.get(contexts, sc)? ^ flip;
                    decided[decided_len] = (idx, SIG | if sign == 1 { NEG } else { 0 });
                    decided_len += 1;
                    mags[idx] = 1 << plane;
                    start = y + 1;
                }
            }

            for y in start..stripe_end {
                let idx = state.idx(x, y);
                if state.flags[idx] & (SIG | VISITED) != 0 {
                    continue;
                }
                let cx = state.zc_context(band, x, y, stripe_end);
                let bit = source.get(contexts, cx)?;
                if bit == 1 {
                    let (sc, flip) = state.sc_context(x, y, stripe_end);
                    let sign = source.get(contexts, sc)? ^ flip;
                    decided[decided_len] = (idx, SIG | if sign == 1 { NEG } else { 0 });
                    decided_len += 1;
                    mags[idx] = 1 << plane;
                }
            }

            for &(idx, f) in &decided[..decided_len] {
                state.flags[idx] |= f;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data: &[i32], w: u32, h: u32, band: SubbandKind, style: CodingStyle) {
        let coded = encode_block(data, w, h, band, &style).unwrap();
        let segments: Vec<Vec<u8>> = coded.passes.iter().map(|p| p.data.clone()).collect();
        let decoded = decode_block(&segments, w, h, coded.num_planes, band, &style).unwrap();
        assert_eq!(decoded.coefficients, data, "block {w}x{h} {band:?}");
        assert_eq!(decoded.lowest_plane, 0);
    }

    #[test]
    fn all_zero_block_emits_nothing() {
        let coded = encode_block(&[0; 16], 4, 4, SubbandKind::LL, &CodingStyle::default()).unwrap();
        assert_eq!(coded.num_planes, 0);
        assert!(coded.passes.is_empty());
    }

    #[test]
    fn sparse_block_roundtrip() {
        let mut data = vec![0i32; 64];
        data[0] = 10;
        data[9] = -5;
        data[18] = 3;
        data[63] = 1;
        roundtrip(&data, 8, 8, SubbandKind::LL, CodingStyle::default());
    }

    #[test]
    fn diagonal_stripe_column_regression() {
        // Three coefficients on the diagonal exercise the deferred
        // cleanup-column state update: (1,1) must not see (0,0) become
        // significant mid-column.
        let mut data = vec![0i32; 16];
        data[0] = 1; // (0,0)
        data[5] = 1; // (1,1)
        data[10] = 1; // (2,2)
        roundtrip(&data, 4, 4, SubbandKind::LL, CodingStyle::default());
    }

    #[test]
    fn dense_block_all_bands_roundtrip() {
        let mut seed = 0x9E37_79B9_7F4A_7C15u64;
        let mut rng = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };
        for band in [SubbandKind::LL, SubbandKind::HL, SubbandKind::LH, SubbandKind::HH] {
            let data: Vec<i32> = (0..(16 * 16))
                .map(|_| {
                    let r = rng();
                    let mag = (r % 512) as i32;
                    if r & (1 << 40) != 0 {
                        -mag
                    } else {
                        mag
                    }
                })
                .collect();
            roundtrip(&data, 16, 16, band, CodingStyle::default());
        }
    }

    #[test]
    fn odd_sized_blocks_roundtrip() {
        for (w, h) in [(1u32, 1u32), (3, 5), (7, 2), (5, 13), (64, 3)] {
            let data: Vec<i32> = (0..(w * h) as i32)
                .map(|i| (i * 7 % 37) - 18)
                .collect();
            roundtrip(&data, w, h, SubbandKind::HH, CodingStyle::default());
        }
    }

    #[test]
    fn style_flags_roundtrip() {
        let mut seed = 0xDEAD_BEEF_CAFE_F00Du64;
        let mut rng = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };
        let data: Vec<i32> = (0..(12 * 9))
            .map(|_| {
                let r = rng();
                let mag = (r % 4096) as i32;
                if r & 1 == 1 {
                    -mag
                } else {
                    mag
                }
            })
            .collect();
        let styles = [
            CodingStyle {
                bypass: true,
                ..Default::default()
            },
            CodingStyle {
                reset_context: true,
                ..Default::default()
            },
            CodingStyle {
                vertically_causal: true,
                ..Default::default()
            },
            CodingStyle {
                segmentation_symbols: true,
                ..Default::default()
            },
            CodingStyle {
                bypass: true,
                reset_context: true,
                vertically_causal: true,
                predictable_termination: true,
                segmentation_symbols: true,
            },
        ];
        for style in styles {
            roundtrip(&data, 12, 9, SubbandKind::LH, style);
        }
    }

    #[test]
    fn truncated_passes_still_decode() {
        let data: Vec<i32> = (0..64).map(|i| (i % 23) - 11).collect();
        let style = CodingStyle::default();
        let coded = encode_block(&data, 8, 8, SubbandKind::LL, &style).unwrap();
        assert!(coded.passes.len() > 3);
        // Decoding any prefix of passes must succeed, with distortion
        // matching the encoder's running estimate at that pass.
        for keep in 1..=coded.passes.len() {
            let segments: Vec<Vec<u8>> =
                coded.passes[..keep].iter().map(|p| p.data.clone()).collect();
            let decoded =
                decode_block(&segments, 8, 8, coded.num_planes, SubbandKind::LL, &style).unwrap();
            let d: f64 = decoded
                .coefficients
                .iter()
                .zip(&data)
                .map(|(&r, &v)| {
                    let e = (v.unsigned_abs() as f64) - (r.unsigned_abs() as f64);
                    e * e
                })
                .sum();
            let tracked = coded.passes[keep - 1].distortion_after;
            assert!(
                (d - tracked).abs() < 1e-6,
                "pass {keep}: decoded distortion {d} vs tracked {tracked}"
            );
        }
    }

    #[test]
    fn distortion_is_monotone_in_passes() {
        let data: Vec<i32> = (0..256).map(|i| ((i * i) % 800) - 400).collect();
        let coded = encode_block(&data, 16, 16, SubbandKind::HL, &CodingStyle::default()).unwrap();
        let mut last = coded.initial_distortion;
        for p in &coded.passes {
            assert!(p.distortion_after <= last + 1e-9);
            last = p.distortion_after;
        }
        assert!(last < 1e-9, "full decode must be exact");
    }
}
