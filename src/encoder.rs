//! Encode pipeline: image -> colour transform -> DWT -> quantizer ->
//! Tier-1 -> rate control -> Tier-2 packets -> codestream.
//!
//! Tiles encode in parallel into isolated fragments; a sequential
//! assembly pass then emits the main header and the fragments in tile
//! order, so the output bytes are identical no matter how the tile work
//! was scheduled.

use log::debug;
use rayon::prelude::*;

use crate::bit_plane_coder::{self, CodedBlock, CodingStyle, SubbandKind};
use crate::config::{EncoderConfig, ProgressionOrder};
use crate::dwt::{Dwt53, Dwt97};
use crate::error::{Error, Result};
use crate::headers::{CapParams, CodParams, QcdParams, QuantStyle, RgnParams, SizParams, SotParams, TlmEntry};
use crate::ht_block_coder;
use crate::image::Image;
use crate::markers;
use crate::mct;
use crate::packet::{write_packet, BandEncState, PacketBlockInput};
use crate::progression::packet_sequence;
use crate::quantization::{self, max_bit_planes, StepSize};
use crate::rate_control::{allocate_layers, BlockRateInput};
use crate::tile::{build_precincts, build_resolutions, tile_rects, Rect};
use crate::writer::CodestreamWriter;

/// Subband order used by QCD and step tables: LL, then HL/LH/HH per
/// resolution from the lowest upward.
pub fn subband_index(resolution: u8, band_pos: usize) -> usize {
    if resolution == 0 {
        0
    } else {
        1 + 3 * (resolution as usize - 1) + band_pos
    }
}

/// Subband orientation at a QCD step index.
pub fn band_kind_at(index: usize) -> SubbandKind {
    if index == 0 {
        SubbandKind::LL
    } else {
        match (index - 1) % 3 {
            0 => SubbandKind::HL,
            1 => SubbandKind::LH,
            _ => SubbandKind::HH,
        }
    }
}

/// Base quantizer step for a quality target in [0, 1].
fn base_step_for_quality(q: f64) -> f32 {
    (1.0f32 - 7.0 * q as f32).exp2()
}

struct EncodeParams {
    tile_w: u32,
    tile_h: u32,
    levels: u8,
    cb_w: u32,
    cb_h: u32,
    layers: u16,
    progression: ProgressionOrder,
    reversible: bool,
    use_ht: bool,
    mct: bool,
    style: CodingStyle,
    qcd: QcdParams,
    /// Reconstructed per-subband steps (unit for the reversible path).
    band_steps: Vec<f32>,
    /// Magnitude planes per subband before any ROI shift.
    band_planes: Vec<u8>,
    roi_shift: u8,
    byte_target: Option<usize>,
    strict_rate: bool,
    image_pixels: u64,
}

struct TileFragment {
    bytes: Vec<u8>,
}

/// Encodes an image into a raw JPEG 2000 codestream.
pub fn encode(image: &Image, config: &EncoderConfig) -> Result<Vec<u8>> {
    config.validate()?;
    image.validate()?;

    let (tile_w, tile_h) = config
        .tile_size
        .unwrap_or((image.width, image.height));
    if let Some(limit) = config.memory_limit {
        let needed = tile_w as u128 * tile_h as u128 * image.components.len() as u128 * 8;
        if needed > limit as u128 {
            return Err(Error::MemoryLimitExceeded {
                needed: needed.min(usize::MAX as u128) as usize,
                limit,
            });
        }
    }

    let mct_enabled = image.components.len() >= 3
        && image.components[..3].windows(2).all(|w| {
            w[0].width == w[1].width && w[0].height == w[1].height
        })
        && image.components[..3].iter().all(|c| c.dx == 1 && c.dy == 1);

    let max_eff_depth = quantization::max_effective_depth(
        image.components.iter().map(|c| c.bit_depth),
        mct_enabled && config.reversible,
    );

    let levels = config.decomposition_levels;
    let num_bands = 1 + 3 * levels as usize;
    let (qcd, band_steps): (QcdParams, Vec<f32>) = if config.reversible {
        let steps: Vec<StepSize> = (0..num_bands)
            .map(|i| StepSize {
                exponent: quantization::reversible_exponent(max_eff_depth, band_kind_at(i)),
                mantissa: 0,
            })
            .collect();
        (
            QcdParams {
                style: QuantStyle::None,
                guard_bits: config.guard_bits,
                steps,
            },
            vec![1.0; num_bands],
        )
    } else {
        let base = base_step_for_quality(config.target_quality.unwrap_or(0.9));
        let mut steps = Vec::with_capacity(num_bands);
        let mut deltas = Vec::with_capacity(num_bands);
        for i in 0..num_bands {
            let rb = quantization::subband_range(max_eff_depth, band_kind_at(i));
            let ss = StepSize::for_step(base, rb);
            deltas.push(ss.step(rb));
            steps.push(ss);
        }
        (
            QcdParams {
                style: QuantStyle::ScalarExpounded,
                guard_bits: config.guard_bits,
                steps,
            },
            deltas,
        )
    };
    let band_planes: Vec<u8> = qcd
        .steps
        .iter()
        .map(|s| max_bit_planes(s.exponent, config.guard_bits))
        .collect();
    // Maxshift ROI: a data-independent shift clearing every background
    // magnitude the bit budget allows.
    let roi_shift = if config.roi.is_some() {
        band_planes.iter().copied().max().unwrap_or(0)
    } else {
        0
    };

    let params = EncodeParams {
        tile_w,
        tile_h,
        levels,
        cb_w: config.code_block_size.0,
        cb_h: config.code_block_size.1,
        layers: config.quality_layers,
        progression: config.progression,
        reversible: config.reversible,
        use_ht: config.use_ht,
        mct: mct_enabled,
        style: CodingStyle {
            bypass: config.selective_bypass,
            reset_context: config.reset_context,
            vertically_causal: config.vertically_causal_context,
            predictable_termination: config.predictable_termination,
            segmentation_symbols: config.segmentation_symbols,
        },
        qcd,
        band_steps,
        band_planes,
        roi_shift,
        byte_target: config
            .bitrate
            .map(|bpp| (bpp * (image.width as f64 * image.height as f64) / 8.0) as usize),
        strict_rate: config.strict_rate,
        image_pixels: image.width as u64 * image.height as u64,
    };

    let tiles = tile_rects(image.width, image.height, tile_w, tile_h);
    debug!(
        "encoding {}x{} image, {} components, {} tiles, levels {}",
        image.width,
        image.height,
        image.components.len(),
        tiles.len(),
        levels
    );

    let run = || -> Result<Vec<TileFragment>> {
        tiles
            .par_iter()
            .map(|rect| {
                if let Some(cancel) = &config.cancel {
                    cancel.check()?;
                }
                encode_tile(image, config, &params, rect)
            })
            .collect()
    };
    let fragments = match &config.thread_pool {
        Some(pool) => pool.install(run),
        None => run(),
    }?;

    if let Some(cancel) = &config.cancel {
        cancel.check()?;
    }

    // Sequential assembly in tile order.
    let mut w = CodestreamWriter::new();
    w.write_soc();
    w.write_siz(&SizParams {
        rsiz: if params.use_ht { markers::RSIZ_CAP } else { 0 },
        width: image.width,
        height: image.height,
        x_offset: 0,
        y_offset: 0,
        tile_width: tile_w,
        tile_height: tile_h,
        tile_x_offset: 0,
        tile_y_offset: 0,
        components: image
            .components
            .iter()
            .map(|c| crate::headers::ComponentSiz {
                depth: c.bit_depth,
                signed: c.signed,
                dx: c.dx,
                dy: c.dy,
            })
            .collect(),
    });
    if params.use_ht {
        w.write_cap(&CapParams {
            pcap: markers::PCAP_HT,
            ccap: vec![markers::CCAP15_HTONLY],
        });
        w.write_cpf(&[0]);
    }
    w.write_cod(&CodParams {
        progression: params.progression,
        layers: params.layers,
        mct: u8::from(params.mct),
        decomposition_levels: levels,
        cb_width_exp: params.cb_w.ilog2() as u8,
        cb_height_exp: params.cb_h.ilog2() as u8,
        cblk_style: cblk_style_byte(config),
        transformation: u8::from(params.reversible),
        precinct_sizes: Vec::new(),
    });
    w.write_qcd(&params.qcd);
    if params.roi_shift > 0 {
        for c in 0..image.components.len() as u16 {
            w.write_rgn(
                &RgnParams {
                    component: c,
                    shift: params.roi_shift,
                },
                image.components.len(),
            );
        }
    }
    w.write_comment(concat!("j2kodec ", env!("CARGO_PKG_VERSION")));
    let tlm: Vec<TlmEntry> = fragments
        .iter()
        .enumerate()
        .map(|(i, f)| TlmEntry {
            tile_index: i as u16,
            length: f.bytes.len() as u32,
        })
        .collect();
    w.write_tlm(&tlm);

    for fragment in &fragments {
        w.bytes_mut().extend_from_slice(&fragment.bytes);
    }
    w.write_eoc();
    Ok(w.into_bytes())
}

fn cblk_style_byte(config: &EncoderConfig) -> u8 {
    // Every pass is terminated regardless of the caller's restart flag.
    let mut style = markers::CBLK_STYLE_TERMALL;
    if config.selective_bypass {
        style |= markers::CBLK_STYLE_LAZY;
    }
    if config.reset_context {
        style |= markers::CBLK_STYLE_RESET;
    }
    if config.vertically_causal_context {
        style |= markers::CBLK_STYLE_VSC;
    }
    if config.predictable_termination {
        style |= markers::CBLK_STYLE_PTERM;
    }
    if config.segmentation_symbols {
        style |= markers::CBLK_STYLE_SEGSYM;
    }
    style
}

/// Quantized tile-component in Mallat layout.
struct TileComp {
    width: u32,
    height: u32,
    indices: Vec<i32>,
}

struct BlockJob {
    comp: usize,
    resolution: u8,
    precinct: usize,
    band_pos: usize,
    grid_w: u32,
    grid_h: u32,
    data: Vec<i32>,
    width: u32,
    height: u32,
    kind: SubbandKind,
    max_planes: u8,
}

fn encode_tile(
    image: &Image,
    config: &EncoderConfig,
    params: &EncodeParams,
    rect: &Rect,
) -> Result<TileFragment> {
    let tile_index = {
        let cols = image.width.div_ceil(params.tile_w);
        (rect.y0 / params.tile_h) * cols + rect.x0 / params.tile_w
    };
    let comps = prepare_tile_components(image, config, params, rect)?;

    // Tier-1 over every code-block of every component.
    let mut jobs: Vec<BlockJob> = Vec::new();
    for (ci, tc) in comps.iter().enumerate() {
        let resolutions = build_resolutions(tc.width, tc.height, params.levels);
        for res in &resolutions {
            let precincts = build_precincts(res, params.levels, params.cb_w, params.cb_h);
            for (pi, precinct) in precincts.iter().enumerate() {
                for pb in &precinct.bands {
                    let band = &res.bands[pb.band_index];
                    let sb = subband_index(res.level, pb.band_index);
                    for block in &pb.blocks {
                        let mut data = Vec::with_capacity((block.width * block.height) as usize);
                        for y in 0..block.height {
                            let row = (band.y_off + block.y0 + y) as usize * tc.width as usize
                                + (band.x_off + block.x0) as usize;
                            data.extend_from_slice(&tc.indices[row..row + block.width as usize]);
                        }
                        jobs.push(BlockJob {
                            comp: ci,
                            resolution: res.level,
                            precinct: pi,
                            band_pos: pb.band_index,
                            grid_w: pb.grid_w,
                            grid_h: pb.grid_h,
                            data,
                            width: block.width,
                            height: block.height,
                            kind: band.kind,
                            max_planes: params.band_planes[sb] + params.roi_shift,
                        });
                    }
                }
            }
        }
    }

    let coded: Vec<(CodedBlock, u32)> = jobs
        .par_iter()
        .map(|job| -> Result<(CodedBlock, u32)> {
            if let Some(cancel) = &config.cancel {
                cancel.check()?;
            }
            let coded = if params.use_ht {
                ht_block_coder::encode_block(&job.data, job.width, job.height, params.reversible)?
            } else {
                bit_plane_coder::encode_block(
                    &job.data,
                    job.width,
                    job.height,
                    job.kind,
                    &params.style,
                )?
            };
            if coded.num_planes > job.max_planes {
                return Err(Error::Internal("encoder: bit-plane count exceeds subband budget"));
            }
            let zbp = (job.max_planes - coded.num_planes) as u32;
            Ok((coded, zbp))
        })
        .collect::<Result<_>>()?;

    // PCRD-opt layer allocation across the tile's blocks.
    let tile_target = params.byte_target.map(|total| {
        let tile_pixels = rect.width() as u64 * rect.height() as u64;
        (total as u64 * tile_pixels / params.image_pixels.max(1)) as usize
    });
    let rate_inputs: Vec<BlockRateInput<'_>> = jobs
        .iter()
        .zip(&coded)
        .map(|(job, (block, _))| BlockRateInput {
            coded: block,
            weight: 4f64.powi(decomposition_level_of(job.resolution, params.levels) as i32),
        })
        .collect();
    let allocations = allocate_layers(
        &rate_inputs,
        params.layers,
        tile_target,
        params.strict_rate,
    );

    // Tier-2: packets in progression order.
    let comp_count = comps.len() as u16;
    let resolutions_per_comp: Vec<Vec<crate::tile::ResolutionGeom>> = comps
        .iter()
        .map(|tc| build_resolutions(tc.width, tc.height, params.levels))
        .collect();
    let precinct_counts: Vec<Vec<u32>> = resolutions_per_comp
        .iter()
        .map(|rs| {
            rs.iter()
                .map(|r| build_precincts(r, params.levels, params.cb_w, params.cb_h).len() as u32)
                .collect()
        })
        .collect();

    // Persistent Tier-2 state, keyed (comp, resolution, precinct).
    let mut band_states: std::collections::BTreeMap<(usize, u8, usize), Vec<BandEncState>> =
        std::collections::BTreeMap::new();
    // Flat job index ranges per (comp, resolution, precinct, band_pos).
    let mut band_ranges: std::collections::BTreeMap<(usize, u8, usize, usize), (usize, usize)> =
        std::collections::BTreeMap::new();
    {
        let mut i = 0;
        while i < jobs.len() {
            let key = (
                jobs[i].comp,
                jobs[i].resolution,
                jobs[i].precinct,
                jobs[i].band_pos,
            );
            let start = i;
            while i < jobs.len()
                && (jobs[i].comp, jobs[i].resolution, jobs[i].precinct, jobs[i].band_pos) == key
            {
                i += 1;
            }
            band_ranges.insert(key, (start, i));
        }
    }

    let sequence = packet_sequence(
        params.progression,
        params.layers,
        comp_count,
        params.levels + 1,
        &|c, r| precinct_counts[c as usize][r as usize],
    );

    // Pass segments per block, indexed like `jobs`.
    let block_segments: Vec<Vec<Vec<u8>>> = coded
        .iter()
        .map(|(block, _)| block.passes.iter().map(|p| p.data.clone()).collect())
        .collect();

    let mut packets: Vec<u8> = Vec::new();
    let mut packet_lengths = Vec::with_capacity(sequence.len());
    for pc in &sequence {
        let band_count = if pc.resolution == 0 { 1 } else { 3 };
        let key = (pc.component as usize, pc.resolution, pc.precinct as usize);
        let states = band_states.entry(key).or_insert_with(|| {
            (0..band_count)
                .map(|band_pos| {
                    match band_ranges.get(&(key.0, key.1, key.2, band_pos)) {
                        Some(&(start, end)) => {
                            let zbps: Vec<u32> = coded[start..end].iter().map(|(_, z)| *z).collect();
                            BandEncState::new(jobs[start].grid_w, jobs[start].grid_h, &zbps)
                        }
                        None => BandEncState::new(0, 0, &[]),
                    }
                })
                .collect()
        });

        let mut inputs: Vec<Vec<PacketBlockInput<'_>>> = Vec::with_capacity(band_count);
        for band_pos in 0..band_count {
            let mut band_inputs = Vec::new();
            if let Some(&(start, end)) = band_ranges.get(&(key.0, key.1, key.2, band_pos)) {
                for flat in start..end {
                    let alloc = &allocations[flat];
                    let prev = if pc.layer == 0 {
                        0
                    } else {
                        alloc[pc.layer as usize - 1]
                    };
                    let now = alloc[pc.layer as usize];
                    band_inputs.push(PacketBlockInput {
                        segments: &block_segments[flat][prev..now],
                        ht: params.use_ht,
                    });
                }
            }
            inputs.push(band_inputs);
        }
        let bytes = write_packet(states, &inputs, pc.layer, false);
        packet_lengths.push(bytes.len());
        packets.extend_from_slice(&bytes);
    }

    // Fragment: SOT + PLT + SOD + packets, with Psot patched in.
    let mut w = CodestreamWriter::new();
    let sot_pos = w.len();
    w.write_sot(&SotParams {
        tile_index: tile_index as u16,
        tile_part_len: 0,
        tile_part_index: 0,
        num_tile_parts: 1,
    });
    w.write_plt(&packet_lengths);
    w.write_sod();
    w.bytes_mut().extend_from_slice(&packets);
    let len = (w.len() - sot_pos) as u32;
    w.patch_psot(sot_pos, len);
    Ok(TileFragment {
        bytes: w.into_bytes(),
    })
}

/// Decomposition level a resolution's bands belong to.
fn decomposition_level_of(resolution: u8, levels: u8) -> u8 {
    if resolution == 0 {
        levels
    } else {
        levels - resolution + 1
    }
}

fn prepare_tile_components(
    image: &Image,
    config: &EncoderConfig,
    params: &EncodeParams,
    rect: &Rect,
) -> Result<Vec<TileComp>> {
    // Extract, level-shift, colour-transform, wavelet-transform and
    // quantize each tile-component.
    let mut planes: Vec<(u32, u32, Vec<i32>)> = Vec::with_capacity(image.components.len());
    for comp in &image.components {
        let cx0 = rect.x0.div_ceil(comp.dx as u32);
        let cx1 = rect.x1.div_ceil(comp.dx as u32);
        let cy0 = rect.y0.div_ceil(comp.dy as u32);
        let cy1 = rect.y1.div_ceil(comp.dy as u32);
        let (w, h) = (cx1 - cx0, cy1 - cy0);
        let mut samples = Vec::with_capacity((w * h) as usize);
        for y in cy0..cy1 {
            let row = (y * comp.width + cx0) as usize;
            samples.extend_from_slice(&comp.samples[row..row + w as usize]);
        }
        if !comp.signed {
            mct::level_shift_forward(&mut samples, comp.bit_depth);
        }
        planes.push((w, h, samples));
    }

    let mut out = Vec::with_capacity(planes.len());
    if params.reversible {
        if params.mct {
            let (a, rest) = planes.split_at_mut(1);
            let (b, c) = rest.split_at_mut(1);
            mct::forward_rct(&mut a[0].2, &mut b[0].2, &mut c[0].2);
        }
        for (w, h, samples) in planes {
            let mut buf = samples;
            Dwt53::forward_2d(&mut buf, w as usize, h as usize, params.levels);
            out.push(TileComp {
                width: w,
                height: h,
                indices: buf,
            });
        }
    } else {
        let mut fplanes: Vec<(u32, u32, Vec<f32>)> = planes
            .into_iter()
            .map(|(w, h, s)| (w, h, s.iter().map(|&v| v as f32).collect()))
            .collect();
        if params.mct {
            let (a, rest) = fplanes.split_at_mut(1);
            let (b, c) = rest.split_at_mut(1);
            mct::forward_ict(&mut a[0].2, &mut b[0].2, &mut c[0].2);
        }
        for (w, h, mut buf) in fplanes {
            Dwt97::forward_2d(&mut buf, w as usize, h as usize, params.levels);
            let mut indices = vec![0; buf.len()];
            let resolutions = build_resolutions(w, h, params.levels);
            for res in &resolutions {
                for (band_pos, band) in res.bands.iter().enumerate() {
                    let step = params.band_steps[subband_index(res.level, band_pos)];
                    for y in 0..band.height {
                        for x in 0..band.width {
                            let idx = ((band.y_off + y) * w + band.x_off + x) as usize;
                            indices[idx] = quantization::quantize(buf[idx], step);
                        }
                    }
                }
            }
            out.push(TileComp {
                width: w,
                height: h,
                indices,
            });
        }
    }

    // ROI lifting on the quantized indices.
    if let Some(mask) = &config.roi {
        if params.roi_shift > 0 {
            for (ci, tc) in out.iter_mut().enumerate() {
                apply_roi_shift(tc, params, rect, image, ci, mask);
            }
        }
    }
    Ok(out)
}

fn apply_roi_shift(
    tc: &mut TileComp,
    params: &EncodeParams,
    rect: &Rect,
    image: &Image,
    comp_index: usize,
    mask: &crate::config::RoiMask,
) {
    let comp = &image.components[comp_index];
    let resolutions = build_resolutions(tc.width, tc.height, params.levels);
    for res in &resolutions {
        let l = decomposition_level_of(res.level, params.levels);
        for band in &res.bands {
            for y in 0..band.height {
                for x in 0..band.width {
                    // Nominal spatial support of the coefficient on the
                    // full-resolution grid.
                    let tcx = ((x as u64) << l).min(tc.width.saturating_sub(1) as u64);
                    let tcy = ((y as u64) << l).min(tc.height.saturating_sub(1) as u64);
                    let fx = (rect.x0 as u64 + tcx * comp.dx as u64).min(image.width as u64 - 1);
                    let fy = (rect.y0 as u64 + tcy * comp.dy as u64).min(image.height as u64 - 1);
                    if mask(fx as u32, fy as u32) {
                        let idx = ((band.y_off + y) * tc.width + band.x_off + x) as usize;
                        tc.indices[idx] =
                            quantization::roi_shift_up(tc.indices[idx], params.roi_shift);
                    }
                }
            }
        }
    }
}
