//! Decode pipeline: codestream -> Tier-2 -> Tier-1 -> dequantizer ->
//! inverse DWT -> inverse colour transform -> image.
//!
//! Parsing is sequential until tile-part boundaries are known, then tiles
//! decode in parallel. Partial decoding drops packets above the requested
//! layer or resolution and tiles outside the requested window before any
//! Tier-1 work happens.

use std::collections::BTreeMap;

use log::debug;
use rayon::prelude::*;

use crate::bit_plane_coder::{self, CodingStyle, DecodedBlock, SubbandKind};
use crate::config::{DecodeOptions, PartialDecodeSpec};
use crate::dwt::{level_dim, Dwt53, Dwt97};
use crate::encoder::{band_kind_at, subband_index};
use crate::error::{Error, Result};
use crate::headers::{CodestreamInfo, MainHeader, QuantStyle, TilePart};
use crate::ht_block_coder;
use crate::image::{Image, ImageComponent};
use crate::markers;
use crate::mct;
use crate::packet::{read_packet, BandDecState};
use crate::parser::parse_codestream;
use crate::progression::packet_sequence;
use crate::quantization::{self, max_bit_planes};
use crate::tile::{build_precincts, build_resolutions, tile_rects, Rect};

/// Reads codestream metadata without decoding any pixel data.
pub fn inspect(data: &[u8]) -> Result<CodestreamInfo> {
    let (main, _tiles) = parse_codestream(data)?;
    Ok(CodestreamInfo {
        width: main.siz.width,
        height: main.siz.height,
        x_offset: main.siz.x_offset,
        y_offset: main.siz.y_offset,
        tile_width: main.siz.tile_width,
        tile_height: main.siz.tile_height,
        tile_cols: main.siz.width.div_ceil(main.siz.tile_width),
        tile_rows: main.siz.height.div_ceil(main.siz.tile_height),
        components: main.siz.components.clone(),
        progression: main.cod.progression,
        quality_layers: main.cod.layers,
        decomposition_levels: main.cod.decomposition_levels,
        code_block_size: (main.cod.cb_width(), main.cod.cb_height()),
        reversible: main.cod.reversible(),
        ht: main.cap.as_ref().is_some_and(|c| c.ht()),
        comments: main.comments.clone(),
        tile_part_lengths: main.tlm.clone(),
    })
}

/// Decodes a full codestream.
pub fn decode(data: &[u8], opts: &DecodeOptions) -> Result<Image> {
    decode_partial(data, &PartialDecodeSpec::default(), opts)
}

/// Decodes a window, resolution or layer subset of a codestream.
pub fn decode_partial(data: &[u8], spec: &PartialDecodeSpec, opts: &DecodeOptions) -> Result<Image> {
    let (main, tile_parts) = parse_codestream(data)?;
    validate_supported(&main)?;
    if tile_parts.iter().any(|tp| tp.cod.is_some() || tp.qcd.is_some()) {
        return Err(Error::UnsupportedFeature("tile-part coding overrides"));
    }

    let levels = main.cod.decomposition_levels;
    let max_res = spec
        .max_resolution_level
        .unwrap_or(levels)
        .min(levels);
    let reduction = levels - max_res;
    let max_layer = spec
        .max_layer
        .map(|l| l.min(main.cod.layers - 1))
        .unwrap_or(main.cod.layers - 1);

    let window = match spec.window {
        Some((x0, y0, x1, y1)) => {
            let clamped = Rect {
                x0: x0.min(main.siz.width),
                y0: y0.min(main.siz.height),
                x1: x1.min(main.siz.width),
                y1: y1.min(main.siz.height),
            };
            if clamped.x0 >= clamped.x1 || clamped.y0 >= clamped.y1 {
                return Err(Error::InvalidParameter("decode window is empty"));
            }
            Some(clamped)
        }
        None => None,
    };

    let tiles = tile_rects(
        main.siz.width,
        main.siz.height,
        main.siz.tile_width,
        main.siz.tile_height,
    );

    // Reduced-grid layout: tile origins are the running sums of reduced
    // tile extents (identical to ceil(extent / 2^r) whenever the tile size
    // is divisible by the reduction factor).
    let cols = main.siz.width.div_ceil(main.siz.tile_width) as usize;
    let rows = main.siz.height.div_ceil(main.siz.tile_height) as usize;
    let mut col_offsets = vec![0u32; cols + 1];
    for i in 0..cols {
        let tw = tiles[i].width();
        col_offsets[i + 1] = col_offsets[i] + level_dim(tw as usize, reduction) as u32;
    }
    let mut row_offsets = vec![0u32; rows + 1];
    for j in 0..rows {
        let th = tiles[j * cols].height();
        row_offsets[j + 1] = row_offsets[j] + level_dim(th as usize, reduction) as u32;
    }
    let reduced_w = col_offsets[cols];
    let reduced_h = row_offsets[rows];

    // Output region on the reduced grid.
    let out_rect = match &window {
        Some(wr) => Rect {
            x0: wr.x0 >> reduction,
            y0: wr.y0 >> reduction,
            x1: (wr.x1 as u64).div_ceil(1u64 << reduction) as u32,
            y1: (wr.y1 as u64).div_ceil(1u64 << reduction) as u32,
        },
        None => Rect {
            x0: 0,
            y0: 0,
            x1: reduced_w,
            y1: reduced_h,
        },
    };

    if let Some(limit) = opts.memory_limit {
        let needed = out_rect.width() as u128
            * out_rect.height() as u128
            * main.siz.components.len() as u128
            * 8;
        if needed > limit as u128 {
            return Err(Error::MemoryLimitExceeded {
                needed: needed.min(usize::MAX as u128) as usize,
                limit,
            });
        }
    }

    // Tile-parts grouped per tile, in tile-part order.
    let mut per_tile: BTreeMap<u16, Vec<&TilePart>> = BTreeMap::new();
    for tp in &tile_parts {
        per_tile.entry(tp.sot.tile_index).or_default().push(tp);
    }
    for parts in per_tile.values_mut() {
        parts.sort_by_key(|tp| tp.sot.tile_part_index);
    }

    let wanted: Vec<(u16, &Vec<&TilePart>)> = per_tile
        .iter()
        .filter(|(idx, _)| {
            let idx = **idx as usize;
            idx < tiles.len()
                && window
                    .as_ref()
                    .map(|wr| tiles[idx].intersects(wr))
                    .unwrap_or(true)
        })
        .map(|(i, p)| (*i, p))
        .collect();
    debug!(
        "decoding {} of {} tiles, reduction {}, layers 0..={}",
        wanted.len(),
        tiles.len(),
        reduction,
        max_layer
    );

    let run = || -> Result<Vec<(u16, Vec<Plane>)>> {
        wanted
            .par_iter()
            .map(|(tile_index, parts)| {
                if let Some(cancel) = &opts.cancel {
                    cancel.check()?;
                }
                let mut tile_data = Vec::new();
                for tp in parts.iter() {
                    tile_data.extend_from_slice(&data[tp.data_start..tp.data_end]);
                }
                let planes = decode_tile(
                    &main,
                    &tile_data,
                    &tiles[*tile_index as usize],
                    max_res,
                    max_layer,
                    window.as_ref(),
                    opts,
                )?;
                Ok((*tile_index, planes))
            })
            .collect()
    };
    let decoded_tiles = match &opts.thread_pool {
        Some(pool) => pool.install(run),
        None => run(),
    }?;

    // Assemble the output image from the per-tile planes.
    let mut image = Image {
        width: out_rect.width(),
        height: out_rect.height(),
        x_offset: 0,
        y_offset: 0,
        components: main
            .siz
            .components
            .iter()
            .map(|c| {
                let w = out_rect.width().div_ceil(c.dx as u32);
                let h = out_rect.height().div_ceil(c.dy as u32);
                let mut comp = ImageComponent::new(w, h, c.depth);
                comp.signed = c.signed;
                comp.dx = c.dx;
                comp.dy = c.dy;
                comp
            })
            .collect(),
    };

    for (tile_index, planes) in decoded_tiles {
        let ti = tile_index as usize;
        let (tcol, trow) = (ti % cols, ti / cols);
        for (ci, plane) in planes.iter().enumerate() {
            let dx = main.siz.components[ci].dx as u32;
            let dy = main.siz.components[ci].dy as u32;
            // Tile origin on the reduced component grid.
            let ox = col_offsets[tcol] / dx;
            let oy = row_offsets[trow] / dy;
            let comp = &mut image.components[ci];
            let cx0 = out_rect.x0 / dx;
            let cy0 = out_rect.y0 / dy;
            for y in 0..plane.height {
                let gy = oy + y;
                if gy < cy0 || gy >= cy0 + comp.height {
                    continue;
                }
                for x in 0..plane.width {
                    let gx = ox + x;
                    if gx < cx0 || gx >= cx0 + comp.width {
                        continue;
                    }
                    comp.samples[((gy - cy0) * comp.width + (gx - cx0)) as usize] =
                        plane.samples[(y * plane.width + x) as usize];
                }
            }
        }
    }
    Ok(image)
}

fn validate_supported(main: &MainHeader) -> Result<()> {
    if main.siz.x_offset != 0
        || main.siz.y_offset != 0
        || main.siz.tile_x_offset != 0
        || main.siz.tile_y_offset != 0
    {
        return Err(Error::UnsupportedFeature("nonzero reference grid offsets"));
    }
    if main.has_poc {
        return Err(Error::UnsupportedFeature("progression order changes"));
    }
    if main.cod.mct > 1 {
        return Err(Error::UnsupportedFeature("arbitrary multi-component transforms"));
    }
    if main.cod.cblk_style & markers::CBLK_STYLE_TERMALL == 0 {
        return Err(Error::UnsupportedFeature(
            "code-blocks without per-pass termination",
        ));
    }
    if main
        .coc
        .iter()
        .any(|o| o.decomposition_levels != main.cod.decomposition_levels)
    {
        return Err(Error::UnsupportedFeature(
            "per-component decomposition depths",
        ));
    }
    // COC may vary the code-block size per component (the geometry reads
    // cod_for per component), but the Tier-1 style flags and the wavelet
    // selection are resolved once per tile; a stream that varies them is
    // rejected rather than decoded with the wrong pass structure.
    if main
        .coc
        .iter()
        .any(|o| o.cblk_style != main.cod.cblk_style || o.transformation != main.cod.transformation)
    {
        return Err(Error::UnsupportedFeature(
            "per-component coding styles or transformations",
        ));
    }
    if !main.cod.precinct_sizes.is_empty()
        || main.coc.iter().any(|o| !o.precinct_sizes.is_empty())
    {
        return Err(Error::UnsupportedFeature("explicit precinct sizes"));
    }
    Ok(())
}

/// One decoded tile-component plane at the output resolution.
struct Plane {
    width: u32,
    height: u32,
    samples: Vec<i32>,
}

struct PendingBlock {
    comp: usize,
    resolution: u8,
    band_pos: usize,
    /// Position of the block inside the tile-component buffer.
    x_off: u32,
    y_off: u32,
    width: u32,
    height: u32,
    kind: SubbandKind,
    num_planes: u8,
    ht: bool,
    segments: Vec<Vec<u8>>,
}

#[allow(clippy::too_many_arguments)]
fn decode_tile(
    main: &MainHeader,
    tile_data: &[u8],
    rect: &Rect,
    max_res: u8,
    max_layer: u16,
    window: Option<&Rect>,
    opts: &DecodeOptions,
) -> Result<Vec<Plane>> {
    let levels = main.cod.decomposition_levels;
    let reduction = levels - max_res;
    let comp_count = main.siz.components.len();
    let default_ht = main.cap.as_ref().is_some_and(|c| c.ht());
    let mixed = main.cap.as_ref().is_some_and(|c| c.ht_mixed());

    // Per-component geometry (full resolution, as the encoder saw it).
    let mut comp_dims = Vec::with_capacity(comp_count);
    let mut comp_res = Vec::with_capacity(comp_count);
    let mut comp_precincts = Vec::with_capacity(comp_count);
    for (ci, c) in main.siz.components.iter().enumerate() {
        let w = rect.x1.div_ceil(c.dx as u32) - rect.x0.div_ceil(c.dx as u32);
        let h = rect.y1.div_ceil(c.dy as u32) - rect.y0.div_ceil(c.dy as u32);
        let res = build_resolutions(w, h, levels);
        let cod = main.cod_for(ci as u16);
        let precincts: Vec<_> = res
            .iter()
            .map(|r| build_precincts(r, levels, cod.cb_width(), cod.cb_height()))
            .collect();
        comp_dims.push((w, h));
        comp_res.push(res);
        comp_precincts.push(precincts);
    }

    // Tier-2: walk every packet in progression order. Bound the packet
    // count before materialising the sequence; hostile headers can claim
    // absurd layer/component products.
    let precinct_total: u64 = comp_precincts
        .iter()
        .flat_map(|rs| rs.iter().map(|p| p.len() as u64))
        .sum();
    if main.cod.layers as u64 * precinct_total.max(1) > 1 << 24 {
        return Err(Error::UnsupportedFeature("packet count beyond decoder limits"));
    }
    let sequence = packet_sequence(
        main.cod.progression,
        main.cod.layers,
        comp_count as u16,
        levels + 1,
        &|c, r| comp_precincts[c as usize][r as usize].len() as u32,
    );

    let mut band_states: BTreeMap<(usize, u8, usize), Vec<BandDecState>> = BTreeMap::new();
    let mut blocks: BTreeMap<(usize, u8, usize, usize, usize), PendingBlock> = BTreeMap::new();
    let mut offset = 0usize;

    for pc in &sequence {
        let ci = pc.component as usize;
        let precinct = &comp_precincts[ci][pc.resolution as usize][pc.precinct as usize];
        let key = (ci, pc.resolution, pc.precinct as usize);
        let states = band_states.entry(key).or_insert_with(|| {
            precinct
                .bands
                .iter()
                .map(|pb| BandDecState::new(pb.grid_w, pb.grid_h))
                .collect()
        });

        if offset > tile_data.len() {
            return Err(Error::TruncatedInput("packet data exhausted"));
        }
        let (contributions, header_len) =
            read_packet(&tile_data[offset..], states, pc.layer, mixed, default_ht)?;
        offset += header_len;

        let wanted = pc.layer <= max_layer
            && pc.resolution <= max_res
            && window
                .map(|wr| {
                    let pr = &precinct.full_res_rect;
                    // Precinct rectangles are tile-local.
                    let abs = Rect {
                        x0: rect.x0 + pr.x0.min(rect.width()),
                        y0: rect.y0 + pr.y0.min(rect.height()),
                        x1: rect.x0 + pr.x1.min(rect.width()),
                        y1: rect.y0 + pr.y1.min(rect.height()),
                    };
                    abs.intersects(wr)
                })
                .unwrap_or(true);

        for contrib in contributions {
            let total: usize = contrib.segment_lengths.iter().sum();
            if offset + total > tile_data.len() {
                return Err(Error::TruncatedInput("packet body exhausted"));
            }
            let pb = &precinct.bands[contrib.band_index];
            let band = &comp_res[ci][pc.resolution as usize].bands[pb.band_index];
            let block_geom = &pb.blocks[contrib.block_index];
            let entry = blocks
                .entry((ci, pc.resolution, pc.precinct as usize, contrib.band_index, contrib.block_index));
            let entry = match entry {
                std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::btree_map::Entry::Vacant(v) => {
                    if !contrib.first_inclusion {
                        return Err(Error::MalformedBytestream(
                            "continuation of a block never included",
                        ));
                    }
                    let sb = subband_index(pc.resolution, contrib.band_index);
                    let qcd = main.qcd_for(pc.component);
                    let step = qcd
                        .steps
                        .get(sb)
                        .ok_or(Error::MalformedBytestream("missing subband step size"))?;
                    let mb = max_bit_planes(step.exponent, qcd.guard_bits) as u32
                        + main.roi_shift_for(pc.component) as u32;
                    if contrib.zero_bit_planes > mb {
                        return Err(Error::MalformedBytestream(
                            "zero bit-planes exceed the subband budget",
                        ));
                    }
                    let num_planes = mb - contrib.zero_bit_planes;
                    if num_planes > 31 {
                        return Err(Error::MalformedBytestream(
                            "bit-plane count exceeds the coefficient range",
                        ));
                    }
                    v.insert(PendingBlock {
                        comp: ci,
                        resolution: pc.resolution,
                        band_pos: contrib.band_index,
                        x_off: band.x_off + block_geom.x0,
                        y_off: band.y_off + block_geom.y0,
                        width: block_geom.width,
                        height: block_geom.height,
                        kind: band.kind,
                        num_planes: num_planes as u8,
                        ht: contrib.ht,
                        segments: Vec::new(),
                    })
                }
            };
            for len in &contrib.segment_lengths {
                if wanted {
                    entry.segments.push(tile_data[offset..offset + len].to_vec());
                }
                offset += len;
            }
        }
    }

    // Tier-1, in parallel over the pending blocks.
    let style = CodingStyle {
        bypass: main.cod.cblk_style & markers::CBLK_STYLE_LAZY != 0,
        reset_context: main.cod.cblk_style & markers::CBLK_STYLE_RESET != 0,
        vertically_causal: main.cod.cblk_style & markers::CBLK_STYLE_VSC != 0,
        predictable_termination: main.cod.cblk_style & markers::CBLK_STYLE_PTERM != 0,
        segmentation_symbols: main.cod.cblk_style & markers::CBLK_STYLE_SEGSYM != 0,
    };
    let reversible = main.cod.reversible();
    let pending: Vec<&PendingBlock> = blocks
        .values()
        .filter(|b| !b.segments.is_empty() && b.resolution <= max_res)
        .collect();
    let decoded: Vec<DecodedBlock> = pending
        .par_iter()
        .map(|b| -> Result<DecodedBlock> {
            if let Some(cancel) = &opts.cancel {
                cancel.check()?;
            }
            if b.ht {
                ht_block_coder::decode_block(&b.segments, b.width, b.height, b.num_planes, reversible)
            } else {
                bit_plane_coder::decode_block(
                    &b.segments,
                    b.width,
                    b.height,
                    b.num_planes,
                    b.kind,
                    &style,
                )
            }
        })
        .collect::<Result<_>>()?;

    // Reduced tile-component buffer dimensions.
    let reduced_dims: Vec<(u32, u32)> = comp_dims
        .iter()
        .map(|&(w, h)| {
            (
                level_dim(w as usize, reduction) as u32,
                level_dim(h as usize, reduction) as u32,
            )
        })
        .collect();

    let mut out_planes: Vec<Plane> = Vec::with_capacity(comp_count);
    if reversible {
        let mut int_planes: Vec<Vec<i32>> = reduced_dims
            .iter()
            .map(|&(rw, rh)| vec![0i32; (rw * rh) as usize])
            .collect();
        for (b, d) in pending.iter().zip(&decoded) {
            let roi = main.roi_shift_for(b.comp as u16);
            let rw = reduced_dims[b.comp].0;
            let buf = &mut int_planes[b.comp];
            for y in 0..b.height {
                for x in 0..b.width {
                    let mut v = d.coefficients[(y * b.width + x) as usize];
                    let mut lowest = d.lowest_plane;
                    if roi > 0 {
                        v = quantization::roi_shift_down(v, roi);
                        lowest = lowest.saturating_sub(roi);
                    }
                    buf[((b.y_off + y) * rw + b.x_off + x) as usize] =
                        quantization::reconstruct_reversible(v, lowest);
                }
            }
        }
        for ((rw, rh), buf) in reduced_dims.iter().zip(int_planes.iter_mut()) {
            Dwt53::inverse_2d(buf, *rw as usize, *rh as usize, max_res);
        }
        if main.cod.mct == 1 && comp_count >= 3 {
            let (a, rest) = int_planes.split_at_mut(1);
            let (b, c) = rest.split_at_mut(1);
            mct::inverse_rct(&mut a[0], &mut b[0], &mut c[0]);
        }
        for (ci, mut buf) in int_planes.into_iter().enumerate() {
            finish_plane(main, ci, &mut buf);
            out_planes.push(Plane {
                width: reduced_dims[ci].0,
                height: reduced_dims[ci].1,
                samples: buf,
            });
        }
    } else {
        // Per-component subband steps reconstructed from QCD/QCC.
        let max_eff_depth = quantization::max_effective_depth(
            main.siz.components.iter().map(|c| c.depth),
            false,
        );
        let qcd_steps: Vec<Vec<f32>> = (0..comp_count)
            .map(|ci| {
                let qcd = main.qcd_for(ci as u16);
                qcd.steps
                    .iter()
                    .enumerate()
                    .map(|(i, s)| match qcd.style {
                        QuantStyle::None => 1.0,
                        QuantStyle::ScalarExpounded => s.step(quantization::subband_range(
                            max_eff_depth,
                            band_kind_at(i),
                        )),
                    })
                    .collect()
            })
            .collect();

        let mut f_planes: Vec<Vec<f32>> = reduced_dims
            .iter()
            .map(|&(rw, rh)| vec![0f32; (rw * rh) as usize])
            .collect();
        for (b, d) in pending.iter().zip(&decoded) {
            let roi = main.roi_shift_for(b.comp as u16);
            let sb = subband_index(b.resolution, b.band_pos);
            let step = qcd_steps[b.comp].get(sb).copied().unwrap_or(1.0);
            let rw = reduced_dims[b.comp].0;
            let buf = &mut f_planes[b.comp];
            for y in 0..b.height {
                for x in 0..b.width {
                    let mut v = d.coefficients[(y * b.width + x) as usize];
                    let mut lowest = d.lowest_plane;
                    if roi > 0 {
                        v = quantization::roi_shift_down(v, roi);
                        lowest = lowest.saturating_sub(roi);
                    }
                    buf[((b.y_off + y) * rw + b.x_off + x) as usize] =
                        quantization::dequantize(v.unsigned_abs(), v < 0, lowest, step);
                }
            }
        }
        for ((rw, rh), buf) in reduced_dims.iter().zip(f_planes.iter_mut()) {
            Dwt97::inverse_2d(buf, *rw as usize, *rh as usize, max_res);
        }
        if main.cod.mct == 1 && comp_count >= 3 {
            let (a, rest) = f_planes.split_at_mut(1);
            let (b, c) = rest.split_at_mut(1);
            mct::inverse_ict(&mut a[0], &mut b[0], &mut c[0]);
        }
        for (ci, buf) in f_planes.into_iter().enumerate() {
            let mut ints: Vec<i32> = buf.iter().map(|&v| v.round() as i32).collect();
            finish_plane(main, ci, &mut ints);
            out_planes.push(Plane {
                width: reduced_dims[ci].0,
                height: reduced_dims[ci].1,
                samples: ints,
            });
        }
    }
    Ok(out_planes)
}

/// Inverse level shift (unsigned) or range clamp (signed).
fn finish_plane(main: &MainHeader, ci: usize, samples: &mut [i32]) {
    let comp = &main.siz.components[ci];
    if comp.signed {
        let max = (1i64 << (comp.depth - 1)) as i32 - 1;
        let min = -(1i64 << (comp.depth - 1)) as i32;
        for v in samples {
            *v = (*v).clamp(min, max);
        }
    } else {
        mct::level_shift_inverse(samples, comp.depth);
    }
}

