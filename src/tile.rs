//! Tile, resolution, precinct and code-block geometry.
//!
//! All partitions are anchored at the origin and derived with the
//! standard's floor/ceil coordinate arithmetic. The subband layout matches
//! the in-place Mallat arrangement the DWT leaves behind, so a band's
//! `(x_off, y_off)` addresses directly into the tile-component buffer.

use crate::bit_plane_coder::SubbandKind;
use crate::dwt::level_dim;

/// Half-open rectangle on some grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x0 < other.x1 && other.x0 < self.x1 && self.y0 < other.y1 && other.y0 < self.y1
    }
}

/// Row-major tile rectangles covering the image grid.
pub fn tile_rects(img_w: u32, img_h: u32, tile_w: u32, tile_h: u32) -> Vec<Rect> {
    let tx = img_w.div_ceil(tile_w);
    let ty = img_h.div_ceil(tile_h);
    let mut out = Vec::with_capacity((tx * ty) as usize);
    for j in 0..ty {
        for i in 0..tx {
            out.push(Rect {
                x0: i * tile_w,
                y0: j * tile_h,
                x1: ((i + 1) * tile_w).min(img_w),
                y1: ((j + 1) * tile_h).min(img_h),
            });
        }
    }
    out
}

/// One subband's placement inside the tile-component buffer.
#[derive(Debug, Clone, Copy)]
pub struct BandGeom {
    pub kind: SubbandKind,
    pub x_off: u32,
    pub y_off: u32,
    pub width: u32,
    pub height: u32,
}

/// One resolution level of the pyramid: level 0 is the lowest LL, each
/// higher level adds its HL/LH/HH detail bands.
#[derive(Debug, Clone)]
pub struct ResolutionGeom {
    pub level: u8,
    pub width: u32,
    pub height: u32,
    pub bands: Vec<BandGeom>,
}

/// Builds the resolution pyramid for a `width x height` tile-component
/// decomposed `levels` times.
pub fn build_resolutions(width: u32, height: u32, levels: u8) -> Vec<ResolutionGeom> {
    let mut out = Vec::with_capacity(levels as usize + 1);
    let ll_w = level_dim(width as usize, levels) as u32;
    let ll_h = level_dim(height as usize, levels) as u32;
    out.push(ResolutionGeom {
        level: 0,
        width: ll_w,
        height: ll_h,
        bands: vec![BandGeom {
            kind: SubbandKind::LL,
            x_off: 0,
            y_off: 0,
            width: ll_w,
            height: ll_h,
        }],
    });
    for r in 1..=levels {
        let l = levels - r + 1; // decomposition level that produced these bands
        let w_l = level_dim(width as usize, l) as u32;
        let h_l = level_dim(height as usize, l) as u32;
        let w_prev = level_dim(width as usize, l - 1) as u32;
        let h_prev = level_dim(height as usize, l - 1) as u32;
        out.push(ResolutionGeom {
            level: r,
            width: w_prev,
            height: h_prev,
            bands: vec![
                BandGeom {
                    kind: SubbandKind::HL,
                    x_off: w_l,
                    y_off: 0,
                    width: w_prev - w_l,
                    height: h_l,
                },
                BandGeom {
                    kind: SubbandKind::LH,
                    x_off: 0,
                    y_off: h_l,
                    width: w_l,
                    height: h_prev - h_l,
                },
                BandGeom {
                    kind: SubbandKind::HH,
                    x_off: w_l,
                    y_off: h_l,
                    width: w_prev - w_l,
                    height: h_prev - h_l,
                },
            ],
        });
    }
    out
}

/// Default precinct size exponent: effectively one precinct per
/// resolution for any realistic tile.
pub const PRECINCT_EXP: u8 = 15;

/// One code-block inside a subband (band-local coordinates).
#[derive(Debug, Clone, Copy)]
pub struct BlockGeom {
    pub x0: u32,
    pub y0: u32,
    pub width: u32,
    pub height: u32,
}

/// The code-blocks one precinct contributes from one subband, with the
/// grid shape its packet-header tag trees are sized to.
#[derive(Debug, Clone)]
pub struct PrecinctBand {
    /// Index into the resolution's `bands`.
    pub band_index: usize,
    pub grid_w: u32,
    pub grid_h: u32,
    pub blocks: Vec<BlockGeom>,
}

/// One precinct of a resolution.
#[derive(Debug, Clone)]
pub struct PrecinctGeom {
    /// Rectangle on the full-resolution tile grid, for window filtering.
    pub full_res_rect: Rect,
    pub bands: Vec<PrecinctBand>,
}

/// Partitions a resolution into precincts and their per-band code-blocks.
pub fn build_precincts(
    res: &ResolutionGeom,
    levels: u8,
    cb_w: u32,
    cb_h: u32,
) -> Vec<PrecinctGeom> {
    if res.width == 0 || res.height == 0 {
        return Vec::new();
    }
    let p = 1u64 << PRECINCT_EXP;
    let px_count = (res.width as u64).div_ceil(p) as u32;
    let py_count = (res.height as u64).div_ceil(p) as u32;
    // Bands of resolution r sit one dyadic level below the resolution
    // grid, except at resolution zero.
    let band_shift = u8::from(res.level > 0);
    let res_shift = levels - res.level; // resolution grid -> full-res shift
    let band_p = p >> band_shift;

    let mut out = Vec::with_capacity((px_count * py_count) as usize);
    for py in 0..py_count {
        for px in 0..px_count {
            let mut bands = Vec::with_capacity(res.bands.len());
            for (band_index, band) in res.bands.iter().enumerate() {
                let bx0 = (px as u64 * band_p).min(band.width as u64) as u32;
                let bx1 = ((px as u64 + 1) * band_p).min(band.width as u64) as u32;
                let by0 = (py as u64 * band_p).min(band.height as u64) as u32;
                let by1 = ((py as u64 + 1) * band_p).min(band.height as u64) as u32;
                let gx0 = bx0 / cb_w;
                let gx1 = bx1.div_ceil(cb_w);
                let gy0 = by0 / cb_h;
                let gy1 = by1.div_ceil(cb_h);
                let (grid_w, grid_h) = (gx1.saturating_sub(gx0), gy1.saturating_sub(gy0));
                let mut blocks = Vec::with_capacity((grid_w * grid_h) as usize);
                for gy in gy0..gy1 {
                    for gx in gx0..gx1 {
                        let x0 = gx * cb_w;
                        let y0 = gy * cb_h;
                        blocks.push(BlockGeom {
                            x0,
                            y0,
                            width: (band.width - x0).min(cb_w),
                            height: (band.height - y0).min(cb_h),
                        });
                    }
                }
                bands.push(PrecinctBand {
                    band_index,
                    grid_w,
                    grid_h,
                    blocks,
                });
            }
            let fx0 = ((px as u64 * p) << res_shift).min(u32::MAX as u64) as u32;
            let fy0 = ((py as u64 * p) << res_shift).min(u32::MAX as u64) as u32;
            let fx1 = (((px as u64 + 1) * p) << res_shift).min(u32::MAX as u64) as u32;
            let fy1 = (((py as u64 + 1) * p) << res_shift).min(u32::MAX as u64) as u32;
            out.push(PrecinctGeom {
                full_res_rect: Rect {
                    x0: fx0,
                    y0: fy0,
                    x1: fx1,
                    y1: fy1,
                },
                bands,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_partition_covers_image() {
        let tiles = tile_rects(1000, 600, 256, 256);
        assert_eq!(tiles.len(), 4 * 3);
        assert_eq!(tiles[0].width(), 256);
        assert_eq!(tiles[3].width(), 1000 - 3 * 256);
        assert_eq!(tiles.last().unwrap().height(), 600 - 2 * 256);
    }

    #[test]
    fn resolution_pyramid_dims() {
        let res = build_resolutions(17, 9, 2);
        assert_eq!(res.len(), 3);
        // Level 0: ceil(17/4) x ceil(9/4)
        assert_eq!((res[0].width, res[0].height), (5, 3));
        // Resolution 1 covers the level-1 LL grid.
        assert_eq!((res[1].width, res[1].height), (9, 5));
        assert_eq!((res[2].width, res[2].height), (17, 9));

        // HL band of resolution 1: produced by decomposition level 2.
        let hl = &res[1].bands[0];
        assert_eq!(hl.kind, SubbandKind::HL);
        assert_eq!((hl.x_off, hl.y_off), (5, 0));
        assert_eq!((hl.width, hl.height), (4, 3));
        // Band areas of one resolution tile the level grid.
        let area: u32 = res[1].bands.iter().map(|b| b.width * b.height).sum();
        assert_eq!(area + 5 * 3, 9 * 5);
    }

    #[test]
    fn zero_levels_has_single_ll_resolution() {
        let res = build_resolutions(64, 64, 0);
        assert_eq!(res.len(), 1);
        assert_eq!((res[0].width, res[0].height), (64, 64));
        assert_eq!(res[0].bands.len(), 1);
    }

    #[test]
    fn precinct_blocks_tile_each_band() {
        let res = build_resolutions(200, 120, 3);
        for r in &res {
            let precincts = build_precincts(r, 3, 32, 32);
            assert_eq!(precincts.len(), 1, "default precinct spans the resolution");
            for pb in &precincts[0].bands {
                let band = &r.bands[pb.band_index];
                let area: u32 = pb.blocks.iter().map(|b| b.width * b.height).sum();
                assert_eq!(area, band.width * band.height);
                assert_eq!(
                    pb.blocks.len() as u32,
                    pb.grid_w * pb.grid_h,
                    "grid shape matches block list"
                );
            }
        }
    }

    #[test]
    fn empty_band_yields_empty_grid() {
        // A 1x1 tile decomposed once has empty detail bands.
        let res = build_resolutions(1, 1, 1);
        let precincts = build_precincts(&res[1], 1, 64, 64);
        for pb in &precincts[0].bands {
            assert_eq!(pb.blocks.len(), 0);
        }
    }
}
