//! Discrete wavelet transforms: reversible 5/3 integer lifting and
//! irreversible 9/7 floating-point lifting, with symmetric extension at
//! the boundaries.
//!
//! The 2D drivers work in place on a tile-component buffer in Mallat
//! layout: after each level the low-pass half of every axis sits first, so
//! level `l` leaves LL in the top-left `ceil(w/2^l) x ceil(h/2^l)` corner
//! and the next level recurses on it alone.

/// Reversible 5/3 filter bank.
pub struct Dwt53;

impl Dwt53 {
    /// Forward 1D transform: `x` in, low coefficients then high
    /// coefficients out (in place).
    pub fn forward_1d(x: &mut [i32]) {
        let len = x.len();
        if len <= 1 {
            return;
        }
        // Predict odd samples, then update even samples.
        let mut i = 1;
        while i < len {
            let left = x[i - 1];
            let right = if i + 1 < len { x[i + 1] } else { x[i - 1] };
            x[i] -= (left + right) >> 1;
            i += 2;
        }
        let mut i = 0;
        while i < len {
            let left = if i > 0 { x[i - 1] } else { x[i + 1] };
            let right = if i + 1 < len { x[i + 1] } else { x[i - 1] };
            x[i] += (left + right + 2) >> 2;
            i += 2;
        }
        deinterleave(x);
    }

    /// Inverse 1D transform: low then high coefficients in, samples out.
    pub fn inverse_1d(x: &mut [i32]) {
        let len = x.len();
        if len <= 1 {
            return;
        }
        interleave(x);
        let mut i = 0;
        while i < len {
            let left = if i > 0 { x[i - 1] } else { x[i + 1] };
            let right = if i + 1 < len { x[i + 1] } else { x[i - 1] };
            x[i] -= (left + right + 2) >> 2;
            i += 2;
        }
        let mut i = 1;
        while i < len {
            let left = x[i - 1];
            let right = if i + 1 < len { x[i + 1] } else { x[i - 1] };
            x[i] += (left + right) >> 1;
            i += 2;
        }
    }

    /// Multi-level forward 2D transform, rows then columns per level.
    pub fn forward_2d(data: &mut [i32], width: usize, height: usize, levels: u8) {
        let mut scratch = vec![0i32; width.max(height)];
        for l in 0..levels {
            let w = level_dim(width, l);
            let h = level_dim(height, l);
            for y in 0..h {
                let row = &mut scratch[..w];
                for (x, v) in row.iter_mut().enumerate() {
                    *v = data[y * width + x];
                }
                Self::forward_1d(row);
                for (x, v) in row.iter().enumerate() {
                    data[y * width + x] = *v;
                }
            }
            for x in 0..w {
                let col = &mut scratch[..h];
                for (y, v) in col.iter_mut().enumerate() {
                    *v = data[y * width + x];
                }
                Self::forward_1d(col);
                for (y, v) in col.iter().enumerate() {
                    data[y * width + x] = *v;
                }
            }
        }
    }

    /// Multi-level inverse 2D transform; undoes `forward_2d` exactly.
    pub fn inverse_2d(data: &mut [i32], width: usize, height: usize, levels: u8) {
        let mut scratch = vec![0i32; width.max(height)];
        for l in (0..levels).rev() {
            let w = level_dim(width, l);
            let h = level_dim(height, l);
            for x in 0..w {
                let col = &mut scratch[..h];
                for (y, v) in col.iter_mut().enumerate() {
                    *v = data[y * width + x];
                }
                Self::inverse_1d(col);
                for (y, v) in col.iter().enumerate() {
                    data[y * width + x] = *v;
                }
            }
            for y in 0..h {
                let row = &mut scratch[..w];
                for (x, v) in row.iter_mut().enumerate() {
                    *v = data[y * width + x];
                }
                Self::inverse_1d(row);
                for (x, v) in row.iter().enumerate() {
                    data[y * width + x] = *v;
                }
            }
        }
    }
}

/// Irreversible 9/7 filter bank.
pub struct Dwt97;

impl Dwt97 {
    const ALPHA: f32 = -1.586_134_3;
    const BETA: f32 = -0.052_980_118;
    const GAMMA: f32 = 0.882_911_1;
    const DELTA: f32 = 0.443_506_85;
    const K: f32 = 1.230_174_1;
    const INV_K: f32 = 1.0 / 1.230_174_1;

    fn lift_odd(x: &mut [f32], coeff: f32) {
        let len = x.len();
        let mut i = 1;
        while i < len {
            let left = x[i - 1];
            let right = if i + 1 < len { x[i + 1] } else { x[i - 1] };
            x[i] += coeff * (left + right);
            i += 2;
        }
    }

    fn lift_even(x: &mut [f32], coeff: f32) {
        let len = x.len();
        let mut i = 0;
        while i < len {
            let left = if i > 0 { x[i - 1] } else { x[i + 1] };
            let right = if i + 1 < len { x[i + 1] } else { x[i - 1] };
            x[i] += coeff * (left + right);
            i += 2;
        }
    }

    pub fn forward_1d(x: &mut [f32]) {
        let len = x.len();
        if len <= 1 {
            return;
        }
        Self::lift_odd(x, Self::ALPHA);
        Self::lift_even(x, Self::BETA);
        Self::lift_odd(x, Self::GAMMA);
        Self::lift_even(x, Self::DELTA);
        for (i, v) in x.iter_mut().enumerate() {
            *v *= if i % 2 == 0 { Self::INV_K } else { Self::K };
        }
        deinterleave_f32(x);
    }

    pub fn inverse_1d(x: &mut [f32]) {
        let len = x.len();
        if len <= 1 {
            return;
        }
        interleave_f32(x);
        for (i, v) in x.iter_mut().enumerate() {
            *v *= if i % 2 == 0 { Self::K } else { Self::INV_K };
        }
        Self::lift_even(x, -Self::DELTA);
        Self::lift_odd(x, -Self::GAMMA);
        Self::lift_even(x, -Self::BETA);
        Self::lift_odd(x, -Self::ALPHA);
    }

    pub fn forward_2d(data: &mut [f32], width: usize, height: usize, levels: u8) {
        let mut scratch = vec![0f32; width.max(height)];
        for l in 0..levels {
            let w = level_dim(width, l);
            let h = level_dim(height, l);
            for y in 0..h {
                let row = &mut scratch[..w];
                for (x, v) in row.iter_mut().enumerate() {
                    *v = data[y * width + x];
                }
                Self::forward_1d(row);
                for (x, v) in row.iter().enumerate() {
                    data[y * width + x] = *v;
                }
            }
            for x in 0..w {
                let col = &mut scratch[..h];
                for (y, v) in col.iter_mut().enumerate() {
                    *v = data[y * width + x];
                }
                Self::forward_1d(col);
                for (y, v) in col.iter().enumerate() {
                    data[y * width + x] = *v;
                }
            }
        }
    }

    pub fn inverse_2d(data: &mut [f32], width: usize, height: usize, levels: u8) {
        let mut scratch = vec![0f32; width.max(height)];
        for l in (0..levels).rev() {
            let w = level_dim(width, l);
            let h = level_dim(height, l);
            for x in 0..w {
                let col = &mut scratch[..h];
                for (y, v) in col.iter_mut().enumerate() {
                    *v = data[y * width + x];
                }
                Self::inverse_1d(col);
                for (y, v) in col.iter().enumerate() {
                    data[y * width + x] = *v;
                }
            }
            for y in 0..h {
                let row = &mut scratch[..w];
                for (x, v) in row.iter_mut().enumerate() {
                    *v = data[y * width + x];
                }
                Self::inverse_1d(row);
                for (x, v) in row.iter().enumerate() {
                    data[y * width + x] = *v;
                }
            }
        }
    }
}

/// Size of the low-pass region after `level` decompositions.
pub fn level_dim(extent: usize, level: u8) -> usize {
    let mut e = extent;
    for _ in 0..level {
        e = e.div_ceil(2);
    }
    e
}

fn deinterleave(x: &mut [i32]) {
    let tmp: Vec<i32> = x.to_vec();
    let half = x.len().div_ceil(2);
    for (i, &v) in tmp.iter().enumerate() {
        if i % 2 == 0 {
            x[i / 2] = v;
        } else {
            x[half + i / 2] = v;
        }
    }
}

fn interleave(x: &mut [i32]) {
    let tmp: Vec<i32> = x.to_vec();
    let half = x.len().div_ceil(2);
    for i in 0..x.len() {
        x[i] = if i % 2 == 0 {
            tmp[i / 2]
        } else {
            tmp[half + i / 2]
        };
    }
}

fn deinterleave_f32(x: &mut [f32]) {
    let tmp: Vec<f32> = x.to_vec();
    let half = x.len().div_ceil(2);
    for (i, &v) in tmp.iter().enumerate() {
        if i % 2 == 0 {
            x[i / 2] = v;
        } else {
            x[half + i / 2] = v;
        }
    }
}

fn interleave_f32(x: &mut [f32]) {
    let tmp: Vec<f32> = x.to_vec();
    let half = x.len().div_ceil(2);
    for i in 0..x.len() {
        x[i] = if i % 2 == 0 {
            tmp[i / 2]
        } else {
            tmp[half + i / 2]
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dwt53_1d_roundtrip_even_and_odd_lengths() {
        for len in [1usize, 2, 3, 5, 8, 13, 64, 65] {
            let input: Vec<i32> = (0..len as i32).map(|i| (i * 37) % 251 - 120).collect();
            let mut buf = input.clone();
            Dwt53::forward_1d(&mut buf);
            Dwt53::inverse_1d(&mut buf);
            assert_eq!(buf, input, "length {len}");
        }
    }

    #[test]
    fn dwt53_2d_multilevel_roundtrip() {
        for (w, h, levels) in [(8usize, 8usize, 3u8), (16, 16, 4), (17, 9, 3), (1, 1, 5), (33, 1, 2)] {
            let input: Vec<i32> = (0..w * h).map(|i| ((i * 97) % 511) as i32 - 255).collect();
            let mut buf = input.clone();
            Dwt53::forward_2d(&mut buf, w, h, levels);
            Dwt53::inverse_2d(&mut buf, w, h, levels);
            assert_eq!(buf, input, "{w}x{h} levels {levels}");
        }
    }

    #[test]
    fn dwt97_roundtrip_within_precision() {
        let (w, h) = (32usize, 24usize);
        let input: Vec<f32> = (0..w * h).map(|i| ((i * 53) % 509) as f32 - 254.0).collect();
        let mut buf = input.clone();
        Dwt97::forward_2d(&mut buf, w, h, 4);
        Dwt97::inverse_2d(&mut buf, w, h, 4);
        for (i, (&a, &b)) in input.iter().zip(&buf).enumerate() {
            assert!((a - b).abs() < 1e-2, "sample {i}: {a} vs {b}");
        }
    }

    #[test]
    fn level_dims_follow_ceil_halving() {
        assert_eq!(level_dim(256, 0), 256);
        assert_eq!(level_dim(256, 3), 32);
        assert_eq!(level_dim(17, 1), 9);
        assert_eq!(level_dim(17, 2), 5);
        assert_eq!(level_dim(1, 7), 1);
    }

    #[test]
    fn forward_low_band_is_average_like() {
        // A constant signal must keep its value in the low band and
        // produce zero high-band coefficients.
        let mut buf = vec![100i32; 16];
        Dwt53::forward_1d(&mut buf);
        assert!(buf[..8].iter().all(|&v| v == 100));
        assert!(buf[8..].iter().all(|&v| v == 0));
    }
}
