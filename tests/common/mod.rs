//! Shared helpers for the integration suites: deterministic image
//! builders and quality metrics.
#![allow(dead_code)] // each suite uses a different subset

use j2kodec::{Image, ImageComponent};

/// Deterministic xorshift generator so test corpora are reproducible.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    pub fn next_u8(&mut self) -> u8 {
        (self.next_u64() >> 32) as u8
    }
}

pub fn random_image(width: u32, height: u32, components: usize, seed: u64) -> Image {
    let mut rng = XorShift::new(seed);
    let mut img = Image::new(width, height, components, 8);
    for comp in &mut img.components {
        for v in &mut comp.samples {
            *v = rng.next_u8() as i32;
        }
    }
    img
}

pub fn gradient_image(width: u32, height: u32) -> Image {
    let mut img = Image::new(width, height, 1, 8);
    for y in 0..height {
        for x in 0..width {
            img.components[0].samples[(y * width + x) as usize] = (x % 256) as i32;
        }
    }
    img
}

pub fn checkerboard_rgb(width: u32, height: u32) -> Image {
    let mut img = Image::new(width, height, 3, 8);
    for y in 0..height {
        for x in 0..width {
            let v = if (x + y) % 2 == 0 { 0 } else { 255 };
            for comp in &mut img.components {
                comp.samples[(y * width + x) as usize] = v;
            }
        }
    }
    img
}

pub fn mse(a: &ImageComponent, b: &ImageComponent) -> f64 {
    assert_eq!(a.samples.len(), b.samples.len());
    let sum: f64 = a
        .samples
        .iter()
        .zip(&b.samples)
        .map(|(&x, &y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum();
    sum / a.samples.len() as f64
}

/// PSNR in decibels across all components; infinite for identical images.
pub fn psnr(a: &Image, b: &Image) -> f64 {
    assert_eq!(a.components.len(), b.components.len());
    let total: f64 = a
        .components
        .iter()
        .zip(&b.components)
        .map(|(x, y)| mse(x, y))
        .sum::<f64>()
        / a.components.len() as f64;
    if total == 0.0 {
        f64::INFINITY
    } else {
        10.0 * (255.0f64 * 255.0 / total).log10()
    }
}

/// Global-statistics SSIM over the first component, 8x8 windows.
pub fn ssim(a: &Image, b: &Image) -> f64 {
    let (ca, cb) = (&a.components[0], &b.components[0]);
    let (w, h) = (ca.width as usize, ca.height as usize);
    let win = 8usize.min(w).min(h);
    let c1 = (0.01f64 * 255.0) * (0.01 * 255.0);
    let c2 = (0.03f64 * 255.0) * (0.03 * 255.0);

    let mut total = 0.0;
    let mut windows = 0usize;
    let mut wy = 0;
    while wy + win <= h {
        let mut wx = 0;
        while wx + win <= w {
            let n = (win * win) as f64;
            let (mut ma, mut mb) = (0.0, 0.0);
            for y in wy..wy + win {
                for x in wx..wx + win {
                    ma += ca.samples[y * w + x] as f64;
                    mb += cb.samples[y * w + x] as f64;
                }
            }
            ma /= n;
            mb /= n;
            let (mut va, mut vb, mut cov) = (0.0, 0.0, 0.0);
            for y in wy..wy + win {
                for x in wx..wx + win {
                    let da = ca.samples[y * w + x] as f64 - ma;
                    let db = cb.samples[y * w + x] as f64 - mb;
                    va += da * da;
                    vb += db * db;
                    cov += da * db;
                }
            }
            va /= n - 1.0;
            vb /= n - 1.0;
            cov /= n - 1.0;
            total += ((2.0 * ma * mb + c1) * (2.0 * cov + c2))
                / ((ma * ma + mb * mb + c1) * (va + vb + c2));
            windows += 1;
            wx += win;
        }
        wy += win;
    }
    if windows == 0 {
        1.0
    } else {
        total / windows as f64
    }
}
