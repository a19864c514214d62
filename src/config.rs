//! Encoder and decoder configuration, validated before any work begins.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{Error, Result};

/// Packet sequencing order (SGcod progression field values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ProgressionOrder {
    #[default]
    /// Layer, resolution, component, position.
    Lrcp = 0,
    /// Resolution, layer, component, position.
    Rlcp = 1,
    /// Resolution, position, component, layer.
    Rpcl = 2,
    /// Position, component, resolution, layer.
    Pcrl = 3,
    /// Component, position, resolution, layer.
    Cprl = 4,
}

/// Advisory cancellation token, checked between tiles and between
/// code-blocks. Cancellation surfaces as [`Error::OperationCancelled`]
/// and no partial codestream is emitted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::OperationCancelled)
        } else {
            Ok(())
        }
    }
}

/// Region-of-interest mask callable: `(x, y) -> inside ROI`, in image
/// coordinates of the full-resolution grid.
pub type RoiMask = Arc<dyn Fn(u32, u32) -> bool + Send + Sync>;

/// Encoder configuration. `Default` produces a lossless single-layer
/// LRCP codestream with 5 decomposition levels and 64x64 code-blocks.
#[derive(Clone)]
pub struct EncoderConfig {
    pub progression: ProgressionOrder,
    /// DWT decomposition depth, 0..=32.
    pub decomposition_levels: u8,
    /// Code-block nominal size; both dimensions powers of two in 4..=1024,
    /// product at most 4096.
    pub code_block_size: (u32, u32),
    /// Number of quality layers, 1..=65535.
    pub quality_layers: u16,
    /// Target rate in bits per pixel for the final layer. Mutually
    /// exclusive with `target_quality`.
    pub bitrate: Option<f64>,
    /// Target quality in [0, 1]; drives the irreversible base step size.
    pub target_quality: Option<f64>,
    /// When strict, the rate controller never exceeds the byte target;
    /// otherwise the last pass of a layer may overshoot slightly.
    pub strict_rate: bool,
    /// Reversible path: RCT + 5/3 wavelet + unit quantizer.
    pub reversible: bool,
    /// Tile size on the reference grid; `None` encodes a single tile.
    pub tile_size: Option<(u32, u32)>,
    /// Use the Part 15 (HTJ2K) block coder instead of EBCOT/MQ.
    pub use_ht: bool,
    /// Quantization headroom bits, 0..=7.
    pub guard_bits: u8,
    /// Selective arithmetic bypass: raw-coded SP/MR passes after the
    /// fourth coded bit-plane.
    pub selective_bypass: bool,
    /// Terminate the arithmetic coder on every pass. The encoder always
    /// terminates per pass internally; this flag only mirrors the caller's
    /// request into the signalled style byte together with the default.
    pub restart_on_pass: bool,
    /// Reset context states at each pass boundary.
    pub reset_context: bool,
    /// Restrict context formation to the current stripe (no neighbours
    /// from the row below the stripe).
    pub vertically_causal_context: bool,
    /// Use predictable termination for every segment.
    pub predictable_termination: bool,
    /// Append segmentation symbols at the end of each cleanup pass.
    pub segmentation_symbols: bool,
    /// Optional ROI mask; encoded with the maxshift method and signalled
    /// via RGN markers.
    pub roi: Option<RoiMask>,
    pub cancel: Option<CancelToken>,
    /// Optional caller-provided pool; the global rayon pool otherwise.
    pub thread_pool: Option<Arc<rayon::ThreadPool>>,
    /// Byte budget for working buffers.
    pub memory_limit: Option<usize>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            progression: ProgressionOrder::Lrcp,
            decomposition_levels: 5,
            code_block_size: (64, 64),
            quality_layers: 1,
            bitrate: None,
            target_quality: None,
            strict_rate: false,
            reversible: true,
            tile_size: None,
            use_ht: false,
            guard_bits: 2,
            selective_bypass: false,
            restart_on_pass: false,
            reset_context: false,
            vertically_causal_context: false,
            predictable_termination: false,
            segmentation_symbols: false,
            roi: None,
            cancel: None,
            thread_pool: None,
            memory_limit: None,
        }
    }
}

impl fmt::Debug for EncoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderConfig")
            .field("progression", &self.progression)
            .field("decomposition_levels", &self.decomposition_levels)
            .field("code_block_size", &self.code_block_size)
            .field("quality_layers", &self.quality_layers)
            .field("bitrate", &self.bitrate)
            .field("target_quality", &self.target_quality)
            .field("reversible", &self.reversible)
            .field("tile_size", &self.tile_size)
            .field("use_ht", &self.use_ht)
            .field("guard_bits", &self.guard_bits)
            .field("roi", &self.roi.as_ref().map(|_| "<mask>"))
            .finish_non_exhaustive()
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.decomposition_levels > 32 {
            return Err(Error::InvalidParameter("decomposition_levels must be 0..=32"));
        }
        let (cw, ch) = self.code_block_size;
        if !cw.is_power_of_two() || !ch.is_power_of_two() {
            return Err(Error::InvalidParameter("code_block_size must be powers of two"));
        }
        if !(4..=1024).contains(&cw) || !(4..=1024).contains(&ch) {
            return Err(Error::InvalidParameter("code_block dimension must be 4..=1024"));
        }
        if cw * ch > 4096 {
            return Err(Error::InvalidParameter("code_block area must be <= 4096"));
        }
        if self.quality_layers == 0 {
            return Err(Error::InvalidParameter("quality_layers must be >= 1"));
        }
        if self.bitrate.is_some() && self.target_quality.is_some() {
            return Err(Error::InvalidParameter(
                "bitrate and target_quality are mutually exclusive",
            ));
        }
        if let Some(rate) = self.bitrate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(Error::InvalidParameter("bitrate must be positive"));
            }
        }
        if let Some(q) = self.target_quality {
            if !(0.0..=1.0).contains(&q) {
                return Err(Error::InvalidParameter("target_quality must be in [0, 1]"));
            }
        }
        if let Some((tw, th)) = self.tile_size {
            if tw == 0 || th == 0 {
                return Err(Error::InvalidParameter("tile dimensions must be nonzero"));
            }
        }
        if self.guard_bits > 7 {
            return Err(Error::InvalidParameter("guard_bits must be 0..=7"));
        }
        Ok(())
    }
}

/// Options honoured by `decode` and `decode_partial`.
#[derive(Clone, Default)]
pub struct DecodeOptions {
    /// Byte budget for decoded sample buffers.
    pub memory_limit: Option<usize>,
    pub cancel: Option<CancelToken>,
    pub thread_pool: Option<Arc<rayon::ThreadPool>>,
}

impl fmt::Debug for DecodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeOptions")
            .field("memory_limit", &self.memory_limit)
            .finish_non_exhaustive()
    }
}

/// Region/resolution/layer restriction for `decode_partial`.
#[derive(Debug, Clone, Default)]
pub struct PartialDecodeSpec {
    /// Half-open pixel window `(x0, y0, x1, y1)` on the full-resolution
    /// grid. `None` decodes the whole image.
    pub window: Option<(u32, u32, u32, u32)>,
    /// Highest resolution level to reconstruct; the image shrinks by
    /// `2^(levels - max_resolution_level)` per axis.
    pub max_resolution_level: Option<u8>,
    /// Decode only layers `0..=max_layer`.
    pub max_layer: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EncoderConfig::default().validate().unwrap();
    }

    #[test]
    fn oversized_code_block_rejected() {
        let cfg = EncoderConfig {
            code_block_size: (128, 64),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn conflicting_rate_targets_rejected() {
        let cfg = EncoderConfig {
            bitrate: Some(1.0),
            target_quality: Some(0.9),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cancel_token_observed() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert_eq!(token.check(), Err(Error::OperationCancelled));
    }
}
