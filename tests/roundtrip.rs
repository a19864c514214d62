//! Round-trip properties: reversible identity, HT/legacy agreement,
//! progression equivalence, layer behaviour and the irreversible quality
//! floor.

mod common;

use common::{checkerboard_rgb, gradient_image, psnr, random_image, ssim};
use j2kodec::{
    decode, decode_partial, encode, DecodeOptions, EncoderConfig, Image, PartialDecodeSpec,
    ProgressionOrder,
};

fn lossless_roundtrip(image: &Image, config: &EncoderConfig) {
    let bytes = encode(image, config).expect("encode");
    let decoded = decode(&bytes, &DecodeOptions::default()).expect("decode");
    assert_eq!(&decoded, image);
}

#[test]
fn reversible_identity_structured_images() {
    for (w, h) in [(1u32, 1u32), (2, 2), (7, 5), (16, 16), (33, 17), (64, 64), (65, 63)] {
        lossless_roundtrip(&gradient_image(w, h), &EncoderConfig::default());
    }
}

#[test]
fn reversible_identity_random_images_multi_component() {
    for &components in &[1usize, 3, 4] {
        let img = random_image(37, 29, components, 0xC0FFEE + components as u64);
        lossless_roundtrip(&img, &EncoderConfig::default());
    }
}

#[test]
fn reversible_identity_with_tiling() {
    let img = random_image(100, 80, 3, 42);
    let cfg = EncoderConfig {
        tile_size: Some((32, 32)),
        ..Default::default()
    };
    lossless_roundtrip(&img, &cfg);
}

#[test]
fn reversible_identity_small_code_blocks() {
    let img = random_image(50, 40, 1, 7);
    let cfg = EncoderConfig {
        code_block_size: (16, 16),
        decomposition_levels: 3,
        ..Default::default()
    };
    lossless_roundtrip(&img, &cfg);
}

#[test]
fn reversible_identity_all_style_flags() {
    let img = random_image(48, 48, 1, 99);
    let cfg = EncoderConfig {
        selective_bypass: true,
        restart_on_pass: true,
        reset_context: true,
        vertically_causal_context: true,
        predictable_termination: true,
        segmentation_symbols: true,
        ..Default::default()
    };
    lossless_roundtrip(&img, &cfg);
}

#[test]
fn reversible_identity_zero_decomposition_levels() {
    let img = random_image(20, 20, 1, 5);
    let cfg = EncoderConfig {
        decomposition_levels: 0,
        ..Default::default()
    };
    lossless_roundtrip(&img, &cfg);
}

#[test]
fn ht_and_legacy_decode_identically() {
    for &(w, h, comps) in &[(16u32, 16u32, 1usize), (40, 24, 3)] {
        let img = random_image(w, h, comps, 0xAB + w as u64);
        let legacy = EncoderConfig::default();
        let ht = EncoderConfig {
            use_ht: true,
            ..Default::default()
        };
        let a = decode(&encode(&img, &legacy).unwrap(), &DecodeOptions::default()).unwrap();
        let b = decode(&encode(&img, &ht).unwrap(), &DecodeOptions::default()).unwrap();
        assert_eq!(a, img);
        assert_eq!(b, img);
    }
}

#[test]
fn progression_orders_decode_to_same_image() {
    let img = random_image(40, 40, 3, 0x51EE7);
    let mut reference: Option<Image> = None;
    for order in [
        ProgressionOrder::Lrcp,
        ProgressionOrder::Rlcp,
        ProgressionOrder::Rpcl,
        ProgressionOrder::Pcrl,
        ProgressionOrder::Cprl,
    ] {
        let cfg = EncoderConfig {
            progression: order,
            quality_layers: 3,
            ..Default::default()
        };
        let decoded = decode(&encode(&img, &cfg).unwrap(), &DecodeOptions::default()).unwrap();
        match &reference {
            None => reference = Some(decoded),
            Some(r) => assert_eq!(&decoded, r, "order {order:?}"),
        }
    }
    assert_eq!(reference.unwrap(), img);
}

#[test]
fn irreversible_meets_quality_floor() {
    let img = gradient_image(64, 64);
    let cfg = EncoderConfig {
        reversible: false,
        target_quality: Some(0.9),
        ..Default::default()
    };
    let decoded = decode(&encode(&img, &cfg).unwrap(), &DecodeOptions::default()).unwrap();
    let p = psnr(&img, &decoded);
    assert!(p >= 38.0, "psnr {p}");
    let s = ssim(&img, &decoded);
    assert!(s >= 0.98, "ssim {s}");
}

#[test]
fn irreversible_quality_is_monotone() {
    let img = random_image(64, 64, 1, 0xBEE);
    let mut last = 0.0;
    for q in [0.3, 0.6, 0.9] {
        let cfg = EncoderConfig {
            reversible: false,
            target_quality: Some(q),
            ..Default::default()
        };
        let decoded = decode(&encode(&img, &cfg).unwrap(), &DecodeOptions::default()).unwrap();
        let p = psnr(&img, &decoded);
        assert!(p >= last, "psnr not monotone: {p} after {last}");
        last = p;
    }
}

#[test]
fn irreversible_ht_roundtrip_quality() {
    let img = checkerboard_rgb(32, 32);
    let cfg = EncoderConfig {
        reversible: false,
        use_ht: true,
        target_quality: Some(0.95),
        ..Default::default()
    };
    let decoded = decode(&encode(&img, &cfg).unwrap(), &DecodeOptions::default()).unwrap();
    assert!(psnr(&img, &decoded) >= 30.0);
}

#[test]
fn layer_truncation_is_monotone() {
    let img = random_image(64, 64, 1, 1234);
    let cfg = EncoderConfig {
        quality_layers: 4,
        bitrate: Some(2.0),
        ..Default::default()
    };
    let bytes = encode(&img, &cfg).unwrap();
    let mut last = 0.0;
    for layer in 0..4u16 {
        let spec = PartialDecodeSpec {
            max_layer: Some(layer),
            ..Default::default()
        };
        let decoded = decode_partial(&bytes, &spec, &DecodeOptions::default()).unwrap();
        let p = psnr(&img, &decoded);
        assert!(
            p + 0.01 >= last,
            "layer {layer}: psnr {p} dropped below {last}"
        );
        last = p;
    }
}

#[test]
fn roi_region_survives_low_rate() {
    let img = random_image(64, 64, 1, 0x5EED);
    let roi: j2kodec::config::RoiMask =
        std::sync::Arc::new(|x: u32, y: u32| (16..32).contains(&x) && (16..32).contains(&y));
    let cfg = EncoderConfig {
        roi: Some(roi),
        ..Default::default()
    };
    // Lossless with ROI still round-trips exactly.
    let decoded = decode(&encode(&img, &cfg).unwrap(), &DecodeOptions::default()).unwrap();
    assert_eq!(decoded, img);
}

#[test]
fn strict_bitrate_bounds_codestream_size() {
    let img = random_image(128, 128, 1, 0xFACE);
    let cfg = EncoderConfig {
        bitrate: Some(0.8),
        strict_rate: true,
        ..Default::default()
    };
    let bytes = encode(&img, &cfg).unwrap();
    // Header overhead rides on top of the packet budget; keep a margin.
    let budget = (0.8 * 128.0 * 128.0 / 8.0) as usize;
    assert!(
        bytes.len() < budget + 1024,
        "stream {} bytes for budget {budget}",
        bytes.len()
    );
    let decoded = decode(&bytes, &DecodeOptions::default()).unwrap();
    assert!(psnr(&img, &decoded) > 10.0);
}

#[test]
fn cancellation_token_aborts_encode() {
    let img = random_image(64, 64, 3, 3);
    let token = j2kodec::CancelToken::new();
    token.cancel();
    let cfg = EncoderConfig {
        cancel: Some(token),
        ..Default::default()
    };
    assert!(matches!(
        encode(&img, &cfg),
        Err(j2kodec::Error::OperationCancelled)
    ));
}

#[test]
fn memory_limit_is_enforced() {
    let img = random_image(64, 64, 1, 4);
    let cfg = EncoderConfig {
        memory_limit: Some(16),
        ..Default::default()
    };
    assert!(matches!(
        encode(&img, &cfg),
        Err(j2kodec::Error::MemoryLimitExceeded { .. })
    ));

    let bytes = encode(&img, &EncoderConfig::default()).unwrap();
    let opts = DecodeOptions {
        memory_limit: Some(16),
        ..Default::default()
    };
    assert!(matches!(
        decode(&bytes, &opts),
        Err(j2kodec::Error::MemoryLimitExceeded { .. })
    ));
}

#[test]
fn inspect_reports_codestream_parameters() {
    let img = random_image(60, 44, 3, 8);
    let cfg = EncoderConfig {
        quality_layers: 2,
        progression: ProgressionOrder::Rpcl,
        tile_size: Some((32, 32)),
        ..Default::default()
    };
    let bytes = encode(&img, &cfg).unwrap();
    let info = j2kodec::inspect(&bytes).unwrap();
    assert_eq!((info.width, info.height), (60, 44));
    assert_eq!(info.components.len(), 3);
    assert_eq!(info.components[0].depth, 8);
    assert_eq!(info.quality_layers, 2);
    assert_eq!(info.progression, ProgressionOrder::Rpcl);
    assert_eq!((info.tile_cols, info.tile_rows), (2, 2));
    assert!(info.reversible);
    assert!(!info.ht);
    assert_eq!(info.tile_part_lengths.len(), 4);
    assert!(info.comments.iter().any(|c| c.contains("j2kodec")));
}
