//! Resolution, layer and window truncation behaviour of `decode_partial`.

mod common;

use common::{gradient_image, psnr, random_image};
use j2kodec::{
    decode, decode_partial, encode, DecodeOptions, EncoderConfig, Error, PartialDecodeSpec,
};

#[test]
fn resolution_truncation_matches_pyramid_dims() {
    let img = random_image(200, 120, 1, 0x77);
    let levels = 4u8;
    let cfg = EncoderConfig {
        decomposition_levels: levels,
        ..Default::default()
    };
    let bytes = encode(&img, &cfg).unwrap();
    for r in 0..=levels {
        let spec = PartialDecodeSpec {
            max_resolution_level: Some(r),
            ..Default::default()
        };
        let decoded = decode_partial(&bytes, &spec, &DecodeOptions::default()).unwrap();
        let shift = levels - r;
        let expect_w = (200u32).div_ceil(1 << shift);
        let expect_h = (120u32).div_ceil(1 << shift);
        assert_eq!(
            (decoded.width, decoded.height),
            (expect_w, expect_h),
            "resolution {r}"
        );
    }
}

#[test]
fn low_resolution_preview_resembles_image() {
    let img = gradient_image(128, 128);
    let bytes = encode(&img, &EncoderConfig::default()).unwrap();
    let spec = PartialDecodeSpec {
        max_resolution_level: Some(3),
        ..Default::default()
    };
    let preview = decode_partial(&bytes, &spec, &DecodeOptions::default()).unwrap();
    assert_eq!((preview.width, preview.height), (32, 32));
    // The gradient survives downscaling: strictly increasing row values.
    let row: Vec<i32> = (0..32).map(|x| preview.components[0].sample(x, 16)).collect();
    for w in row.windows(2) {
        assert!(w[1] >= w[0] - 8, "row not gradient-like: {row:?}");
    }
}

#[test]
fn window_decode_from_tiled_stream() {
    let img = random_image(96, 96, 1, 0x1111);
    let cfg = EncoderConfig {
        tile_size: Some((32, 32)),
        ..Default::default()
    };
    let bytes = encode(&img, &cfg).unwrap();
    let spec = PartialDecodeSpec {
        window: Some((40, 8, 72, 56)),
        ..Default::default()
    };
    let windowed = decode_partial(&bytes, &spec, &DecodeOptions::default()).unwrap();
    assert_eq!((windowed.width, windowed.height), (32, 48));
    for y in 0..48u32 {
        for x in 0..32u32 {
            assert_eq!(
                windowed.components[0].sample(x, y),
                img.components[0].sample(x + 40, y + 8)
            );
        }
    }
}

#[test]
fn window_and_resolution_combine() {
    let img = random_image(128, 128, 1, 0x2222);
    let cfg = EncoderConfig {
        tile_size: Some((64, 64)),
        decomposition_levels: 3,
        ..Default::default()
    };
    let bytes = encode(&img, &cfg).unwrap();

    let spec = PartialDecodeSpec {
        window: Some((0, 0, 64, 64)),
        max_resolution_level: Some(2),
        ..Default::default()
    };
    let out = decode_partial(&bytes, &spec, &DecodeOptions::default()).unwrap();
    assert_eq!((out.width, out.height), (32, 32));

    // It must match the top-left quadrant of a whole-image reduced decode.
    let whole = decode_partial(
        &bytes,
        &PartialDecodeSpec {
            max_resolution_level: Some(2),
            ..Default::default()
        },
        &DecodeOptions::default(),
    )
    .unwrap();
    for y in 0..32u32 {
        for x in 0..32u32 {
            assert_eq!(out.components[0].sample(x, y), whole.components[0].sample(x, y));
        }
    }
}

#[test]
fn max_layer_beyond_stream_is_clamped() {
    let img = random_image(32, 32, 1, 0x3333);
    let cfg = EncoderConfig {
        quality_layers: 2,
        ..Default::default()
    };
    let bytes = encode(&img, &cfg).unwrap();
    let spec = PartialDecodeSpec {
        max_layer: Some(100),
        ..Default::default()
    };
    let decoded = decode_partial(&bytes, &spec, &DecodeOptions::default()).unwrap();
    assert_eq!(decoded, img);
}

#[test]
fn empty_window_is_invalid() {
    let img = random_image(16, 16, 1, 0x4444);
    let bytes = encode(&img, &EncoderConfig::default()).unwrap();
    let spec = PartialDecodeSpec {
        window: Some((10, 10, 10, 20)),
        ..Default::default()
    };
    assert!(matches!(
        decode_partial(&bytes, &spec, &DecodeOptions::default()),
        Err(Error::InvalidParameter(_))
    ));
}

#[test]
fn layer_subset_of_rate_controlled_stream_decodes() {
    let img = random_image(64, 64, 3, 0x5555);
    let cfg = EncoderConfig {
        quality_layers: 3,
        bitrate: Some(1.5),
        ..Default::default()
    };
    let bytes = encode(&img, &cfg).unwrap();
    let first = decode_partial(
        &bytes,
        &PartialDecodeSpec {
            max_layer: Some(0),
            ..Default::default()
        },
        &DecodeOptions::default(),
    )
    .unwrap();
    let all = decode(&bytes, &DecodeOptions::default()).unwrap();
    assert!(psnr(&img, &all) + 0.01 >= psnr(&img, &first));
}
