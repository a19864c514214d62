//! The end-to-end scenarios, with literal inputs and expected outputs.

mod common;

use common::{checkerboard_rgb, gradient_image, psnr, random_image};
use j2kodec::{
    decode, decode_partial, encode, DecodeOptions, EncoderConfig, Error, Image,
    PartialDecodeSpec, ProgressionOrder,
};

/// 1x1 single-component image, reversible: exact value back, SOC first,
/// EOC last, SIZ present, COD says reversible.
#[test]
fn scenario_1_single_pixel() {
    let img = Image::from_gray8(1, 1, &[128]).unwrap();
    let bytes = encode(&img, &EncoderConfig::default()).unwrap();

    assert_eq!(&bytes[..2], &[0xFF, 0x4F], "SOC first");
    assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9], "EOC last");
    assert!(bytes.windows(2).any(|w| w == [0xFF, 0x51]), "SIZ present");
    let info = j2kodec::inspect(&bytes).unwrap();
    assert!(info.reversible, "COD reversible flag");

    let decoded = decode(&bytes, &DecodeOptions::default()).unwrap();
    assert_eq!((decoded.width, decoded.height), (1, 1));
    assert_eq!(decoded.components[0].samples, vec![128]);
}

/// 16x16 RGB checkerboard in HT mode: exact round-trip and a CAP marker
/// declaring the HT capability.
#[test]
fn scenario_2_ht_checkerboard() {
    let img = checkerboard_rgb(16, 16);
    let cfg = EncoderConfig {
        use_ht: true,
        ..Default::default()
    };
    let bytes = encode(&img, &cfg).unwrap();

    let cap_pos = bytes
        .windows(2)
        .position(|w| w == [0xFF, 0x50])
        .expect("CAP marker present");
    // Pcap follows the 2-byte length; bit 14 set in its last byte pair.
    let pcap = u32::from_be_bytes(bytes[cap_pos + 4..cap_pos + 8].try_into().unwrap());
    assert_ne!(pcap & (1 << 14), 0, "HT capability declared");
    assert!(j2kodec::inspect(&bytes).unwrap().ht);

    let decoded = decode(&bytes, &DecodeOptions::default()).unwrap();
    assert_eq!(decoded, img);
}

/// 256x256 gradient with 5 levels and 4 layers at 1.0 bpp: decoding a
/// layer prefix lands near the full-rate reconstruction quality ladder.
#[test]
fn scenario_3_layered_gradient() {
    let img = gradient_image(256, 256);
    let cfg = EncoderConfig {
        decomposition_levels: 5,
        quality_layers: 4,
        bitrate: Some(1.0),
        ..Default::default()
    };
    let bytes = encode(&img, &cfg).unwrap();

    let mut quality = Vec::new();
    for layer in 0..4u16 {
        let spec = PartialDecodeSpec {
            max_layer: Some(layer),
            ..Default::default()
        };
        let decoded = decode_partial(&bytes, &spec, &DecodeOptions::default()).unwrap();
        quality.push(psnr(&img, &decoded));
    }
    for w in quality.windows(2) {
        assert!(w[1] + 0.01 >= w[0], "quality ladder {quality:?}");
    }
    // Layers 0..2 must already be a usable image.
    assert!(quality[2] > 25.0, "intermediate layers too poor: {quality:?}");
}

/// 1024x1024 RGB noise, RPCL, 256-tiles, window decode equals the crop of
/// a full decode.
#[test]
fn scenario_4_windowed_decode_matches_crop() {
    let img = random_image(1024, 1024, 3, 0xD1CE);
    let cfg = EncoderConfig {
        progression: ProgressionOrder::Rpcl,
        tile_size: Some((256, 256)),
        decomposition_levels: 5,
        quality_layers: 3,
        ..Default::default()
    };
    let bytes = encode(&img, &cfg).unwrap();

    let full = decode(&bytes, &DecodeOptions::default()).unwrap();
    assert_eq!(full, img);

    let spec = PartialDecodeSpec {
        window: Some((128, 128, 384, 384)),
        ..Default::default()
    };
    let windowed = decode_partial(&bytes, &spec, &DecodeOptions::default()).unwrap();
    assert_eq!((windowed.width, windowed.height), (256, 256));
    for c in 0..3 {
        for y in 0..256u32 {
            for x in 0..256u32 {
                assert_eq!(
                    windowed.components[c].sample(x, y),
                    img.components[c].sample(x + 128, y + 128),
                    "component {c} at ({x},{y})"
                );
            }
        }
    }
}

/// SIZ with zero image width decodes as malformed.
#[test]
fn scenario_5_zero_width_is_malformed() {
    let img = gradient_image(8, 8);
    let mut bytes = encode(&img, &EncoderConfig::default()).unwrap();
    let siz = bytes.windows(2).position(|w| w == [0xFF, 0x51]).unwrap();
    // Xsiz sits after marker (2), length (2) and Rsiz (2).
    bytes[siz + 6..siz + 10].copy_from_slice(&0u32.to_be_bytes());
    assert!(matches!(
        decode(&bytes, &DecodeOptions::default()),
        Err(Error::MalformedBytestream(_))
    ));
}

/// A codestream truncated right after SOC decodes as truncated input.
#[test]
fn scenario_6_truncated_after_soc() {
    let bytes = [0xFF, 0x4F];
    assert!(matches!(
        decode(&bytes, &DecodeOptions::default()),
        Err(Error::TruncatedInput(_))
    ));
}
