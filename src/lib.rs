/*!
# j2kodec

`j2kodec` is a pure Rust encoder and decoder for the JPEG 2000 still-image
codestream: the Part 1 (ISO/IEC 15444-1) EBCOT/MQ coding path and the
Part 15 (ISO/IEC 15444-15, HTJ2K) fast block coder.

## Pipeline

Encoding runs image -> colour transform -> wavelet transform -> quantizer
-> Tier-1 block coding -> rate control -> Tier-2 packets -> codestream
markers; decoding is the strict inverse. Tiles are independent and are
processed in parallel; the emitted bytes are identical regardless of
scheduling.

- **Codestream**: SOC/SIZ/COD/QCD main header, CAP+CPF for HT, SOT/SOD
  tile-parts, TLM/PLT length records, EOC.
- **Tier-2**: tag-tree coded packet headers under any of the five
  progression orders, PCRD-opt quality layers.
- **Tier-1**: the legacy three-pass MQ coder with the standard context
  model and the six code-block style variations, or the HT cleanup /
  refinement coder with MEL, VLC and MagSgn sub-streams.
- **Transforms**: reversible 5/3 and irreversible 9/7 lifting, RCT/ICT.

## Example

```no_run
use j2kodec::{decode, encode, DecodeOptions, EncoderConfig, Image};

let image = Image::from_gray8(64, 64, &[128u8; 64 * 64]).unwrap();
let bytes = encode(&image, &EncoderConfig::default()).unwrap();
let roundtrip = decode(&bytes, &DecodeOptions::default()).unwrap();
assert_eq!(roundtrip, image);
```
*/

pub mod bit_io;
pub mod bit_plane_coder;
pub mod config;
pub mod decoder;
pub mod dwt;
pub mod encoder;
pub mod error;
pub mod headers;
pub mod ht_block_coder;
pub mod image;
pub mod markers;
pub mod mct;
pub mod mq_coder;
pub mod packet;
pub mod parser;
pub mod progression;
pub mod quantization;
pub mod rate_control;
pub mod tag_tree;
pub mod tile;
pub mod writer;

pub use config::{CancelToken, DecodeOptions, EncoderConfig, PartialDecodeSpec, ProgressionOrder};
pub use error::{Error, Result};
pub use headers::CodestreamInfo;
pub use image::{Image, ImageComponent};

/// Encodes an image into a raw JPEG 2000 codestream.
pub fn encode(image: &Image, config: &EncoderConfig) -> Result<Vec<u8>> {
    encoder::encode(image, config)
}

/// Decodes a raw JPEG 2000 codestream.
pub fn decode(data: &[u8], options: &DecodeOptions) -> Result<Image> {
    decoder::decode(data, options)
}

/// Decodes a spatial window, resolution level or layer subset; the
/// returned image has correspondingly reduced dimensions.
pub fn decode_partial(
    data: &[u8],
    spec: &PartialDecodeSpec,
    options: &DecodeOptions,
) -> Result<Image> {
    decoder::decode_partial(data, spec, options)
}

/// Reads codestream metadata without decoding pixels.
pub fn inspect(data: &[u8]) -> Result<CodestreamInfo> {
    decoder::inspect(data)
}
