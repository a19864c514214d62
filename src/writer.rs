//! Codestream writing: structured parameters to marker segments.

use crate::headers::{CapParams, CodParams, QcdParams, QuantStyle, RgnParams, SizParams, SotParams, TlmEntry};
use crate::markers::MarkerCode;

/// Append-only big-endian marker writer.
#[derive(Default)]
pub struct CodestreamWriter {
    out: Vec<u8>,
}

impl CodestreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.out
    }

    fn push_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn push_u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn push_u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn marker(&mut self, code: MarkerCode) {
        self.push_u8(0xFF);
        self.push_u8(code.into());
    }

    /// Emits a marker with its segment body; the length field covers the
    /// body plus itself.
    fn segment(&mut self, code: MarkerCode, body: &[u8]) {
        self.marker(code);
        self.push_u16(body.len() as u16 + 2);
        self.out.extend_from_slice(body);
    }

    pub fn write_soc(&mut self) {
        self.marker(MarkerCode::StartOfCodestream);
    }

    pub fn write_eoc(&mut self) {
        self.marker(MarkerCode::EndOfCodestream);
    }

    pub fn write_sod(&mut self) {
        self.marker(MarkerCode::StartOfData);
    }

    pub fn write_siz(&mut self, siz: &SizParams) {
        let mut body = Vec::with_capacity(36 + siz.components.len() * 3);
        body.extend_from_slice(&siz.rsiz.to_be_bytes());
        body.extend_from_slice(&siz.width.to_be_bytes());
        body.extend_from_slice(&siz.height.to_be_bytes());
        body.extend_from_slice(&siz.x_offset.to_be_bytes());
        body.extend_from_slice(&siz.y_offset.to_be_bytes());
        body.extend_from_slice(&siz.tile_width.to_be_bytes());
        body.extend_from_slice(&siz.tile_height.to_be_bytes());
        body.extend_from_slice(&siz.tile_x_offset.to_be_bytes());
        body.extend_from_slice(&siz.tile_y_offset.to_be_bytes());
        body.extend_from_slice(&(siz.components.len() as u16).to_be_bytes());
        for c in &siz.components {
            body.push((c.depth - 1) | if c.signed { 0x80 } else { 0 });
            body.push(c.dx);
            body.push(c.dy);
        }
        self.segment(MarkerCode::ImageAndTileSize, &body);
    }

    pub fn write_cod(&mut self, cod: &CodParams) {
        let mut body = Vec::with_capacity(10 + cod.precinct_sizes.len());
        body.push(if cod.precinct_sizes.is_empty() { 0x00 } else { 0x01 });
        body.push(cod.progression.into());
        body.extend_from_slice(&cod.layers.to_be_bytes());
        body.push(cod.mct);
        body.push(cod.decomposition_levels);
        body.push(cod.cb_width_exp - 2);
        body.push(cod.cb_height_exp - 2);
        body.push(cod.cblk_style);
        body.push(cod.transformation);
        body.extend_from_slice(&cod.precinct_sizes);
        self.segment(MarkerCode::CodingStyleDefault, &body);
    }

    pub fn write_qcd(&mut self, qcd: &QcdParams) {
        let style_bits = match qcd.style {
            QuantStyle::None => 0u8,
            QuantStyle::ScalarExpounded => 2,
        };
        let mut body = vec![(qcd.guard_bits << 5) | style_bits];
        for step in &qcd.steps {
            match qcd.style {
                QuantStyle::None => body.push(step.to_u8_reversible()),
                QuantStyle::ScalarExpounded => body.extend_from_slice(&step.to_u16().to_be_bytes()),
            }
        }
        self.segment(MarkerCode::QuantizationDefault, &body);
    }

    pub fn write_cap(&mut self, cap: &CapParams) {
        let mut body = Vec::with_capacity(4 + cap.ccap.len() * 2);
        body.extend_from_slice(&cap.pcap.to_be_bytes());
        for c in &cap.ccap {
            body.extend_from_slice(&c.to_be_bytes());
        }
        self.segment(MarkerCode::Capability, &body);
    }

    pub fn write_cpf(&mut self, pcpf: &[u16]) {
        let mut body = Vec::with_capacity(pcpf.len() * 2);
        for v in pcpf {
            body.extend_from_slice(&v.to_be_bytes());
        }
        self.segment(MarkerCode::CorrespondingProfile, &body);
    }

    pub fn write_rgn(&mut self, rgn: &RgnParams, component_count: usize) {
        let mut body = Vec::new();
        if component_count < 257 {
            body.push(rgn.component as u8);
        } else {
            body.extend_from_slice(&rgn.component.to_be_bytes());
        }
        body.push(0); // Srgn: maxshift
        body.push(rgn.shift);
        self.segment(MarkerCode::RegionOfInterest, &body);
    }

    pub fn write_comment(&mut self, text: &str) {
        let mut body = Vec::with_capacity(2 + text.len());
        body.extend_from_slice(&1u16.to_be_bytes()); // Rcom: text
        body.extend_from_slice(text.as_bytes());
        self.segment(MarkerCode::Comment, &body);
    }

    pub fn write_tlm(&mut self, entries: &[TlmEntry]) {
        let mut body = Vec::with_capacity(2 + entries.len() * 6);
        body.push(0); // Ztlm
        body.push(0x50); // Stlm: 16-bit tile indices, 32-bit lengths
        for e in entries {
            body.extend_from_slice(&e.tile_index.to_be_bytes());
            body.extend_from_slice(&e.length.to_be_bytes());
        }
        self.segment(MarkerCode::TilePartLengths, &body);
    }

    /// PLT: packet lengths of one tile-part, coded as 7-bit continuation
    /// varints.
    pub fn write_plt(&mut self, packet_lengths: &[usize]) {
        let mut body = vec![0u8]; // Zplt
        for &len in packet_lengths {
            let mut shift = (usize::BITS - 1 - (len | 1).leading_zeros()) / 7 * 7;
            loop {
                let digit = ((len >> shift) & 0x7F) as u8;
                if shift == 0 {
                    body.push(digit);
                    break;
                }
                body.push(digit | 0x80);
                shift -= 7;
            }
        }
        self.segment(MarkerCode::PacketLengthTilePart, &body);
    }

    pub fn write_sot(&mut self, sot: &SotParams) {
        self.marker(MarkerCode::StartOfTile);
        self.push_u16(10);
        self.push_u16(sot.tile_index);
        self.push_u32(sot.tile_part_len);
        self.push_u8(sot.tile_part_index);
        self.push_u8(sot.num_tile_parts);
    }

    /// Patches a previously written SOT's Psot once the tile length is
    /// known. `sot_pos` is the offset of the SOT marker.
    pub fn patch_psot(&mut self, sot_pos: usize, tile_part_len: u32) {
        self.out[sot_pos + 6..sot_pos + 10].copy_from_slice(&tile_part_len.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgressionOrder;
    use crate::headers::ComponentSiz;
    use crate::parser::{parse_codestream, parse_main_header, ByteCursor};
    use crate::quantization::StepSize;

    fn siz_1x256() -> SizParams {
        SizParams {
            rsiz: 0,
            width: 256,
            height: 256,
            x_offset: 0,
            y_offset: 0,
            tile_width: 256,
            tile_height: 256,
            tile_x_offset: 0,
            tile_y_offset: 0,
            components: vec![ComponentSiz {
                depth: 8,
                signed: false,
                dx: 1,
                dy: 1,
            }],
        }
    }

    fn cod_default() -> CodParams {
        CodParams {
            progression: ProgressionOrder::Rpcl,
            layers: 3,
            mct: 0,
            decomposition_levels: 5,
            cb_width_exp: 6,
            cb_height_exp: 6,
            cblk_style: 0x04,
            transformation: 1,
            precinct_sizes: Vec::new(),
        }
    }

    #[test]
    fn emitted_headers_parse_back() {
        let mut w = CodestreamWriter::new();
        w.write_soc();
        w.write_siz(&siz_1x256());
        w.write_cap(&CapParams {
            pcap: crate::markers::PCAP_HT,
            ccap: vec![0],
        });
        w.write_cod(&cod_default());
        let qcd = QcdParams {
            style: QuantStyle::None,
            guard_bits: 2,
            steps: (0..16)
                .map(|_| StepSize {
                    exponent: 11,
                    mantissa: 0,
                })
                .collect(),
        };
        w.write_qcd(&qcd);
        w.write_comment("j2kodec test");
        w.write_rgn(
            &RgnParams {
                component: 0,
                shift: 5,
            },
            1,
        );
        w.write_sot(&SotParams {
            tile_index: 0,
            tile_part_len: 0,
            tile_part_index: 0,
            num_tile_parts: 1,
        });

        let bytes = w.into_bytes();
        let mut cursor = ByteCursor::new(&bytes);
        let main = parse_main_header(&mut cursor).unwrap();
        assert_eq!(main.siz, siz_1x256());
        assert_eq!(main.cod, cod_default());
        assert_eq!(main.qcd, qcd);
        assert_eq!(main.comments, vec!["j2kodec test".to_string()]);
        assert_eq!(main.rgn.len(), 1);
        assert_eq!(main.rgn[0].shift, 5);
        assert!(main.cap.unwrap().ht());
    }

    #[test]
    fn tile_part_roundtrip_with_psot_patch() {
        let mut w = CodestreamWriter::new();
        w.write_soc();
        w.write_siz(&siz_1x256());
        let mut cod = cod_default();
        cod.layers = 1;
        w.write_cod(&cod);
        w.write_qcd(&QcdParams {
            style: QuantStyle::None,
            guard_bits: 2,
            steps: vec![StepSize {
                exponent: 11,
                mantissa: 0,
            }],
        });
        let sot_pos = w.len();
        w.write_sot(&SotParams {
            tile_index: 0,
            tile_part_len: 0,
            tile_part_index: 0,
            num_tile_parts: 1,
        });
        w.write_plt(&[3, 200, 70000]);
        w.write_sod();
        w.bytes_mut().extend_from_slice(&[0xAB; 7]);
        let tile_len = (w.len() - sot_pos) as u32;
        w.patch_psot(sot_pos, tile_len);
        w.write_eoc();

        let bytes = w.into_bytes();
        let (_, tiles) = parse_codestream(&bytes).unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].data_end - tiles[0].data_start, 7);
        assert_eq!(tiles[0].sot.tile_part_len, tile_len);
    }

    #[test]
    fn expounded_qcd_roundtrip() {
        let mut w = CodestreamWriter::new();
        w.write_soc();
        w.write_siz(&siz_1x256());
        w.write_cod(&cod_default());
        let qcd = QcdParams {
            style: QuantStyle::ScalarExpounded,
            guard_bits: 1,
            steps: vec![
                StepSize {
                    exponent: 9,
                    mantissa: 1024,
                },
                StepSize {
                    exponent: 10,
                    mantissa: 7,
                },
            ],
        };
        w.write_qcd(&qcd);
        w.write_sot(&SotParams {
            tile_index: 0,
            tile_part_len: 0,
            tile_part_index: 0,
            num_tile_parts: 1,
        });
        let bytes = w.into_bytes();
        let mut cursor = ByteCursor::new(&bytes);
        let main = parse_main_header(&mut cursor).unwrap();
        assert_eq!(main.qcd, qcd);
    }
}
