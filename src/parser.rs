//! Codestream parsing: marker segments to structured parameters.
//!
//! The main header runs SOC..first SOT; tile-part headers run SOT..SOD.
//! Packet data between SOD and the end of a tile-part is located by the
//! SOT length field, never by scanning, so packet bodies cannot emulate
//! markers as far as this parser is concerned. Unknown markers in the
//! reserved range fail as malformed; truncation anywhere fails as
//! truncated input.

use crate::config::ProgressionOrder;
use crate::error::{Error, Result};
use crate::headers::{
    CapParams, CocOverride, CodParams, ComponentSiz, MainHeader, QcdParams, QuantStyle, RgnParams,
    SizParams, SotParams, TilePart, TlmEntry,
};
use crate::markers::{MarkerCode, MARKER_PREFIX};
use crate::quantization::StepSize;

/// Big-endian cursor over the codestream bytes.
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(Error::TruncatedInput("unexpected end of codestream"))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(((self.read_u8()? as u16) << 8) | self.read_u8()? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(((self.read_u16()? as u32) << 16) | self.read_u16()? as u32)
    }

    fn read_marker(&mut self) -> Result<MarkerCode> {
        let prefix = self.read_u8()?;
        if prefix != MARKER_PREFIX {
            return Err(Error::MalformedBytestream("expected marker prefix"));
        }
        let code = self.read_u8()?;
        MarkerCode::try_from(code)
            .map_err(|_| Error::MalformedBytestream("unknown marker in reserved range"))
    }

    /// Reads a marker segment's length field and returns the segment body
    /// as a child cursor, advancing past it.
    fn segment(&mut self) -> Result<ByteCursor<'a>> {
        let len = self.read_u16()? as usize;
        if len < 2 {
            return Err(Error::MalformedBytestream("marker segment length below 2"));
        }
        let body_len = len - 2;
        if body_len > self.remaining() {
            return Err(Error::TruncatedInput("marker segment overruns codestream"));
        }
        let body = &self.data[self.pos..self.pos + body_len];
        self.pos += body_len;
        Ok(ByteCursor::new(body))
    }
}

fn parse_siz(seg: &mut ByteCursor<'_>) -> Result<SizParams> {
    let rsiz = seg.read_u16()?;
    let width_total = seg.read_u32()?;
    let height_total = seg.read_u32()?;
    let x_offset = seg.read_u32()?;
    let y_offset = seg.read_u32()?;
    let tile_width = seg.read_u32()?;
    let tile_height = seg.read_u32()?;
    let tile_x_offset = seg.read_u32()?;
    let tile_y_offset = seg.read_u32()?;
    let count = seg.read_u16()?;

    if width_total == 0 || height_total == 0 {
        return Err(Error::MalformedBytestream("SIZ image dimensions are zero"));
    }
    if width_total <= x_offset || height_total <= y_offset {
        return Err(Error::MalformedBytestream("SIZ offsets exceed image size"));
    }
    if tile_width == 0 || tile_height == 0 {
        return Err(Error::MalformedBytestream("SIZ tile dimensions are zero"));
    }
    if count == 0 {
        return Err(Error::MalformedBytestream("SIZ declares zero components"));
    }

    let mut components = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let ssiz = seg.read_u8()?;
        let depth = (ssiz & 0x7F) + 1;
        if depth > 38 {
            return Err(Error::MalformedBytestream("component depth above 38"));
        }
        let dx = seg.read_u8()?;
        let dy = seg.read_u8()?;
        if !matches!(dx, 1 | 2 | 4) || !matches!(dy, 1 | 2 | 4) {
            return Err(Error::MalformedBytestream("unsupported sub-sampling factor"));
        }
        components.push(ComponentSiz {
            depth,
            signed: ssiz & 0x80 != 0,
            dx,
            dy,
        });
    }
    Ok(SizParams {
        rsiz,
        width: width_total,
        height: height_total,
        x_offset,
        y_offset,
        tile_width,
        tile_height,
        tile_x_offset,
        tile_y_offset,
        components,
    })
}

fn parse_cod(seg: &mut ByteCursor<'_>) -> Result<CodParams> {
    let scod = seg.read_u8()?;
    let progression = ProgressionOrder::try_from(seg.read_u8()?)
        .map_err(|_| Error::MalformedBytestream("invalid progression order"))?;
    let layers = seg.read_u16()?;
    if layers == 0 {
        return Err(Error::MalformedBytestream("COD declares zero layers"));
    }
    let mct = seg.read_u8()?;
    let decomposition_levels = seg.read_u8()?;
    if decomposition_levels > 32 {
        return Err(Error::MalformedBytestream("COD decomposition levels above 32"));
    }
    let cbw_raw = seg.read_u8()?;
    let cbh_raw = seg.read_u8()?;
    if cbw_raw > 8 || cbh_raw > 8 || cbw_raw + cbh_raw > 8 {
        return Err(Error::MalformedBytestream("COD code-block size out of range"));
    }
    let cb_width_exp = cbw_raw + 2;
    let cb_height_exp = cbh_raw + 2;
    let cblk_style = seg.read_u8()?;
    let transformation = seg.read_u8()?;
    if transformation > 1 {
        return Err(Error::MalformedBytestream("COD transformation unknown"));
    }
    let mut precinct_sizes = Vec::new();
    if scod & 0x01 != 0 {
        for _ in 0..=decomposition_levels {
            precinct_sizes.push(seg.read_u8()?);
        }
    }
    Ok(CodParams {
        progression,
        layers,
        mct,
        decomposition_levels,
        cb_width_exp,
        cb_height_exp,
        cblk_style,
        transformation,
        precinct_sizes,
    })
}

fn parse_coc(seg: &mut ByteCursor<'_>, component: u16) -> Result<CocOverride> {
    let scoc = seg.read_u8()?;
    let decomposition_levels = seg.read_u8()?;
    if decomposition_levels > 32 {
        return Err(Error::MalformedBytestream("COC decomposition levels above 32"));
    }
    let cbw_raw = seg.read_u8()?;
    let cbh_raw = seg.read_u8()?;
    if cbw_raw > 8 || cbh_raw > 8 || cbw_raw + cbh_raw > 8 {
        return Err(Error::MalformedBytestream("COC code-block size out of range"));
    }
    let cb_width_exp = cbw_raw + 2;
    let cb_height_exp = cbh_raw + 2;
    let cblk_style = seg.read_u8()?;
    let transformation = seg.read_u8()?;
    if transformation > 1 {
        return Err(Error::MalformedBytestream("COC transformation unknown"));
    }
    let mut precinct_sizes = Vec::new();
    if scoc & 0x01 != 0 {
        for _ in 0..=decomposition_levels {
            precinct_sizes.push(seg.read_u8()?);
        }
    }
    Ok(CocOverride {
        component,
        decomposition_levels,
        cb_width_exp,
        cb_height_exp,
        cblk_style,
        transformation,
        precinct_sizes,
    })
}

fn parse_qcd(seg: &mut ByteCursor<'_>) -> Result<QcdParams> {
    let sqcd = seg.read_u8()?;
    let guard_bits = sqcd >> 5;
    let style = match sqcd & 0x1F {
        0 => QuantStyle::None,
        2 => QuantStyle::ScalarExpounded,
        1 => {
            return Err(Error::UnsupportedFeature("scalar derived quantization"));
        }
        _ => return Err(Error::MalformedBytestream("unknown quantization style")),
    };
    let mut steps = Vec::new();
    match style {
        QuantStyle::None => {
            while seg.remaining() > 0 {
                steps.push(StepSize::from_u8_reversible(seg.read_u8()?));
            }
        }
        QuantStyle::ScalarExpounded => {
            if seg.remaining() % 2 != 0 {
                return Err(Error::MalformedBytestream("odd QCD step payload"));
            }
            while seg.remaining() > 0 {
                steps.push(StepSize::from_u16(seg.read_u16()?));
            }
        }
    }
    if steps.is_empty() {
        return Err(Error::MalformedBytestream("QCD carries no step sizes"));
    }
    Ok(QcdParams {
        style,
        guard_bits,
        steps,
    })
}

fn parse_cap(seg: &mut ByteCursor<'_>) -> Result<CapParams> {
    let pcap = seg.read_u32()?;
    let mut ccap = Vec::new();
    while seg.remaining() >= 2 {
        ccap.push(seg.read_u16()?);
    }
    Ok(CapParams { pcap, ccap })
}

fn parse_rgn(seg: &mut ByteCursor<'_>, component_count: usize) -> Result<RgnParams> {
    let component = if component_count < 257 {
        seg.read_u8()? as u16
    } else {
        seg.read_u16()?
    };
    let srgn = seg.read_u8()?;
    if srgn != 0 {
        return Err(Error::UnsupportedFeature("non-maxshift ROI style"));
    }
    let shift = seg.read_u8()?;
    Ok(RgnParams { component, shift })
}

fn parse_tlm(seg: &mut ByteCursor<'_>) -> Result<Vec<TlmEntry>> {
    let _ztlm = seg.read_u8()?;
    let stlm = seg.read_u8()?;
    let st = (stlm >> 4) & 0x3;
    let sp = (stlm >> 6) & 0x1;
    let mut out = Vec::new();
    while seg.remaining() > 0 {
        let tile_index = match st {
            0 => out.len() as u16,
            1 => seg.read_u8()? as u16,
            2 => seg.read_u16()?,
            _ => return Err(Error::MalformedBytestream("invalid TLM Stlm")),
        };
        let length = if sp == 1 {
            seg.read_u32()?
        } else {
            seg.read_u16()? as u32
        };
        out.push(TlmEntry { tile_index, length });
    }
    Ok(out)
}

fn parse_comment(seg: &mut ByteCursor<'_>) -> Result<String> {
    let _rcom = seg.read_u16()?;
    let mut bytes = Vec::with_capacity(seg.remaining());
    while seg.remaining() > 0 {
        bytes.push(seg.read_u8()?);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_component_index(seg: &mut ByteCursor<'_>, component_count: usize) -> Result<u16> {
    if component_count < 257 {
        Ok(seg.read_u8()? as u16)
    } else {
        seg.read_u16()
    }
}

/// Parses SOC through the first SOT (exclusive); the cursor is left at the
/// SOT marker.
pub fn parse_main_header(cursor: &mut ByteCursor<'_>) -> Result<MainHeader> {
    let soc = cursor.read_marker()?;
    if soc != MarkerCode::StartOfCodestream {
        return Err(Error::MalformedBytestream("codestream does not start with SOC"));
    }

    let mut siz: Option<SizParams> = None;
    let mut cod: Option<CodParams> = None;
    let mut qcd: Option<QcdParams> = None;
    let mut coc = Vec::new();
    let mut qcc = Vec::new();
    let mut cap = None;
    let mut cpf = None;
    let mut rgn = Vec::new();
    let mut comments = Vec::new();
    let mut tlm = Vec::new();
    let mut has_poc = false;

    loop {
        let marker_pos = cursor.position();
        let marker = cursor.read_marker()?;
        log::trace!("main header marker {marker:?} at {marker_pos}");
        match marker {
            MarkerCode::StartOfTile => {
                cursor.seek(marker_pos);
                break;
            }
            MarkerCode::EndOfCodestream => {
                return Err(Error::TruncatedInput("no tile-part before EOC"));
            }
            MarkerCode::ImageAndTileSize => {
                siz = Some(parse_siz(&mut cursor.segment()?)?);
            }
            MarkerCode::CodingStyleDefault => {
                cod = Some(parse_cod(&mut cursor.segment()?)?);
            }
            MarkerCode::QuantizationDefault => {
                qcd = Some(parse_qcd(&mut cursor.segment()?)?);
            }
            MarkerCode::CodingStyleComponent => {
                let mut seg = cursor.segment()?;
                let count = siz.as_ref().map(|s| s.components.len()).unwrap_or(0);
                let comp = parse_component_index(&mut seg, count)?;
                coc.push(parse_coc(&mut seg, comp)?);
            }
            MarkerCode::QuantizationComponent => {
                let mut seg = cursor.segment()?;
                let count = siz.as_ref().map(|s| s.components.len()).unwrap_or(0);
                let comp = parse_component_index(&mut seg, count)?;
                qcc.push((comp, parse_qcd(&mut seg)?));
            }
            MarkerCode::Capability => {
                cap = Some(parse_cap(&mut cursor.segment()?)?);
            }
            MarkerCode::CorrespondingProfile => {
                let mut seg = cursor.segment()?;
                let mut v = Vec::new();
                while seg.remaining() >= 2 {
                    v.push(seg.read_u16()?);
                }
                cpf = Some(v);
            }
            MarkerCode::RegionOfInterest => {
                let count = siz.as_ref().map(|s| s.components.len()).unwrap_or(0);
                rgn.push(parse_rgn(&mut cursor.segment()?, count)?);
            }
            MarkerCode::ProgressionOrderChange => {
                cursor.segment()?;
                has_poc = true;
            }
            MarkerCode::TilePartLengths => {
                tlm.extend(parse_tlm(&mut cursor.segment()?)?);
            }
            MarkerCode::PacketLengthMain | MarkerCode::ComponentRegistration => {
                cursor.segment()?;
            }
            MarkerCode::PackedPacketMain => {
                return Err(Error::UnsupportedFeature("packed packet headers"));
            }
            MarkerCode::Comment => {
                comments.push(parse_comment(&mut cursor.segment()?)?);
            }
            _ => {
                return Err(Error::MalformedBytestream("marker not allowed in main header"));
            }
        }
    }

    let siz = siz.ok_or(Error::MalformedBytestream("missing SIZ"))?;
    let cod = cod.ok_or(Error::MalformedBytestream("missing COD"))?;
    let qcd = qcd.ok_or(Error::MalformedBytestream("missing QCD"))?;

    Ok(MainHeader {
        siz,
        cod,
        qcd,
        coc,
        qcc,
        cap,
        cpf,
        rgn,
        comments,
        tlm,
        has_poc,
    })
}

/// Parses one tile-part: SOT header, optional tile-header markers, then
/// the packet-data range. The cursor is left after the tile-part.
pub fn parse_tile_part(cursor: &mut ByteCursor<'_>, stream_len: usize) -> Result<TilePart> {
    let sot_pos = cursor.position();
    let marker = cursor.read_marker()?;
    if marker != MarkerCode::StartOfTile {
        return Err(Error::MalformedBytestream("expected SOT"));
    }
    let mut seg = cursor.segment()?;
    let sot = SotParams {
        tile_index: seg.read_u16()?,
        tile_part_len: seg.read_u32()?,
        tile_part_index: seg.read_u8()?,
        num_tile_parts: seg.read_u8()?,
    };

    let mut cod = None;
    let mut qcd = None;
    loop {
        let marker = cursor.read_marker()?;
        match marker {
            MarkerCode::StartOfData => break,
            MarkerCode::CodingStyleDefault => cod = Some(parse_cod(&mut cursor.segment()?)?),
            MarkerCode::QuantizationDefault => qcd = Some(parse_qcd(&mut cursor.segment()?)?),
            MarkerCode::PacketLengthTilePart | MarkerCode::Comment => {
                cursor.segment()?;
            }
            MarkerCode::PackedPacketTilePart => {
                return Err(Error::UnsupportedFeature("packed packet headers"));
            }
            MarkerCode::CodingStyleComponent | MarkerCode::QuantizationComponent => {
                return Err(Error::UnsupportedFeature("per-component tile-part overrides"));
            }
            MarkerCode::StartOfTile | MarkerCode::EndOfCodestream => {
                return Err(Error::MalformedBytestream("tile-part header without SOD"));
            }
            _ => {
                return Err(Error::MalformedBytestream("marker not allowed in tile-part header"));
            }
        }
    }

    let data_start = cursor.position();
    let data_end = if sot.tile_part_len == 0 {
        // Open-ended final tile-part: data runs to EOC at the stream end.
        if stream_len < data_start + 2 {
            return Err(Error::TruncatedInput("open tile-part with no room for EOC"));
        }
        stream_len - 2
    } else {
        let end = sot_pos + sot.tile_part_len as usize;
        if end < data_start || end > stream_len {
            return Err(Error::TruncatedInput("tile-part length overruns codestream"));
        }
        end
    };
    cursor.seek(data_end);
    Ok(TilePart {
        sot,
        cod,
        qcd,
        data_start,
        data_end,
    })
}

/// Parses the whole codestream structure: main header plus all tile-parts
/// up to EOC.
pub fn parse_codestream(data: &[u8]) -> Result<(MainHeader, Vec<TilePart>)> {
    let mut cursor = ByteCursor::new(data);
    let main = parse_main_header(&mut cursor)?;
    let mut tile_parts = Vec::new();
    loop {
        let pos = cursor.position();
        let marker = cursor.read_marker()?;
        match marker {
            MarkerCode::EndOfCodestream => break,
            MarkerCode::StartOfTile => {
                cursor.seek(pos);
                tile_parts.push(parse_tile_part(&mut cursor, data.len())?);
            }
            _ => return Err(Error::MalformedBytestream("expected SOT or EOC")),
        }
    }
    if tile_parts.is_empty() {
        return Err(Error::MalformedBytestream("codestream has no tile-parts"));
    }
    Ok((main, tile_parts))
}
