//! JPEG 2000 codestream marker codes (ISO/IEC 15444-1 Annex A, 15444-15).
//!
//! Markers are two-byte codes `0xFF xx`. Outside SOD..SOT regions they are
//! byte-aligned and exact; inside packet data the bit-stuffing rules of the
//! packet header writer guarantee no `0xFF >= 0x90` pair can occur.

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const MARKER_PREFIX: u8 = 0xFF;

/// Second byte of a JPEG 2000 marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MarkerCode {
    /// SOC: start of codestream.
    StartOfCodestream = 0x4F,
    /// CAP: extended capabilities (mandatory for HT codestreams).
    Capability = 0x50,
    /// SIZ: image and tile size.
    ImageAndTileSize = 0x51,
    /// COD: coding style default.
    CodingStyleDefault = 0x52,
    /// COC: coding style component.
    CodingStyleComponent = 0x53,
    /// TLM: tile-part lengths.
    TilePartLengths = 0x55,
    /// PLM: packet lengths, main header.
    PacketLengthMain = 0x57,
    /// PLT: packet lengths, tile-part header.
    PacketLengthTilePart = 0x58,
    /// CPF: corresponding profile (Part 15).
    CorrespondingProfile = 0x59,
    /// QCD: quantization default.
    QuantizationDefault = 0x5C,
    /// QCC: quantization component.
    QuantizationComponent = 0x5D,
    /// RGN: region of interest.
    RegionOfInterest = 0x5E,
    /// POC: progression order change.
    ProgressionOrderChange = 0x5F,
    /// PPM: packed packet headers, main header.
    PackedPacketMain = 0x60,
    /// PPT: packed packet headers, tile-part header.
    PackedPacketTilePart = 0x61,
    /// CRG: component registration.
    ComponentRegistration = 0x63,
    /// COM: comment.
    Comment = 0x64,
    /// SOT: start of tile-part.
    StartOfTile = 0x90,
    /// SOP: start of packet.
    StartOfPacket = 0x91,
    /// EPH: end of packet header.
    EndOfPacketHeader = 0x92,
    /// SOD: start of data.
    StartOfData = 0x93,
    /// EOC: end of codestream.
    EndOfCodestream = 0xD9,
}

/// CAP Pcap bit 14 signals the Part 15 (HTJ2K) block coder.
pub const PCAP_HT: u32 = 1 << 14;
/// Ccap15 value advertising HTONLY codestreams.
pub const CCAP15_HTONLY: u16 = 0;
/// Rsiz value advertising a Part 15 codestream in SIZ.
pub const RSIZ_CAP: u16 = 0x4000;

// COD / COC code-block style flags (SPcod byte 5).
pub const CBLK_STYLE_LAZY: u8 = 0x01; // selective arithmetic bypass
pub const CBLK_STYLE_RESET: u8 = 0x02; // reset contexts on each pass
pub const CBLK_STYLE_TERMALL: u8 = 0x04; // terminate on each pass
pub const CBLK_STYLE_VSC: u8 = 0x08; // vertically causal contexts
pub const CBLK_STYLE_PTERM: u8 = 0x10; // predictable termination
pub const CBLK_STYLE_SEGSYM: u8 = 0x20; // segmentation symbols

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_markers_convert() {
        assert_eq!(MarkerCode::try_from(0x4Fu8), Ok(MarkerCode::StartOfCodestream));
        assert_eq!(u8::from(MarkerCode::EndOfCodestream), 0xD9);
    }

    #[test]
    fn reserved_markers_rejected() {
        assert!(MarkerCode::try_from(0x54u8).is_err());
        assert!(MarkerCode::try_from(0x6Au8).is_err());
    }

}
