//! Marker-segment parameter types shared by the codestream parser and
//! writer.

use crate::config::ProgressionOrder;
use crate::quantization::StepSize;

/// Per-component fields of SIZ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentSiz {
    pub depth: u8,
    pub signed: bool,
    pub dx: u8,
    pub dy: u8,
}

/// SIZ: image and tile geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizParams {
    pub rsiz: u16,
    pub width: u32,
    pub height: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_x_offset: u32,
    pub tile_y_offset: u32,
    pub components: Vec<ComponentSiz>,
}

/// COD / COC: coding style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodParams {
    pub progression: ProgressionOrder,
    pub layers: u16,
    /// 0: none, 1: component transform on components 0..3.
    pub mct: u8,
    pub decomposition_levels: u8,
    /// Actual code-block exponents (log2 of the nominal size).
    pub cb_width_exp: u8,
    pub cb_height_exp: u8,
    /// The six block-coder style flags (markers::CBLK_STYLE_*).
    pub cblk_style: u8,
    /// 0: 9/7 irreversible, 1: 5/3 reversible.
    pub transformation: u8,
    /// Per-resolution precinct size exponents; empty means the default
    /// maximal precincts.
    pub precinct_sizes: Vec<u8>,
}

impl CodParams {
    pub fn reversible(&self) -> bool {
        self.transformation == 1
    }

    pub fn cb_width(&self) -> u32 {
        1 << self.cb_width_exp
    }

    pub fn cb_height(&self) -> u32 {
        1 << self.cb_height_exp
    }
}

/// COC: the component-specific subset of the coding style (SGcod fields
/// are inherited from COD).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CocOverride {
    pub component: u16,
    pub decomposition_levels: u8,
    pub cb_width_exp: u8,
    pub cb_height_exp: u8,
    pub cblk_style: u8,
    pub transformation: u8,
    pub precinct_sizes: Vec<u8>,
}

/// Quantization style of QCD / QCC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantStyle {
    /// Reversible path: exponents only.
    None,
    /// One (exponent, mantissa) pair per subband.
    ScalarExpounded,
}

/// QCD / QCC: quantization parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QcdParams {
    pub style: QuantStyle,
    pub guard_bits: u8,
    /// One entry per subband: LL then HL, LH, HH per level.
    pub steps: Vec<StepSize>,
}

/// CAP: extended capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapParams {
    pub pcap: u32,
    pub ccap: Vec<u16>,
}

impl CapParams {
    pub fn ht(&self) -> bool {
        self.pcap & crate::markers::PCAP_HT != 0
    }

    /// Part 15 mixed mode: HT and MQ blocks share the codestream and each
    /// first inclusion carries a one-bit coder tag.
    pub fn ht_mixed(&self) -> bool {
        self.ht() && self.ccap.first().is_some_and(|&c| c & 1 != 0)
    }
}

/// RGN: maxshift region of interest for one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RgnParams {
    pub component: u16,
    pub shift: u8,
}

/// SOT: one tile-part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SotParams {
    pub tile_index: u16,
    /// Total tile-part length from the SOT marker, zero for
    /// "runs to the next SOT or EOC".
    pub tile_part_len: u32,
    pub tile_part_index: u8,
    pub num_tile_parts: u8,
}

/// TLM entry: a tile-part length recorded in the main header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlmEntry {
    pub tile_index: u16,
    pub length: u32,
}

/// Everything collected from the main header.
#[derive(Debug, Clone)]
pub struct MainHeader {
    pub siz: SizParams,
    pub cod: CodParams,
    pub qcd: QcdParams,
    /// Per-component COD overrides from COC.
    pub coc: Vec<CocOverride>,
    /// Per-component QCD overrides from QCC.
    pub qcc: Vec<(u16, QcdParams)>,
    pub cap: Option<CapParams>,
    pub cpf: Option<Vec<u16>>,
    pub rgn: Vec<RgnParams>,
    pub comments: Vec<String>,
    pub tlm: Vec<TlmEntry>,
    pub has_poc: bool,
}

impl MainHeader {
    /// Coding parameters effective for a component, COC overrides merged
    /// over the COD defaults.
    pub fn cod_for(&self, component: u16) -> CodParams {
        let mut cod = self.cod.clone();
        if let Some(o) = self.coc.iter().find(|o| o.component == component) {
            cod.decomposition_levels = o.decomposition_levels;
            cod.cb_width_exp = o.cb_width_exp;
            cod.cb_height_exp = o.cb_height_exp;
            cod.cblk_style = o.cblk_style;
            cod.transformation = o.transformation;
            cod.precinct_sizes = o.precinct_sizes.clone();
        }
        cod
    }

    /// Quantization parameters effective for a component.
    pub fn qcd_for(&self, component: u16) -> &QcdParams {
        self.qcc
            .iter()
            .find(|(c, _)| *c == component)
            .map(|(_, p)| p)
            .unwrap_or(&self.qcd)
    }

    /// ROI shift signalled for a component, zero when absent.
    pub fn roi_shift_for(&self, component: u16) -> u8 {
        self.rgn
            .iter()
            .find(|r| r.component == component)
            .map(|r| r.shift)
            .unwrap_or(0)
    }
}

/// One tile-part located in the codestream.
#[derive(Debug, Clone)]
pub struct TilePart {
    pub sot: SotParams,
    /// Coding/quantization overrides found in the tile-part header.
    pub cod: Option<CodParams>,
    pub qcd: Option<QcdParams>,
    /// Byte range of the packet data (after SOD) in the codestream.
    pub data_start: usize,
    pub data_end: usize,
}

/// Metadata surfaced by `inspect`.
#[derive(Debug, Clone)]
pub struct CodestreamInfo {
    pub width: u32,
    pub height: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_cols: u32,
    pub tile_rows: u32,
    pub components: Vec<ComponentSiz>,
    pub progression: ProgressionOrder,
    pub quality_layers: u16,
    pub decomposition_levels: u8,
    pub code_block_size: (u32, u32),
    pub reversible: bool,
    pub ht: bool,
    pub comments: Vec<String>,
    pub tile_part_lengths: Vec<TlmEntry>,
}
