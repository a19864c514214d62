//! MEL run-prefix coder (ISO/IEC 15444-15, Annex B).
//!
//! Codes the per-quad "any sample significant" flags as runs of zeros with
//! an adaptive exponent: a 0 bit stands for a complete run of `2^E[k]`
//! zeros, a 1 bit is followed by `E[k]` bits giving the partial run length
//! before a significant quad.

use crate::bit_io::{BitReader, BitWriter};

/// Exponent per adaptation state.
const MEL_E: [u8; 13] = [0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 4, 5];
const MEL_MAX_STATE: usize = 12;

pub struct MelEncoder {
    bw: BitWriter,
    state: usize,
    run: u32,
}

impl Default for MelEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MelEncoder {
    pub fn new() -> Self {
        Self {
            bw: BitWriter::new(),
            state: 0,
            run: 0,
        }
    }

    pub fn encode(&mut self, significant: bool) {
        let exp = MEL_E[self.state];
        if significant {
            self.bw.write_bit(1);
            if exp > 0 {
                self.bw.write_bits(self.run, exp);
            }
            self.state = self.state.saturating_sub(1);
            self.run = 0;
        } else {
            self.run += 1;
            if self.run == 1 << exp {
                self.bw.write_bit(0);
                self.state = (self.state + 1).min(MEL_MAX_STATE);
                self.run = 0;
            }
        }
    }

    /// Flushes a partial run as one complete-run bit; the decoder's extra
    /// zeros fall beyond the last quad and are never requested.
    pub fn finish(mut self) -> Vec<u8> {
        if self.run > 0 {
            self.bw.write_bit(0);
        }
        self.bw.finish()
    }
}

pub struct MelDecoder<'a> {
    br: BitReader<'a>,
    state: usize,
    run: u32,
    pending_one: bool,
}

impl<'a> MelDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            br: BitReader::new(data),
            state: 0,
            run: 0,
            pending_one: false,
        }
    }

    pub fn decode(&mut self) -> bool {
        if self.run > 0 {
            self.run -= 1;
            return false;
        }
        if self.pending_one {
            self.pending_one = false;
            return true;
        }
        let exp = MEL_E[self.state];
        // A truncated stream decodes as zero bits, i.e. runs of
        // insignificant quads; corruption surfaces at higher layers.
        if self.br.read_bit().unwrap_or(0) == 0 {
            self.run = (1u32 << exp) - 1;
            self.state = (self.state + 1).min(MEL_MAX_STATE);
            false
        } else {
            let partial = if exp > 0 {
                self.br.read_bits(exp).unwrap_or(0)
            } else {
                0
            };
            self.state = self.state.saturating_sub(1);
            if partial > 0 {
                // The 1 event carries `partial` zeros before the
                // significant quad.
                self.run = partial - 1;
                self.pending_one = true;
                false
            } else {
                true
            }
        }
    }
}
