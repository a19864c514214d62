//! MagSgn sub-stream: sign and magnitude for samples flagged significant
//! by the VLC pattern. A magnitude m >= 1 is coded as a unary exponent
//! prefix (`bitlen(m) - 1` zeros then a one) followed by the `bitlen(m)-1`
//! bits below the leading one, so the stream is self-delimiting.

use crate::bit_io::{BitReader, BitWriter};

pub struct MagSgnEncoder {
    bw: BitWriter,
}

impl Default for MagSgnEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MagSgnEncoder {
    pub fn new() -> Self {
        Self { bw: BitWriter::new() }
    }

    pub fn encode(&mut self, magnitude: u32, negative: bool) {
        debug_assert!(magnitude >= 1);
        self.bw.write_bit(negative as u8);
        let bits = 32 - magnitude.leading_zeros() as u8;
        for _ in 1..bits {
            self.bw.write_bit(0);
        }
        self.bw.write_bit(1);
        if bits > 1 {
            self.bw.write_bits(magnitude & !(1 << (bits - 1)), bits - 1);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.bw.finish()
    }
}

pub struct MagSgnDecoder<'a> {
    br: BitReader<'a>,
}

impl<'a> MagSgnDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            br: BitReader::new(data),
        }
    }

    /// Returns `(magnitude, negative)`. Truncated streams yield magnitude 1
    /// positives; corruption is caught at higher layers.
    pub fn decode(&mut self) -> (u32, bool) {
        let negative = self.br.read_bit().unwrap_or(0) == 1;
        let mut exp = 0u8;
        while exp < 31 && self.br.read_bit().unwrap_or(1) == 0 {
            exp += 1;
        }
        let mut mag = 1u32 << exp;
        if exp > 0 {
            mag |= self.br.read_bits(exp).unwrap_or(0);
        }
        (mag, negative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magnitudes_roundtrip() {
        let values: Vec<(u32, bool)> = vec![
            (1, false),
            (1, true),
            (2, false),
            (3, true),
            (7, false),
            (8, true),
            (255, false),
            (256, true),
            (12345, false),
            (1 << 30, true),
        ];
        let mut enc = MagSgnEncoder::new();
        for &(m, n) in &values {
            enc.encode(m, n);
        }
        let bytes = enc.finish();
        let mut dec = MagSgnDecoder::new(&bytes);
        for &(m, n) in &values {
            assert_eq!(dec.decode(), (m, n));
        }
    }
}
