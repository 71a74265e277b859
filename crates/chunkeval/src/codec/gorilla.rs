//! Gorilla XOR compression for float chunks.
//!
//! Each value is XORed with its predecessor and only the meaningful bits of
//! the result are stored:
//!
//! - First value: 64 bits raw (IEEE 754)
//! - Subsequent values:
//!   - XOR = 0: `'0'` (1 bit)
//!   - Same window: `'10'` + meaningful bits
//!   - New window: `'11'` + 5 bits leading + 6 bits length + meaningful bits
//!
//! Smoothly varying data (such as a linspace) shares sign, exponent and high
//! mantissa bits between neighbours, which is what the window captures.

use crate::error::{ChunkError, Result};
use bitvec::prelude::*;

/// Largest leading-zero count representable in the 5-bit field.
const MAX_LEADING: u32 = 31;

/// Encoder for float values using XOR compression.
pub struct ValueEncoder {
    first_value: Option<u64>,
    prev_value: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl ValueEncoder {
    /// Creates a new value encoder.
    pub fn new() -> Self {
        Self {
            first_value: None,
            prev_value: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    /// Encodes a float value into the output bit vector.
    pub fn encode(&mut self, value: f64, output: &mut BitVec<u8, Msb0>) {
        let bits = value.to_bits();

        if self.first_value.is_none() {
            self.first_value = Some(bits);
            self.prev_value = bits;
            push_bits(output, bits, 64);
            return;
        }

        let xor = bits ^ self.prev_value;

        if xor == 0 {
            output.push(false);
        } else {
            // The stored leading count is capped, so the window widens to match.
            let leading = xor.leading_zeros().min(MAX_LEADING);
            let trailing = xor.trailing_zeros();

            if self.has_window() && leading >= self.prev_leading && trailing >= self.prev_trailing {
                output.push(true);
                output.push(false);

                let meaningful_bits = 64 - self.prev_leading - self.prev_trailing;
                push_bits(output, xor >> self.prev_trailing, meaningful_bits);
            } else {
                output.push(true);
                output.push(true);

                let meaningful_bits = 64 - leading - trailing;
                push_bits(output, leading as u64, 5);
                // Length 1..=64 stored as 0..=63
                push_bits(output, (meaningful_bits - 1) as u64, 6);
                push_bits(output, xor >> trailing, meaningful_bits);

                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }

        self.prev_value = bits;
    }

    fn has_window(&self) -> bool {
        self.prev_leading != 0 || self.prev_trailing != 0
    }
}

impl Default for ValueEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bits(output: &mut BitVec<u8, Msb0>, value: u64, count: u32) {
    for i in (0..count).rev() {
        output.push((value >> i) & 1 == 1);
    }
}

/// Decoder for XOR-encoded float values.
pub struct ValueDecoder<'a> {
    data: &'a BitSlice<u8, Msb0>,
    pos: usize,
    first_value: Option<u64>,
    prev_value: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> ValueDecoder<'a> {
    /// Creates a new value decoder.
    pub fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            data,
            pos: 0,
            first_value: None,
            prev_value: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    fn read_bit(&mut self) -> Option<bool> {
        let bit = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(bit)
    }

    fn read_bits(&mut self, count: u32) -> Option<u64> {
        let mut value: u64 = 0;
        for _ in 0..count {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Some(value)
    }

    /// Decodes the next float value, or `None` when the stream is exhausted.
    pub fn decode_next(&mut self) -> Option<f64> {
        if self.first_value.is_none() {
            let bits = self.read_bits(64)?;
            self.first_value = Some(bits);
            self.prev_value = bits;
            return Some(f64::from_bits(bits));
        }

        let xor = if !self.read_bit()? {
            0u64
        } else if !self.read_bit()? {
            let meaningful_bits = 64 - self.prev_leading - self.prev_trailing;
            self.read_bits(meaningful_bits)? << self.prev_trailing
        } else {
            let leading = self.read_bits(5)? as u32;
            let meaningful_bits = self.read_bits(6)? as u32 + 1;
            let trailing = 64u32.checked_sub(leading + meaningful_bits)?;
            let value = self.read_bits(meaningful_bits)?;

            self.prev_leading = leading;
            self.prev_trailing = trailing;

            value << trailing
        };

        let bits = self.prev_value ^ xor;
        self.prev_value = bits;

        Some(f64::from_bits(bits))
    }
}

/// Compresses a run of values into a byte buffer.
pub fn encode(values: &[f64]) -> Vec<u8> {
    let mut output = BitVec::<u8, Msb0>::with_capacity(values.len() * 16);
    let mut encoder = ValueEncoder::new();
    for &value in values {
        encoder.encode(value, &mut output);
    }
    output.into_vec()
}

/// Decompresses exactly `out.len()` values from `bytes`.
///
/// # Errors
///
/// Returns [`ChunkError::DecompressionError`] if the stream ends early.
pub fn decode_into(bytes: &[u8], out: &mut [f64]) -> Result<()> {
    let total = out.len();
    let mut decoder = ValueDecoder::new(bytes.view_bits::<Msb0>());
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = decoder.decode_next().ok_or_else(|| {
            ChunkError::DecompressionError(format!(
                "gorilla stream ended after {i} of {total} values"
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: &[f64]) -> Vec<f64> {
        let bytes = encode(values);
        let mut out = vec![0.0; values.len()];
        decode_into(&bytes, &mut out).unwrap();
        out
    }

    #[test]
    fn test_value_roundtrip() {
        let values = vec![1.0_f64, 1.0, 1.1, 1.2, 1.1, 2.0, 0.0, -1.0];
        let decoded = roundtrip(&values);
        for (expected, actual) in values.iter().zip(&decoded) {
            assert_eq!(expected.to_bits(), actual.to_bits());
        }
    }

    #[test]
    fn test_identical_values_one_bit_each() {
        let values = vec![42.0_f64; 1000];
        let bytes = encode(&values);
        // 64 bits for the first value and one bit per repeat
        assert_eq!(bytes.len(), (64 + 999usize).div_ceil(8));
        assert_eq!(roundtrip(&values), values);
    }

    #[test]
    fn test_small_xor_uses_capped_leading() {
        // Values whose XOR has more than 31 leading zeros
        let values = vec![1.0_f64, f64::from_bits(1.0_f64.to_bits() + 1), 1.0];
        let decoded = roundtrip(&values);
        for (expected, actual) in values.iter().zip(&decoded) {
            assert_eq!(expected.to_bits(), actual.to_bits());
        }
    }

    #[test]
    fn test_special_values() {
        let values = vec![0.0, -0.0, f64::INFINITY, f64::MIN_POSITIVE, f64::MAX, -1e-300];
        let decoded = roundtrip(&values);
        for (expected, actual) in values.iter().zip(&decoded) {
            assert_eq!(expected.to_bits(), actual.to_bits());
        }
    }

    #[test]
    fn test_linspace_compresses() {
        let n = 10_000;
        let values: Vec<f64> = (0..n).map(|i| -1.0 + 2.0 * i as f64 / (n - 1) as f64).collect();
        let bytes = encode(&values);
        assert!(bytes.len() < n * 8);
        assert_eq!(roundtrip(&values), values);
    }

    #[test]
    fn test_truncated_stream() {
        let bytes = encode(&[1.0, 2.0, 3.0]);
        let mut out = vec![0.0; 3];
        match decode_into(&bytes[..4], &mut out) {
            Err(ChunkError::DecompressionError(msg)) => assert!(msg.contains("0 of 3"), "{msg}"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_empty() {
        assert!(encode(&[]).is_empty());
        let mut out: Vec<f64> = Vec::new();
        decode_into(&[], &mut out).unwrap();
    }
}
