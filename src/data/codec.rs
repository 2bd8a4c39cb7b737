//! Twos-complement sample codec.
//!
//! The ADC board streams each sample as a fixed-width twos-complement word.
//! Decoding is a pure function of the byte buffer, the word width and the
//! byte order; calibration to volts is a separate step so that raw counts
//! remain available.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Largest supported word width in bytes.
pub const MAX_WORD_WIDTH: usize = 8;

/// Largest converter resolution accepted by the voltage conversions.
pub const MAX_BITS: u32 = 63;

/// Order of the bytes inside one sample word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Most-significant byte first (big endian).
    #[default]
    #[serde(rename = "msb")]
    MsbFirst,
    /// Least-significant byte first (little endian).
    #[serde(rename = "lsb")]
    LsbFirst,
}

/// Layout of a sample word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordFormat {
    /// Bytes per word.
    pub width: usize,
    /// Byte order inside a word.
    pub order: ByteOrder,
}

impl WordFormat {
    /// Decode `bytes` with this layout.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<i64>, CodecError> {
        decode_words(bytes, self.width, self.order)
    }
}

fn check_width(word_width: usize) -> Result<(), CodecError> {
    if word_width == 0 || word_width > MAX_WORD_WIDTH {
        return Err(CodecError::InvalidWordWidth(word_width));
    }
    Ok(())
}

/// Decode a flat buffer into signed integers.
///
/// Every `word_width` bytes form one word. The sign bit is the top bit of
/// the most-significant byte whatever the byte order; when it is set the
/// result equals the unsigned value minus `2^(8 * word_width)`.
///
/// # Errors
/// - `InvalidWordWidth` unless `1 <= word_width <= 8`
/// - `MisalignedBuffer` if `bytes.len()` is not a multiple of `word_width`
pub fn decode_words(
    bytes: &[u8],
    word_width: usize,
    byte_order: ByteOrder,
) -> Result<Vec<i64>, CodecError> {
    check_width(word_width)?;
    if bytes.len() % word_width != 0 {
        return Err(CodecError::MisalignedBuffer {
            len: bytes.len(),
            word_width,
        });
    }

    let shift = 64 - 8 * word_width as u32;
    let words = bytes
        .chunks_exact(word_width)
        .map(|word| {
            let unsigned = match byte_order {
                ByteOrder::MsbFirst => word
                    .iter()
                    .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
                ByteOrder::LsbFirst => word
                    .iter()
                    .rev()
                    .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
            };
            // Move the word's sign bit to bit 63, then sign-extend back down.
            ((unsigned << shift) as i64) >> shift
        })
        .collect();

    Ok(words)
}

/// Encode signed integers into fixed-width twos-complement words.
///
/// Values are truncated to the low `8 * word_width` bits, so a value outside
/// the word's range wraps exactly as the hardware register would.
pub fn encode_words(
    words: &[i64],
    word_width: usize,
    byte_order: ByteOrder,
) -> Result<Vec<u8>, CodecError> {
    check_width(word_width)?;
    let mut out = Vec::with_capacity(words.len() * word_width);
    for &word in words {
        let le = word.to_le_bytes();
        let low = &le[..word_width];
        match byte_order {
            ByteOrder::LsbFirst => out.extend_from_slice(low),
            ByteOrder::MsbFirst => out.extend(low.iter().rev()),
        }
    }
    Ok(out)
}

/// Volts per count for a `bits`-bit converter with the given full scale.
///
/// The largest unsigned count is `2^bits`, but the converter is bipolar and
/// its signed range is half that, so the divisor is `2^(bits - 1)`. Dividing
/// by `2^bits` instead halves every reading.
pub fn volts_per_count(bits: u32, full_scale: f64) -> f64 {
    full_scale / 2f64.powi(bits as i32 - 1)
}

/// Convert raw counts to volts: `word * full_scale / 2^(bits - 1)`.
pub fn words_to_voltage(words: &[i64], bits: u32, full_scale: f64) -> Vec<f64> {
    let factor = volts_per_count(bits, full_scale);
    words.iter().map(|&w| w as f64 * factor).collect()
}

/// Quantize a voltage to the nearest count, saturating at the signed range
/// of a `bits`-bit converter. `bits` is clamped to `1..=MAX_BITS`.
pub fn voltage_to_word(voltage: f64, bits: u32, full_scale: f64) -> i64 {
    let bits = bits.clamp(1, MAX_BITS);
    let max = (1i64 << (bits - 1)) - 1;
    let min = -(1i64 << (bits - 1));
    let count = (voltage / volts_per_count(bits, full_scale)).round();
    if count >= max as f64 {
        max
    } else if count <= min as f64 {
        min
    } else {
        count as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_ones_is_minus_one() {
        let words = decode_words(&[0xFF, 0xFF, 0xFF], 3, ByteOrder::MsbFirst).unwrap();
        assert_eq!(words, vec![-1]);
    }

    #[test]
    fn test_positive_word() {
        let words = decode_words(&[0x64, 0xFF, 0xFF], 3, ByteOrder::MsbFirst).unwrap();
        assert_eq!(words, vec![6_619_135]);
    }

    #[test]
    fn test_multiple_words() {
        let bytes = [0xFF, 0xFF, 0xFF, 0x64, 0xFF, 0xFF];
        let words = decode_words(&bytes, 3, ByteOrder::MsbFirst).unwrap();
        assert_eq!(words, vec![-1, 6_619_135]);
    }

    #[test]
    fn test_negative_triples_match_formula() {
        for b0 in (0x80u8..=0xFF).step_by(7) {
            for b1 in (0u8..=0xFF).step_by(51) {
                for b2 in (0u8..=0xFF).step_by(85) {
                    let words =
                        decode_words(&[b0, b1, b2], 3, ByteOrder::MsbFirst).unwrap();
                    let unsigned =
                        (i64::from(b0) << 16) | (i64::from(b1) << 8) | i64::from(b2);
                    assert!(words[0] < 0);
                    assert_eq!(words[0], unsigned - (1 << 24));
                }
            }
        }
    }

    #[test]
    fn test_lsb_first_uses_last_byte_for_sign() {
        let words = decode_words(&[0xFF, 0xFF, 0x64], 3, ByteOrder::LsbFirst).unwrap();
        assert_eq!(words, vec![6_619_135]);

        let words = decode_words(&[0x00, 0x00, 0x80], 3, ByteOrder::LsbFirst).unwrap();
        assert_eq!(words, vec![-(1 << 23)]);
    }

    #[test]
    fn test_other_widths() {
        assert_eq!(decode_words(&[0x80], 1, ByteOrder::MsbFirst).unwrap(), vec![-128]);
        assert_eq!(decode_words(&[0x7F], 1, ByteOrder::MsbFirst).unwrap(), vec![127]);
        assert_eq!(
            decode_words(&[0xFE, 0xFF], 2, ByteOrder::LsbFirst).unwrap(),
            vec![-2]
        );
        assert_eq!(
            decode_words(&[0xFF; 8], 8, ByteOrder::MsbFirst).unwrap(),
            vec![-1]
        );
        assert_eq!(
            decode_words(&[0x7F, 0xFF, 0xFF, 0xFF], 4, ByteOrder::MsbFirst).unwrap(),
            vec![i64::from(i32::MAX)]
        );
    }

    #[test]
    fn test_misaligned_buffer() {
        let err = decode_words(&[1, 2, 3, 4], 3, ByteOrder::MsbFirst).unwrap_err();
        assert_eq!(
            err,
            CodecError::MisalignedBuffer {
                len: 4,
                word_width: 3
            }
        );
    }

    #[test]
    fn test_invalid_width() {
        assert_eq!(
            decode_words(&[], 0, ByteOrder::MsbFirst).unwrap_err(),
            CodecError::InvalidWordWidth(0)
        );
        assert!(encode_words(&[1], 9, ByteOrder::MsbFirst).is_err());
    }

    #[test]
    fn test_empty_buffer_decodes_to_nothing() {
        assert!(decode_words(&[], 3, ByteOrder::MsbFirst).unwrap().is_empty());
    }

    #[test]
    fn test_half_scale_maps_to_full_scale() {
        let volts = words_to_voltage(&[1 << 23], 24, 5.0);
        assert!((volts[0] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_max_positive_word_is_just_below_full_scale() {
        let words = decode_words(&[0x7F, 0xFF, 0xFF], 3, ByteOrder::MsbFirst).unwrap();
        let volts = words_to_voltage(&words, 24, 5.0);
        assert!((volts[0] - 5.0).abs() < 1e-5);
        assert!(volts[0] < 5.0);
    }

    #[test]
    fn test_encode_matches_decode_layout() {
        let bytes = encode_words(&[-1, 6_619_135], 3, ByteOrder::MsbFirst).unwrap();
        assert_eq!(bytes, vec![0xFF, 0xFF, 0xFF, 0x64, 0xFF, 0xFF]);

        let bytes = encode_words(&[6_619_135], 3, ByteOrder::LsbFirst).unwrap();
        assert_eq!(bytes, vec![0xFF, 0xFF, 0x64]);
    }

    #[test]
    fn test_voltage_round_trip_within_one_lsb() {
        let bits = 24;
        let full_scale = 3.3;
        let lsb = volts_per_count(bits, full_scale);
        let voltages: Vec<f64> = (0..200)
            .map(|i| -full_scale + f64::from(i) * (2.0 * full_scale / 200.0) * 0.999)
            .collect();

        for order in [ByteOrder::MsbFirst, ByteOrder::LsbFirst] {
            let words: Vec<i64> = voltages
                .iter()
                .map(|&v| voltage_to_word(v, bits, full_scale))
                .collect();
            let bytes = encode_words(&words, 3, order).unwrap();
            let decoded = decode_words(&bytes, 3, order).unwrap();
            let recovered = words_to_voltage(&decoded, bits, full_scale);
            for (v, r) in voltages.iter().zip(&recovered) {
                assert!((v - r).abs() <= lsb, "{v} recovered as {r}");
            }
        }
    }

    #[test]
    fn test_voltage_to_word_saturates() {
        assert_eq!(voltage_to_word(10.0, 24, 3.3), (1 << 23) - 1);
        assert_eq!(voltage_to_word(-10.0, 24, 3.3), -(1 << 23));
    }

    #[test]
    fn test_voltage_to_word_clamps_resolution() {
        assert_eq!(voltage_to_word(10.0, 0, 3.3), 0);
        assert_eq!(voltage_to_word(-10.0, 0, 3.3), -1);
        assert_eq!(voltage_to_word(10.0, 64, 3.3), (1i64 << 62) - 1);
        assert_eq!(voltage_to_word(-10.0, 64, 3.3), -(1i64 << 62));
        assert_eq!(voltage_to_word(0.0, 64, 3.3), 0);
    }

    #[test]
    fn test_byte_order_serde_names() {
        let order: ByteOrder = serde_json::from_str("\"lsb\"").unwrap();
        assert_eq!(order, ByteOrder::LsbFirst);
    }
}
