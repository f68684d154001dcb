//! Arbitrary-scale decimal numbers.
//!
//! ```text
//! | scale: i32 | len: i32 | len bytes of two's-complement unscaled value |
//! ```
//!
//! The unscaled value is written in its minimal big-endian two's-complement
//! form, so `0` takes one byte and `-1` takes one byte (`0xFF`).

use std::cmp::Ordering;

use super::{BinarySerializer, SerializerId, read_array, read_len_prefix, write_len_prefix};

/// A decimal number `unscaled * 10^-scale`.
///
/// Comparison is numeric: `1.0` and `1.00` are equal even though they encode
/// differently.
#[derive(Debug, Clone, Copy)]
pub struct Decimal {
    unscaled: i128,
    scale: i32,
}

impl Decimal {
    /// Create a decimal from an unscaled integer and a scale.
    #[must_use]
    pub const fn new(unscaled: i128, scale: i32) -> Self {
        Self { unscaled, scale }
    }

    /// The unscaled integer value.
    #[must_use]
    pub const fn unscaled(&self) -> i128 {
        self.unscaled
    }

    /// Number of digits to the right of the decimal point.
    #[must_use]
    pub const fn scale(&self) -> i32 {
        self.scale
    }

    /// Minimal two's-complement big-endian bytes of the unscaled value.
    fn magnitude_bytes(self) -> Vec<u8> {
        let bytes = self.unscaled.to_be_bytes();
        let mut start = 0;
        while start < bytes.len() - 1 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        bytes[start..].to_vec()
    }

    /// Rescale `value` up to `scale`, `None` on overflow.
    fn rescaled(self, scale: i32) -> Option<i128> {
        let diff = u32::try_from(scale.checked_sub(self.scale)?).ok()?;
        10i128
            .checked_pow(diff)
            .and_then(|factor| self.unscaled.checked_mul(factor))
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.scale == other.scale {
            return self.unscaled.cmp(&other.unscaled);
        }
        let (low, high, flipped) = if self.scale < other.scale {
            (self, other, false)
        } else {
            (other, self, true)
        };
        let ordering = match low.rescaled(high.scale) {
            Some(value) => value.cmp(&high.unscaled),
            // The rescaled value left i128, so its magnitude dominates.
            None => low.unscaled.signum().cmp(&0),
        };
        if flipped { ordering.reverse() } else { ordering }
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.scale <= 0 {
            let zeros = "0".repeat(self.scale.unsigned_abs() as usize);
            return write!(f, "{}{zeros}", self.unscaled);
        }
        let digits = self.unscaled.unsigned_abs().to_string();
        let scale = self.scale.unsigned_abs() as usize;
        let sign = if self.unscaled < 0 { "-" } else { "" };
        if digits.len() > scale {
            let (int, frac) = digits.split_at(digits.len() - scale);
            write!(f, "{sign}{int}.{frac}")
        } else {
            write!(f, "{sign}0.{}{digits}", "0".repeat(scale - digits.len()))
        }
    }
}

/// Codec for [`Decimal`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecimalSerializer;

impl BinarySerializer for DecimalSerializer {
    type Value = Decimal;

    fn id(&self) -> SerializerId {
        SerializerId::Decimal
    }

    fn object_size(&self, value: &Decimal) -> usize {
        8 + value.magnitude_bytes().len()
    }

    fn object_size_in_buffer(&self, buffer: &[u8], offset: usize) -> usize {
        8 + read_len_prefix(buffer, offset + 4)
    }

    fn serialize(&self, value: &Decimal, buffer: &mut [u8], offset: usize) {
        buffer[offset..offset + 4].copy_from_slice(&value.scale.to_be_bytes());
        let magnitude = value.magnitude_bytes();
        write_len_prefix(buffer, offset + 4, magnitude.len());
        buffer[offset + 8..offset + 8 + magnitude.len()].copy_from_slice(&magnitude);
    }

    fn deserialize(&self, buffer: &[u8], offset: usize) -> Decimal {
        let scale = i32::from_be_bytes(read_array(buffer, offset));
        let len = read_len_prefix(buffer, offset + 4);
        let magnitude = &buffer[offset + 8..offset + 8 + len];
        let negative = magnitude.first().is_some_and(|b| b & 0x80 != 0);

        // Magnitudes wider than 128 bits saturate.
        let (extension, tail) = magnitude.split_at(len.saturating_sub(16));
        let fill = if negative { 0xFF } else { 0x00 };
        let sign_kept = tail.first().is_some_and(|b| (b & 0x80 != 0) == negative);
        let fits = extension.iter().all(|b| *b == fill) && (extension.is_empty() || sign_kept);
        if !fits {
            let unscaled = if negative { i128::MIN } else { i128::MAX };
            return Decimal::new(unscaled, scale);
        }

        let seed: i128 = if negative { -1 } else { 0 };
        let unscaled = tail
            .iter()
            .fold(seed, |acc, byte| (acc << 8) | i128::from(*byte));
        Decimal::new(unscaled, scale)
    }

    fn fixed_length(&self) -> Option<usize> {
        None
    }
}
