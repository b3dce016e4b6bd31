//! Coefficient word encoding.
//!
//! Receivers report their DSP word format in `DType`. Float receivers take
//! IEEE-754 single precision, fixed-point receivers take a signed 1.31
//! fraction. Both are little-endian 4-byte words.

use std::fmt;

/// Bytes per coefficient word on the wire.
pub const WORD_LEN: usize = 4;

const FIXED_SCALE: f64 = 2_147_483_648.0; // 2^31

/// Coefficient word format reported by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDataType {
    Float,
    Fixed,
}

impl DeviceDataType {
    /// Parse the receiver's `DType` string. Only `float` selects IEEE words;
    /// every other value (`fixedA`, ...) is fixed point.
    pub fn from_dtype(dtype: &str) -> Self {
        if dtype.trim().eq_ignore_ascii_case("float") {
            DeviceDataType::Float
        } else {
            DeviceDataType::Fixed
        }
    }

    /// True when the receiver needs INIT_COEFS before coefficient upload.
    pub fn requires_init(dtype: &str) -> bool {
        dtype.trim().to_ascii_lowercase().starts_with("fixed")
    }

    pub fn is_fixed(self) -> bool {
        self == DeviceDataType::Fixed
    }
}

impl fmt::Display for DeviceDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceDataType::Float => write!(f, "float"),
            DeviceDataType::Fixed => write!(f, "fixed"),
        }
    }
}

/// Convert a float to the receiver's 1.31 fixed-point word.
///
/// The magnitude is built one bit at a time by doubling the fractional
/// remainder; `|f| >= 1` saturates to `0x7FFF_FFFF`. Negative inputs are
/// stored as the bitwise complement of the magnitude with the sign bit set.
pub fn float_to_fixed32(f: f64) -> i32 {
    let negative = f < 0.0;
    let abs = f.abs();
    let mut word: i32 = if abs >= 1.0 {
        0x7FFF_FFFF
    } else {
        let mut rem = abs;
        let mut acc: i32 = 0;
        for _ in 0..31 {
            acc <<= 1;
            rem = rem.fract() * 2.0;
            if rem >= 1.0 {
                acc |= 1;
            }
        }
        acc
    };
    if negative {
        word = !word | i32::MIN;
    }
    word
}

/// Encode coefficients as 4-byte little-endian words.
pub fn encode_coefficients(values: &[f64], data_type: DeviceDataType) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * WORD_LEN);
    for &v in values {
        match data_type {
            DeviceDataType::Float => out.extend_from_slice(&(v as f32).to_le_bytes()),
            DeviceDataType::Fixed => out.extend_from_slice(&float_to_fixed32(v).to_le_bytes()),
        }
    }
    out
}

/// Decode little-endian IEEE-754 words. A trailing partial word is ignored.
pub fn decode_float_le(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(WORD_LEN)
        .map(|w| f32::from_le_bytes([w[0], w[1], w[2], w[3]]) as f64)
        .collect()
}

/// Decode little-endian 1.31 fixed-point words.
pub fn decode_fixed32_le(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(WORD_LEN)
        .map(|w| i32::from_le_bytes([w[0], w[1], w[2], w[3]]) as f64 / FIXED_SCALE)
        .collect()
}

/// Decode words in the given format.
pub fn decode_coefficients(bytes: &[u8], data_type: DeviceDataType) -> Vec<f64> {
    match data_type {
        DeviceDataType::Float => decode_float_le(bytes),
        DeviceDataType::Fixed => decode_fixed32_le(bytes),
    }
}
