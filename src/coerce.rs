//! Fixed-width big-endian codecs for the scalar types used on the wire.
//!
//! Every decoder follows the same two rules: an empty input decodes to
//! `None` (the wire representation of a null value), and any other input
//! must have exactly the width of the type. Encoders are the mirror
//! image, mapping `None` to the empty byte string.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::error::{Error, Result};

fn fixed<const N: usize>(raw: &[u8]) -> Result<Option<[u8; N]>> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.try_into().map(Some).map_err(|_| Error::ErrInvalidLength)
}

pub fn to_unsigned_integer8(raw: &[u8]) -> Result<Option<u8>> {
    Ok(fixed::<1>(raw)?.map(|b| b[0]))
}

pub fn from_unsigned_integer8(value: Option<u8>) -> Vec<u8> {
    value.map(|v| vec![v]).unwrap_or_default()
}

pub fn to_unsigned_integer16(raw: &[u8]) -> Result<Option<u16>> {
    Ok(fixed::<2>(raw)?.map(u16::from_be_bytes))
}

pub fn from_unsigned_integer16(value: Option<u16>) -> Vec<u8> {
    value.map(|v| v.to_be_bytes().to_vec()).unwrap_or_default()
}

pub fn to_unsigned_integer32(raw: &[u8]) -> Result<Option<u32>> {
    Ok(fixed::<4>(raw)?.map(u32::from_be_bytes))
}

pub fn from_unsigned_integer32(value: Option<u32>) -> Vec<u8> {
    value.map(|v| v.to_be_bytes().to_vec()).unwrap_or_default()
}

pub fn to_unsigned_integer64(raw: &[u8]) -> Result<Option<u64>> {
    Ok(fixed::<8>(raw)?.map(u64::from_be_bytes))
}

pub fn from_unsigned_integer64(value: Option<u64>) -> Vec<u8> {
    value.map(|v| v.to_be_bytes().to_vec()).unwrap_or_default()
}

pub fn to_integer32(raw: &[u8]) -> Result<Option<i32>> {
    Ok(fixed::<4>(raw)?.map(i32::from_be_bytes))
}

pub fn from_integer32(value: Option<i32>) -> Vec<u8> {
    value.map(|v| v.to_be_bytes().to_vec()).unwrap_or_default()
}

pub fn to_integer64(raw: &[u8]) -> Result<Option<i64>> {
    Ok(fixed::<8>(raw)?.map(i64::from_be_bytes))
}

pub fn from_integer64(value: Option<i64>) -> Vec<u8> {
    value.map(|v| v.to_be_bytes().to_vec()).unwrap_or_default()
}

/// Decodes an IEEE-754 half-precision float, widened to `f32`.
pub fn to_float16(raw: &[u8]) -> Result<Option<f32>> {
    Ok(fixed::<2>(raw)?.map(|b| f16_bits_to_f32(u16::from_be_bytes(b))))
}

/// Encodes to IEEE-754 half precision, rounding to nearest-even.
pub fn from_float16(value: Option<f32>) -> Vec<u8> {
    value
        .map(|v| f32_to_f16_bits(v).to_be_bytes().to_vec())
        .unwrap_or_default()
}

pub fn to_float32(raw: &[u8]) -> Result<Option<f32>> {
    Ok(fixed::<4>(raw)?.map(f32::from_be_bytes))
}

pub fn from_float32(value: Option<f32>) -> Vec<u8> {
    value.map(|v| v.to_be_bytes().to_vec()).unwrap_or_default()
}

pub fn to_float64(raw: &[u8]) -> Result<Option<f64>> {
    Ok(fixed::<8>(raw)?.map(f64::from_be_bytes))
}

pub fn from_float64(value: Option<f64>) -> Vec<u8> {
    value.map(|v| v.to_be_bytes().to_vec()).unwrap_or_default()
}

pub fn to_uuid(raw: &[u8]) -> Result<Option<Uuid>> {
    Ok(fixed::<16>(raw)?.map(Uuid::from_bytes))
}

pub fn from_uuid(value: Option<Uuid>) -> Vec<u8> {
    value
        .map(|v| v.into_bytes().to_vec())
        .unwrap_or_default()
}

pub fn to_string(raw: &[u8]) -> Result<Option<String>> {
    if raw.is_empty() {
        return Ok(None);
    }
    String::from_utf8(raw.to_vec())
        .map(Some)
        .map_err(|_| Error::ErrInvalidContent)
}

pub fn from_string(value: Option<&str>) -> Vec<u8> {
    value.map(|v| v.as_bytes().to_vec()).unwrap_or_default()
}

/// Lowercase hex, two characters per byte.
pub fn to_hex(raw: &[u8]) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let mut out = String::with_capacity(raw.len() * 2);
    for b in raw {
        out.push_str(&format!("{b:02x}"));
    }
    Some(out)
}

pub fn from_hex(value: Option<&str>) -> Result<Vec<u8>> {
    let hex = match value {
        Some(hex) => hex,
        None => return Ok(vec![]),
    };
    if hex.len() % 2 != 0 {
        return Err(Error::ErrInvalidLength);
    }
    if !hex.is_ascii() {
        return Err(Error::ErrInvalidContent);
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let b = u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| Error::ErrInvalidContent)?;
        out.push(b);
    }
    Ok(out)
}

/// A UTC wall-clock instant at the wire's one-second resolution.
///
/// Encoded as signed seconds since the Unix epoch in 32 bits, so it runs
/// out in 2038 along with everything else that chose this format.
/// Sub-second precision is dropped on conversion, never rounded up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i32);

impl Timestamp {
    pub const fn from_secs(secs: i32) -> Self {
        Timestamp(secs)
    }

    pub const fn as_secs(self) -> i32 {
        self.0
    }

    pub fn from_system_time(time: SystemTime) -> Result<Self> {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => {
                let secs = since.as_secs();
                if secs > i32::MAX as u64 {
                    return Err(Error::ErrInvalidSystemTime);
                }
                Ok(Timestamp(secs as i32))
            }
            Err(before) => {
                // truncation towards zero, matching the positive branch
                let secs = before.duration().as_secs();
                if secs > i32::MIN.unsigned_abs() as u64 {
                    return Err(Error::ErrInvalidSystemTime);
                }
                Ok(Timestamp(-(secs as i64) as i32))
            }
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        if self.0 >= 0 {
            UNIX_EPOCH + Duration::from_secs(self.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_secs((self.0 as i64).unsigned_abs())
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

pub fn to_datetime32(raw: &[u8]) -> Result<Option<Timestamp>> {
    Ok(to_integer32(raw)?.map(Timestamp))
}

pub fn from_datetime32(value: Option<Timestamp>) -> Vec<u8> {
    from_integer32(value.map(|t| t.0))
}

fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;

    if exp == 0xff {
        // infinity, or NaN with a quiet payload bit so it stays a NaN
        let payload = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | payload;
    }

    let unbiased = exp - 127;
    if unbiased >= 16 {
        return sign | 0x7c00;
    }
    if unbiased >= -14 {
        let mut half = sign as u32 | (((unbiased + 15) as u32) << 10) | (mantissa >> 13);
        let round = mantissa & 0x1fff;
        // round to nearest even; a carry into the exponent is valid
        if round > 0x1000 || (round == 0x1000 && (half & 1) != 0) {
            half += 1;
        }
        return half as u16;
    }
    if unbiased >= -25 {
        let mantissa = mantissa | 0x0080_0000;
        let shift = (13 - 14 - unbiased) as u32;
        let mut half = sign as u32 | (mantissa >> shift);
        let round_bit = 1u32 << (shift - 1);
        let round = mantissa & ((round_bit << 1) - 1);
        if round > round_bit || (round == round_bit && (half & 1) != 0) {
            half += 1;
        }
        return half as u16;
    }
    sign
}

fn f16_bits_to_f32(half: u16) -> f32 {
    let sign = ((half & 0x8000) as u32) << 16;
    let exp = ((half >> 10) & 0x1f) as u32;
    let mantissa = (half & 0x03ff) as u32;
    let bits = match exp {
        0 => {
            if mantissa == 0 {
                sign
            } else {
                let mut e = 0u32;
                let mut m = mantissa;
                while m & 0x0400 == 0 {
                    m <<= 1;
                    e += 1;
                }
                sign | ((113 - e) << 23) | ((m & 0x03ff) << 13)
            }
        }
        0x1f => sign | 0x7f80_0000 | (mantissa << 13),
        _ => sign | ((exp + 112) << 23) | (mantissa << 13),
    };
    f32::from_bits(bits)
}
