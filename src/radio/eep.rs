//! Equipment profiles and generic field extraction.
//!
//! Profile tables themselves are supplied by the device layer; this module
//! only provides the profile identifier and the bit extraction contract those
//! tables are evaluated with.

use std::fmt;
use std::time::Duration;

use crate::core::{EEP_UNKNOWN, MANUFACTURER_UNKNOWN};

/// Equipment profile `{rorg, func, type}` plus an internal variant byte.
///
/// Packed form: `variant << 24 | rorg << 16 | func << 8 | type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Eep {
    /// Implementation-internal disambiguator, never on the wire.
    pub variant: u8,
    /// Radio organisation byte.
    pub rorg: u8,
    /// Function.
    pub func: u8,
    /// Type.
    pub typ: u8,
}

impl Eep {
    /// Create a profile with variant 0.
    pub const fn new(rorg: u8, func: u8, typ: u8) -> Self {
        Self {
            variant: 0,
            rorg,
            func,
            typ,
        }
    }

    /// Profile whose func/type are not carried by the telegram.
    pub const fn unknown(rorg: u8) -> Self {
        Self::new(rorg, EEP_UNKNOWN, EEP_UNKNOWN)
    }

    /// Unpack from the 32-bit form.
    pub const fn from_u32(value: u32) -> Self {
        Self {
            variant: (value >> 24) as u8,
            rorg: (value >> 16) as u8,
            func: (value >> 8) as u8,
            typ: value as u8,
        }
    }

    /// Pack into the 32-bit form.
    pub const fn as_u32(self) -> u32 {
        (self.variant as u32) << 24
            | (self.rorg as u32) << 16
            | (self.func as u32) << 8
            | self.typ as u32
    }

    /// The 24-bit profile without the variant.
    pub const fn profile(self) -> u32 {
        self.as_u32() & 0x00FF_FFFF
    }

    /// Same profile with a different variant.
    pub const fn with_variant(self, variant: u8) -> Self {
        Self { variant, ..self }
    }

    /// Whether func and type are present.
    pub fn is_known(self) -> bool {
        self.func != EEP_UNKNOWN && self.typ != EEP_UNKNOWN
    }
}

impl fmt::Display for Eep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}-{:02X}-{:02X}", self.rorg, self.func, self.typ)?;
        if self.variant != 0 {
            write!(f, "/{}", self.variant)?;
        }
        Ok(())
    }
}

/// Profile and manufacturer announced by a teach-in telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeachInInfo {
    /// Announced profile (func/type may be unknown).
    pub eep: Eep,
    /// 11-bit manufacturer code.
    pub manufacturer: u16,
}

impl TeachInInfo {
    /// Info for a telegram that carries no profile bytes.
    pub fn unknown(rorg: u8) -> Self {
        Self {
            eep: Eep::unknown(rorg),
            manufacturer: MANUFACTURER_UNKNOWN,
        }
    }
}

/// Extract bits `msb..=lsb` from `data`, big-endian.
///
/// Positions are offsets counted from the most significant bit of `data[0]`,
/// as in profile tables. Returns `None` when the range is empty, wider than
/// 64 bits or outside the buffer.
pub fn extract_bits(data: &[u8], msb: usize, lsb: usize) -> Option<u64> {
    if lsb < msb || lsb - msb >= 64 || lsb >= data.len() * 8 {
        return None;
    }
    let mut value = 0u64;
    for bit in msb..=lsb {
        let byte = data[bit / 8];
        let set = (byte >> (7 - bit % 8)) & 1;
        value = (value << 1) | set as u64;
    }
    Some(value)
}

/// Conversion from a raw field value to an engineering value.
pub type Extractor = fn(&FieldDescriptor, u64) -> f64;

/// Externally supplied description of one sensor/input field.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    /// Field name for diagnostics.
    pub name: &'static str,
    /// Offset of the first (most significant) bit.
    pub msb: usize,
    /// Offset of the last (least significant) bit.
    pub lsb: usize,
    /// Raw value mapping to `scale_min`.
    pub raw_min: u64,
    /// Raw value mapping to `scale_max`.
    pub raw_max: u64,
    /// Engineering value at `raw_min`.
    pub scale_min: f64,
    /// Engineering value at `raw_max`.
    pub scale_max: f64,
    /// Expected update interval of the field.
    pub update_interval: Duration,
    /// Conversion function.
    pub extractor: Extractor,
}

impl FieldDescriptor {
    /// Extract and convert this field from radio user data.
    pub fn extract(&self, data: &[u8]) -> Option<f64> {
        extract_bits(data, self.msb, self.lsb).map(|raw| (self.extractor)(self, raw))
    }
}

/// Linear mapping of `raw_min..=raw_max` onto `scale_min..=scale_max`.
///
/// Raw values outside the range are clamped. Inverted ranges are allowed.
pub fn linear_scale(field: &FieldDescriptor, raw: u64) -> f64 {
    let (lo, hi) = if field.raw_min <= field.raw_max {
        (field.raw_min, field.raw_max)
    } else {
        (field.raw_max, field.raw_min)
    };
    if lo == hi {
        return field.scale_min;
    }
    let raw = raw.clamp(lo, hi);
    let span = field.raw_max as f64 - field.raw_min as f64;
    let fraction = (raw as f64 - field.raw_min as f64) / span;
    field.scale_min + fraction * (field.scale_max - field.scale_min)
}
