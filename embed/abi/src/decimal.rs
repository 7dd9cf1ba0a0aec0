use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::str::FromStr;

const SCALE_SHIFT: u32 = 16;
const SCALE_MASK: u32 = 0x00ff_0000;
const SIGN_MASK: u32 = 0x8000_0000;
const MAX_SCALE: u8 = 28;
const MANTISSA_BITS: u32 = 96;

/// Managed `System.Decimal` as laid out by the runtime.
///
/// Bits 16..24 of `sign_scale` hold the scale, bit 31 the sign. The 96-bit
/// mantissa is split across `hi32` and `lo64`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Decimal {
    pub sign_scale: u32,
    pub hi32: u32,
    pub lo64: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseDecimalError {
    #[error("empty decimal literal")]
    Empty,
    #[error("invalid character {0:?} in decimal literal")]
    InvalidDigit(char),
    #[error("decimal scale {0} exceeds 28")]
    ScaleTooLarge(usize),
    #[error("decimal mantissa does not fit in 96 bits")]
    Overflow,
}

impl Decimal {
    pub const ZERO: Decimal = Decimal {
        sign_scale: 0,
        hi32: 0,
        lo64: 0,
    };

    /// Build from a 96-bit magnitude. Returns `None` when the magnitude or the
    /// scale is out of range.
    pub fn from_parts(mantissa: u128, scale: u8, negative: bool) -> Option<Self> {
        if mantissa >> MANTISSA_BITS != 0 || scale > MAX_SCALE {
            return None;
        }
        let mut sign_scale = (scale as u32) << SCALE_SHIFT;
        if negative {
            sign_scale |= SIGN_MASK;
        }
        Some(Self {
            sign_scale,
            hi32: (mantissa >> 64) as u32,
            lo64: mantissa as u64,
        })
    }

    pub fn mantissa(&self) -> u128 {
        ((self.hi32 as u128) << 64) | self.lo64 as u128
    }

    pub fn scale(&self) -> u8 {
        ((self.sign_scale & SCALE_MASK) >> SCALE_SHIFT) as u8
    }

    pub fn is_negative(&self) -> bool {
        self.sign_scale & SIGN_MASK != 0
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mantissa = self.mantissa();
        let scale = self.scale() as usize;
        let mut digits = mantissa.to_string();
        if digits.len() <= scale {
            digits = format!("{}{}", "0".repeat(scale + 1 - digits.len()), digits);
        }
        if self.is_negative() && mantissa != 0 {
            f.write_str("-")?;
        }
        let (int, frac) = digits.split_at(digits.len() - scale);
        if frac.is_empty() {
            f.write_str(int)
        } else {
            write!(f, "{}.{}", int, frac)
        }
    }
}

/// Invariant-culture parse: optional sign, digits, optional fraction.
impl FromStr for Decimal {
    type Err = ParseDecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        if body.is_empty() {
            return Err(ParseDecimalError::Empty);
        }

        let (int, frac) = body.split_once('.').unwrap_or((body, ""));
        if int.is_empty() && frac.is_empty() {
            return Err(ParseDecimalError::Empty);
        }
        if frac.len() > MAX_SCALE as usize {
            return Err(ParseDecimalError::ScaleTooLarge(frac.len()));
        }

        let mut mantissa: u128 = 0;
        for c in int.chars().chain(frac.chars()) {
            let digit = c.to_digit(10).ok_or(ParseDecimalError::InvalidDigit(c))?;
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(digit as u128))
                .ok_or(ParseDecimalError::Overflow)?;
        }

        Self::from_parts(mantissa, frac.len() as u8, negative).ok_or(ParseDecimalError::Overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_sixteen_bytes_in_field_order() {
        assert_eq!(std::mem::size_of::<Decimal>(), 16);
        let d = Decimal {
            sign_scale: 0x8002_0000,
            hi32: 7,
            lo64: 0x0102_0304_0506_0708,
        };
        let bytes = bytemuck::bytes_of(&d);
        assert_eq!(&bytes[0..4], &0x8002_0000u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &7u32.to_ne_bytes());
        assert_eq!(&bytes[8..16], &0x0102_0304_0506_0708u64.to_ne_bytes());
    }

    #[test]
    fn parse_and_format() {
        let d: Decimal = "-123.450".parse().unwrap();
        assert!(d.is_negative());
        assert_eq!(d.scale(), 3);
        assert_eq!(d.mantissa(), 123450);
        assert_eq!(d.to_string(), "-123.450");

        assert_eq!("0.05".parse::<Decimal>().unwrap().to_string(), "0.05");
        assert_eq!(".5".parse::<Decimal>().unwrap().to_string(), "0.5");
        assert_eq!("42".parse::<Decimal>().unwrap().to_string(), "42");
        assert_eq!(Decimal::ZERO.to_string(), "0");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!("".parse::<Decimal>(), Err(ParseDecimalError::Empty));
        assert_eq!("-".parse::<Decimal>(), Err(ParseDecimalError::Empty));
        assert_eq!("1x".parse::<Decimal>(), Err(ParseDecimalError::InvalidDigit('x')));
        // 2^96
        assert_eq!(
            "79228162514264337593543950336".parse::<Decimal>(),
            Err(ParseDecimalError::Overflow)
        );
        assert!("79228162514264337593543950335".parse::<Decimal>().is_ok());
    }

    #[test]
    fn wide_mantissa_splits_across_fields() {
        let d = Decimal::from_parts(1u128 << 70, 0, false).unwrap();
        assert_eq!(d.hi32, 1 << 6);
        assert_eq!(d.lo64, 0);
        assert!(Decimal::from_parts(1u128 << 96, 0, false).is_none());
        assert!(Decimal::from_parts(1, 29, false).is_none());
    }
}
