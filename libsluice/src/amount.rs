use bigint::uint::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use crate::types::ParseError;

/// An unsigned 256-bit token amount.
///
/// Amounts are opaque base units (wei-style); conversion to display units is the
/// concern of whoever knows the token's decimals. All arithmetic is checked —
/// an overflowing or underflowing operation returns `None` rather than wrapping.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(U256);

impl TokenAmount {
    pub fn zero() -> Self {
        TokenAmount(U256::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn from_u64(value: u64) -> Self {
        TokenAmount(U256::from(value))
    }

    /// Interpret up to 32 big-endian bytes as an amount.
    pub fn from_big_endian(bytes: &[u8]) -> Self {
        TokenAmount(U256::from_big_endian(bytes))
    }

    /// The amount as 32 big-endian bytes. Used in canonical hash encodings.
    pub fn to_big_endian(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.0.to_big_endian(&mut bytes);
        bytes
    }

    /// Parses a decimal string of whole base units, e.g. `"1000000"`.
    pub fn from_decimal(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }
        let ten = U256::from(10u64);
        let mut acc = U256::zero();
        for c in s.chars() {
            let digit = c.to_digit(10)? as u64;
            let (shifted, overflow) = acc.overflowing_mul(ten);
            if overflow {
                return None;
            }
            let (next, overflow) = shifted.overflowing_add(U256::from(digit));
            if overflow {
                return None;
            }
            acc = next;
        }
        Some(TokenAmount(acc))
    }

    /// Parses a display-unit string such as `"1.25"` for a token with the given
    /// number of decimals, yielding the amount in base units.
    /// Returns `None` for malformed numbers or fractions finer than `decimals`.
    pub fn from_display(s: &str, decimals: u32) -> Option<Self> {
        let mut parts = s.split('.');
        let whole = parts.next()?;
        if whole.is_empty() {
            return None;
        }
        let whole = Self::from_decimal(whole)?;
        let fraction = if let Some(frac_str) = parts.next() {
            if parts.next().is_some() {
                return None; // More than one decimal point is invalid
            }
            if frac_str.len() > decimals as usize {
                return None; // Finer than the token can represent
            }
            let mut padded = frac_str.to_string();
            while padded.len() < decimals as usize {
                padded.push('0');
            }
            Self::from_decimal(&padded)?
        } else {
            TokenAmount::zero()
        };
        let scale = Self::pow10(decimals)?;
        let (scaled, overflow) = whole.0.overflowing_mul(scale.0);
        if overflow {
            return None;
        }
        TokenAmount(scaled).checked_add(fraction)
    }

    fn pow10(exp: u32) -> Option<Self> {
        let ten = U256::from(10u64);
        let mut acc = U256::from(1u64);
        for _ in 0..exp {
            let (next, overflow) = acc.overflowing_mul(ten);
            if overflow {
                return None;
            }
            acc = next;
        }
        Some(TokenAmount(acc))
    }

    pub fn checked_add(&self, other: TokenAmount) -> Option<TokenAmount> {
        let (sum, overflow) = self.0.overflowing_add(other.0);
        if overflow {
            None
        } else {
            Some(TokenAmount(sum))
        }
    }

    pub fn checked_sub(&self, other: TokenAmount) -> Option<TokenAmount> {
        if other.0 > self.0 {
            None
        } else {
            let (diff, _) = self.0.overflowing_sub(other.0);
            Some(TokenAmount(diff))
        }
    }

    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.is_empty() || s.len() > 64 {
            return Err(ParseError::new("amount", "expected between 1 and 64 hex digits"));
        }
        // Left-pad to an even number of nibbles so hex::decode accepts it.
        let padded = if s.len() % 2 == 1 { format!("0{s}") } else { s.to_string() };
        let bytes = hex::decode(&padded).map_err(|e| ParseError::new("amount", e.to_string()))?;
        Ok(TokenAmount::from_big_endian(&bytes))
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.to_big_endian();
        let hex_str = hex::encode(bytes);
        let trimmed = hex_str.trim_start_matches('0');
        if trimmed.is_empty() {
            write!(f, "0x0")
        } else {
            write!(f, "0x{trimmed}")
        }
    }
}

impl Debug for TokenAmount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenAmount({self})")
    }
}

impl FromStr for TokenAmount {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TokenAmount::from_hex(s)
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        TokenAmount::from_u64(value)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(s)
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        TokenAmount::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decimal_parsing() {
        assert_eq!(TokenAmount::from_decimal("0").unwrap(), TokenAmount::zero());
        assert_eq!(TokenAmount::from_decimal("100").unwrap(), TokenAmount::from_u64(100));
        assert!(TokenAmount::from_decimal("").is_none());
        assert!(TokenAmount::from_decimal("12a4").is_none());
        // 78 nines overflows 256 bits
        assert!(TokenAmount::from_decimal(&"9".repeat(78)).is_none());
    }

    #[test]
    fn display_unit_parsing() {
        let val = TokenAmount::from_display("1.25", 6).unwrap();
        assert_eq!(val, TokenAmount::from_u64(1_250_000));

        let val = TokenAmount::from_display("0.000001", 6).unwrap();
        assert_eq!(val, TokenAmount::from_u64(1));

        let val = TokenAmount::from_display("123", 2).unwrap();
        assert_eq!(val, TokenAmount::from_u64(12_300));

        assert!(TokenAmount::from_display("1.0000001", 6).is_none());
        assert!(TokenAmount::from_display("1.0.0", 6).is_none());
        assert!(TokenAmount::from_display(".5", 6).is_none());
        assert!(TokenAmount::from_display("zero", 6).is_none());
    }

    #[test]
    fn checked_arithmetic() {
        let a = TokenAmount::from_u64(100);
        let b = TokenAmount::from_u64(40);
        assert_eq!(a.checked_add(b).unwrap(), TokenAmount::from_u64(140));
        assert_eq!(a.checked_sub(b).unwrap(), TokenAmount::from_u64(60));
        assert!(b.checked_sub(a).is_none());

        let max = TokenAmount::from_big_endian(&[0xff; 32]);
        assert!(max.checked_add(TokenAmount::from_u64(1)).is_none());
    }

    #[test]
    fn hex_display_and_parse() {
        let a = TokenAmount::from_u64(255);
        assert_eq!(a.to_string(), "0xff");
        assert_eq!(TokenAmount::from_hex("0xff").unwrap(), a);
        assert_eq!(TokenAmount::from_hex("ff").unwrap(), a);
        assert_eq!(TokenAmount::zero().to_string(), "0x0");
        assert_eq!(TokenAmount::from_hex("0x0").unwrap(), TokenAmount::zero());
        assert!(TokenAmount::from_hex("").is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let a = TokenAmount::from_u64(1_000_000_000_000);
        let json = serde_json::to_string(&a).unwrap();
        let back: TokenAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }

    #[test]
    fn big_endian_roundtrip() {
        let a = TokenAmount::from_u64(0xdead_beef);
        let bytes = a.to_big_endian();
        assert_eq!(TokenAmount::from_big_endian(&bytes), a);
    }

    #[test]
    fn ordering() {
        assert!(TokenAmount::from_u64(1) < TokenAmount::from_u64(2));
        assert!(TokenAmount::from_big_endian(&[1u8; 32]) > TokenAmount::from_u64(u64::MAX));
    }
}
