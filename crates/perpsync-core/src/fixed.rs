//! Integer-encoded fixed-point decimals.
//!
//! On-chain fields arrive as integers with an implicit number of decimal
//! places (6 for prices and collateral, 18 for sizes and P&L). Arithmetic is
//! done on the raw integers and the combined scale is applied once; the value
//! is only turned into a `Decimal` for display at the very end.

use crate::error::{CoreError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of implicit decimal places of an integer-encoded field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scale(u32);

impl Scale {
    /// Prices, collateral, margin.
    pub const USD: Self = Self(6);
    /// Position sizes and P&L.
    pub const WAD: Self = Self(18);
    /// price[6] x size[18].
    pub const NOTIONAL: Self = Self(24);

    #[inline]
    pub const fn new(decimals: u32) -> Self {
        Self(decimals)
    }

    #[inline]
    pub const fn decimals(self) -> u32 {
        self.0
    }

    /// `10^decimals`, `None` past the i128 range.
    #[inline]
    pub fn factor(self) -> Option<i128> {
        10i128.checked_pow(self.0)
    }

    /// Scale of a product of two values.
    #[inline]
    pub const fn combine(self, other: Scale) -> Self {
        Self(self.0 + other.0)
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}dp", self.0)
    }
}

/// A signed integer magnitude paired with its decimal scale.
///
/// Equality is structural: `1.0` at 6 decimals and `1.0` at 18 decimals are
/// different values. Use [`FixedPoint::rescale`] before comparing across scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedPoint {
    #[serde(with = "int_string")]
    raw: i128,
    scale: Scale,
}

impl FixedPoint {
    #[inline]
    pub const fn new(raw: i128, scale: Scale) -> Self {
        Self { raw, scale }
    }

    #[inline]
    pub const fn zero(scale: Scale) -> Self {
        Self { raw: 0, scale }
    }

    /// Encode a decimal at the given scale, truncating extra digits.
    pub fn from_decimal(value: Decimal, scale: Scale) -> Result<Self> {
        let mantissa = value.mantissa();
        let value_scale = value.scale();
        let raw = if value_scale <= scale.0 {
            Scale(scale.0 - value_scale)
                .factor()
                .and_then(|f| mantissa.checked_mul(f))
                .ok_or_else(|| CoreError::Overflow(format!("{value} at {scale}")))?
        } else {
            match Scale(value_scale - scale.0).factor() {
                Some(f) => mantissa / f,
                None => 0,
            }
        };
        Ok(Self { raw, scale })
    }

    /// Parse a human decimal string (e.g. `"100.5"`) at the given scale.
    pub fn parse(s: &str, scale: Scale) -> Result<Self> {
        let value: Decimal = s.trim().parse()?;
        Self::from_decimal(value, scale)
    }

    #[inline]
    pub fn raw(&self) -> i128 {
        self.raw
    }

    #[inline]
    pub fn scale(&self) -> Scale {
        self.scale
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.raw == 0
    }

    #[inline]
    pub fn is_negative(&self) -> bool {
        self.raw < 0
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.raw > 0
    }

    /// Unsigned magnitude, for display once the sign has been consumed.
    #[inline]
    pub fn abs(self) -> Self {
        Self {
            raw: self.raw.saturating_abs(),
            scale: self.scale,
        }
    }

    /// Change scale. Upscaling is exact; downscaling truncates toward zero.
    pub fn rescale(self, target: Scale) -> Option<Self> {
        if target.0 >= self.scale.0 {
            let factor = Scale(target.0 - self.scale.0).factor()?;
            Some(Self {
                raw: self.raw.checked_mul(factor)?,
                scale: target,
            })
        } else {
            let raw = match Scale(self.scale.0 - target.0).factor() {
                Some(factor) => self.raw / factor,
                None => 0,
            };
            Some(Self { raw, scale: target })
        }
    }

    fn aligned(self, rhs: Self) -> Option<(i128, i128, Scale)> {
        let scale = self.scale.max(rhs.scale);
        Some((self.rescale(scale)?.raw, rhs.rescale(scale)?.raw, scale))
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        let (a, b, scale) = self.aligned(rhs)?;
        Some(Self::new(a.checked_add(b)?, scale))
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        let (a, b, scale) = self.aligned(rhs)?;
        Some(Self::new(a.checked_sub(b)?, scale))
    }

    /// Multiply raw integers; the result scale is the sum of both scales.
    pub fn checked_mul(self, rhs: Self) -> Option<Self> {
        Some(Self {
            raw: self.raw.checked_mul(rhs.raw)?,
            scale: self.scale.combine(rhs.scale),
        })
    }

    /// `self / rhs` rounded half away from zero to an integer.
    ///
    /// Returns `None` on a zero denominator or overflow.
    pub fn round_div_integer(self, rhs: Self) -> Option<i128> {
        if rhs.raw == 0 {
            return None;
        }
        // a/10^sa / (b/10^sb) = a*10^sb / (b*10^sa)
        let (num, den) = if rhs.scale.0 >= self.scale.0 {
            let f = Scale(rhs.scale.0 - self.scale.0).factor()?;
            (self.raw.checked_mul(f)?, rhs.raw)
        } else {
            let f = Scale(self.scale.0 - rhs.scale.0).factor()?;
            (self.raw, rhs.raw.checked_mul(f)?)
        };
        let quotient = num / den;
        let remainder = num % den;
        if remainder.unsigned_abs().checked_mul(2)? >= den.unsigned_abs() {
            let away = if (num < 0) == (den < 0) { 1 } else { -1 };
            quotient.checked_add(away)
        } else {
            Some(quotient)
        }
    }

    /// `self / denominator` as a display decimal; zero denominator yields zero.
    pub fn ratio(self, denominator: Self) -> Decimal {
        if denominator.is_zero() {
            return Decimal::ZERO;
        }
        self.to_decimal()
            .checked_div(denominator.to_decimal())
            .unwrap_or(Decimal::ZERO)
    }

    /// Final display conversion.
    ///
    /// Exact when the value fits in a `Decimal` (96-bit mantissa, 28 places);
    /// otherwise least significant digits are dropped until it does.
    pub fn to_decimal(self) -> Decimal {
        let mut raw = self.raw;
        let mut scale = self.scale.0;
        loop {
            if scale <= 28 {
                if let Ok(d) = Decimal::try_from_i128_with_scale(raw, scale) {
                    return d;
                }
            }
            if scale == 0 {
                return if raw < 0 { Decimal::MIN } else { Decimal::MAX };
            }
            raw /= 10;
            scale -= 1;
        }
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.raw < 0 { "-" } else { "" };
        let abs = self.raw.unsigned_abs();
        let decimals = self.scale.0 as usize;
        if decimals == 0 {
            return write!(f, "{sign}{abs}");
        }
        match 10u128.checked_pow(self.scale.0) {
            Some(factor) => write!(
                f,
                "{sign}{}.{:0width$}",
                abs / factor,
                abs % factor,
                width = decimals
            ),
            None => write!(f, "{sign}0.{:0>width$}", abs, width = decimals),
        }
    }
}

/// Serde helpers for integers that travel as decimal (or `0x` hex) strings.
///
/// uint256 values do not fit JSON numbers, so gateways send them as strings.
/// Small values sent as plain JSON numbers are accepted too.
pub mod int_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Str(String),
        Signed(i64),
        Unsigned(u64),
    }

    impl Repr {
        fn into_i128(self) -> Result<i128, String> {
            match self {
                Repr::Str(s) => parse_int(&s),
                Repr::Signed(v) => Ok(i128::from(v)),
                Repr::Unsigned(v) => Ok(i128::from(v)),
            }
        }
    }

    /// Parse a decimal or `0x`-prefixed hex integer.
    pub fn parse_int(s: &str) -> Result<i128, String> {
        let s = s.trim();
        let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            i128::from_str_radix(hex, 16)
        } else {
            s.parse::<i128>()
        };
        parsed.map_err(|e| format!("invalid integer {s:?}: {e}"))
    }

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        Repr::deserialize(deserializer)?
            .into_i128()
            .map_err(de::Error::custom)
    }

    pub mod option {
        use super::Repr;
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<i128>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.collect_str(v),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<i128>, D::Error> {
            Option::<Repr>::deserialize(deserializer)?
                .map(Repr::into_i128)
                .transpose()
                .map_err(de::Error::custom)
        }
    }
}
