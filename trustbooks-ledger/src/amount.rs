use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::ops::AddAssign;
use std::ops::Neg;
use std::ops::Sub;
use std::ops::SubAssign;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

/// Units per whole dollar: postings carry four decimal places.
pub const AMOUNT_SCALE: i64 = 10_000;

/// Fixed-point currency amount stored as an `i64` count of 1e-4 units.
/// Binary floats never touch accounting math; rounding happens only at
/// the two-decimal presentation boundary, half-to-even.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    #[must_use]
    pub const fn from_raw(raw: i64) -> Self {
        Amount(raw)
    }

    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Amount(cents * 100)
    }

    #[must_use]
    pub const fn from_dollars(dollars: i64) -> Self {
        Amount(dollars * AMOUNT_SCALE)
    }

    #[must_use]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    #[must_use]
    pub const fn abs(self) -> Self {
        Amount(self.0.abs())
    }

    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Amount(self.0.min(other.0))
    }

    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Amount(self.0.max(other.0))
    }

    /// Whole cents, rounded half-to-even. Presentation only.
    #[must_use]
    pub fn to_cents(self) -> i64 {
        div_round_half_even(i128::from(self.0), 100) as i64
    }

    /// Multiply by a rate expressed as another 4-dp amount
    /// (e.g. `0.0500` for five percent), rounding half-to-even at 4 dp.
    #[must_use]
    pub fn mul_rate(self, rate: Amount) -> Self {
        let product = i128::from(self.0) * i128::from(rate.0);
        Amount(div_round_half_even(product, i128::from(AMOUNT_SCALE)) as i64)
    }

    /// Scale by `numerator / denominator`, rounding half-to-even.
    /// Used for day-count accruals.
    #[must_use]
    pub fn prorate(self, numerator: i64, denominator: i64) -> Self {
        let product = i128::from(self.0) * i128::from(numerator);
        Amount(div_round_half_even(product, i128::from(denominator)) as i64)
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Two-decimal display used on statements and balance reads.
    #[must_use]
    pub fn display_2dp(self) -> String {
        let cents = self.to_cents();
        let sign = if cents < 0 { "-" } else { "" };
        let magnitude = cents.abs();
        format!("{sign}{}.{:02}", magnitude / 100, magnitude % 100)
    }
}

fn div_round_half_even(value: i128, divisor: i128) -> i128 {
    let quotient = value.div_euclid(divisor);
    let remainder = value.rem_euclid(divisor);
    let twice = remainder * 2;
    if twice > divisor || (twice == divisor && quotient % 2 != 0) {
        quotient + 1
    } else {
        quotient
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, Add::add)
    }
}

impl fmt::Display for Amount {
    /// Canonical 4-dp rendering, trailing zeros preserved.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.abs();
        write!(
            f,
            "{sign}{}.{:04}",
            magnitude / AMOUNT_SCALE,
            magnitude % AMOUNT_SCALE
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid amount literal: {0}")]
pub struct AmountParseError(String);

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let invalid = || AmountParseError(input.to_string());

        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        if digits.is_empty() {
            return Err(invalid());
        }

        let (whole, frac) = match digits.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (digits, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if frac.len() > 4 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let whole_units: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut frac_units: i64 = if frac.is_empty() {
            0
        } else {
            frac.parse().map_err(|_| invalid())?
        };
        for _ in frac.len()..4 {
            frac_units *= 10;
        }

        let raw = whole_units
            .checked_mul(AMOUNT_SCALE)
            .and_then(|units| units.checked_add(frac_units))
            .ok_or_else(invalid)?;
        Ok(Amount(if negative { -raw } else { raw }))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
