//! Exact fractions for time bases, frame rates and accumulated durations.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A reduced fraction with a strictly positive denominator.
///
/// Every constructor normalizes the sign onto the numerator and divides out
/// the gcd, so structural equality is numeric equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rational {
    num: i64,
    den: i64,
}

impl Rational {
    pub const ZERO: Rational = Rational { num: 0, den: 1 };
    pub const ONE: Rational = Rational { num: 1, den: 1 };

    pub fn new(num: i64, den: i64) -> Result<Self> {
        if den == 0 {
            return Err(Error::InvalidRational(format!("{num}/0")));
        }
        Self::from_i128(num as i128, den as i128)
            .ok_or_else(|| Error::InvalidRational(format!("{num}/{den} out of range")))
    }

    pub const fn from_int(n: i64) -> Self {
        Self { num: n, den: 1 }
    }

    /// Closest fraction with denominator `max_den` (rounded half away from zero).
    pub fn from_f64(value: f64, max_den: i64) -> Result<Self> {
        if !value.is_finite() || max_den <= 0 {
            return Err(Error::InvalidRational(value.to_string()));
        }
        let scaled = (value * max_den as f64).round();
        if scaled.abs() >= i64::MAX as f64 {
            return Err(Error::InvalidRational(value.to_string()));
        }
        Self::new(scaled as i64, max_den)
    }

    pub fn num(&self) -> i64 {
        self.num
    }

    pub fn den(&self) -> i64 {
        self.den
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn is_positive(&self) -> bool {
        self.num > 0
    }

    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    pub fn recip(&self) -> Option<Self> {
        if self.num == 0 {
            return None;
        }
        Self::from_i128(self.den as i128, self.num as i128)
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        let num = self.num as i128 * rhs.den as i128 + rhs.num as i128 * self.den as i128;
        let den = self.den as i128 * rhs.den as i128;
        Self::from_i128(num, den)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.checked_add(Rational {
            num: rhs.num.checked_neg()?,
            den: rhs.den,
        })
    }

    pub fn checked_mul(self, rhs: Self) -> Option<Self> {
        Self::from_i128(
            self.num as i128 * rhs.num as i128,
            self.den as i128 * rhs.den as i128,
        )
    }

    pub fn checked_div(self, rhs: Self) -> Option<Self> {
        self.checked_mul(rhs.recip()?)
    }

    /// `self * n`, used to turn a tick count into seconds.
    pub fn checked_mul_int(self, n: i64) -> Option<Self> {
        Self::from_i128(self.num as i128 * n as i128, self.den as i128)
    }

    fn from_i128(num: i128, den: i128) -> Option<Self> {
        if den == 0 {
            return None;
        }
        let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
        let g = gcd_i128(num.unsigned_abs(), den.unsigned_abs()).max(1) as i128;
        let num = i64::try_from(num / g).ok()?;
        let den = i64::try_from(den / g).ok()?;
        Some(Self { num, den })
    }
}

fn gcd_i128(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

impl Default for Rational {
    fn default() -> Self {
        Self::ZERO
    }
}

impl PartialOrd for Rational {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rational {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.num as i128 * other.den as i128).cmp(&(other.num as i128 * self.den as i128))
    }
}

impl fmt::Debug for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Accepts `30000/1001` or a bare integer such as `30`.
impl FromStr for Rational {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parse = |part: &str| {
            part.trim()
                .parse::<i64>()
                .map_err(|_| Error::InvalidRational(s.to_string()))
        };
        match s.split_once('/') {
            Some((num, den)) => Self::new(parse(num)?, parse(den)?),
            None => Ok(Self::from_int(parse(s)?)),
        }
    }
}

impl TryFrom<String> for Rational {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Rational> for String {
    fn from(value: Rational) -> Self {
        value.to_string()
    }
}

/// Seconds per timestamp tick. Both terms are strictly positive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeBase(Rational);

impl TimeBase {
    /// MPEG-TS 90 kHz clock.
    pub const MPEG_TS: TimeBase = TimeBase(Rational { num: 1, den: 90_000 });
    pub const MILLISECONDS: TimeBase = TimeBase(Rational { num: 1, den: 1_000 });
    pub const MICROSECONDS: TimeBase = TimeBase(Rational {
        num: 1,
        den: 1_000_000,
    });

    pub fn new(num: i64, den: i64) -> Result<Self> {
        if num <= 0 || den <= 0 {
            return Err(Error::InvalidTimeBase { num, den });
        }
        Rational::new(num, den).map(TimeBase)
    }

    /// `1/rate`: one tick per frame.
    pub fn from_frame_rate(rate: Rational) -> Result<Self> {
        if !rate.is_positive() {
            return Err(Error::InvalidTimeBase {
                num: rate.den(),
                den: rate.num(),
            });
        }
        Self::new(rate.den(), rate.num())
    }

    pub fn num(&self) -> i64 {
        self.0.num
    }

    pub fn den(&self) -> i64 {
        self.0.den
    }

    pub fn as_rational(&self) -> Rational {
        self.0
    }

    /// Exact length of `ticks` in seconds, `None` if it does not fit.
    pub fn seconds(&self, ticks: i64) -> Option<Rational> {
        self.0.checked_mul_int(ticks)
    }
}

impl TryFrom<Rational> for TimeBase {
    type Error = Error;

    fn try_from(value: Rational) -> Result<Self> {
        Self::new(value.num(), value.den())
    }
}

impl From<TimeBase> for Rational {
    fn from(value: TimeBase) -> Self {
        value.0
    }
}

impl fmt::Debug for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeBase({})", self.0)
    }
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TimeBase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TimeBase::try_from(s.parse::<Rational>()?)
    }
}

impl TryFrom<String> for TimeBase {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeBase> for String {
    fn from(value: TimeBase) -> Self {
        value.to_string()
    }
}
