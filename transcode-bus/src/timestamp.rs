//! Timestamp conversion between time bases.
//!
//! `rescale(v, from, to)` computes `v * from / to` exactly and rounds half
//! away from zero. The intermediate product can need up to 190 bits, so values
//! whose product overflows `u128` fall back to a 256-bit multiply and long
//! division. Results that do not fit `i64` saturate.

use crate::packet::Packet;
use crate::rational::TimeBase;

/// Converts a possibly-unset tick count. Unset stays unset.
pub fn rescale(ticks: Option<i64>, from: TimeBase, to: TimeBase) -> Option<i64> {
    ticks.map(|ticks| rescale_ticks(ticks, from, to))
}

pub fn rescale_ticks(ticks: i64, from: TimeBase, to: TimeBase) -> i64 {
    if from == to {
        return ticks;
    }
    let (mul, div) = factors(from, to);
    mul_div_round(ticks, mul, div)
}

/// `(from.num * to.den, from.den * to.num)` with the common factor removed.
fn factors(from: TimeBase, to: TimeBase) -> (u128, u128) {
    let mul = from.num() as u128 * to.den() as u128;
    let div = from.den() as u128 * to.num() as u128;
    let g = gcd(mul, div);
    (mul / g, div / g)
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// `round(a * b / c)`, half away from zero. `b` and `c` are below 2^126.
fn mul_div_round(a: i64, b: u128, c: u128) -> i64 {
    let magnitude = a.unsigned_abs() as u128;
    let quotient = match magnitude.checked_mul(b) {
        Some(n) => {
            let q = n / c;
            let r = n % c;
            if r >= c - r { q + 1 } else { q }
        }
        None => wide_mul_div_round(magnitude, b, c),
    };

    if a < 0 {
        if quotient >= i64::MIN.unsigned_abs() as u128 {
            i64::MIN
        } else {
            -(quotient as i64)
        }
    } else if quotient > i64::MAX as u128 {
        i64::MAX
    } else {
        quotient as i64
    }
}

/// Slow path: `a < 2^64`, `b < 2^126`, `c < 2^126`.
fn wide_mul_div_round(a: u128, b: u128, c: u128) -> u128 {
    let b_lo = b & u64::MAX as u128;
    let b_hi = b >> 64;
    let low = a * b_lo;
    let mid = a * b_hi;

    let (lo, carry) = low.overflowing_add(mid << 64);
    let hi = (mid >> 64) + carry as u128;

    if hi >= c {
        return u128::MAX;
    }

    // Restoring division of the 256-bit value `hi:lo` by `c`. `rem < c` keeps
    // `rem << 1 | 1` below 2^127.
    let mut rem = hi;
    let mut q: u128 = 0;
    for bit in (0..128).rev() {
        rem = (rem << 1) | ((lo >> bit) & 1);
        q <<= 1;
        if rem >= c {
            rem -= c;
            q |= 1;
        }
    }
    if rem >= c - rem {
        q = q.saturating_add(1);
    }
    q
}

/// Precomputed conversion for a fixed pair of time bases.
#[derive(Debug, Clone, Copy)]
pub struct Rescaler {
    from: TimeBase,
    to: TimeBase,
    mul: u128,
    div: u128,
}

impl Rescaler {
    pub fn new(from: TimeBase, to: TimeBase) -> Self {
        let (mul, div) = factors(from, to);
        Self { from, to, mul, div }
    }

    pub fn from(&self) -> TimeBase {
        self.from
    }

    pub fn to(&self) -> TimeBase {
        self.to
    }

    pub fn rescale(&self, ticks: Option<i64>) -> Option<i64> {
        ticks.map(|ticks| {
            if self.mul == self.div {
                ticks
            } else {
                mul_div_round(ticks, self.mul, self.div)
            }
        })
    }
}

/// Keeps decode timestamps non-decreasing on a muxed stream.
///
/// A packet whose dts falls behind the previous one is pulled forward to it,
/// and its pts with it when the pts would otherwise precede the dts. A packet
/// flagged as a discontinuity resets the reference.
#[derive(Debug, Default)]
pub struct DtsGuard {
    last_dts: Option<i64>,
    corrected: u64,
}

impl DtsGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the packet was modified.
    pub fn apply(&mut self, packet: &mut Packet) -> bool {
        if packet.is_discontinuity() {
            self.last_dts = None;
        }

        let mut changed = false;
        if let (Some(dts), Some(last)) = (packet.dts(), self.last_dts) {
            if dts < last {
                packet.set_dts(Some(last));
                if packet.pts().is_some_and(|pts| pts < last) {
                    packet.set_pts(Some(last));
                }
                self.corrected += 1;
                changed = true;
            }
        }

        if let Some(dts) = packet.dts() {
            self.last_dts = Some(dts);
        }
        changed
    }

    pub fn corrected(&self) -> u64 {
        self.corrected
    }
}
