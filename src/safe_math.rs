//! Saturating arithmetic for token amounts, counters and priorities.
//!
//! A long-running service must never wrap or panic on a bad amount, so every
//! primitive here saturates instead:
//!
//! - `add` / `multiply` clamp to [`MAX_SAFE`] on overflow
//! - `subtract` floors at zero (balances and counters are non-negative)
//! - `divide` by zero yields zero
//!
//! Overflow is reported through a `warn!` event and otherwise swallowed.

use tracing::warn;

/// Largest value any saturating operation will produce.
pub const MAX_SAFE: u64 = u64::MAX;

/// Saturating addition.
#[inline]
pub fn add(a: u64, b: u64) -> u64 {
    let result = a.wrapping_add(b);
    if result < a {
        warn!(a, b, "safe_math: addition overflow, saturating");
        return MAX_SAFE;
    }
    result
}

/// Subtraction floored at zero.
#[inline]
pub fn subtract(a: u64, b: u64) -> u64 {
    if b > a {
        return 0;
    }
    a - b
}

/// Saturating multiplication.
#[inline]
pub fn multiply(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        return 0;
    }
    let result = a.wrapping_mul(b);
    if result / a != b {
        warn!(a, b, "safe_math: multiplication overflow, saturating");
        return MAX_SAFE;
    }
    result
}

/// Integer division; divide-by-zero yields zero.
#[inline]
pub fn divide(a: u64, b: u64) -> u64 {
    if b == 0 {
        warn!(a, "safe_math: division by zero, returning 0");
        return 0;
    }
    a / b
}

/// Clamp `value` into `[min, max]`.
///
/// If the bounds are inverted, `min` wins.
pub fn clamp<T: PartialOrd>(value: T, min: T, max: T) -> T {
    if value < min {
        min
    } else if value > max {
        if max < min { min } else { max }
    } else {
        value
    }
}

/// `pct` percent of `value`, rounded down.
///
/// `pct` is clamped into `[0, 100]`; a NaN percentage yields zero.
pub fn percentage(value: u64, pct: f64) -> u64 {
    if pct.is_nan() {
        return 0;
    }
    let pct = clamp(pct, 0.0, 100.0);
    // Work in hundredths of a percent so integer math stays exact for the common cases.
    let basis_points = (pct * 100.0).round() as u64;
    let whole = multiply(divide(value, 10_000), basis_points);
    let rest = divide(multiply(value % 10_000, basis_points), 10_000);
    add(whole, rest)
}
