//! Linear interpolation at fractional indices.
//!
//! Calibration tables are sampled on uniform axes, so lookups reduce to
//! interpolating a slice at a fractional index. The same routine serves
//! real tables (zero offsets) and complex ones (response filters).

use std::ops::{Add, Mul};

/// Interpolate `table` at fractional index `x`.
///
/// A length-1 table returns its single value regardless of `x`. With
/// `extrapolate` false, positions outside `[0, len - 1]` return the boundary
/// value (flat extension); with `extrapolate` true, the slope of the nearest
/// edge segment continues linearly.
///
/// # Panics
///
/// Panics on an empty table; callers guarantee at least one element.
pub fn interp<T>(table: &[T], x: f64, extrapolate: bool) -> T
where
    T: Copy + Add<Output = T> + Mul<f64, Output = T>,
{
    assert!(!table.is_empty(), "interp called with an empty table");
    if table.len() == 1 {
        return table[0];
    }
    let segment = (x.floor() as isize).clamp(0, table.len() as isize - 2) as usize;
    let mut frac = x - segment as f64;
    if !extrapolate {
        frac = frac.clamp(0.0, 1.0);
    }
    table[segment] * (1.0 - frac) + table[segment + 1] * frac
}
