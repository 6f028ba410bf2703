//! Physical units with type safety.
//!
//! These newtypes provide compile-time unit checking to prevent
//! mixing incompatible quantities (e.g., adding Gigahertz to Nanoseconds).
//!
//! The board runs at one sample per nanosecond, so frequencies are carried
//! in GHz and times in ns throughout the workspace.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Mul, Sub};

/// Frequency in gigahertz.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Gigahertz(pub f64);

impl Gigahertz {
    pub const ZERO: Self = Self(0.0);

    /// Nyquist frequency of a 1 GS/s channel.
    pub const NYQUIST: Self = Self(0.5);

    #[inline]
    pub fn from_mhz(mhz: f64) -> Self {
        Self(mhz * 1e-3)
    }

    #[inline]
    pub fn as_mhz(&self) -> f64 {
        self.0 * 1e3
    }

    #[inline]
    pub fn as_hz(&self) -> f64 {
        self.0 * 1e9
    }

    /// Angular frequency in rad/ns.
    #[inline]
    pub fn angular(&self) -> f64 {
        2.0 * std::f64::consts::PI * self.0
    }
}

impl Add for Gigahertz {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Gigahertz {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Mul<f64> for Gigahertz {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        Self(self.0 * rhs)
    }
}

impl Div<f64> for Gigahertz {
    type Output = Self;
    fn div(self, rhs: f64) -> Self {
        Self(self.0 / rhs)
    }
}

impl Div<Gigahertz> for Gigahertz {
    type Output = f64;
    fn div(self, rhs: Gigahertz) -> f64 {
        self.0 / rhs.0
    }
}

/// Time in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Nanoseconds(pub f64);

impl Nanoseconds {
    pub const ZERO: Self = Self(0.0);

    #[inline]
    pub fn from_ps(ps: f64) -> Self {
        Self(ps * 1e-3)
    }

    #[inline]
    pub fn as_ps(&self) -> f64 {
        self.0 * 1e3
    }

    /// Convert to frequency (reciprocal).
    #[inline]
    pub fn to_frequency(&self) -> Gigahertz {
        Gigahertz(1.0 / self.0)
    }
}

impl Add for Nanoseconds {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Nanoseconds {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Mul<f64> for Nanoseconds {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        Self(self.0 * rhs)
    }
}

impl Div<f64> for Nanoseconds {
    type Output = Self;
    fn div(self, rhs: f64) -> Self {
        Self(self.0 / rhs)
    }
}
