//! Lowpass filter shapes.
//!
//! A lowpass shape is the transfer function the corrected chain should end
//! up with after deconvolution. Responses are sampled at the n/2 + 1
//! non-negative frequency bins of an n-point transform, i.e. at f = k/n in
//! units of the sample rate, up to Nyquist at f = 0.5.
//!
//! The shape is a tagged value rather than a function pointer so corrector
//! configuration stays serializable and comparable.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Target transfer function applied during deconvolution.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum LowpassFilter {
    /// Flat up to `bandwidth`, then a quarter-cosine roll-off to zero at
    /// Nyquist. Bandwidth is in units of the sample rate.
    Cosine { bandwidth: f64 },

    /// Gaussian roll-off with the -3 dB point at `bandwidth`, shifted and
    /// rescaled so the response reaches exactly zero at Nyquist.
    Gauss { bandwidth: f64 },

    /// Unity transmission everywhere.
    Flat,
}

impl LowpassFilter {
    /// Default shape for the IQ-mixer corrector.
    pub const DEFAULT_IQ: Self = Self::Cosine { bandwidth: 0.4 };

    /// Default shape for the single-channel corrector.
    pub const DEFAULT_CHANNEL: Self = Self::Gauss { bandwidth: 0.13 };

    /// Sample the transmission at the n/2 + 1 non-negative bins of an
    /// n-point transform.
    pub fn response(&self, n: usize) -> Vec<f64> {
        let bins = n / 2 + 1;
        match *self {
            Self::Flat => vec![1.0; bins],
            Self::Cosine { bandwidth } => cosine_response(n, bins, bandwidth),
            Self::Gauss { bandwidth } => gauss_response(n, bins, bandwidth),
        }
    }
}

fn cosine_response(n: usize, bins: usize, bandwidth: f64) -> Vec<f64> {
    let mut result = vec![1.0; bins];
    if bandwidth >= 0.5 || n == 0 {
        return result;
    }
    let start = (bandwidth * n as f64).ceil() as usize;
    for (k, value) in result.iter_mut().enumerate().skip(start) {
        let f = k as f64 / n as f64;
        *value = 0.5 + 0.5 * (PI * (f - bandwidth) / (0.5 - bandwidth)).cos();
    }
    result
}

fn gauss_response(n: usize, bins: usize, bandwidth: f64) -> Vec<f64> {
    if n == 0 {
        return vec![1.0; bins];
    }
    let x = (2.0f64.ln() / 2.0).sqrt() / bandwidth;
    let floor = (-(0.5 * x).powi(2)).exp();
    (0..bins)
        .map(|k| {
            let g = (-(x * k as f64 / n as f64).powi(2)).exp();
            (g - floor) / (1.0 - floor)
        })
        .collect()
}
