//! FFT/IFFT operations using rustfft and realfft.
//!
//! This module provides a high-level wrapper with:
//! - Planner caching for repeated transforms
//! - Zero-padded forward transforms of arbitrary length
//! - Real-to-complex and complex-to-real transforms
//!
//! Lengths that factorize into 2, 3 and 5 are the fast path; see
//! [`crate::fftlen::fast_fft_len`] for choosing them. Inverse transforms
//! are normalized by 1/n.

use crate::error::{DspError, DspResult};
use num_complex::Complex64;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};

/// FFT engine with cached planners.
pub struct FftEngine {
    /// Complex FFT planner.
    complex_planner: FftPlanner<f64>,

    /// Real FFT planner.
    real_planner: RealFftPlanner<f64>,
}

impl FftEngine {
    /// Create a new FFT engine.
    pub fn new() -> Self {
        Self {
            complex_planner: FftPlanner::new(),
            real_planner: RealFftPlanner::new(),
        }
    }

    /// Forward complex FFT, zero-padded (or truncated) to `nfft` points.
    pub fn fft(&mut self, data: &[Complex64], nfft: usize) -> DspResult<Vec<Complex64>> {
        if nfft == 0 {
            return Err(DspError::InvalidLength(0));
        }
        let mut buffer = vec![Complex64::new(0.0, 0.0); nfft];
        let used = data.len().min(nfft);
        buffer[..used].copy_from_slice(&data[..used]);

        let fft = self.complex_planner.plan_fft_forward(nfft);
        fft.process(&mut buffer);
        Ok(buffer)
    }

    /// Inverse complex FFT of `data`, normalized by 1/n.
    pub fn ifft(&mut self, data: &[Complex64]) -> DspResult<Vec<Complex64>> {
        let nfft = data.len();
        if nfft == 0 {
            return Err(DspError::InvalidLength(0));
        }
        let mut buffer = data.to_vec();
        let fft = self.complex_planner.plan_fft_inverse(nfft);
        fft.process(&mut buffer);

        let scale = 1.0 / nfft as f64;
        for x in buffer.iter_mut() {
            *x *= scale;
        }
        Ok(buffer)
    }

    /// Forward real-to-complex FFT, zero-padded to `nfft` points.
    ///
    /// Output: nfft/2 + 1 complex bins from DC to Nyquist.
    pub fn rfft(&mut self, data: &[f64], nfft: usize) -> DspResult<Vec<Complex64>> {
        if nfft == 0 {
            return Err(DspError::InvalidLength(0));
        }
        let r2c = self.real_planner.plan_fft_forward(nfft);
        let mut input = vec![0.0; nfft];
        let used = data.len().min(nfft);
        input[..used].copy_from_slice(&data[..used]);
        let mut output = r2c.make_output_vec();

        r2c.process(&mut input, &mut output)
            .map_err(|e| DspError::TransformFailed(e.to_string()))?;

        Ok(output)
    }

    /// Inverse complex-to-real FFT, normalized by 1/n.
    ///
    /// Input: nfft/2 + 1 complex bins. The imaginary parts of the DC bin and
    /// (for even nfft) the Nyquist bin are discarded, since a real signal
    /// cannot carry them.
    pub fn irfft(&mut self, data: &[Complex64], nfft: usize) -> DspResult<Vec<f64>> {
        if nfft == 0 {
            return Err(DspError::InvalidLength(0));
        }
        let expected = nfft / 2 + 1;
        if data.len() != expected {
            return Err(DspError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }

        let c2r = self.real_planner.plan_fft_inverse(nfft);
        let mut input = data.to_vec();
        input[0].im = 0.0;
        if nfft % 2 == 0 {
            input[expected - 1].im = 0.0;
        }
        let mut output = c2r.make_output_vec();

        c2r.process(&mut input, &mut output)
            .map_err(|e| DspError::TransformFailed(e.to_string()))?;

        let scale = 1.0 / nfft as f64;
        for x in output.iter_mut() {
            *x *= scale;
        }
        Ok(output)
    }
}

impl Default for FftEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_fft_ifft_roundtrip_non_pow2() {
        let mut engine = FftEngine::new();

        let n = 60;
        let signal: Vec<Complex64> = (0..n)
            .map(|i| {
                let t = i as f64 / n as f64;
                Complex64::new((2.0 * PI * 4.0 * t).sin(), (2.0 * PI * 3.0 * t).cos())
            })
            .collect();

        let spectrum = engine.fft(&signal, n).unwrap();
        let recovered = engine.ifft(&spectrum).unwrap();

        for (orig, rec) in signal.iter().zip(recovered.iter()) {
            assert!((orig - rec).norm() < 1e-10);
        }
    }

    #[test]
    fn test_rfft_irfft_roundtrip_odd_length() {
        let mut engine = FftEngine::new();

        let n = 45;
        let signal: Vec<f64> = (0..n)
            .map(|i| (2.0 * PI * 5.0 * i as f64 / n as f64).sin() + 0.25)
            .collect();

        let spectrum = engine.rfft(&signal, n).unwrap();
        assert_eq!(spectrum.len(), n / 2 + 1);
        let recovered = engine.irfft(&spectrum, n).unwrap();

        for (orig, rec) in signal.iter().zip(recovered.iter()) {
            assert!((orig - rec).abs() < 1e-10);
        }
    }

    #[test]
    fn test_zero_padding_delta_spectrum() {
        let mut engine = FftEngine::new();

        // A unit impulse padded out to 64 points has a flat spectrum.
        let spectrum = engine.rfft(&[1.0], 64).unwrap();
        for bin in &spectrum {
            assert!((bin.re - 1.0).abs() < 1e-12);
            assert!(bin.im.abs() < 1e-12);
        }
    }

    #[test]
    fn test_invalid_lengths() {
        let mut engine = FftEngine::new();
        assert!(matches!(
            engine.rfft(&[1.0], 0),
            Err(DspError::InvalidLength(0))
        ));
        let bins = vec![Complex64::new(1.0, 0.0); 4];
        assert!(matches!(
            engine.irfft(&bins, 16),
            Err(DspError::LengthMismatch { expected: 9, actual: 4 })
        ));
    }
}
