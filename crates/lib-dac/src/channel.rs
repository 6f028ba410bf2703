//! Correction engine for a single DAC channel.
//!
//! The corrector accumulates pulse-response filters from measured step
//! responses, optionally combined with an analytic settling model, and
//! deconvolves waveforms with their product. The combined filter is cached
//! per transform length and rebuilt lazily whenever any contributing input
//! changes.

use crate::calibration::RESPONSE_LENGTH;
use crate::error::{CorrectionError, CorrectionResult};
use crate::range::{clip_samples, quantize, rescale_factor};
use lib_dsp::{fast_fft_len, interp, FftEngine, LowpassFilter};
use lib_types::dac::{self, DAC_MAX};
use lib_types::Nanoseconds;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Switches for the single-channel pipeline.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Treat the signal as exactly periodic: transform at its own length
    /// instead of padding to a fast FFT length.
    pub loop_mode: bool,

    /// On overflow, uniformly rescale into the DAC range instead of
    /// clipping.
    pub rescale: bool,

    /// Add the calibrated zero offset.
    pub zero_correction: bool,

    /// Deconvolve with the loaded pulse filters and settling model.
    pub deconvolve: bool,

    /// Interpret the input in volts using the calibrated gain. Without a
    /// gain calibration, or with `volts` false, full scale is the DAC
    /// range over the dynamic reserve.
    pub volts: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            loop_mode: false,
            rescale: false,
            zero_correction: true,
            deconvolve: true,
            volts: true,
        }
    }
}

/// Combined deconvolution filter, valid for one transform length and one
/// calibration generation.
struct FilterCache {
    nfft: usize,
    generation: u64,
    filter: Vec<Complex64>,
}

/// Correction engine for one DAC channel.
pub struct ChannelCorrector {
    board: String,
    channel: String,
    dynamic_reserve: f64,
    lowpass: LowpassFilter,
    zero: f64,
    clics_per_volt: Option<f64>,
    corrections: Vec<Vec<Complex64>>,
    settling_rates: Vec<f64>,
    settling_amplitudes: Vec<f64>,
    /// Bumped on every mutation that feeds the combined filter.
    generation: u64,
    cache: Option<FilterCache>,
    last_rescale_factor: f64,
    min_rescale_factor: f64,
    fft: FftEngine,
}

impl ChannelCorrector {
    /// Corrector for one channel of the given board, with no calibrations
    /// loaded. Every correction is the identity until then.
    pub fn new(board: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            board: board.into(),
            channel: channel.into(),
            dynamic_reserve: 2.0,
            lowpass: LowpassFilter::DEFAULT_CHANNEL,
            zero: 0.0,
            clics_per_volt: None,
            corrections: Vec::new(),
            settling_rates: Vec::new(),
            settling_amplitudes: Vec::new(),
            generation: 0,
            cache: None,
            last_rescale_factor: 1.0,
            min_rescale_factor: 1.0,
            fft: FftEngine::new(),
        }
    }

    /// The board handle, unchanged.
    pub fn board(&self) -> &str {
        &self.board
    }

    /// The channel handle, unchanged.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Calibrated DAC level giving zero output.
    pub fn zero(&self) -> f64 {
        self.zero
    }

    /// Calibrated gain in DAC codes per volt, if known.
    pub fn clics_per_volt(&self) -> Option<f64> {
        self.clics_per_volt
    }

    /// Number of pulse filters loaded so far.
    pub fn correction_count(&self) -> usize {
        self.corrections.len()
    }

    /// Scale applied by the most recent rescaling correction call.
    pub fn last_rescale_factor(&self) -> f64 {
        self.last_rescale_factor
    }

    /// Smallest scale any rescaling correction call has applied so far.
    pub fn min_rescale_factor(&self) -> f64 {
        self.min_rescale_factor
    }

    /// Append a pulse filter derived from a measured step response.
    ///
    /// `rows` hold `[t_ns, amplitude]` samples recorded at an integer
    /// sampling rate in GHz; the amplitude scale does not matter. The step
    /// is differenced over one output sample period, transformed and
    /// normalized by its DC value.
    ///
    /// For a secondary calibration, where the measurement drive was itself
    /// numerically corrected through a lowpass, pass that `lowpass` here so
    /// it divides out of the measured response; otherwise corrections would
    /// stack it twice. For a raw measurement pass
    /// [`LowpassFilter::Flat`].
    ///
    /// `zero` is the DAC level producing zero output and `clics_per_volt`
    /// the measured gain used by the volts mode of [`correct`].
    ///
    /// [`correct`]: ChannelCorrector::correct
    pub fn load_cal(
        &mut self,
        rows: &[[f64; 2]],
        zero: f64,
        clics_per_volt: Option<f64>,
        lowpass: LowpassFilter,
    ) -> CorrectionResult<()> {
        if rows.len() < 2 {
            return Err(CorrectionError::BadShape(
                "step response trace needs at least two samples".into(),
            ));
        }
        let dt = rows[1][0] - rows[0][0];
        if dt <= 0.0 {
            return Err(CorrectionError::BadAxis(format!(
                "step response time axis steps by {dt} ns"
            )));
        }
        let sampling = (1.0 / dt).round() as usize;
        if sampling == 0 {
            return Err(CorrectionError::BadAxis(format!(
                "step response sampling rate {} GHz is below 1 GS/s",
                1.0 / dt
            )));
        }
        if rows.len() <= sampling {
            return Err(CorrectionError::BadShape(
                "step response trace is shorter than one output sample period".into(),
            ));
        }

        let amplitude: Vec<f64> = rows.iter().map(|r| r[1]).collect();
        let impulse: Vec<f64> = (0..amplitude.len() - sampling)
            .map(|k| amplitude[k + sampling] - amplitude[k])
            .collect();

        let nfft = RESPONSE_LENGTH * sampling;
        let spectrum = self.fft.rfft(&impulse, nfft)?;
        let dc = spectrum[0].norm();
        if dc == 0.0 {
            return Err(CorrectionError::BadShape(
                "step response has no DC content".into(),
            ));
        }

        let shape = lowpass.response(RESPONSE_LENGTH);
        let filter: Vec<Complex64> = (0..=RESPONSE_LENGTH / 2)
            .map(|k| Complex64::new(shape[k] * dc, 0.0) / spectrum[k])
            .collect();

        tracing::info!(
            "channel {} pulse calibration: sampling frequency {} GHz, {} filter(s) loaded",
            self.channel,
            sampling,
            self.corrections.len() + 1
        );

        self.corrections.push(filter);
        self.zero = zero;
        self.clics_per_volt = clics_per_volt;
        self.generation += 1;
        Ok(())
    }

    /// Install an analytic settling model.
    ///
    /// The model describes a step response of `1 + sum(a_k * exp(-r_k t))`
    /// for t >= 0, replacing any previous model. Mismatched lengths fail
    /// without touching any state; identical values leave the cached
    /// combined filter valid.
    pub fn set_settling(&mut self, rates: &[f64], amplitudes: &[f64]) -> CorrectionResult<()> {
        if rates.len() != amplitudes.len() {
            return Err(CorrectionError::ShapeMismatch {
                rates: rates.len(),
                amplitudes: amplitudes.len(),
            });
        }
        if rates != self.settling_rates.as_slice()
            || amplitudes != self.settling_amplitudes.as_slice()
        {
            self.settling_rates = rates.to_vec();
            self.settling_amplitudes = amplitudes.to_vec();
            self.generation += 1;
        }
        Ok(())
    }

    /// Change the target transfer function applied during correction.
    ///
    /// Invalidates the cached combined filter only on an actual change.
    pub fn set_filter(&mut self, lowpass: LowpassFilter) {
        if lowpass != self.lowpass {
            self.lowpass = lowpass;
            self.generation += 1;
        }
    }

    /// Correct a waveform and pack it into 14-bit sample words.
    ///
    /// Unless `loop_mode` is set the signal is padded to a fast FFT length
    /// at the level of its edge samples; to keep the pulse-response
    /// correction from wrapping into the pulse, hold the signal constant
    /// for a few ns before it and for the length of the longest calibrated
    /// response after it.
    pub fn correct(&mut self, signal: &[f64], options: &ChannelOptions) -> CorrectionResult<Vec<u32>> {
        let codes = self.correct_impl(signal, options, true)?;
        Ok(codes.iter().map(|&v| dac::pack_single(v)).collect())
    }

    /// Like [`correct`], returning unclipped, unpacked DAC codes.
    ///
    /// Useful for inspecting what deconvolution did to the signal; rescale
    /// mode is still honored.
    ///
    /// [`correct`]: ChannelCorrector::correct
    pub fn correct_raw(
        &mut self,
        signal: &[f64],
        options: &ChannelOptions,
    ) -> CorrectionResult<Vec<i32>> {
        self.correct_impl(signal, options, false)
    }

    /// Correct an already transformed waveform and pack it.
    ///
    /// `spectrum` holds the nfft/2 + 1 bins from DC to Nyquist. When
    /// `nfft` is absent or inconsistent with the bin count it defaults to
    /// `max(n, 2 * (bins - 1))`. `offset` is a DC level added into bin 0
    /// and `t0` shifts the output in time by a linear phase.
    pub fn correct_spectrum(
        &mut self,
        spectrum: &[Complex64],
        n: usize,
        nfft: Option<usize>,
        offset: f64,
        t0: Nanoseconds,
        options: &ChannelOptions,
    ) -> CorrectionResult<Vec<u32>> {
        let codes = self.correct_spectrum_impl(spectrum, n, nfft, offset, t0, options, true)?;
        Ok(codes.iter().map(|&v| dac::pack_single(v)).collect())
    }

    /// Like [`correct_spectrum`], returning unclipped, unpacked DAC codes.
    ///
    /// [`correct_spectrum`]: ChannelCorrector::correct_spectrum
    pub fn correct_spectrum_raw(
        &mut self,
        spectrum: &[Complex64],
        n: usize,
        nfft: Option<usize>,
        offset: f64,
        t0: Nanoseconds,
        options: &ChannelOptions,
    ) -> CorrectionResult<Vec<i32>> {
        self.correct_spectrum_impl(spectrum, n, nfft, offset, t0, options, false)
    }

    /// Constant fill at a given signal level, for idle stretches.
    pub fn idle_words(&self, n: usize, level: f64) -> Vec<u32> {
        let fullscale = match self.clics_per_volt {
            Some(cpv) => DAC_MAX as f64 / cpv,
            None => DAC_MAX as f64 / self.dynamic_reserve,
        };
        let code = dac::clamp_sample((fullscale * level + self.zero).round() as i32);
        vec![dac::pack_single(code); n]
    }

    fn correct_impl(
        &mut self,
        signal: &[f64],
        options: &ChannelOptions,
        fit_range: bool,
    ) -> CorrectionResult<Vec<i32>> {
        if signal.is_empty() {
            return Ok(Vec::new());
        }
        let n = signal.len();
        let nfft = if options.loop_mode { n } else { fast_fft_len(n) };
        // Remove the edge level before padding so the padded tail does not
        // introduce a step, then restore it in the DC bin.
        let background = 0.5 * (signal[0] + signal[n - 1]);
        let spectrum = if nfft == 1 {
            vec![Complex64::new(0.0, 0.0)]
        } else {
            let shifted: Vec<f64> = signal.iter().map(|&v| v - background).collect();
            self.fft.rfft(&shifted, nfft)?
        };
        self.dacify(spectrum, n, nfft, background, Nanoseconds::ZERO, options, fit_range)
    }

    fn correct_spectrum_impl(
        &mut self,
        spectrum: &[Complex64],
        n: usize,
        nfft: Option<usize>,
        offset: f64,
        t0: Nanoseconds,
        options: &ChannelOptions,
        fit_range: bool,
    ) -> CorrectionResult<Vec<i32>> {
        if n == 0 || spectrum.is_empty() {
            return Ok(Vec::new());
        }
        let bins = spectrum.len();
        let nfft = nfft
            .filter(|&m| m / 2 + 1 == bins)
            .unwrap_or_else(|| n.max(2 * (bins - 1)));
        let mut padded = spectrum.to_vec();
        padded.resize(nfft / 2 + 1, Complex64::new(0.0, 0.0));
        self.dacify(padded, n, nfft, offset, t0, options, fit_range)
    }

    /// The transform pipeline: deconvolution, inverse transform, gain and
    /// range fitting.
    #[allow(clippy::too_many_arguments)]
    fn dacify(
        &mut self,
        mut spectrum: Vec<Complex64>,
        n: usize,
        nfft: usize,
        offset: f64,
        t0: Nanoseconds,
        options: &ChannelOptions,
        fit_range: bool,
    ) -> CorrectionResult<Vec<i32>> {
        if t0.0 != 0.0 {
            for (k, bin) in spectrum.iter_mut().enumerate() {
                *bin *= Complex64::from_polar(1.0, 2.0 * PI * t0.0 * k as f64 / nfft as f64);
            }
        }
        spectrum[0] += Complex64::new(offset * nfft as f64, 0.0);

        if options.deconvolve {
            self.apply_deconvolution(&mut spectrum, nfft);
        } else {
            let shape = self.lowpass.response(nfft);
            for (bin, &value) in spectrum.iter_mut().zip(&shape) {
                *bin *= value;
            }
        }

        let mut samples = if nfft == 1 {
            vec![spectrum[0].re]
        } else {
            self.fft.irfft(&spectrum, nfft)?
        };
        samples.truncate(n);

        let zero = if options.zero_correction { self.zero } else { 0.0 };
        let mut fullscale = match (options.volts, self.clics_per_volt) {
            (true, Some(cpv)) => DAC_MAX as f64 / cpv,
            _ => DAC_MAX as f64 / self.dynamic_reserve,
        };

        if options.rescale {
            let scale = rescale_factor(&[(samples.as_slice(), zero)], fullscale);
            if scale < 1.0 {
                tracing::info!("corrected signal scaled by {} to fit the DAC range", scale);
            }
            self.last_rescale_factor = scale;
            if scale < self.min_rescale_factor {
                self.min_rescale_factor = scale;
            }
            fullscale *= scale;
        }

        let mut codes = quantize(&samples, fullscale, zero);
        if fit_range && !options.rescale && clip_samples(&mut codes) {
            tracing::warn!("corrected signal beyond DAC range, clipping");
        }
        Ok(codes)
    }

    /// Multiply the spectrum by the combined deconvolution filter,
    /// rebuilding the cache when the transform length or any contributing
    /// input has changed.
    fn apply_deconvolution(&mut self, spectrum: &mut [Complex64], nfft: usize) {
        let stale = match &self.cache {
            Some(cache) => cache.nfft != nfft || cache.generation != self.generation,
            None => true,
        };
        if stale {
            let shape = self.lowpass.response(nfft);
            let mut filter: Vec<Complex64> =
                shape.iter().map(|&v| Complex64::new(v, 0.0)).collect();

            for correction in &self.corrections {
                let len = correction.len();
                let stride = 2.0 * (len as f64 - 1.0) / nfft as f64;
                for (k, value) in filter.iter_mut().enumerate() {
                    *value *= interp(correction, k as f64 * stride, true);
                }
            }

            if !self.settling_rates.is_empty() {
                for (k, value) in filter.iter_mut().enumerate() {
                    let s = Complex64::new(0.0, 2.0 * PI * k as f64 / nfft as f64);
                    let mut denom = Complex64::new(1.0, 0.0);
                    for (&rate, &amplitude) in
                        self.settling_rates.iter().zip(&self.settling_amplitudes)
                    {
                        denom += s * amplitude / (s + rate);
                    }
                    *value /= denom;
                }
            }

            self.cache = Some(FilterCache {
                nfft,
                generation: self.generation,
                filter,
            });
        }
        if let Some(cache) = &self.cache {
            for (bin, value) in spectrum.iter_mut().zip(&cache.filter) {
                *bin *= *value;
            }
        }
    }
}
