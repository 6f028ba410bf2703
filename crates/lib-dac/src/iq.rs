//! Correction engine for a dual-channel DAC board driving an IQ mixer.
//!
//! The corrector owns three kinds of calibration data: zero offsets (DAC
//! levels nulling the mixer's LO leakage per carrier frequency), sideband
//! compensation (leakage as a function of sideband offset) and the inverse
//! pulse response of the two channels. [`IqCorrector::correct`] applies all
//! of them in the frequency domain and returns packed SRAM words.

use crate::calibration::{
    carrier_axis, find_cal_set, CalSource, PulseCalibration, SelectionMode, SidebandCalibration,
    ZeroCalibration, RESPONSE_LENGTH,
};
use crate::error::{CorrectionError, CorrectionResult};
use crate::range::{clip_samples, quantize, rescale_factor};
use lib_dsp::{fast_fft_len, find_relevant, interp, FftEngine, LowpassFilter};
use lib_types::dac::{self, DAC_MAX};
use lib_types::{Gigahertz, Nanoseconds};
use ndarray::Array2;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Switches for the correction pipeline.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CorrectionOptions {
    /// Treat the signal as exactly periodic: transform at its own length
    /// instead of padding to a fast FFT length.
    pub loop_mode: bool,

    /// On overflow, uniformly rescale into the DAC range instead of
    /// clipping.
    pub rescale: bool,

    /// Add the calibrated zero offsets.
    pub zero_correction: bool,

    /// Deconvolve with the loaded pulse calibration.
    pub deconvolve: bool,

    /// Cancel the measured non-orthogonality of the I and Q paths.
    pub iq_correction: bool,
}

impl Default for CorrectionOptions {
    fn default() -> Self {
        Self {
            loop_mode: false,
            rescale: false,
            zero_correction: true,
            deconvolve: true,
            iq_correction: true,
        }
    }
}

/// Parameters handed to a recalibration routine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecalibrationRequest {
    /// Board handle, passed through unchanged.
    pub board: String,
    pub carrier_min: Gigahertz,
    pub carrier_max: Gigahertz,
    /// Carrier spacing of the zero calibration scan, in GHz.
    pub zero_carrier_step: f64,
    /// Carrier spacing of the sideband calibration scan, in GHz.
    pub sideband_carrier_step: f64,
    /// Largest sideband offset to calibrate, in GHz.
    pub sideband_max: f64,
    /// Sideband spacing, in GHz.
    pub sideband_step: f64,
}

impl RecalibrationRequest {
    /// Request with the customary scan spacings.
    pub fn new(board: impl Into<String>, carrier_min: Gigahertz, carrier_max: Gigahertz) -> Self {
        Self {
            board: board.into(),
            carrier_min,
            carrier_max,
            zero_carrier_step: 0.02,
            sideband_carrier_step: 0.05,
            sideband_max: 0.35,
            sideband_step: 0.05,
        }
    }
}

/// User-supplied measurement routine invoked by [`IqCorrector::recalibrate`].
pub type RecalibrationFn = Box<dyn FnMut(&RecalibrationRequest, &mut IqCorrector) + Send>;

/// Correction engine for a DAC board with an IQ mixer.
pub struct IqCorrector {
    board: String,
    dynamic_reserve: f64,
    lowpass: LowpassFilter,
    exceed_cal_limits: f64,
    flip_channels: bool,
    last_rescale_factor: f64,
    min_rescale_factor: f64,
    zero_cals: Vec<ZeroCalibration>,
    sideband_cals: Vec<SidebandCalibration>,
    pulse_cal: Option<PulseCalibration>,
    selection: SelectionMode,
    recalibration: Option<RecalibrationFn>,
    fft: FftEngine,
}

impl IqCorrector {
    /// Corrector for the given board, with no calibrations loaded.
    ///
    /// Until calibrations are loaded every correction is the identity:
    /// zero offsets of 0, no sideband compensation, no deconvolution.
    pub fn new(board: impl Into<String>) -> Self {
        Self {
            board: board.into(),
            dynamic_reserve: 2.0,
            lowpass: LowpassFilter::DEFAULT_IQ,
            exceed_cal_limits: 0.001,
            flip_channels: false,
            last_rescale_factor: 1.0,
            min_rescale_factor: 1.0,
            zero_cals: Vec::new(),
            sideband_cals: Vec::new(),
            pulse_cal: None,
            selection: SelectionMode::Auto,
            recalibration: None,
            fft: FftEngine::new(),
        }
    }

    /// Use a different target transfer function for deconvolution.
    pub fn with_lowpass(mut self, lowpass: LowpassFilter) -> Self {
        self.lowpass = lowpass;
        self
    }

    /// Tolerance, in GHz, by which a calibration may fall short of a
    /// requested range before a diagnostic is emitted.
    pub fn with_exceed_cal_limits(mut self, limit: f64) -> Self {
        self.exceed_cal_limits = limit;
        self
    }

    /// The board handle, unchanged.
    pub fn board(&self) -> &str {
        &self.board
    }

    pub fn flip_channels(&self) -> bool {
        self.flip_channels
    }

    pub fn selection(&self) -> SelectionMode {
        self.selection
    }

    /// Scale applied by the most recent rescaling correction call.
    pub fn last_rescale_factor(&self) -> f64 {
        self.last_rescale_factor
    }

    /// Smallest scale any rescaling correction call has applied so far.
    pub fn min_rescale_factor(&self) -> f64 {
        self.min_rescale_factor
    }

    pub fn pulse_cal(&self) -> Option<&PulseCalibration> {
        self.pulse_cal.as_ref()
    }

    /// Register the measurement routine used by [`recalibrate`].
    ///
    /// [`recalibrate`]: IqCorrector::recalibrate
    pub fn set_recalibration(&mut self, routine: RecalibrationFn) {
        self.recalibration = Some(routine);
    }

    // ---------------------------------------------------------------
    // Calibration loading and elimination
    // ---------------------------------------------------------------

    /// Append a zero calibration from rows of `[carrier_ghz, dac_a, dac_b]`.
    ///
    /// Which column feeds the I table follows the current channel
    /// assignment. The carrier axis must be strictly increasing.
    pub fn load_zero_cal(&mut self, rows: &[[f64; 3]], source: CalSource) -> CorrectionResult<()> {
        let axis: Vec<f64> = rows.iter().map(|r| r[0]).collect();
        let (start, end, step) = carrier_axis(&axis, "zero calibration")?;
        let (i_col, q_col) = if self.flip_channels { (2, 1) } else { (1, 2) };
        if rows.len() > 1 {
            tracing::info!(
                "zero calibration {}: carrier frequencies {} GHz to {} GHz in steps of {} MHz",
                source,
                start,
                end,
                step * 1e3
            );
        } else {
            tracing::info!("zero calibration {}: carrier frequency {} GHz", source, start);
        }
        self.zero_cals.push(ZeroCalibration {
            carrier_start: Gigahertz(start),
            carrier_end: Gigahertz(end),
            carrier_step: step,
            source,
            i_table: rows.iter().map(|r| r[i_col]).collect(),
            q_table: rows.iter().map(|r| r[q_col]).collect(),
        });
        Ok(())
    }

    /// Drop zero calibrations whose range a later entry covers.
    ///
    /// Returns the sources still in use. Pinned selections refer to list
    /// positions, so reselect after calling this.
    pub fn eliminate_zero_cals(&mut self) -> Vec<CalSource> {
        let starts: Vec<f64> = self.zero_cals.iter().map(|c| c.carrier_start.0).collect();
        let ends: Vec<f64> = self.zero_cals.iter().map(|c| c.carrier_end.0).collect();
        let keep = find_relevant(&starts, &ends);
        let mut index = 0;
        self.zero_cals.retain(|_| {
            let kept = keep.contains(&index);
            index += 1;
            kept
        });
        self.zero_cals.iter().map(|c| c.source).collect()
    }

    /// Append a sideband calibration from rows of
    /// `[carrier_ghz, re_0, im_0, re_1, im_1, ...]`.
    ///
    /// Each row tabulates the compensation over an odd number of sideband
    /// offsets symmetric about zero, spaced by `sideband_step` GHz.
    pub fn load_sideband_cal(
        &mut self,
        rows: &[Vec<f64>],
        sideband_step: f64,
        source: CalSource,
    ) -> CorrectionResult<()> {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        if width < 3 || (width - 1) % 2 != 0 {
            return Err(CorrectionError::BadShape(
                "sideband table rows need a carrier column plus re/im pairs".into(),
            ));
        }
        if rows.iter().any(|r| r.len() != width) {
            return Err(CorrectionError::BadShape(
                "sideband table rows have inconsistent widths".into(),
            ));
        }
        let count = (width - 1) / 2;
        if count % 2 == 0 {
            return Err(CorrectionError::BadShape(format!(
                "sideband axis must have odd width, got {count}"
            )));
        }
        let axis: Vec<f64> = rows.iter().map(|r| r[0]).collect();
        let (start, end, step) = carrier_axis(&axis, "sideband calibration")?;

        let mut values = Vec::with_capacity(rows.len() * count);
        for row in rows {
            for pair in 0..count {
                values.push(Complex64::new(row[1 + 2 * pair], row[2 + 2 * pair]));
            }
        }
        let compensation = Array2::from_shape_vec((rows.len(), count), values)
            .map_err(|e| CorrectionError::BadShape(e.to_string()))?;

        if rows.len() > 1 {
            tracing::info!(
                "sideband calibration {}: carrier frequencies {} GHz to {} GHz in steps of {} MHz",
                source,
                start,
                end,
                step * 1e3
            );
        } else {
            tracing::info!(
                "sideband calibration {}: carrier frequency {} GHz",
                source,
                start
            );
        }
        let max_offset_mhz = 500.0 * (count as f64 - 1.0) * sideband_step;
        tracing::info!(
            "sideband calibration {}: sideband frequencies {} MHz to {} MHz in steps of {} MHz",
            source,
            -max_offset_mhz,
            max_offset_mhz,
            sideband_step * 1e3
        );

        self.sideband_cals.push(SidebandCalibration {
            carrier_start: Gigahertz(start),
            carrier_end: Gigahertz(end),
            carrier_step: step,
            sideband_step,
            source,
            compensation,
        });
        Ok(())
    }

    /// Drop sideband calibrations whose range a later entry covers.
    ///
    /// Returns the sources still in use. Pinned selections refer to list
    /// positions, so reselect after calling this.
    pub fn eliminate_sideband_cals(&mut self) -> Vec<CalSource> {
        let starts: Vec<f64> = self.sideband_cals.iter().map(|c| c.carrier_start.0).collect();
        let ends: Vec<f64> = self.sideband_cals.iter().map(|c| c.carrier_end.0).collect();
        let keep = find_relevant(&starts, &ends);
        let mut index = 0;
        self.sideband_cals.retain(|_| {
            let kept = keep.contains(&index);
            index += 1;
            kept
        });
        self.sideband_cals.iter().map(|c| c.source).collect()
    }

    /// Extract the inverse pulse response from a measured mixer trace.
    ///
    /// `rows` hold `[t_ns, dac_a, dac_b]` samples of the mixer output while
    /// the board played a step or impulse, recorded at an integer sampling
    /// rate in GHz. The trace is demodulated at `carrier`, each channel's
    /// response is inverted independently and the correction magnitude is
    /// limited to three times the dynamic reserve so spectral nulls do not
    /// blow up the output. Replaces any previously loaded pulse
    /// calibration and fixes the channel assignment to `flip_channels`.
    pub fn load_pulse_cal(
        &mut self,
        rows: &[[f64; 3]],
        carrier: Gigahertz,
        source: CalSource,
        flip_channels: bool,
    ) -> CorrectionResult<()> {
        if rows.len() < 2 {
            return Err(CorrectionError::BadShape(
                "pulse calibration trace needs at least two samples".into(),
            ));
        }
        let dt = rows[1][0] - rows[0][0];
        if dt <= 0.0 {
            return Err(CorrectionError::BadAxis(format!(
                "pulse calibration time axis steps by {dt} ns"
            )));
        }
        let sampling = (1.0 / dt).round() as usize;
        if sampling == 0 {
            return Err(CorrectionError::BadAxis(format!(
                "pulse calibration sampling rate {} GHz is below 1 GS/s",
                1.0 / dt
            )));
        }

        self.flip_channels = flip_channels;
        let (i_col, q_col) = if flip_channels { (2, 1) } else { (1, 2) };
        let mut i_trace: Vec<f64> = rows.iter().map(|r| r[i_col]).collect();
        let mut q_trace: Vec<f64> = rows.iter().map(|r| r[q_col]).collect();
        remove_mean(&mut i_trace);
        remove_mean(&mut q_trace);

        let nfft = RESPONSE_LENGTH * sampling;
        let half = RESPONSE_LENGTH / 2;
        tracing::info!("pulse calibration {}: sampling frequency {} GHz", source, sampling);

        let carrier_bin = carrier.0 * RESPONSE_LENGTH as f64;
        if carrier_bin.floor() < carrier_bin.ceil() {
            tracing::warn!(
                "calibration carrier is not a multiple of {} MHz, accuracy may suffer",
                1e3 * sampling as f64 / nfft as f64
            );
        }
        let carrier_bin = carrier_bin.round();
        if carrier_bin < half as f64 || carrier_bin + half as f64 > (nfft / 2) as f64 {
            return Err(CorrectionError::CarrierOutOfBand {
                carrier: carrier.0,
                halfwidth: Gigahertz::NYQUIST.0,
            });
        }
        let carrier_bin = carrier_bin as usize;

        let i_spec = self.fft.rfft(&i_trace, nfft)?;
        let q_spec = self.fft.rfft(&q_trace, nfft)?;
        let limit = 3.0 * self.dynamic_reserve;
        self.pulse_cal = Some(PulseCalibration {
            correction_i: invert_response(&i_spec, carrier_bin, half, limit)?,
            correction_q: invert_response(&q_spec, carrier_bin, half, limit)?,
            source,
        });
        Ok(())
    }

    // ---------------------------------------------------------------
    // Calibration selection
    // ---------------------------------------------------------------

    /// Per correction, pick the best covering calibration. This is the
    /// default behaviour.
    pub fn select_all(&mut self) {
        self.selection = SelectionMode::Auto;
        tracing::info!("per correction the best covering calibration will be chosen");
    }

    /// Always use the latest calibration, extended beyond its range when
    /// the carrier lies outside it.
    pub fn select_latest(&mut self) {
        self.selection = SelectionMode::Latest;
        if let Some(cal) = self.zero_cals.last() {
            tracing::info!("zero calibration: selecting calset {}", cal.source);
        }
        if let Some(cal) = self.sideband_cals.last() {
            tracing::info!("sideband calibration: selecting calset {}", cal.source);
        }
    }

    /// Pin the calibrations that best cover the given carrier range.
    ///
    /// The choice stays fixed until another selection call; loading or
    /// eliminating entries afterwards does not move it, so reselect after
    /// changing the stores.
    pub fn select_by_range(&mut self, start: Gigahertz, end: Gigahertz) {
        let zero = if self.zero_cals.is_empty() {
            0
        } else {
            let starts: Vec<f64> = self.zero_cals.iter().map(|c| c.carrier_start.0).collect();
            let ends: Vec<f64> = self.zero_cals.iter().map(|c| c.carrier_end.0).collect();
            let index = find_cal_set(start.0, end.0, &starts, &ends, self.exceed_cal_limits, "zero");
            tracing::info!(
                "zero calibration: selecting calset {}",
                self.zero_cals[index].source
            );
            index
        };
        let sideband = if self.sideband_cals.is_empty() {
            0
        } else {
            let starts: Vec<f64> = self.sideband_cals.iter().map(|c| c.carrier_start.0).collect();
            let ends: Vec<f64> = self.sideband_cals.iter().map(|c| c.carrier_end.0).collect();
            let index = find_cal_set(
                start.0,
                end.0,
                &starts,
                &ends,
                self.exceed_cal_limits,
                "sideband",
            );
            tracing::info!(
                "sideband calibration: selecting calset {}",
                self.sideband_cals[index].source
            );
            index
        };
        self.selection = SelectionMode::Pinned { zero, sideband };
    }

    fn zero_index(&self, carrier: Gigahertz) -> usize {
        match self.selection {
            SelectionMode::Latest => self.zero_cals.len() - 1,
            SelectionMode::Pinned { zero, .. } => zero.min(self.zero_cals.len() - 1),
            SelectionMode::Auto => {
                let starts: Vec<f64> = self.zero_cals.iter().map(|c| c.carrier_start.0).collect();
                let ends: Vec<f64> = self.zero_cals.iter().map(|c| c.carrier_end.0).collect();
                find_cal_set(
                    carrier.0,
                    carrier.0,
                    &starts,
                    &ends,
                    self.exceed_cal_limits,
                    "zero",
                )
            }
        }
    }

    fn sideband_index(&self, carrier: Gigahertz) -> usize {
        match self.selection {
            SelectionMode::Latest => self.sideband_cals.len() - 1,
            SelectionMode::Pinned { sideband, .. } => sideband.min(self.sideband_cals.len() - 1),
            SelectionMode::Auto => {
                let starts: Vec<f64> =
                    self.sideband_cals.iter().map(|c| c.carrier_start.0).collect();
                let ends: Vec<f64> = self.sideband_cals.iter().map(|c| c.carrier_end.0).collect();
                find_cal_set(
                    carrier.0,
                    carrier.0,
                    &starts,
                    &ends,
                    self.exceed_cal_limits,
                    "sideband",
                )
            }
        }
    }

    // ---------------------------------------------------------------
    // Correction
    // ---------------------------------------------------------------

    /// DAC levels nulling the mixer output at the given carrier frequency.
    ///
    /// (0, 0) when no zero calibration is loaded.
    pub fn dac_zeros(&self, carrier: Gigahertz) -> (f64, f64) {
        if self.zero_cals.is_empty() {
            return (0.0, 0.0);
        }
        let cal = &self.zero_cals[self.zero_index(carrier)];
        let x = cal.fractional_index(carrier);
        (interp(&cal.i_table, x, false), interp(&cal.q_table, x, false))
    }

    /// Sideband compensation at the n + 1 offsets
    /// `{0, 1, ..., n/2, n/2+1-n, ..., -1, 0} / n` GHz.
    ///
    /// The stored grid covers a symmetric band around the carrier; beyond
    /// it the sideband axis is treated as periodic, wrapping the edge bins
    /// across the Nyquist seam. All zeros when no sideband calibration is
    /// loaded.
    pub fn sideband_compensation(&self, carrier: Gigahertz, n: usize) -> Vec<Complex64> {
        if self.sideband_cals.is_empty() {
            return vec![Complex64::new(0.0, 0.0); n + 1];
        }
        let cal = &self.sideband_cals[self.sideband_index(carrier)];
        let row = interp_rows(&cal.compensation, cal.fractional_index(carrier));
        let width = row.len();
        let max_freq = 0.5 * cal.sideband_step * (width as f64 - 1.0);
        let wrap = cal.sideband_step / (1.0 - 2.0 * max_freq);

        let mut extended = Vec::with_capacity(width + 2);
        extended.push(row[0] * (1.0 - wrap) + row[width - 1] * wrap);
        extended.extend_from_slice(&row);
        extended.push(row[width - 1] * (1.0 - wrap) + row[0] * wrap);

        (0..=n)
            .map(|k| {
                let f = output_sideband_frequency(k, n);
                interp(
                    &extended,
                    (f + max_freq + cal.sideband_step) / cal.sideband_step,
                    true,
                )
            })
            .collect()
    }

    /// Correct a complex baseband signal and pack it into SRAM words.
    ///
    /// The real part drives the I channel and the imaginary part the Q
    /// channel. Unless `loop_mode` is set the signal is padded to a fast
    /// FFT length; to keep the pulse-response correction from wrapping
    /// into the pulse, leave a few ns of (near-)constant signal before it
    /// and a few tens of ns after it.
    ///
    /// Only the lower 28 bits of each word are produced; callers can OR
    /// trigger flags into the top 4 bits as needed.
    pub fn correct(
        &mut self,
        carrier: Gigahertz,
        signal: &[Complex64],
        options: &CorrectionOptions,
    ) -> CorrectionResult<Vec<u32>> {
        let (i, q) = self.correct_pairs(carrier, signal, options)?;
        Ok(self.pack_pairs(&i, &q))
    }

    /// Like [`correct`], returning the quantized (I, Q) pairs unpacked.
    ///
    /// [`correct`]: IqCorrector::correct
    pub fn correct_raw(
        &mut self,
        carrier: Gigahertz,
        signal: &[Complex64],
        options: &CorrectionOptions,
    ) -> CorrectionResult<(Vec<i32>, Vec<i32>)> {
        self.correct_pairs(carrier, signal, options)
    }

    /// Correct an already transformed signal and pack it into SRAM words.
    ///
    /// `spectrum` holds the full complex FFT, bin k sitting at frequency
    /// k/nfft GHz for k < nfft/2 and k/nfft - 1 GHz above. Skipping the
    /// forward transform is faster and avoids sampling artifacts when the
    /// caller already has a spectral description. The result is truncated
    /// to `n` samples; `t0` shifts the output in time by a linear phase.
    pub fn correct_spectrum(
        &mut self,
        carrier: Gigahertz,
        spectrum: &[Complex64],
        n: usize,
        t0: Nanoseconds,
        options: &CorrectionOptions,
    ) -> CorrectionResult<Vec<u32>> {
        let (i, q) = self.correct_spectrum_raw(carrier, spectrum, n, t0, options)?;
        Ok(self.pack_pairs(&i, &q))
    }

    /// Like [`correct_spectrum`], returning the quantized (I, Q) pairs.
    ///
    /// [`correct_spectrum`]: IqCorrector::correct_spectrum
    pub fn correct_spectrum_raw(
        &mut self,
        carrier: Gigahertz,
        spectrum: &[Complex64],
        n: usize,
        t0: Nanoseconds,
        options: &CorrectionOptions,
    ) -> CorrectionResult<(Vec<i32>, Vec<i32>)> {
        if n == 0 || spectrum.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        self.dacify_pairs(carrier, spectrum.to_vec(), n, t0, options)
    }

    /// Constant fill at the calibrated zero level, for idle stretches.
    pub fn idle_words(&self, carrier: Gigahertz, n: usize, zero_correction: bool) -> Vec<u32> {
        let word = if zero_correction {
            let (zero_i, zero_q) = self.dac_zeros(carrier);
            dac::pack_iq(
                zero_i.round() as i32,
                zero_q.round() as i32,
                self.flip_channels,
            )
        } else {
            0
        };
        vec![word; n]
    }

    /// Run the registered recalibration routine over a carrier range.
    ///
    /// With no routine registered this reports the fact and leaves the
    /// corrector unchanged. `carrier_max` defaults to `carrier_min`.
    pub fn recalibrate(&mut self, carrier_min: Gigahertz, carrier_max: Option<Gigahertz>) {
        let request = RecalibrationRequest::new(
            self.board.clone(),
            carrier_min,
            carrier_max.unwrap_or(carrier_min),
        );
        self.recalibrate_with(&request);
    }

    /// Run the registered recalibration routine with explicit parameters.
    pub fn recalibrate_with(&mut self, request: &RecalibrationRequest) {
        let Some(mut routine) = self.recalibration.take() else {
            tracing::warn!("no calibration routine hooked in");
            return;
        };
        routine(request, self);
        self.recalibration = Some(routine);
    }

    fn correct_pairs(
        &mut self,
        carrier: Gigahertz,
        signal: &[Complex64],
        options: &CorrectionOptions,
    ) -> CorrectionResult<(Vec<i32>, Vec<i32>)> {
        if signal.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let n = signal.len();
        let spectrum = if n > 1 {
            let nfft = if options.loop_mode { n } else { fast_fft_len(n) };
            // Remove the edge level before padding so the zero tail does
            // not introduce a step, then restore it in the DC bin.
            let background = (signal[0] + signal[n - 1]) * 0.5;
            let shifted: Vec<Complex64> = signal.iter().map(|&s| s - background).collect();
            let mut spectrum = self.fft.fft(&shifted, nfft)?;
            spectrum[0] += background * nfft as f64;
            spectrum
        } else {
            vec![signal[0]]
        };
        self.dacify_pairs(carrier, spectrum, n, Nanoseconds::ZERO, options)
    }

    /// The transform pipeline: IQ correction, conjugate-symmetry split,
    /// deconvolution, inverse transform and range fitting.
    fn dacify_pairs(
        &mut self,
        carrier: Gigahertz,
        mut signal: Vec<Complex64>,
        n: usize,
        t0: Nanoseconds,
        options: &CorrectionOptions,
    ) -> CorrectionResult<(Vec<i32>, Vec<i32>)> {
        let nfft = signal.len();
        let n = n.min(nfft);
        if t0.0 != 0.0 {
            for (k, bin) in signal.iter_mut().enumerate() {
                let f = bin_frequency(k, nfft);
                *bin *= Complex64::from_polar(1.0, 2.0 * PI * t0.0 * f);
            }
        }

        let (i_samples, q_samples) = if n > 1 {
            // Close the spectrum with a copy of bin 0 so bin nfft - k is
            // the component at the frequency opposite bin k.
            signal.push(signal[0]);
            if options.iq_correction {
                let compensation = self.sideband_compensation(carrier, nfft);
                let mirrored: Vec<Complex64> =
                    (0..=nfft).map(|k| signal[nfft - k].conj()).collect();
                for k in 0..=nfft {
                    signal[k] += mirrored[k] * compensation[k];
                }
            }

            // Split into the transform of a real signal (I) and of an
            // imaginary signal (Q).
            let nrfft = nfft / 2 + 1;
            let mut i_spec = Vec::with_capacity(nrfft);
            let mut q_spec = Vec::with_capacity(nrfft);
            for k in 0..nrfft {
                let direct = signal[k];
                let mirror = signal[nfft - k].conj();
                i_spec.push((direct + mirror) * 0.5);
                q_spec.push((direct - mirror) * Complex64::new(0.0, -0.5));
            }

            if options.deconvolve {
                if let Some(cal) = &self.pulse_cal {
                    // Resample the stored inverse response at the working
                    // transform resolution.
                    let len = cal.correction_i.len();
                    let stride = 2.0 * (len as f64 - 1.0) / nfft as f64;
                    let lowpass = self.lowpass.response(nfft);
                    for k in 0..nrfft {
                        let f = k as f64 * stride;
                        i_spec[k] *= interp(&cal.correction_i, f, true) * lowpass[k];
                        q_spec[k] *= interp(&cal.correction_q, f, true) * lowpass[k];
                    }
                }
            }

            let mut i_time = self.fft.irfft(&i_spec, nfft)?;
            let mut q_time = self.fft.irfft(&q_spec, nfft)?;
            i_time.truncate(n);
            q_time.truncate(n);
            (i_time, q_time)
        } else {
            // A single sample has no sideband structure; only the
            // zero-offset compensation term applies.
            let mut value = signal[0];
            if options.iq_correction {
                let compensation = self.sideband_compensation(carrier, 1);
                value += value.conj() * compensation[0];
            }
            (vec![value.re], vec![value.im])
        };

        let mut fullscale = DAC_MAX as f64 / self.dynamic_reserve;
        let (zero_i, zero_q) = if options.zero_correction {
            self.dac_zeros(carrier)
        } else {
            (0.0, 0.0)
        };

        if options.rescale {
            let scale = rescale_factor(
                &[(i_samples.as_slice(), zero_i), (q_samples.as_slice(), zero_q)],
                fullscale,
            );
            if scale < 1.0 {
                tracing::info!("corrected signal scaled by {} to fit the DAC range", scale);
            }
            self.last_rescale_factor = scale;
            if scale < self.min_rescale_factor {
                self.min_rescale_factor = scale;
            }
            fullscale *= scale;
        }

        let mut i_codes = quantize(&i_samples, fullscale, zero_i);
        let mut q_codes = quantize(&q_samples, fullscale, zero_q);
        if !options.rescale {
            let clipped_i = clip_samples(&mut i_codes);
            let clipped_q = clip_samples(&mut q_codes);
            if clipped_i || clipped_q {
                tracing::warn!("corrected IQ signal beyond DAC range, clipping");
            }
        }
        Ok((i_codes, q_codes))
    }

    fn pack_pairs(&self, i: &[i32], q: &[i32]) -> Vec<u32> {
        i.iter()
            .zip(q)
            .map(|(&a, &b)| dac::pack_iq(a, b, self.flip_channels))
            .collect()
    }
}

/// Frequency of bin k of an nfft-point transform, in GHz at 1 GS/s.
fn bin_frequency(k: usize, nfft: usize) -> f64 {
    if 2 * k < nfft {
        k as f64 / nfft as f64
    } else {
        k as f64 / nfft as f64 - 1.0
    }
}

/// Sideband frequency of output bin k; the final bin repeats DC.
fn output_sideband_frequency(k: usize, n: usize) -> f64 {
    if k == n {
        0.0
    } else if 2 * k <= n {
        k as f64 / n as f64
    } else {
        (k as f64 - n as f64) / n as f64
    }
}

fn remove_mean(trace: &mut [f64]) {
    if trace.is_empty() {
        return;
    }
    let mean = trace.iter().sum::<f64>() / trace.len() as f64;
    for v in trace.iter_mut() {
        *v -= mean;
    }
}

/// Interpolate between grid rows at fractional row index `x`, with flat
/// extension beyond the carrier range.
fn interp_rows(grid: &Array2<Complex64>, x: f64) -> Vec<Complex64> {
    let rows = grid.nrows();
    if rows == 1 {
        return grid.row(0).to_vec();
    }
    let segment = (x.floor() as isize).clamp(0, rows as isize - 2) as usize;
    let frac = (x - segment as f64).clamp(0.0, 1.0);
    grid.row(segment)
        .iter()
        .zip(grid.row(segment + 1).iter())
        .map(|(a, b)| *a * (1.0 - frac) + *b * frac)
        .collect()
}

/// Demodulate one channel's spectrum around the carrier and invert it.
///
/// `low` and `high` walk symmetrically down and up from the carrier bin.
/// The carrier's complex phase reference comes from their cross
/// correlation; its sign is fixed so the DC response stays positive. The
/// inverse magnitude is limited to `limit`, preserving phase, so nulls in
/// the measured response cannot produce unbounded gain.
fn invert_response(
    spectrum: &[Complex64],
    carrier_bin: usize,
    half: usize,
    limit: f64,
) -> CorrectionResult<Vec<Complex64>> {
    let low: Vec<Complex64> = (0..=half).map(|k| spectrum[carrier_bin - k]).collect();
    let high: Vec<Complex64> = (0..=half).map(|k| spectrum[carrier_bin + k]).collect();

    let mut phase = low
        .iter()
        .zip(&high)
        .map(|(l, h)| l * h)
        .sum::<Complex64>()
        .sqrt();
    if phase.norm() == 0.0 {
        phase = Complex64::new(1.0, 0.0);
    } else {
        phase /= phase.norm();
    }
    if (phase.conj() * low[0]).re < 0.0 {
        phase = -phase;
    }

    let amplitude = low[0].norm();
    if amplitude == 0.0 {
        return Err(CorrectionError::BadShape(
            "measured trace has no power at the carrier frequency".into(),
        ));
    }

    Ok((0..=half)
        .map(|k| {
            let response = ((low[k] / phase).conj() + high[k] / phase) * (0.5 / amplitude);
            let mut correction = Complex64::new(1.0, 0.0) / response;
            let magnitude = correction.norm();
            if magnitude > limit {
                correction *= limit / magnitude;
            }
            correction
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_types::dac::pack_iq;

    fn zeros(n: usize) -> Vec<Complex64> {
        vec![Complex64::new(0.0, 0.0); n]
    }

    #[test]
    fn test_no_calibration_is_identity() {
        let corrector = IqCorrector::new("test board");
        assert_eq!(corrector.dac_zeros(Gigahertz(6.0)), (0.0, 0.0));
        let comp = corrector.sideband_compensation(Gigahertz(6.0), 8);
        assert_eq!(comp.len(), 9);
        assert!(comp.iter().all(|c| c.norm() == 0.0));
    }

    #[test]
    fn test_empty_signal() {
        let mut corrector = IqCorrector::new("test board");
        let words = corrector
            .correct(Gigahertz(6.0), &[], &CorrectionOptions::default())
            .unwrap();
        assert!(words.is_empty());
    }

    #[test]
    fn test_zero_waveform_packs_dac_zeros() {
        let mut corrector = IqCorrector::new("test board");
        corrector.load_zero_cal(&[[6.0, 100.0, -200.0]], 1).unwrap();

        let words = corrector
            .correct(Gigahertz(6.0), &zeros(16), &CorrectionOptions::default())
            .unwrap();
        assert_eq!(words.len(), 16);
        let expected = pack_iq(100, -200, false);
        assert!(words.iter().all(|&w| w == expected));
    }

    #[test]
    fn test_zero_cal_interpolation() {
        let mut corrector = IqCorrector::new("test board");
        corrector
            .load_zero_cal(&[[5.0, 10.0, -10.0], [5.1, 20.0, -30.0]], 1)
            .unwrap();
        let (i, q) = corrector.dac_zeros(Gigahertz(5.05));
        assert!((i - 15.0).abs() < 1e-9);
        assert!((q - -20.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_cal_rejects_bad_axis() {
        let mut corrector = IqCorrector::new("test board");
        let result = corrector.load_zero_cal(&[[6.0, 0.0, 0.0], [5.0, 0.0, 0.0]], 1);
        assert!(matches!(result, Err(CorrectionError::BadAxis(_))));
    }

    #[test]
    fn test_identical_reload_then_eliminate_keeps_latest() {
        let mut corrector = IqCorrector::new("test board");
        let rows = [[5.0, 1.0, 2.0], [6.0, 3.0, 4.0]];
        corrector.load_zero_cal(&rows, 1).unwrap();
        corrector.load_zero_cal(&rows, 2).unwrap();

        let survivors = corrector.eliminate_zero_cals();
        assert_eq!(survivors, vec![2]);
    }

    #[test]
    fn test_auto_selection_tie_breaks_toward_latest() {
        let mut corrector = IqCorrector::new("test board");
        corrector
            .load_zero_cal(&[[5.0, 10.0, 10.0], [7.0, 10.0, 10.0]], 1)
            .unwrap();
        corrector
            .load_zero_cal(&[[5.0, 20.0, 20.0], [7.0, 20.0, 20.0]], 2)
            .unwrap();
        assert_eq!(corrector.dac_zeros(Gigahertz(6.0)), (20.0, 20.0));
    }

    #[test]
    fn test_undercovered_range_uses_closest_entry() {
        let mut corrector = IqCorrector::new("test board");
        corrector
            .load_zero_cal(&[[5.0, 1.0, 0.0], [6.0, 2.0, 0.0]], 1)
            .unwrap();
        // 7 GHz is a full GHz outside the table; the table edge applies.
        let (i, _) = corrector.dac_zeros(Gigahertz(7.0));
        assert!((i - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_select_by_range_pins_until_reselected() {
        let mut corrector = IqCorrector::new("test board");
        corrector
            .load_zero_cal(&[[5.0, 10.0, 0.0], [6.0, 11.0, 0.0]], 1)
            .unwrap();
        corrector
            .load_zero_cal(&[[6.0, 20.0, 0.0], [7.0, 21.0, 0.0]], 2)
            .unwrap();

        corrector.select_by_range(Gigahertz(5.2), Gigahertz(5.8));
        assert_eq!(
            corrector.selection(),
            SelectionMode::Pinned { zero: 0, sideband: 0 }
        );
        // Pinned to the first entry, 6.5 GHz reads its flat extension.
        let (i, _) = corrector.dac_zeros(Gigahertz(6.5));
        assert!((i - 11.0).abs() < 1e-12);

        corrector.select_all();
        let (i, _) = corrector.dac_zeros(Gigahertz(6.5));
        assert!((i - 20.5).abs() < 1e-12);
    }

    #[test]
    fn test_sideband_compensation_grid_lookup() {
        let mut corrector = IqCorrector::new("test board");
        let a = Complex64::new(1.0, 0.0);
        let b = Complex64::new(2.0, 0.5);
        let c = Complex64::new(3.0, -1.0);
        corrector
            .load_sideband_cal(&[vec![6.0, a.re, a.im, b.re, b.im, c.re, c.im]], 0.1, 1)
            .unwrap();

        let n = 10;
        let comp = corrector.sideband_compensation(Gigahertz(6.0), n);
        assert_eq!(comp.len(), n + 1);
        // Center, +step and -step land on grid values.
        assert!((comp[0] - b).norm() < 1e-12);
        assert!((comp[1] - c).norm() < 1e-12);
        assert!((comp[9] - a).norm() < 1e-12);
        // The closing bin repeats DC.
        assert!((comp[10] - b).norm() < 1e-12);
        // One step past the grid edge wraps toward the opposite edge.
        let wrapped = c * (1.0 - 0.125) + a * 0.125;
        assert!((comp[2] - wrapped).norm() < 1e-12);
    }

    #[test]
    fn test_sideband_cal_rejects_even_width() {
        let mut corrector = IqCorrector::new("test board");
        let result = corrector.load_sideband_cal(
            &[vec![6.0, 1.0, 0.0, 2.0, 0.0, 3.0, 0.0, 4.0, 0.0]],
            0.1,
            1,
        );
        assert!(matches!(result, Err(CorrectionError::BadShape(_))));
    }

    #[test]
    fn test_single_sample_applies_dc_compensation_only() {
        let mut corrector = IqCorrector::new("test board");
        let signal = [Complex64::new(0.5, 0.3)];
        let (i, q) = corrector
            .correct_raw(Gigahertz(6.0), &signal, &CorrectionOptions::default())
            .unwrap();
        // fullscale = 0x1FFF / 2
        assert_eq!(i, vec![2048]);
        assert_eq!(q, vec![1229]);
    }

    #[test]
    fn test_loop_mode_reproduces_complex_exponential() {
        let mut corrector = IqCorrector::new("test board");
        let n = 17;
        let signal: Vec<Complex64> = (0..n)
            .map(|m| Complex64::from_polar(0.5, 2.0 * PI * 3.0 * m as f64 / n as f64))
            .collect();
        let options = CorrectionOptions {
            loop_mode: true,
            ..Default::default()
        };
        let (i, q) = corrector
            .correct_raw(Gigahertz(6.0), &signal, &options)
            .unwrap();

        let fullscale = DAC_MAX as f64 / 2.0;
        for m in 0..n {
            let angle = 2.0 * PI * 3.0 * m as f64 / n as f64;
            let expected_i = (0.5 * angle.cos() * fullscale).round() as i32;
            let expected_q = (0.5 * angle.sin() * fullscale).round() as i32;
            assert!((i[m] - expected_i).abs() <= 1, "I sample {m}");
            assert!((q[m] - expected_q).abs() <= 1, "Q sample {m}");
        }
    }

    #[test]
    fn test_clipping_at_range_boundary() {
        let mut corrector = IqCorrector::new("test board");
        let signal = vec![Complex64::new(3.0, 0.0); 8];
        let (i, q) = corrector
            .correct_raw(Gigahertz(6.0), &signal, &CorrectionOptions::default())
            .unwrap();
        assert!(i.iter().all(|&v| v == DAC_MAX));
        assert!(q.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_rescale_tracks_factor() {
        let mut corrector = IqCorrector::new("test board");
        let signal = vec![Complex64::new(3.0, 0.0); 8];
        let options = CorrectionOptions {
            rescale: true,
            ..Default::default()
        };
        let (i, _) = corrector
            .correct_raw(Gigahertz(6.0), &signal, &options)
            .unwrap();
        // 3.0 * fullscale overshoots by 1.5x, so the scale is 2/3.
        assert!((corrector.last_rescale_factor() - 2.0 / 3.0).abs() < 1e-6);
        assert!((corrector.min_rescale_factor() - 2.0 / 3.0).abs() < 1e-6);
        assert!(i.iter().all(|&v| (v - DAC_MAX).abs() <= 1));

        // The minimum ratchets: a harmless call leaves it in place.
        let tame = vec![Complex64::new(0.1, 0.0); 8];
        corrector.correct_raw(Gigahertz(6.0), &tame, &options).unwrap();
        assert_eq!(corrector.last_rescale_factor(), 1.0);
        assert!((corrector.min_rescale_factor() - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_correct_matches_correct_spectrum() {
        let mut corrector = IqCorrector::new("test board");
        corrector.load_zero_cal(&[[6.0, 50.0, -50.0]], 1).unwrap();

        let n = 50;
        let signal: Vec<Complex64> = (0..n)
            .map(|m| {
                let t = m as f64 - 25.0;
                Complex64::new(0.4 * (-t * t / 18.0).exp(), 0.1)
            })
            .collect();
        let options = CorrectionOptions::default();
        let direct = corrector.correct(Gigahertz(6.0), &signal, &options).unwrap();

        let nfft = lib_dsp::fast_fft_len(n);
        let background = (signal[0] + signal[n - 1]) * 0.5;
        let shifted: Vec<Complex64> = signal.iter().map(|&s| s - background).collect();
        let mut engine = FftEngine::new();
        let mut spectrum = engine.fft(&shifted, nfft).unwrap();
        spectrum[0] += background * nfft as f64;

        let via_spectrum = corrector
            .correct_spectrum(Gigahertz(6.0), &spectrum, n, Nanoseconds::ZERO, &options)
            .unwrap();
        assert_eq!(direct, via_spectrum);
    }

    #[test]
    fn test_pulse_cal_from_pure_carrier() {
        let mut corrector = IqCorrector::new("test board");
        // 256 samples of a 1 GHz carrier recorded at 4 GS/s; whole periods,
        // so both traces have zero mean.
        let rows: Vec<[f64; 3]> = (0..256)
            .map(|k| {
                let t = k as f64 * 0.25;
                let phase = 2.0 * PI * t;
                [t, phase.cos(), phase.sin()]
            })
            .collect();
        corrector
            .load_pulse_cal(&rows, Gigahertz(1.0), 7, false)
            .unwrap();

        let cal = corrector.pulse_cal().unwrap();
        assert_eq!(cal.correction_i.len(), RESPONSE_LENGTH / 2 + 1);
        assert_eq!(cal.source, 7);

        // A flat carrier inverts to unity at the carrier itself.
        assert!((cal.correction_i[0] - Complex64::new(1.0, 0.0)).norm() < 0.05);

        // Away from the carrier the measured power vanishes, so the
        // inverse saturates at 3x the dynamic reserve.
        let limit = 6.0;
        let max = cal
            .correction_i
            .iter()
            .map(|c| c.norm())
            .fold(0.0, f64::max);
        assert!(max <= limit + 1e-9);
        assert!(
            cal.correction_i
                .iter()
                .any(|c| (c.norm() - limit).abs() < 1e-9)
        );
    }

    #[test]
    fn test_pulse_cal_sets_flip_channels() {
        let mut corrector = IqCorrector::new("test board");
        let rows: Vec<[f64; 3]> = (0..256)
            .map(|k| {
                let t = k as f64 * 0.25;
                let phase = 2.0 * PI * t;
                [t, phase.cos(), phase.sin()]
            })
            .collect();
        corrector
            .load_pulse_cal(&rows, Gigahertz(1.0), 8, true)
            .unwrap();
        assert!(corrector.flip_channels());
    }

    #[test]
    fn test_pulse_cal_carrier_out_of_band() {
        let mut corrector = IqCorrector::new("test board");
        let rows: Vec<[f64; 3]> = (0..64)
            .map(|k| [k as f64, (k as f64).cos(), (k as f64).sin()])
            .collect();
        // At 1 GS/s the spectrum only reaches 0.5 GHz; a 2 GHz carrier
        // cannot be demodulated from it.
        let result = corrector.load_pulse_cal(&rows, Gigahertz(2.0), 9, false);
        assert!(matches!(
            result,
            Err(CorrectionError::CarrierOutOfBand { .. })
        ));
    }

    #[test]
    fn test_idle_words() {
        let mut corrector = IqCorrector::new("test board");
        corrector.load_zero_cal(&[[6.0, 100.0, -200.0]], 1).unwrap();
        let words = corrector.idle_words(Gigahertz(6.0), 4, true);
        assert_eq!(words, vec![pack_iq(100, -200, false); 4]);
        assert_eq!(corrector.idle_words(Gigahertz(6.0), 3, false), vec![0; 3]);
    }

    #[test]
    fn test_recalibrate_without_routine_is_noop() {
        let mut corrector = IqCorrector::new("board A");
        corrector.recalibrate(Gigahertz(5.0), None);
        assert_eq!(corrector.dac_zeros(Gigahertz(5.0)), (0.0, 0.0));
    }

    #[test]
    fn test_recalibrate_invokes_routine() {
        let mut corrector = IqCorrector::new("board A");
        corrector.set_recalibration(Box::new(|request, corrector| {
            assert_eq!(request.board, "board A");
            assert!((request.zero_carrier_step - 0.02).abs() < 1e-12);
            assert!((request.sideband_max - 0.35).abs() < 1e-12);
            let row = [request.carrier_min.0, 1.0, 2.0];
            corrector.load_zero_cal(&[row], 99).unwrap();
        }));
        corrector.recalibrate(Gigahertz(5.0), Some(Gigahertz(6.0)));
        assert_eq!(corrector.dac_zeros(Gigahertz(5.0)), (1.0, 2.0));
    }

    #[test]
    fn test_packed_output_uses_flip_channels() {
        let mut corrector = IqCorrector::new("test board");
        corrector.load_zero_cal(&[[6.0, 100.0, -200.0]], 1).unwrap();
        let plain = corrector
            .correct(Gigahertz(6.0), &zeros(2), &CorrectionOptions::default())
            .unwrap();
        assert_eq!(plain[0], pack_iq(100, -200, false));
    }

    #[test]
    fn test_words_never_touch_trigger_bits() {
        let mut corrector = IqCorrector::new("test board");
        let signal = vec![Complex64::new(-1.0, -1.0); 5];
        let words = corrector
            .correct(Gigahertz(6.0), &signal, &CorrectionOptions::default())
            .unwrap();
        assert!(words.iter().all(|w| w & lib_types::dac::TRIGGER_MASK == 0));
    }
}
