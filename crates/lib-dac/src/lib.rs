//! # lib-dac
//!
//! Waveform correction engines for GHz DAC boards.
//!
//! A signal-generation board distorts what it plays: each channel has a
//! gain and zero offset, the DAC and its analog chain smear pulses, and a
//! board driving an IQ mixer adds carrier-dependent LO leakage and I/Q
//! non-orthogonality. This crate predistorts waveforms in the frequency
//! domain so the analog output matches the requested signal, then
//! quantizes and packs the result into hardware sample words:
//!
//! - [`IqCorrector`]: dual-channel boards behind an IQ mixer
//! - [`ChannelCorrector`]: a single DAC channel
//!
//! Calibration measurements come from outside as plain numeric tables;
//! correctors store them, prune stale entries and pick the applicable one
//! per correction. Diagnostics go through `tracing` and never affect
//! results.

pub mod calibration;
pub mod channel;
pub mod error;
pub mod iq;
mod range;

pub use calibration::{
    CalSource, PulseCalibration, SelectionMode, SidebandCalibration, ZeroCalibration,
};
pub use channel::{ChannelCorrector, ChannelOptions};
pub use error::{CorrectionError, CorrectionResult};
pub use iq::{CorrectionOptions, IqCorrector, RecalibrationFn, RecalibrationRequest};

/// Re-export the filter shapes used to configure correctors.
pub use lib_dsp::LowpassFilter;
