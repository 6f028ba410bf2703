//! Error types for calibration handling and correction.

use lib_dsp::DspError;
use thiserror::Error;

/// Errors that can occur while loading calibrations or correcting waveforms.
#[derive(Debug, Error)]
pub enum CorrectionError {
    /// Settling rates and amplitudes must pair up one to one.
    #[error("settling rates and amplitudes must have the same length: {rates} vs {amplitudes}")]
    ShapeMismatch { rates: usize, amplitudes: usize },

    /// A calibration table has the wrong layout.
    #[error("malformed calibration table: {0}")]
    BadShape(String),

    /// A calibration axis is not strictly increasing.
    #[error("calibration axis must be strictly increasing: {0}")]
    BadAxis(String),

    /// The demodulation window around the carrier leaves the measured band.
    #[error(
        "carrier at {carrier} GHz leaves no room for a +-{halfwidth} GHz demodulation window"
    )]
    CarrierOutOfBand { carrier: f64, halfwidth: f64 },

    /// A transform failed in the underlying DSP layer.
    #[error(transparent)]
    Dsp(#[from] DspError),
}

/// Result type for correction operations.
pub type CorrectionResult<T> = Result<T, CorrectionError>;
