//! # lib-dsp
//!
//! Numerical primitives for DAC-Kernel waveform correction.
//!
//! This crate provides the mathematical core shared by the correction
//! engines:
//!
//! - **FFT/IFFT**: complex and real transforms with planner caching
//! - **Transform sizing**: 235-smooth length selection with a memo table
//! - **Interpolation**: fractional-index lookup with optional extrapolation
//! - **Interval pruning**: relevance filtering of overlapping ranges
//! - **Lowpass shapes**: target transfer functions for deconvolution

pub mod error;
pub mod fft;
pub mod fftlen;
pub mod filters;
pub mod interp;
pub mod intervals;

pub use error::{DspError, DspResult};
pub use fft::FftEngine;
pub use fftlen::fast_fft_len;
pub use filters::LowpassFilter;
pub use interp::interp;
pub use intervals::find_relevant;
