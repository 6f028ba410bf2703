//! # lib-types
//!
//! Core type definitions for DAC-Kernel waveform correction.
//!
//! This crate provides foundational types used throughout the DAC-Kernel
//! workspace:
//! - Physical units with compile-time safety
//! - The DAC word model: sample range, channel packing, trigger-bit layout

pub mod units;
pub mod dac;

pub use units::*;
pub use dac::*;

/// Re-export num_complex for convenience
pub use num_complex::Complex64;
