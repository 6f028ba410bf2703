//! DAC range fitting: uniform rescale and saturation.

use lib_types::dac::{DAC_MAX, DAC_MIN};

/// Largest scale in [0, 1] keeping `sample * fullscale * scale + zero`
/// inside the DAC range for every channel.
///
/// A boundary only constrains the scale when some sample actually reaches
/// toward it, so single-signed signals are handled correctly.
pub(crate) fn rescale_factor(channels: &[(&[f64], f64)], fullscale: f64) -> f64 {
    let mut scale = 1.0f64;
    for (samples, zero) in channels {
        let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        if max > 0.0 {
            scale = scale.min((DAC_MAX as f64 - zero) / fullscale / max);
        }
        if min < 0.0 {
            scale = scale.min((DAC_MIN as f64 - zero) / fullscale / min);
        }
    }
    scale.clamp(0.0, 1.0)
}

/// Quantize scaled samples to DAC codes.
pub(crate) fn quantize(samples: &[f64], fullscale: f64, zero: f64) -> Vec<i32> {
    samples
        .iter()
        .map(|&v| (v * fullscale + zero).round() as i32)
        .collect()
}

/// Saturate samples to the DAC range; true if any sample was out of range.
pub(crate) fn clip_samples(samples: &mut [i32]) -> bool {
    let mut clipped = false;
    for v in samples.iter_mut() {
        let c = (*v).clamp(DAC_MIN, DAC_MAX);
        if c != *v {
            clipped = true;
            *v = c;
        }
    }
    clipped
}
