//! Calibration entries, selection policy and shared table handling.
//!
//! Calibration data arrives as plain numeric tables from an external store.
//! Entries are created by the load operations, never mutated afterwards, and
//! removed only by the staleness-elimination operations, which recompute
//! membership with [`lib_dsp::find_relevant`].

use crate::error::{CorrectionError, CorrectionResult};
use lib_types::Gigahertz;
use ndarray::Array2;
use num_complex::Complex64;

/// Identifier of the external dataset a calibration entry was loaded from.
pub type CalSource = u32;

/// Number of output samples of a resolved response filter is
/// `RESPONSE_LENGTH / 2 + 1`; measured traces are padded to
/// `RESPONSE_LENGTH` times the trace sampling rate before transforming, for
/// fine frequency resolution.
pub(crate) const RESPONSE_LENGTH: usize = 10240;

/// DAC levels nulling the mixer output, tabulated over carrier frequency.
#[derive(Clone, Debug)]
pub struct ZeroCalibration {
    pub carrier_start: Gigahertz,
    pub carrier_end: Gigahertz,
    /// Carrier grid spacing in GHz; 1.0 for a single-frequency table.
    pub carrier_step: f64,
    pub source: CalSource,
    pub i_table: Vec<f64>,
    pub q_table: Vec<f64>,
}

impl ZeroCalibration {
    /// Fractional table index of a carrier frequency.
    pub fn fractional_index(&self, carrier: Gigahertz) -> f64 {
        (carrier - self.carrier_start).0 / self.carrier_step
    }
}

/// Sideband-dependent leakage compensation, tabulated over carrier and
/// sideband frequency.
#[derive(Clone, Debug)]
pub struct SidebandCalibration {
    pub carrier_start: Gigahertz,
    pub carrier_end: Gigahertz,
    /// Carrier grid spacing in GHz; 1.0 for a single-carrier table.
    pub carrier_step: f64,
    /// Sideband grid spacing in GHz.
    pub sideband_step: f64,
    pub source: CalSource,
    /// Compensation values indexed `[carrier][sideband]`; the sideband axis
    /// has odd width and is symmetric about zero offset.
    pub compensation: Array2<Complex64>,
}

impl SidebandCalibration {
    /// Fractional carrier index of a carrier frequency.
    pub fn fractional_index(&self, carrier: Gigahertz) -> f64 {
        (carrier - self.carrier_start).0 / self.carrier_step
    }

    /// Width of the sideband axis.
    pub fn sideband_count(&self) -> usize {
        self.compensation.ncols()
    }
}

/// Inverse pulse response of the two mixer input channels, from DC to
/// Nyquist. At most one is active; loading a new one replaces it.
#[derive(Clone, Debug)]
pub struct PulseCalibration {
    pub correction_i: Vec<Complex64>,
    pub correction_q: Vec<Complex64>,
    pub source: CalSource,
}

/// How a corrector picks among loaded calibration entries.
///
/// `Auto` resolves per query. The other modes pin list positions when
/// selected, so after any elimination call the caller must reselect; a
/// pinned position may otherwise refer to a different entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionMode {
    /// Per query, use the entry that best covers the requested frequency.
    Auto,
    /// Always use the last loaded entry, extended beyond its range.
    Latest,
    /// Use the entries pinned by `select_by_range`.
    Pinned { zero: usize, sideband: usize },
}

/// Best-covering entry for a frequency range.
///
/// Badness of an entry is `max(exceed_limit, start - range_start,
/// range_end - end)`; exact ties resolve toward the most recently loaded
/// entry. When even the best entry falls short by more than `exceed_limit`,
/// a diagnostic names its actual coverage; the entry is still used,
/// extended beyond its range.
pub(crate) fn find_cal_set(
    range_start: f64,
    range_end: f64,
    starts: &[f64],
    ends: &[f64],
    exceed_limit: f64,
    kind: &str,
) -> usize {
    debug_assert!(!starts.is_empty());
    let mut best = 0;
    let mut best_badness = f64::INFINITY;
    for i in 0..starts.len() {
        let badness = exceed_limit
            .max(starts[i] - range_start)
            .max(range_end - ends[i]);
        if badness <= best_badness {
            best = i;
            best_badness = badness;
        }
    }
    if best_badness > exceed_limit {
        tracing::warn!(
            "closest {} calibration only covers {} GHz to {} GHz",
            kind,
            starts[best],
            ends[best]
        );
    }
    best
}

/// Validate a carrier axis and derive its range and step.
///
/// Returns `(start, end, step)` with step 1.0 for a single-row table.
pub(crate) fn carrier_axis(axis: &[f64], what: &str) -> CorrectionResult<(f64, f64, f64)> {
    if axis.is_empty() {
        return Err(CorrectionError::BadShape(format!("{what} table has no rows")));
    }
    for pair in axis.windows(2) {
        if pair[1] <= pair[0] {
            return Err(CorrectionError::BadAxis(format!(
                "{what} table carrier axis goes from {} GHz to {} GHz",
                pair[0], pair[1]
            )));
        }
    }
    let step = if axis.len() > 1 { axis[1] - axis[0] } else { 1.0 };
    Ok((axis[0], axis[axis.len() - 1], step))
}
