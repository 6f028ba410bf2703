//! Relevance filtering of overlapping interval sets.

/// Indices of intervals not covered by a later interval.
///
/// Interval `i` is obsolete when some interval loaded after it satisfies
/// `starts[j] <= starts[i]` and `ends[j] >= ends[i]`. Only later intervals
/// dominate, so the last interval always survives.
pub fn find_relevant(starts: &[f64], ends: &[f64]) -> Vec<usize> {
    debug_assert_eq!(starts.len(), ends.len());
    (0..starts.len())
        .filter(|&i| {
            !(i + 1..starts.len()).any(|j| starts[j] <= starts[i] && ends[j] >= ends[i])
        })
        .collect()
}
