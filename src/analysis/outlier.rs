//! Heuristic trimming of warm-up and cooldown transients.
//!
//! Steady-state band detection: the steady mean and deviation are estimated
//! from the middle half of the stream, and a contiguous prefix (leading) or
//! suffix (trailing) lying outside `mean ± max(2σ, 2% of value range)` is
//! discarded. Deterministic for a given input sequence, and never allowed to
//! empty a stream: a trim that would discard everything is a no-op reported
//! as a soft condition.

/// Which transients to discard before computing statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutlierPolicy {
    /// No filtering.
    None,
    /// Discard the warm-up/ramp prefix.
    Leading,
    /// Discard the cooldown/drain suffix.
    Trailing,
    /// Apply both heuristics.
    All,
}

/// Result of applying an outlier policy to one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimResult {
    /// Retained range, as indexes into the original sequence.
    pub start: usize,
    pub end: usize,
    /// The heuristic would have emptied the stream and declined to trim.
    pub declined: bool,
}

impl TrimResult {
    /// Number of samples discarded from the front.
    pub fn discarded_leading(&self) -> usize {
        self.start
    }

    /// Number of samples discarded from the back, given the original length.
    pub fn discarded_trailing(&self, len: usize) -> usize {
        len - self.end
    }

    /// Total discarded samples.
    pub fn discarded(&self, len: usize) -> usize {
        self.discarded_leading() + self.discarded_trailing(len)
    }
}

/// Sigma multiplier for the steady-state band.
const BAND_SIGMA: f64 = 2.0;

/// Floor on the band half-width, as a fraction of the stream's value range.
const BAND_RANGE_FLOOR: f64 = 0.02;

/// Applies the policy to a value sequence, returning the retained range.
pub fn trim(values: &[f64], policy: OutlierPolicy) -> TrimResult {
    let len = values.len();
    let full = TrimResult {
        start: 0,
        end: len,
        declined: false,
    };

    if policy == OutlierPolicy::None || len < 4 {
        return full;
    }

    // Steady state estimated from the middle half of the stream.
    let quarter = len / 4;
    let steady = &values[quarter..len - quarter];
    let mean = steady.iter().sum::<f64>() / steady.len() as f64;
    let variance = steady.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / steady.len() as f64;
    let sigma = variance.sqrt();

    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        });
    let band = (BAND_SIGMA * sigma).max(BAND_RANGE_FLOOR * (hi - lo));

    let inside = |v: f64| (v - mean).abs() <= band;

    let mut start = 0;
    if matches!(policy, OutlierPolicy::Leading | OutlierPolicy::All) {
        while start < len && !inside(values[start]) {
            start += 1;
        }
    }

    let mut end = len;
    if matches!(policy, OutlierPolicy::Trailing | OutlierPolicy::All) {
        while end > start && !inside(values[end - 1]) {
            end -= 1;
        }
    }

    if start >= end {
        return TrimResult {
            start: 0,
            end: len,
            declined: true,
        };
    }

    TrimResult {
        start,
        end,
        declined: false,
    }
}
