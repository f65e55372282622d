//! Active model ranges for embedded training.
//!
//! A model sequence position `q` is only evaluated at frame `t` if it lies
//! inside that frame's [`Span`]. Spans start from the minimum-duration taper
//! (positions that cannot be reached by, or cannot finish after, frame `t`)
//! and are then trimmed from both ends against the frame's best log beta.

use crate::log_math::is_negligible;

/// Inclusive range of model sequence positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub lo: usize,
    pub hi: usize,
}

impl Span {
    pub fn new(lo: usize, hi: usize) -> Self {
        Self { lo, hi }
    }

    #[inline]
    pub fn contains(&self, q: usize) -> bool {
        self.lo <= q && q <= self.hi
    }

    pub fn width(&self) -> usize {
        self.hi + 1 - self.lo
    }
}

/// Minimum-duration taper for `frames` frames.
///
/// Position `q` may be active at frame `t` only when the models before it
/// fit into frames `0..t` and the models after it (plus one frame of its own,
/// unless it is a tee model) fit into frames `t..T`.
pub(crate) fn taper(durations: &[usize], frames: usize, spans: &mut Vec<Span>) {
    spans.clear();
    let q_count = durations.len();
    let mut prefix = Vec::with_capacity(q_count);
    let mut acc = 0;
    for &d in durations {
        prefix.push(acc);
        acc += d;
    }
    let total = acc;
    // frames still needed from q onwards when q is entered
    let need = |q: usize| -> usize {
        let after = total - prefix[q] - durations[q];
        after + durations[q].min(1)
    };

    let mut lo = 0;
    let mut hi = 0;
    for t in 0..frames {
        while hi + 1 < q_count && prefix[hi + 1] <= t {
            hi += 1;
        }
        while lo + 1 < q_count && need(lo) > frames - t {
            lo += 1;
        }
        spans.push(Span::new(lo.min(hi), hi));
    }
}

/// Lowest position at frame `t` that can still reach position `next_lo` at `t + 1`.
///
/// Leaving a model enters the next one; a tee model in between can be
/// skipped without consuming a frame.
pub(crate) fn reach_back(next_lo: usize, tee: &[bool]) -> usize {
    let mut lo = next_lo.saturating_sub(1);
    while lo >= 1 && tee[lo] {
        lo -= 1;
    }
    lo
}

/// Trim `span` from both ends, dropping positions whose best value falls more
/// than `threshold` below the best in the span, or is negligible.
///
/// Returns `None` when nothing in the span is reachable.
pub(crate) fn prune(span: Span, model_max: &[f64], threshold: f64) -> Option<Span> {
    let best = model_max[span.lo..=span.hi]
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    if is_negligible(best) {
        return None;
    }
    let floor = best - threshold;
    let weak = |v: f64| v < floor || is_negligible(v);
    let mut lo = span.lo;
    let mut hi = span.hi;
    while lo < hi && weak(model_max[lo]) {
        lo += 1;
    }
    while hi > lo && weak(model_max[hi]) {
        hi -= 1;
    }
    Some(Span::new(lo, hi))
}
