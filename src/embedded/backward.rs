//! Pruned backward sweep over a model sequence.

use log::trace;
use ndarray::Array2;

use super::beam::{self, Span};
use super::{EmbeddedScratch, Layout};
use crate::log_math::{clamp_log, is_negligible, log_add, LOG_ZERO};
use crate::model::transition::is_transition;
use crate::model::{HmmSet, TransitionMatrix};
use crate::pattern::Utterance;

/// Result of one backward sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Sweep {
    /// Log probability of the utterance; may still be negligible.
    Complete(f64),
    /// No position survived the beam at `frame`.
    Collapsed { frame: usize },
}

/// Fill `scratch.beta`, `scratch.out` and `scratch.spans` for `utterance`.
///
/// Positions whose best beta falls more than `threshold` below the frame's
/// best are trimmed from the ends of the active span.
pub(crate) fn sweep(
    set: &HmmSet,
    utterance: &Utterance,
    layout: &Layout,
    scratch: &mut EmbeddedScratch,
    threshold: f64,
) -> Sweep {
    let pattern = utterance.pattern();
    let frames = pattern.len();
    let last = frames - 1;
    let q_count = layout.len();
    let mixtures = set.mixtures();

    let EmbeddedScratch {
        beta,
        out,
        spans,
        taper,
        model_max,
        cache,
        ..
    } = scratch;
    beam::taper(&layout.durations, frames, taper);
    spans.clear();
    spans.resize(frames, Span::new(0, 0));
    model_max.clear();
    model_max.resize(q_count, LOG_ZERO);
    cache.reset(mixtures.len());

    for t in (0..frames).rev() {
        let next = (t < last).then(|| spans[t + 1]);
        let candidate = match next {
            None => taper[t],
            Some(next) => Span::new(
                beam::reach_back(next.lo, &layout.tee).max(taper[t].lo),
                next.hi.min(taper[t].hi),
            ),
        };
        if candidate.lo > candidate.hi {
            return Sweep::Collapsed { frame: t };
        }

        let obs = pattern.frame(t);
        for q in candidate.lo..=candidate.hi {
            let first = layout.offsets[q] + 1;
            for (k, &mix) in set.model(layout.models[q]).mixtures().iter().enumerate() {
                out[[t, first + k]] = cache.log_output(mixtures, mix, t, obs);
            }
        }

        for q in (candidate.lo..=candidate.hi).rev() {
            let a = set.transition_of(layout.models[q]);
            let exit = a.exit();
            let off = layout.offsets[q];

            let exit_beta = match next {
                None => layout.end_exit[q],
                Some(span) if q + 1 < q_count && span.contains(q + 1) => {
                    beta[[t + 1, layout.offsets[q + 1]]]
                }
                Some(_) => LOG_ZERO,
            };
            beta[[t, off + exit]] = exit_beta;
            let mut best = exit_beta;

            let stays = next.map_or(false, |span| span.contains(q));
            for i in 1..exit {
                let mut x = LOG_ZERO;
                let to_exit = a.log(i, exit);
                if is_transition(to_exit) && !is_negligible(exit_beta) {
                    x = to_exit + exit_beta;
                }
                if stays {
                    for j in 1..exit {
                        let a_ij = a.log(i, j);
                        let b = beta[[t + 1, off + j]];
                        if is_transition(a_ij) && !is_negligible(b) {
                            x = log_add(x, a_ij + out[[t + 1, off + j]] + b);
                        }
                    }
                }
                let x = clamp_log(x);
                beta[[t, off + i]] = x;
                best = best.max(x);
            }

            let skip =
                (a.is_tee() && q < candidate.hi).then(|| beta[[t, layout.offsets[q + 1]]]);
            let entry = entry_beta(a, beta, out, t, off, skip);
            beta[[t, off]] = entry;
            model_max[q] = best.max(entry);
        }

        match beam::prune(candidate, model_max, threshold) {
            Some(span) => {
                // the forward sweep cannot skip into a position trimmed at this frame
                if span.hi < candidate.hi && layout.tee[span.hi] {
                    let a = set.transition_of(layout.models[span.hi]);
                    let off = layout.offsets[span.hi];
                    let entry = entry_beta(a, beta, out, t, off, None);
                    beta[[t, off]] = entry;
                }
                trace!(
                    "frame {}: positions {}..={} of {}..={}",
                    t,
                    span.lo,
                    span.hi,
                    candidate.lo,
                    candidate.hi
                );
                spans[t] = span;
            }
            None => return Sweep::Collapsed { frame: t },
        }
    }

    if spans[0].lo == 0 {
        Sweep::Complete(beta[[0, 0]])
    } else {
        Sweep::Complete(LOG_ZERO)
    }
}

/// Log beta of an entry slot at frame `t`: into the emitting states, plus
/// the tee skip straight into the next entry when `skip` is given.
fn entry_beta(
    a: &TransitionMatrix,
    beta: &Array2<f64>,
    out: &Array2<f64>,
    t: usize,
    off: usize,
    skip: Option<f64>,
) -> f64 {
    let mut entry = LOG_ZERO;
    for j in 1..a.exit() {
        let a_0j = a.log(0, j);
        let b = beta[[t, off + j]];
        if is_transition(a_0j) && !is_negligible(b) {
            entry = log_add(entry, a_0j + out[[t, off + j]] + b);
        }
    }
    if let Some(skip) = skip.filter(|&b| !is_negligible(b)) {
        entry = log_add(entry, a.tee_log() + skip);
    }
    clamp_log(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GaussianMixture, TransitionMatrix};
    use crate::pattern::Pattern;
    use ndarray::{array, Array2};

    fn two_model_set() -> HmmSet {
        let mut set = HmmSet::new(1);
        let lr = set.add_transition(TransitionMatrix::left_to_right(1, 0.5).unwrap());
        let low = set
            .add_mixture(GaussianMixture::single(array![0.0], array![1.0]).unwrap())
            .unwrap();
        let high = set
            .add_mixture(GaussianMixture::single(array![10.0], array![1.0]).unwrap())
            .unwrap();
        set.add_model("low", lr, vec![low]).unwrap();
        set.add_model("high", lr, vec![high]).unwrap();
        set
    }

    fn run(set: &HmmSet, utterance: &Utterance, threshold: f64) -> (Sweep, Vec<Span>) {
        let layout = Layout::new(set, utterance).unwrap();
        let mut scratch = EmbeddedScratch::for_utterances(set, std::slice::from_ref(utterance));
        let sweep = sweep(set, utterance, &layout, &mut scratch, threshold);
        (sweep, scratch.spans.clone())
    }

    #[test]
    fn test_beam_follows_the_data() {
        let set = two_model_set();
        let frames = Array2::from_shape_vec((6, 1), vec![0.0, 0.0, 0.0, 10.0, 10.0, 10.0]).unwrap();
        let utt = Utterance::new("u", Pattern::new(frames), vec![0, 1]);

        let (open, open_spans) = run(&set, &utt, f64::INFINITY);
        let (narrow, narrow_spans) = run(&set, &utt, 20.0);
        let (Sweep::Complete(open), Sweep::Complete(narrow)) = (open, narrow) else {
            panic!("sweep collapsed");
        };
        assert!(!is_negligible(open));
        assert!((open - narrow).abs() < 1e-6);

        // without pruning only the taper limits the spans
        assert_eq!(open_spans[0], Span::new(0, 0));
        assert_eq!(open_spans[2], Span::new(0, 1));
        assert_eq!(open_spans[5], Span::new(1, 1));
        // "high" cannot explain frame 2 and is dropped by the narrow beam
        assert_eq!(narrow_spans[1], Span::new(0, 0));
        assert!(narrow_spans[1].width() < open_spans[1].width());
    }

    #[test]
    fn test_narrow_beam_only_loses_paths() {
        let set = two_model_set();
        let frames = Array2::from_shape_vec((4, 1), vec![10.0, 10.0, 0.0, 0.0]).unwrap();
        let utt = Utterance::new("u", Pattern::new(frames), vec![0, 1]);
        // the first frame is 10 standard deviations from "low": still reachable
        let (open, _) = run(&set, &utt, f64::INFINITY);
        let Sweep::Complete(open) = open else {
            panic!("open beam collapsed");
        };
        assert!(!is_negligible(open));
        if let (Sweep::Complete(narrow), _) = run(&set, &utt, 1e-9) {
            assert!(narrow <= open + 1e-9);
        }
    }
}
