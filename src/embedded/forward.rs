//! Two-slice forward sweep with statistics accumulation.
//!
//! Runs inside the spans left by the backward sweep. Every quantity added to
//! the statistics is a posterior against the backward total `pr`; the caller
//! rescales once the forward total is known.

use ndarray::{s, Array2};

use super::{EmbeddedScratch, Layout};
use crate::accumulator::Statistics;
use crate::log_math::{clamp_log, is_negligible, log_add, safe_exp, LOG_ZERO};
use crate::model::transition::is_transition;
use crate::model::HmmSet;
use crate::pattern::Utterance;

/// Forward pass over `utterance`; returns the forward total.
///
/// Statistics go into `stats`, per-column occupation into
/// `scratch.occupancy` and, when given, per-frame occupation into `gamma`
/// (`frames x emitting states`).
#[allow(clippy::too_many_arguments)]
pub(crate) fn sweep(
    set: &HmmSet,
    utterance: &Utterance,
    layout: &Layout,
    scratch: &mut EmbeddedScratch,
    pr: f64,
    prune_threshold: f64,
    stats: &mut Statistics,
    mut gamma: Option<&mut Array2<f64>>,
) -> f64 {
    let pattern = utterance.pattern();
    let frames = pattern.len();
    let q_count = layout.len();
    let mixtures = set.mixtures();

    let EmbeddedScratch {
        beta,
        out,
        alpha,
        spans,
        occupancy,
        cache,
        ..
    } = scratch;
    let Statistics {
        transitions: trans_stats,
        mixtures: mix_stats,
    } = stats;
    occupancy[..layout.total_states].fill(0.0);
    cache.reset(mixtures.len());

    for t in 0..frames {
        let span = spans[t];
        let prev_span = (t > 0).then(|| spans[t - 1]);
        let (cur, prev) = (t % 2, (t + 1) % 2);
        let obs = pattern.frame(t);
        let first_col = layout.offsets[span.lo];
        let end_col = layout.offsets[span.hi] + layout.states[span.hi];
        alpha.slice_mut(s![cur, first_col..end_col]).fill(LOG_ZERO);

        for q in span.lo..=span.hi {
            let model = set.model(layout.models[q]);
            let a = set.transition_of(layout.models[q]);
            let exit = a.exit();
            let off = layout.offsets[q];
            let acc = &mut trans_stats[model.transition()];

            // entry: the previous model left after frame t - 1, or a tee
            // model before this one was skipped at frame t
            let mut entry = LOG_ZERO;
            if q == 0 {
                if t == 0 {
                    entry = 0.0;
                }
            } else {
                let p = q - 1;
                let p_exit = layout.offsets[p] + layout.states[p] - 1;
                if prev_span.map_or(false, |ps| ps.contains(p)) {
                    entry = alpha[[prev, p_exit]];
                }
                if layout.tee[p] && span.contains(p) {
                    let p_entry = alpha[[cur, layout.offsets[p]]];
                    if !is_negligible(p_entry) {
                        let skip = set.transition_of(layout.models[p]).tee_log();
                        entry = log_add(entry, p_entry + skip);
                    }
                }
            }
            let entry = clamp_log(entry);
            alpha[[cur, off]] = entry;

            let stayed = prev_span.map_or(false, |ps| ps.contains(q));
            for j in 1..exit {
                let mut x = LOG_ZERO;
                let a_0j = a.log(0, j);
                if is_transition(a_0j) && !is_negligible(entry) {
                    x = entry + a_0j;
                }
                if stayed {
                    for i in 1..exit {
                        let a_ij = a.log(i, j);
                        let p = alpha[[prev, off + i]];
                        if is_transition(a_ij) && !is_negligible(p) {
                            x = log_add(x, p + a_ij);
                        }
                    }
                }
                let mut value = if is_negligible(x) {
                    LOG_ZERO
                } else {
                    clamp_log(x + out[[t, off + j]])
                };
                if !is_negligible(value) && value + beta[[t, off + j]] - pr < -prune_threshold {
                    value = LOG_ZERO;
                }
                alpha[[cur, off + j]] = value;
            }

            let mut leave = LOG_ZERO;
            for i in 1..exit {
                let a_ie = a.log(i, exit);
                let p = alpha[[cur, off + i]];
                if is_transition(a_ie) && !is_negligible(p) {
                    leave = log_add(leave, p + a_ie);
                }
            }
            alpha[[cur, off + exit]] = clamp_log(leave);

            // entry occupation, entry transitions and the tee skip
            if !is_negligible(entry) {
                let entry_beta = beta[[t, off]];
                if !is_negligible(entry_beta) {
                    acc.add_occupancy(0, safe_exp(entry + entry_beta - pr));
                }
                for j in 1..exit {
                    let a_0j = a.log(0, j);
                    let b = beta[[t, off + j]];
                    if is_transition(a_0j) && !is_negligible(b) {
                        acc.add_count(0, j, safe_exp(entry + a_0j + out[[t, off + j]] + b - pr));
                    }
                }
                if a.is_tee() && q + 1 < q_count && span.contains(q + 1) {
                    let b = beta[[t, layout.offsets[q + 1]]];
                    if !is_negligible(b) {
                        acc.add_count(0, exit, safe_exp(entry + a.tee_log() + b - pr));
                    }
                }
            }

            // transitions between emitting states from frame t - 1
            if stayed {
                for i in 1..exit {
                    let p = alpha[[prev, off + i]];
                    if is_negligible(p) {
                        continue;
                    }
                    for j in 1..exit {
                        let a_ij = a.log(i, j);
                        let b = beta[[t, off + j]];
                        if is_transition(a_ij) && !is_negligible(b) {
                            acc.add_count(i, j, safe_exp(p + a_ij + out[[t, off + j]] + b - pr));
                        }
                    }
                }
            }

            let exit_beta = beta[[t, off + exit]];
            for i in 1..exit {
                let f = alpha[[cur, off + i]];
                let b = beta[[t, off + i]];
                if is_negligible(f) || is_negligible(b) {
                    continue;
                }
                let occ = safe_exp(f + b - pr);
                if occ <= 0.0 {
                    continue;
                }
                acc.add_occupancy(i, occ);
                occupancy[off + i] += occ;
                if let Some(g) = gamma.as_deref_mut() {
                    g[[t, layout.emit_offsets[q] + i - 1]] = occ;
                }
                let a_ie = a.log(i, exit);
                if is_transition(a_ie) && !is_negligible(exit_beta) {
                    acc.add_count(i, exit, safe_exp(f + a_ie + exit_beta - pr));
                }

                let mix = model.mixtures()[i - 1];
                let (total, terms) = cache.component_terms(mixtures, mix, t, obs);
                let target = &mut mix_stats[mix];
                if terms.len() == 1 {
                    target.accumulate(0, occ, obs);
                } else {
                    for (m, &term) in terms.iter().enumerate() {
                        let share = occ * safe_exp(term - total);
                        if share > 0.0 {
                            target.accumulate(m, share, obs);
                        }
                    }
                }
            }
        }
    }

    let last = frames - 1;
    let cur = last % 2;
    let final_span = spans[last];
    let mut total = LOG_ZERO;
    for q in final_span.lo..=final_span.hi {
        let x = alpha[[cur, layout.offsets[q] + layout.states[q] - 1]];
        let rest = layout.end_exit[q];
        if !is_negligible(x) && !is_negligible(rest) {
            total = log_add(total, x + rest);
        }
    }

    // tee models entered after the final frame are only ever skipped
    for q in 1..q_count {
        let p = q - 1;
        if !layout.tee[q] || !final_span.contains(p) || is_negligible(layout.end_exit[q]) {
            continue;
        }
        let entered = alpha[[cur, layout.offsets[p] + layout.states[p] - 1]];
        if is_negligible(entered) {
            continue;
        }
        let a = set.transition_of(layout.models[q]);
        let posterior = safe_exp(entered + a.tee_log() + layout.end_exit[q] - pr);
        let acc = &mut trans_stats[set.model(layout.models[q]).transition()];
        acc.add_occupancy(0, posterior);
        acc.add_count(0, a.exit(), posterior);
    }

    clamp_log(total)
}
