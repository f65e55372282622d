//! Embedded forward-backward over a concatenation of shared models.
//!
//! An utterance is modelled by the models of its transcription joined exit
//! to entry. The backward sweep runs first, frame `T-1` down to `0`, inside
//! a beam of active sequence positions; if the beam collapses or the total
//! comes out negligible it is repeated with a wider beam. The forward sweep
//! then runs inside the beam the backward sweep left behind, keeping only two
//! time slices, and accumulates statistics frame by frame.
//!
//! Slot layout per position `q` with `N` states: column `offsets[q]` is the
//! entry, `offsets[q] + N - 1` the exit. At frame `t` the entry holds the
//! probability of being about to emit frame `t` from that model; the exit
//! holds the probability of having emitted frame `t` and left it.

pub mod backward;
pub mod beam;
pub mod forward;

use log::{debug, warn};
use ndarray::Array2;

use crate::accumulator::{OccupancyTally, Statistics};
use crate::error::{Error, Result};
use crate::forward_backward::Totals;
use crate::log_math::{clamp_log, is_negligible, LOG_ZERO};
use crate::model::HmmSet;
use crate::observation::ObservationCache;
use crate::pattern::Utterance;
use crate::session::TrainingSession;
use crate::trainer::{PatternOutcome, SkipReason};
use beam::Span;

/// Per-utterance view of a model sequence.
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    /// Model index per sequence position.
    pub models: Vec<usize>,
    /// Column of each position's entry slot.
    pub offsets: Vec<usize>,
    /// First occupation column of each position's emitting states.
    pub emit_offsets: Vec<usize>,
    pub states: Vec<usize>,
    pub durations: Vec<usize>,
    pub tee: Vec<bool>,
    /// Log probability of reaching the end of the sequence from each exit
    /// without emitting; zero for the last position.
    pub end_exit: Vec<f64>,
    pub total_states: usize,
    pub total_emitting: usize,
    /// Distinct transition matrices and mixtures the utterance touches.
    pub transition_ids: Vec<usize>,
    pub mixture_ids: Vec<usize>,
}

impl Layout {
    pub fn new(set: &HmmSet, utterance: &Utterance) -> Result<Self> {
        let sequence = utterance.models();
        let frames = utterance.pattern().len();
        if sequence.is_empty() {
            return Err(Error::InvalidInput(format!(
                "utterance '{}' has an empty model sequence",
                utterance.id()
            )));
        }
        if let Some(&bad) = sequence.iter().find(|&&m| m >= set.models().len()) {
            return Err(Error::InvalidInput(format!(
                "utterance '{}' refers to unknown model {}",
                utterance.id(),
                bad
            )));
        }
        if frames == 0 {
            return Err(Error::InvalidInput(format!(
                "utterance '{}' has no frames",
                utterance.id()
            )));
        }
        if utterance.pattern().dim() != set.dim() {
            return Err(Error::InvalidInput(format!(
                "utterance '{}' has dimension {}, models expect {}",
                utterance.id(),
                utterance.pattern().dim(),
                set.dim()
            )));
        }

        let q_count = sequence.len();
        let mut layout = Layout {
            models: sequence.to_vec(),
            offsets: Vec::with_capacity(q_count),
            emit_offsets: Vec::with_capacity(q_count),
            states: Vec::with_capacity(q_count),
            durations: Vec::with_capacity(q_count),
            tee: Vec::with_capacity(q_count),
            end_exit: vec![LOG_ZERO; q_count],
            total_states: 0,
            total_emitting: 0,
            transition_ids: Vec::with_capacity(q_count),
            mixture_ids: Vec::new(),
        };
        for (q, &m) in sequence.iter().enumerate() {
            let model = set.model(m);
            if q > 0 && model.is_tee() && layout.tee[q - 1] {
                return Err(Error::ConsecutiveTeeModels {
                    utterance: utterance.id().to_string(),
                    position: q - 1,
                });
            }
            layout.offsets.push(layout.total_states);
            layout.emit_offsets.push(layout.total_emitting);
            layout.states.push(model.num_states());
            layout.durations.push(model.min_duration());
            layout.tee.push(model.is_tee());
            layout.total_states += model.num_states();
            layout.total_emitting += model.num_states() - 2;
            layout.transition_ids.push(model.transition());
            layout.mixture_ids.extend_from_slice(model.mixtures());
        }
        let min_duration: usize = layout.durations.iter().sum();
        if min_duration > frames {
            return Err(Error::UntraversableUtterance {
                utterance: utterance.id().to_string(),
                min_duration,
                frames,
            });
        }

        layout.end_exit[q_count - 1] = 0.0;
        for q in (0..q_count - 1).rev() {
            if layout.tee[q + 1] {
                let skip = set.transition_of(sequence[q + 1]).tee_log();
                layout.end_exit[q] = clamp_log(skip + layout.end_exit[q + 1]);
            }
        }
        layout.transition_ids.sort_unstable();
        layout.transition_ids.dedup();
        layout.mixture_ids.sort_unstable();
        layout.mixture_ids.dedup();
        Ok(layout)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }
}

/// Check an utterance's model sequence before any recursion runs.
///
/// # Errors
///
/// `ConsecutiveTeeModels` when two zero-duration models are adjacent,
/// `UntraversableUtterance` when the summed minimum durations exceed the
/// frame count, `InvalidInput` for unknown models or mismatched dimensions.
pub fn validate_utterance(set: &HmmSet, utterance: &Utterance) -> Result<()> {
    Layout::new(set, utterance).map(|_| ())
}

/// Scratch arena for embedded forward-backward, sized once per training run.
#[derive(Debug, Clone)]
pub struct EmbeddedScratch {
    max_frames: usize,
    max_states: usize,
    /// `frames x states` log beta.
    pub(crate) beta: Array2<f64>,
    /// `frames x states` log output probability (emitting columns only).
    pub(crate) out: Array2<f64>,
    /// Two forward time slices.
    pub(crate) alpha: Array2<f64>,
    /// Beam after the backward sweep.
    pub(crate) spans: Vec<Span>,
    pub(crate) taper: Vec<Span>,
    pub(crate) model_max: Vec<f64>,
    /// Occupation per column for the current utterance.
    pub(crate) occupancy: Vec<f64>,
    pub(crate) cache: ObservationCache,
}

impl EmbeddedScratch {
    pub fn new(max_frames: usize, max_states: usize, num_mixtures: usize) -> Self {
        Self {
            max_frames,
            max_states,
            beta: Array2::from_elem((max_frames, max_states), LOG_ZERO),
            out: Array2::from_elem((max_frames, max_states), LOG_ZERO),
            alpha: Array2::from_elem((2, max_states), LOG_ZERO),
            spans: Vec::with_capacity(max_frames),
            taper: Vec::with_capacity(max_frames),
            model_max: Vec::with_capacity(max_states),
            occupancy: vec![0.0; max_states],
            cache: ObservationCache::new(num_mixtures),
        }
    }

    /// Sized for the longest utterance and the longest model sequence.
    pub fn for_utterances(set: &HmmSet, utterances: &[Utterance]) -> Self {
        let max_frames = utterances
            .iter()
            .map(|u| u.pattern().len())
            .max()
            .unwrap_or(0);
        let max_states = utterances
            .iter()
            .map(|u| {
                u.models()
                    .iter()
                    .filter(|&&m| m < set.models().len())
                    .map(|&m| set.model(m).num_states())
                    .sum::<usize>()
            })
            .max()
            .unwrap_or(0);
        Self::new(max_frames, max_states, set.mixtures().len())
    }

    fn check(&self, frames: usize, states: usize) -> Result<()> {
        if frames > self.max_frames {
            return Err(Error::BufferTooSmall {
                what: "frames",
                capacity: self.max_frames,
                required: frames,
            });
        }
        if states > self.max_states {
            return Err(Error::BufferTooSmall {
                what: "states",
                capacity: self.max_states,
                required: states,
            });
        }
        Ok(())
    }
}

/// Backward sweeps with beam retries; `Err` carries the reason for giving up.
fn backward_with_retry(
    set: &HmmSet,
    utterance: &Utterance,
    layout: &Layout,
    scratch: &mut EmbeddedScratch,
    session: &TrainingSession,
) -> std::result::Result<f64, SkipReason> {
    let mut reason = SkipReason::NegligibleProbability;
    for threshold in session.config().pruning.schedule() {
        match backward::sweep(set, utterance, layout, scratch, threshold) {
            backward::Sweep::Complete(total) if !is_negligible(total) => return Ok(total),
            backward::Sweep::Complete(_) => {
                debug!(
                    "utterance '{}': negligible total with beam {}",
                    utterance.id(),
                    threshold
                );
                reason = SkipReason::NegligibleProbability;
            }
            backward::Sweep::Collapsed { frame } => {
                debug!(
                    "utterance '{}': beam {} collapsed at frame {}",
                    utterance.id(),
                    threshold,
                    frame
                );
                reason = SkipReason::PruningFailed { threshold, frame };
            }
        }
    }
    Err(reason)
}

/// Total log probability of an utterance from the backward sweep alone.
///
/// Returns `None` when every beam in the schedule failed.
pub fn utterance_log_probability(
    set: &HmmSet,
    utterance: &Utterance,
    session: &TrainingSession,
) -> Result<Option<f64>> {
    let layout = Layout::new(set, utterance)?;
    let mut scratch = EmbeddedScratch::new(
        utterance.pattern().len(),
        layout.total_states,
        set.mixtures().len(),
    );
    Ok(backward_with_retry(set, utterance, &layout, &mut scratch, session).ok())
}

/// Run embedded forward-backward on one utterance and add its statistics.
///
/// Statistics are first gathered into `local` against the backward total,
/// then added to `pass` rescaled to the average of the forward and backward
/// totals. `local` must be zero on entry and is left zero.
pub fn process_utterance(
    set: &HmmSet,
    utterance: &Utterance,
    scratch: &mut EmbeddedScratch,
    session: &TrainingSession,
    pass: &mut Statistics,
    local: &mut Statistics,
    tally: &mut OccupancyTally,
) -> Result<PatternOutcome> {
    let layout = Layout::new(set, utterance)?;
    let frames = utterance.pattern().len();
    scratch.check(frames, layout.total_states)?;
    let config = session.config();

    let backward_total = match backward_with_retry(set, utterance, &layout, scratch, session) {
        Ok(total) => total,
        Err(reason) => {
            warn!("skipping utterance '{}': {}", utterance.id(), reason);
            return Ok(PatternOutcome::Skipped(reason));
        }
    };

    let mut gamma = session
        .dumps_occupation()
        .then(|| Array2::zeros((frames, layout.total_emitting)));
    let forward_total = forward::sweep(
        set,
        utterance,
        &layout,
        scratch,
        backward_total,
        config.forward_prune_threshold,
        local,
        gamma.as_mut(),
    );
    let totals = Totals {
        forward: forward_total,
        backward: backward_total,
        frames,
    };
    totals.check(config.consistency_tolerance, || {
        format!("utterance '{}'", utterance.id())
    })?;

    let factor = (backward_total - totals.log_prob()).exp();
    pass.drain_scaled(local, &layout.transition_ids, &layout.mixture_ids, factor);
    for (q, &m) in layout.models.iter().enumerate() {
        let first = layout.offsets[q] + 1;
        let states = &scratch.occupancy[first..first + layout.states[q] - 2];
        tally.add(m, states, factor);
    }
    if let Some(mut g) = gamma {
        g.mapv_inplace(|v| v * factor);
        session.record_occupation(utterance.id().to_string(), g);
    }
    debug!(
        "utterance '{}': log prob {:.4} over {} frames",
        utterance.id(),
        totals.log_prob(),
        frames
    );
    Ok(PatternOutcome::Accumulated(totals))
}
