//! Isolated training: one model, many patterns of it.

use log::warn;
use ndarray::Array2;

use super::{iterate, EmTrainer, PassSummary, PatternOutcome, SkipReason, Trained};
use crate::accumulator::Statistics;
use crate::error::{Error, Result};
use crate::forward_backward::{forward_backward, Trellis};
use crate::model::Hmm;
use crate::pattern::{max_frames, Pattern};
use crate::reestimate::{reestimate_mixture, reestimate_transitions, UpdateSummary};
use crate::session::TrainingSession;

/// Baum-Welch for a single [`Hmm`] over its own training patterns.
#[derive(Debug)]
pub struct IsolatedTrainer<'a> {
    name: String,
    patterns: &'a [Pattern],
    trellis: Option<Trellis>,
}

impl<'a> IsolatedTrainer<'a> {
    pub fn new(name: impl Into<String>, patterns: &'a [Pattern]) -> Self {
        Self {
            name: name.into(),
            patterns,
            trellis: None,
        }
    }

    fn trellis(&mut self, num_states: usize, frames: usize) -> &mut Trellis {
        let stale = self
            .trellis
            .as_ref()
            .map_or(true, |t| t.capacity() < frames || t.num_states() != num_states);
        if stale {
            self.trellis = None;
        }
        self.trellis
            .get_or_insert_with(|| Trellis::new(num_states, frames))
    }
}

/// E-step for one pattern.
fn process_pattern(
    hmm: &Hmm,
    index: usize,
    pattern: &Pattern,
    trellis: &mut Trellis,
    session: &TrainingSession,
    stats: &mut Statistics,
) -> Result<PatternOutcome> {
    if session.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let config = session.config();
    if pattern.len() < config.min_frames_per_pattern {
        let reason = SkipReason::TooShort {
            frames: pattern.len(),
            required: config.min_frames_per_pattern,
        };
        warn!("{}: skipping pattern {}: {}", hmm.name(), index, reason);
        return Ok(PatternOutcome::Skipped(reason));
    }
    let totals = forward_backward(hmm, pattern, trellis, config.consistency_tolerance)
        .map_err(|e| match e {
            Error::Consistency {
                forward,
                backward,
                frames,
                ..
            } => Error::Consistency {
                context: format!("model '{}' pattern {}", hmm.name(), index),
                forward,
                backward,
                frames,
            },
            other => other,
        })?;
    if totals.is_negligible() {
        let reason = SkipReason::NegligibleProbability;
        warn!("{}: skipping pattern {}: {}", hmm.name(), index, reason);
        return Ok(PatternOutcome::Skipped(reason));
    }

    let mut gamma = session
        .dumps_occupation()
        .then(|| Array2::zeros((pattern.len(), hmm.num_states() - 2)));
    trellis.accumulate(hmm, pattern, totals.log_prob(), stats, gamma.as_mut());
    if let Some(gamma) = gamma {
        session.record_occupation(format!("{}:{}", hmm.name(), index), gamma);
    }
    Ok(PatternOutcome::Accumulated(totals))
}

impl EmTrainer for IsolatedTrainer<'_> {
    type Model = Hmm;
    type Stats = Statistics;

    fn label(&self) -> String {
        self.name.clone()
    }

    fn accumulate(
        &mut self,
        model: &Hmm,
        session: &TrainingSession,
    ) -> Result<(Statistics, PassSummary)> {
        let config = session.config();
        if self.patterns.len() < config.min_patterns_per_model {
            return Err(Error::InsufficientData {
                model: model.name().to_string(),
                available: self.patterns.len(),
                required: config.min_patterns_per_model,
            });
        }
        let frames = max_frames(self.patterns);
        let num_states = model.num_states();
        let shape = Statistics::zeroed(std::slice::from_ref(model.transitions()), model.mixtures());

        if config.parallel {
            use rayon::prelude::*;

            return self
                .patterns
                .par_iter()
                .enumerate()
                .try_fold(
                    || {
                        (
                            Trellis::new(num_states, frames),
                            shape.clone(),
                            PassSummary::default(),
                        )
                    },
                    |(mut trellis, mut stats, mut pass), (i, pattern)| {
                        let outcome =
                            process_pattern(model, i, pattern, &mut trellis, session, &mut stats)?;
                        pass.record(&outcome);
                        Ok::<_, Error>((trellis, stats, pass))
                    },
                )
                .map(|worker| worker.map(|(_, stats, pass)| (stats, pass)))
                .try_reduce(
                    || (shape.clone(), PassSummary::default()),
                    |(mut stats, mut pass), (other, other_pass)| {
                        stats.merge(&other);
                        pass.merge(&other_pass);
                        Ok((stats, pass))
                    },
                );
        }

        let patterns = self.patterns;
        let trellis = self.trellis(num_states, frames);
        let mut stats = shape;
        let mut pass = PassSummary::default();
        for (i, pattern) in patterns.iter().enumerate() {
            let outcome = process_pattern(model, i, pattern, trellis, session, &mut stats)?;
            pass.record(&outcome);
        }
        Ok((stats, pass))
    }

    fn update(
        &mut self,
        model: &Hmm,
        stats: Statistics,
        session: &TrainingSession,
    ) -> Result<(Hmm, UpdateSummary)> {
        let config = session.config();
        let mut summary = UpdateSummary::default();
        let Statistics {
            transitions,
            mixtures,
        } = stats;
        let acc = transitions.first().ok_or_else(|| {
            Error::InvalidInput(format!("no transition statistics for '{}'", model.name()))
        })?;
        let matrix = reestimate_transitions(
            model.name(),
            model.transitions(),
            acc,
            config.occupancy_policy,
            &mut summary,
        )?;
        let updated = model
            .mixtures()
            .iter()
            .zip(&mixtures)
            .enumerate()
            .map(|(j, (prior, acc))| {
                let name = format!("{} state {}", model.name(), j + 1);
                reestimate_mixture(&name, prior, acc, config, &mut summary)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((Hmm::new(model.name(), matrix, updated)?, summary))
    }
}

/// Train `hmm` on `patterns` until convergence.
///
/// # Errors
///
/// `InsufficientData` when there are fewer than `min_patterns_per_model`
/// patterns, `Exhausted` when none of them is usable, plus any fatal error
/// of the E- or M-step.
pub fn train(hmm: Hmm, patterns: &[Pattern], session: &TrainingSession) -> Result<Trained<Hmm>> {
    let mut trainer = IsolatedTrainer::new(hmm.name(), patterns);
    iterate(&mut trainer, hmm, session)
}
