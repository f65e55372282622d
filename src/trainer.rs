//! EM controller shared by isolated and embedded training.
//!
//! A training shape implements [`EmTrainer`]: `accumulate` runs the E-step
//! over every pattern and returns the pass statistics by value, `update`
//! consumes them and returns new parameters. [`iterate`] drives the two
//! until the average log probability per pattern stops changing.

pub mod embedded;
pub mod isolated;

use std::fmt;

use log::{info, trace, warn};

use crate::config::TrainingConfig;
use crate::error::{Error, Result};
use crate::forward_backward::Totals;
use crate::reestimate::UpdateSummary;
use crate::report::{IterationReport, TrainingReport};
use crate::session::TrainingSession;

pub use embedded::EmbeddedTrainer;
pub use isolated::IsolatedTrainer;

/// Why a pattern was left out of a pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    /// Fewer frames than `min_frames_per_pattern`.
    TooShort { frames: usize, required: usize },
    /// The model gives the pattern no usable probability.
    NegligibleProbability,
    /// The beam collapsed at `frame` even at the widest `threshold`.
    PruningFailed { threshold: f64, frame: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooShort { frames, required } => {
                write!(f, "{} frames, at least {} required", frames, required)
            }
            SkipReason::NegligibleProbability => write!(f, "negligible probability"),
            SkipReason::PruningFailed { threshold, frame } => {
                write!(f, "beam {} collapsed at frame {}", threshold, frame)
            }
        }
    }
}

/// Result of processing one pattern or utterance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PatternOutcome {
    Accumulated(Totals),
    Skipped(SkipReason),
}

/// Counts and totals of one E-step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PassSummary {
    /// Sum of log probabilities of the accumulated patterns.
    pub log_prob: f64,
    /// Frames in the accumulated patterns.
    pub frames: usize,
    pub accumulated: usize,
    pub too_short: usize,
    pub negligible: usize,
    pub pruning_failures: usize,
}

impl PassSummary {
    pub fn record(&mut self, outcome: &PatternOutcome) {
        match outcome {
            PatternOutcome::Accumulated(totals) => {
                self.log_prob += totals.log_prob();
                self.frames += totals.frames;
                self.accumulated += 1;
            }
            PatternOutcome::Skipped(SkipReason::TooShort { .. }) => self.too_short += 1,
            PatternOutcome::Skipped(SkipReason::NegligibleProbability) => self.negligible += 1,
            PatternOutcome::Skipped(SkipReason::PruningFailed { .. }) => {
                self.pruning_failures += 1
            }
        }
    }

    pub fn merge(&mut self, other: &Self) {
        self.log_prob += other.log_prob;
        self.frames += other.frames;
        self.accumulated += other.accumulated;
        self.too_short += other.too_short;
        self.negligible += other.negligible;
        self.pruning_failures += other.pruning_failures;
    }

    pub fn skipped(&self) -> usize {
        self.too_short + self.negligible + self.pruning_failures
    }

    /// Average log probability per accumulated pattern.
    pub fn average_per_pattern(&self) -> f64 {
        if self.accumulated == 0 {
            return 0.0;
        }
        self.log_prob / self.accumulated as f64
    }

    pub fn average_per_frame(&self) -> f64 {
        if self.frames == 0 {
            return 0.0;
        }
        self.log_prob / self.frames as f64
    }
}

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Init,
    Accumulating,
    Updating,
    Converged,
    /// Ran out of iterations without converging.
    Failed,
}

impl fmt::Display for TrainingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainingState::Init => "init",
            TrainingState::Accumulating => "accumulating",
            TrainingState::Updating => "updating",
            TrainingState::Converged => "converged",
            TrainingState::Failed => "not converged",
        };
        f.write_str(name)
    }
}

/// One training shape.
pub trait EmTrainer {
    /// Parameters being trained.
    type Model;
    /// Statistics of one pass.
    type Stats;

    /// Name used in logs and reports.
    fn label(&self) -> String;

    /// E-step over every pattern with `model`.
    fn accumulate(
        &mut self,
        model: &Self::Model,
        session: &TrainingSession,
    ) -> Result<(Self::Stats, PassSummary)>;

    /// M-step: new parameters from `model` and the statistics of one pass.
    fn update(
        &mut self,
        model: &Self::Model,
        stats: Self::Stats,
        session: &TrainingSession,
    ) -> Result<(Self::Model, UpdateSummary)>;
}

/// Parameters after training and the report of how they got there.
#[derive(Debug, Clone)]
pub struct Trained<M> {
    pub model: M,
    pub report: TrainingReport,
}

/// Run EM from `initial` until convergence or `max_iterations`.
///
/// The change compared against `convergence_threshold` is the difference in
/// average log probability per pattern between consecutive passes.
/// Running out of iterations is not an error: the report says
/// [`TrainingState::Failed`] and `converged` is false.
///
/// # Errors
///
/// `Exhausted` when a pass has no usable pattern, `Cancelled` when the
/// session is cancelled, and anything the trainer's steps return.
pub fn iterate<T: EmTrainer>(
    trainer: &mut T,
    initial: T::Model,
    session: &TrainingSession,
) -> Result<Trained<T::Model>> {
    let config: &TrainingConfig = session.config();
    config.validate()?;
    let label = trainer.label();
    let mut report = TrainingReport::new(label.clone());
    let mut model = initial;
    let mut previous: Option<f64> = None;
    let mut state = TrainingState::Init;

    for iteration in 1..=config.max_iterations {
        state = TrainingState::Accumulating;
        trace!("{}: iteration {} {}", label, iteration, state);
        let (stats, pass) = trainer.accumulate(&model, session)?;
        if pass.accumulated == 0 {
            return Err(Error::Exhausted { iteration });
        }
        if pass.skipped() > 0 {
            warn!(
                "{}: iteration {} skipped {} of {} patterns",
                label,
                iteration,
                pass.skipped(),
                pass.skipped() + pass.accumulated
            );
        }

        state = TrainingState::Updating;
        trace!("{}: iteration {} {}", label, iteration, state);
        let (next, update) = trainer.update(&model, stats, session)?;
        model = next;

        let average = pass.average_per_pattern();
        let change = previous.map(|p| average - p);
        info!(
            "{}: iteration {} avg log prob {:.4} per pattern, {:.4} per frame{}",
            label,
            iteration,
            average,
            pass.average_per_frame(),
            change.map_or(String::new(), |c| format!(", change {:.6}", c))
        );
        report.push(IterationReport {
            iteration,
            pass,
            update,
            change,
        });
        if change.map_or(false, |c| c.abs() < config.convergence_threshold) {
            state = TrainingState::Converged;
            break;
        }
        previous = Some(average);
    }

    if state != TrainingState::Converged {
        warn!(
            "{}: no convergence after {} iterations",
            label, config.max_iterations
        );
        state = TrainingState::Failed;
    }
    report.finish(state);
    Ok(Trained { model, report })
}
