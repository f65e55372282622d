//! Textual training and occupancy reports.

use std::fmt;

use crate::accumulator::OccupancyTally;
use crate::model::HmmSet;
use crate::reestimate::UpdateSummary;
use crate::trainer::{PassSummary, TrainingState};

/// One EM iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    pub pass: PassSummary,
    pub update: UpdateSummary,
    /// Change of the average log probability per pattern; `None` on the first pass.
    pub change: Option<f64>,
}

/// Everything [`iterate`](crate::trainer::iterate) did.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    label: String,
    iterations: Vec<IterationReport>,
    state: TrainingState,
}

impl TrainingReport {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            iterations: Vec::new(),
            state: TrainingState::Init,
        }
    }

    pub(crate) fn push(&mut self, iteration: IterationReport) {
        self.iterations.push(iteration);
    }

    pub(crate) fn finish(&mut self, state: TrainingState) {
        self.state = state;
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn iterations(&self) -> &[IterationReport] {
        &self.iterations
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn converged(&self) -> bool {
        self.state == TrainingState::Converged
    }

    /// Average log probability per pattern of the last pass.
    pub fn final_log_prob(&self) -> Option<f64> {
        self.iterations.last().map(|i| i.pass.average_per_pattern())
    }

    /// Patterns skipped over all passes.
    pub fn total_skipped(&self) -> usize {
        self.iterations.iter().map(|i| i.pass.skipped()).sum()
    }
}

impl fmt::Display for TrainingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} after {} iterations",
            self.label,
            self.state,
            self.iterations.len()
        )?;
        writeln!(
            f,
            "{:>5} {:>14} {:>12} {:>12} {:>6} {:>6} {:>6} {:>6} {:>6}",
            "iter", "logp/pattern", "logp/frame", "change", "used", "short", "lowp", "pruned", "disc"
        )?;
        for it in &self.iterations {
            let change = it
                .change
                .map_or_else(|| "-".to_string(), |c| format!("{:.6}", c));
            writeln!(
                f,
                "{:>5} {:>14.4} {:>12.4} {:>12} {:>6} {:>6} {:>6} {:>6} {:>6}",
                it.iteration,
                it.pass.average_per_pattern(),
                it.pass.average_per_frame(),
                change,
                it.pass.accumulated,
                it.pass.too_short,
                it.pass.negligible,
                it.pass.pruning_failures,
                it.update.discarded_components
            )?;
        }
        Ok(())
    }
}

/// Occurrences and state occupation of one physical model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOccupancy {
    pub label: String,
    pub occurrences: usize,
    /// Total occupation per emitting state.
    pub states: Vec<f64>,
}

/// Per-model occupancy of the last embedded pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OccupancyReport {
    pub models: Vec<ModelOccupancy>,
}

impl OccupancyReport {
    pub fn from_tally(set: &HmmSet, tally: &OccupancyTally) -> Self {
        let models = set
            .models()
            .iter()
            .enumerate()
            .map(|(m, model)| {
                let mut states = tally.state_occupancy(m).to_vec();
                states.resize(model.num_states() - 2, 0.0);
                ModelOccupancy {
                    label: model.label().to_string(),
                    occurrences: tally.occurrences(m),
                    states,
                }
            })
            .collect();
        Self { models }
    }

    pub fn get(&self, label: &str) -> Option<&ModelOccupancy> {
        self.models.iter().find(|m| m.label == label)
    }
}

impl fmt::Display for OccupancyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, model) in self.models.iter().enumerate() {
            write!(f, "{:>4} \"{}\" {:>6}", i + 1, model.label, model.occurrences)?;
            for occ in &model.states {
                write!(f, " {:>10.3}", occ)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
