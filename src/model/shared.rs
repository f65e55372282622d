use ndarray::{Array2, ArrayView1};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::{GaussianMixture, Hmm, TransitionMatrix};

/// A model in a shared set: a label plus indices into the set's pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalHmm {
    label: String,
    transition: usize,
    mixtures: Vec<usize>,
    min_duration: usize,
}

impl PhysicalHmm {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Index of the (possibly shared) transition matrix.
    pub fn transition(&self) -> usize {
        self.transition
    }

    /// Mixture index per emitting state; entry `j - 1` belongs to state `j`.
    pub fn mixtures(&self) -> &[usize] {
        &self.mixtures
    }

    pub fn num_states(&self) -> usize {
        self.mixtures.len() + 2
    }

    /// Minimum frames to pass through; zero for tee models.
    pub fn min_duration(&self) -> usize {
        self.min_duration
    }

    pub fn is_tee(&self) -> bool {
        self.min_duration == 0
    }
}

/// A set of HMMs whose transition matrices and mixtures may be tied.
///
/// Transition matrices and mixtures live in pools; models refer to them by
/// index, so a tied mixture has exactly one parameter set and one accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct HmmSet {
    dim: usize,
    transitions: Vec<TransitionMatrix>,
    mixtures: Vec<GaussianMixture>,
    models: Vec<PhysicalHmm>,
    labels: HashMap<String, usize>,
}

impl HmmSet {
    /// An empty set for `dim`-dimensional features.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            transitions: Vec::new(),
            mixtures: Vec::new(),
            models: Vec::new(),
            labels: HashMap::new(),
        }
    }

    pub fn add_transition(&mut self, transitions: TransitionMatrix) -> usize {
        self.transitions.push(transitions);
        self.transitions.len() - 1
    }

    pub fn add_mixture(&mut self, mixture: GaussianMixture) -> Result<usize> {
        if mixture.dim() != self.dim {
            return Err(Error::InvalidInput(format!(
                "mixture has dimension {}, set expects {}",
                mixture.dim(),
                self.dim
            )));
        }
        self.mixtures.push(mixture);
        Ok(self.mixtures.len() - 1)
    }

    /// Register a model over pooled parameters.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a duplicate label, an unknown pool index, a mixture
    /// count that does not match the emitting states, or an exit that cannot
    /// be reached.
    pub fn add_model(
        &mut self,
        label: impl Into<String>,
        transition: usize,
        mixtures: Vec<usize>,
    ) -> Result<usize> {
        let label = label.into();
        if self.labels.contains_key(&label) {
            return Err(Error::InvalidInput(format!("duplicate model label '{}'", label)));
        }
        let trans = self.transitions.get(transition).ok_or_else(|| {
            Error::InvalidInput(format!(
                "model '{}' refers to unknown transition matrix {}",
                label, transition
            ))
        })?;
        if mixtures.len() != trans.num_emitting() {
            return Err(Error::InvalidInput(format!(
                "model '{}' has {} emitting states but {} mixtures",
                label,
                trans.num_emitting(),
                mixtures.len()
            )));
        }
        if let Some(&bad) = mixtures.iter().find(|&&m| m >= self.mixtures.len()) {
            return Err(Error::InvalidInput(format!(
                "model '{}' refers to unknown mixture {}",
                label, bad
            )));
        }
        let min_duration = trans.min_duration().ok_or_else(|| {
            Error::InvalidInput(format!("model '{}' cannot reach its exit state", label))
        })?;
        self.models.push(PhysicalHmm {
            label: label.clone(),
            transition,
            mixtures,
            min_duration,
        });
        let index = self.models.len() - 1;
        self.labels.insert(label, index);
        Ok(index)
    }

    /// Add a standalone model with its own, untied parameters.
    pub fn add_hmm(&mut self, hmm: Hmm) -> Result<usize> {
        let (name, transitions, mixtures) = hmm.into_parts();
        let ids = mixtures
            .into_iter()
            .map(|m| self.add_mixture(m))
            .collect::<Result<Vec<_>>>()?;
        let t = self.add_transition(transitions);
        self.add_model(name, t, ids)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn models(&self) -> &[PhysicalHmm] {
        &self.models
    }

    pub fn model(&self, index: usize) -> &PhysicalHmm {
        &self.models[index]
    }

    pub fn transitions(&self) -> &[TransitionMatrix] {
        &self.transitions
    }

    pub fn transition_of(&self, model: usize) -> &TransitionMatrix {
        &self.transitions[self.models[model].transition]
    }

    pub fn mixtures(&self) -> &[GaussianMixture] {
        &self.mixtures
    }

    pub fn find(&self, label: &str) -> Option<usize> {
        self.labels.get(label).copied()
    }

    /// Map transcription labels to model indices.
    pub fn resolve<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<usize>> {
        labels
            .iter()
            .map(|l| {
                self.find(l.as_ref()).ok_or_else(|| {
                    Error::InvalidInput(format!("no model for label '{}'", l.as_ref()))
                })
            })
            .collect()
    }

    /// Same models, new pooled parameters.
    ///
    /// Minimum durations are taken from the new matrices: a reestimated tee
    /// model whose skip was never used is an ordinary model afterwards.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if a model can no longer reach its exit state.
    pub(crate) fn with_parameters(
        &self,
        transitions: Vec<TransitionMatrix>,
        mixtures: Vec<GaussianMixture>,
    ) -> Result<Self> {
        let models = self
            .models
            .iter()
            .map(|model| {
                let min_duration = transitions
                    .get(model.transition)
                    .and_then(TransitionMatrix::min_duration)
                    .ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "model '{}' cannot reach its exit state",
                            model.label
                        ))
                    })?;
                Ok(PhysicalHmm {
                    min_duration,
                    ..model.clone()
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            dim: self.dim,
            transitions,
            mixtures,
            models,
            labels: self.labels.clone(),
        })
    }

    /// Unfold a model sequence into one flat HMM.
    ///
    /// Exit-to-entry links between neighbours become direct transitions,
    /// including skips through tee models. Mixtures are copied per state.
    pub fn concatenate(&self, sequence: &[usize]) -> Result<Hmm> {
        if sequence.is_empty() {
            return Err(Error::InvalidInput("empty model sequence".to_string()));
        }
        if let Some(&bad) = sequence.iter().find(|&&q| q >= self.models.len()) {
            return Err(Error::InvalidInput(format!("unknown model index {}", bad)));
        }
        let mut offsets = Vec::with_capacity(sequence.len());
        let mut next = 1;
        for &q in sequence {
            offsets.push(next);
            next += self.models[q].mixtures.len();
        }
        let n = next + 1;
        let exit = n - 1;
        let mut prob = Array2::zeros((n, n));

        let mut row = vec![0.0; n];
        self.enter(sequence, &offsets, 0, 1.0, &mut row);
        prob.row_mut(0).assign(&ArrayView1::from(&row));

        let mut mixtures = Vec::with_capacity(n - 2);
        for (pos, &q) in sequence.iter().enumerate() {
            let trans = self.transition_of(q);
            let local_exit = trans.exit();
            for i in 1..local_exit {
                row.iter_mut().for_each(|p| *p = 0.0);
                for j in 1..local_exit {
                    row[offsets[pos] + j - 1] += trans.prob()[[i, j]];
                }
                let leave = trans.prob()[[i, local_exit]];
                if pos + 1 < sequence.len() {
                    self.enter(sequence, &offsets, pos + 1, leave, &mut row);
                } else {
                    row[exit] += leave;
                }
                prob.row_mut(offsets[pos] + i - 1)
                    .assign(&ArrayView1::from(&row));
                mixtures.push(self.mixtures[self.models[q].mixtures[i - 1]].clone());
            }
        }

        let name = sequence
            .iter()
            .map(|&q| self.models[q].label.as_str())
            .collect::<Vec<_>>()
            .join("+");
        Hmm::new(name, TransitionMatrix::new(prob)?, mixtures)
    }

    /// Spread `weight` from the entry of `sequence[pos]` into `row`.
    fn enter(
        &self,
        sequence: &[usize],
        offsets: &[usize],
        pos: usize,
        weight: f64,
        row: &mut [f64],
    ) {
        if weight <= 0.0 {
            return;
        }
        let trans = self.transition_of(sequence[pos]);
        let local_exit = trans.exit();
        for j in 1..local_exit {
            row[offsets[pos] + j - 1] += weight * trans.prob()[[0, j]];
        }
        let skip = weight * trans.prob()[[0, local_exit]];
        if pos + 1 < sequence.len() {
            self.enter(sequence, offsets, pos + 1, skip, row);
        } else {
            let last = row.len() - 1;
            row[last] += skip;
        }
    }
}
