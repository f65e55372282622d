//! Training configuration.
//!
//! Every scalar has a documented range; [`TrainingConfig::validate`] is run
//! by every training entry point before any pattern is touched.

use crate::error::{Error, Result};

/// What to do with a transition row that collected no occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OccupancyPolicy {
    /// Keep the prior row and warn.
    #[default]
    Retain,
    /// Abort the update with [`Error::DegenerateOccupancy`].
    Abort,
}

/// Beam schedule for embedded training.
///
/// The backward sweep starts at `initial`; after a beam collapse it is
/// repeated with the threshold raised by `increment` until it would exceed
/// `limit`, at which point the utterance is skipped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PruningConfig {
    pub initial: f64,
    pub increment: f64,
    pub limit: f64,
}

impl PruningConfig {
    pub fn new(initial: f64, increment: f64, limit: f64) -> Self {
        Self {
            initial,
            increment,
            limit,
        }
    }

    /// A beam that never prunes anything.
    pub fn disabled() -> Self {
        Self {
            initial: f64::INFINITY,
            increment: 0.0,
            limit: f64::INFINITY,
        }
    }

    /// Thresholds tried in order.
    pub fn schedule(&self) -> impl Iterator<Item = f64> + '_ {
        let mut next = Some(self.initial);
        std::iter::from_fn(move || {
            let current = next?;
            let raised = current + self.increment;
            next = if self.increment > 0.0 && raised <= self.limit && current.is_finite() {
                Some(raised)
            } else {
                None
            };
            Some(current)
        })
    }
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            initial: 2000.0,
            increment: 1000.0,
            limit: 6000.0,
        }
    }
}

/// Options shared by isolated and embedded training.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    /// Maximum EM iterations (1..=1000).
    pub max_iterations: usize,
    /// Convergence threshold on the change of average log probability per pattern (0..=1).
    pub convergence_threshold: f64,
    /// Variance floor applied after every update (0..=1000).
    pub covariance_floor: f64,
    /// Floor on reestimated mixture weights (0..=1).
    pub mixture_weight_floor: f64,
    /// Shorter patterns are skipped.
    pub min_frames_per_pattern: usize,
    /// Isolated training refuses models with fewer patterns.
    pub min_patterns_per_model: usize,
    /// Embedded training beam schedule.
    pub pruning: PruningConfig,
    /// Forward cells with `alpha + beta - pr` below `-forward_prune_threshold` are dropped.
    pub forward_prune_threshold: f64,
    /// Embedded training only updates parameters used by models seen this often.
    pub min_label_occurrences: usize,
    /// Components with less occupancy keep their prior mean and variance.
    pub min_component_occupancy: f64,
    /// Components whose updated weight falls below this are discarded.
    pub min_mixture_weight: f64,
    pub occupancy_policy: OccupancyPolicy,
    /// Allowed per-frame gap between forward and backward log probability.
    pub consistency_tolerance: f64,
    /// Run the E-step across patterns on the rayon pool.
    pub parallel: bool,
    /// Collect per-pattern state occupation for diagnostics.
    pub dump_occupation: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            convergence_threshold: 1e-4,
            covariance_floor: 1e-4,
            mixture_weight_floor: 0.0,
            min_frames_per_pattern: 1,
            min_patterns_per_model: 3,
            pruning: PruningConfig::default(),
            forward_prune_threshold: 10.0,
            min_label_occurrences: 3,
            min_component_occupancy: 1.0,
            min_mixture_weight: 1e-5,
            occupancy_policy: OccupancyPolicy::Retain,
            consistency_tolerance: 1e-3,
            parallel: false,
            dump_occupation: false,
        }
    }
}

impl TrainingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = threshold;
        self
    }

    pub fn with_covariance_floor(mut self, floor: f64) -> Self {
        self.covariance_floor = floor;
        self
    }

    pub fn with_mixture_weight_floor(mut self, floor: f64) -> Self {
        self.mixture_weight_floor = floor;
        self
    }

    pub fn with_min_frames_per_pattern(mut self, frames: usize) -> Self {
        self.min_frames_per_pattern = frames;
        self
    }

    pub fn with_min_patterns_per_model(mut self, patterns: usize) -> Self {
        self.min_patterns_per_model = patterns;
        self
    }

    pub fn with_pruning(mut self, pruning: PruningConfig) -> Self {
        self.pruning = pruning;
        self
    }

    pub fn with_forward_prune_threshold(mut self, threshold: f64) -> Self {
        self.forward_prune_threshold = threshold;
        self
    }

    pub fn with_min_label_occurrences(mut self, occurrences: usize) -> Self {
        self.min_label_occurrences = occurrences;
        self
    }

    pub fn with_min_component_occupancy(mut self, occupancy: f64) -> Self {
        self.min_component_occupancy = occupancy;
        self
    }

    pub fn with_min_mixture_weight(mut self, weight: f64) -> Self {
        self.min_mixture_weight = weight;
        self
    }

    pub fn with_occupancy_policy(mut self, policy: OccupancyPolicy) -> Self {
        self.occupancy_policy = policy;
        self
    }

    pub fn with_consistency_tolerance(mut self, tolerance: f64) -> Self {
        self.consistency_tolerance = tolerance;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_dump_occupation(mut self, dump: bool) -> Self {
        self.dump_occupation = dump;
        self
    }

    /// Check every scalar against its documented range.
    pub fn validate(&self) -> Result<()> {
        if !(1..=1000).contains(&self.max_iterations) {
            return Err(Error::configuration(
                "max_iterations",
                self.max_iterations,
                "must be in 1..=1000",
            ));
        }
        check_range("convergence_threshold", self.convergence_threshold, 0.0, 1.0)?;
        check_range("covariance_floor", self.covariance_floor, 0.0, 1000.0)?;
        check_range("mixture_weight_floor", self.mixture_weight_floor, 0.0, 1.0)?;
        check_range("min_mixture_weight", self.min_mixture_weight, 0.0, 1.0)?;
        if self.min_frames_per_pattern == 0 {
            return Err(Error::configuration(
                "min_frames_per_pattern",
                0,
                "a pattern needs at least one frame",
            ));
        }
        if self.min_patterns_per_model == 0 {
            return Err(Error::configuration(
                "min_patterns_per_model",
                0,
                "must be at least 1",
            ));
        }
        if !(self.pruning.initial > 0.0) {
            return Err(Error::configuration(
                "pruning.initial",
                self.pruning.initial,
                "must be positive",
            ));
        }
        if !(self.pruning.increment >= 0.0) || !(self.pruning.limit >= self.pruning.initial) {
            return Err(Error::configuration(
                "pruning",
                format!("{:?}", self.pruning),
                "increment must be non-negative and limit at least the initial threshold",
            ));
        }
        if !(self.forward_prune_threshold > 0.0) {
            return Err(Error::configuration(
                "forward_prune_threshold",
                self.forward_prune_threshold,
                "must be positive",
            ));
        }
        if !(self.min_component_occupancy >= 0.0) || !self.min_component_occupancy.is_finite() {
            return Err(Error::configuration(
                "min_component_occupancy",
                self.min_component_occupancy,
                "must be finite and non-negative",
            ));
        }
        if !(self.consistency_tolerance > 0.0) {
            return Err(Error::configuration(
                "consistency_tolerance",
                self.consistency_tolerance,
                "must be positive",
            ));
        }
        Ok(())
    }
}

fn check_range(parameter: &'static str, value: f64, lo: f64, hi: f64) -> Result<()> {
    if value.is_finite() && (lo..=hi).contains(&value) {
        Ok(())
    } else {
        Err(Error::configuration(
            parameter,
            value,
            format!("must be in [{}, {}]", lo, hi),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_iterations, 20);
        assert_eq!(config.min_patterns_per_model, 3);
        assert_eq!(config.pruning.initial, 2000.0);
        assert!(config.pruning.increment > 0.0);
    }

    #[test]
    fn test_out_of_range_values_fail() {
        assert!(TrainingConfig::new().with_max_iterations(0).validate().is_err());
        assert!(TrainingConfig::new().with_max_iterations(1001).validate().is_err());
        assert!(TrainingConfig::new()
            .with_convergence_threshold(1.5)
            .validate()
            .is_err());
        assert!(TrainingConfig::new()
            .with_covariance_floor(-1.0)
            .validate()
            .is_err());
        assert!(TrainingConfig::new()
            .with_mixture_weight_floor(f64::NAN)
            .validate()
            .is_err());
        assert!(TrainingConfig::new()
            .with_min_frames_per_pattern(0)
            .validate()
            .is_err());
        assert!(TrainingConfig::new()
            .with_pruning(PruningConfig::new(100.0, 10.0, 50.0))
            .validate()
            .is_err());
    }

    #[test]
    fn test_pruning_schedule() {
        let thresholds: Vec<f64> = PruningConfig::new(100.0, 50.0, 220.0).schedule().collect();
        assert_eq!(thresholds, vec![100.0, 150.0, 200.0]);

        let once: Vec<f64> = PruningConfig::new(100.0, 0.0, 500.0).schedule().collect();
        assert_eq!(once, vec![100.0]);

        let disabled: Vec<f64> = PruningConfig::disabled().schedule().collect();
        assert_eq!(disabled, vec![f64::INFINITY]);
        assert!(TrainingConfig::new()
            .with_pruning(PruningConfig::disabled())
            .validate()
            .is_ok());
    }
}
