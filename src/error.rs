//! Error types for HMM training.
//!
//! Only conditions that abort a training run live here. Per-pattern
//! conditions that are skipped and counted (short patterns, negligible
//! probability, beam collapse) are reported through
//! [`SkipReason`](crate::trainer::SkipReason) instead.

use thiserror::Error;

/// Fatal training errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// Malformed model parameters or data (bad dimensions, probabilities, indices).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A configuration scalar is outside its documented range.
    #[error("configuration error: {parameter} = {value} ({reason})")]
    Configuration {
        parameter: &'static str,
        value: String,
        reason: String,
    },

    /// Too few usable training patterns for a model.
    #[error("model '{model}' has {available} training patterns, at least {required} required")]
    InsufficientData {
        model: String,
        available: usize,
        required: usize,
    },

    /// A transition row collected no occupancy and the policy forbids keeping the prior row.
    #[error("model '{model}': transition row {row} has zero occupancy")]
    DegenerateOccupancy { model: String, row: usize },

    /// Forward and backward totals disagree; this indicates an implementation bug.
    #[error(
        "forward/backward disagreement for {context}: forward {forward}, backward {backward} over {frames} frames"
    )]
    Consistency {
        context: String,
        forward: f64,
        backward: f64,
        frames: usize,
    },

    /// The model sequence needs more frames than the utterance has.
    #[error("utterance '{utterance}': minimum duration {min_duration} exceeds {frames} frames")]
    UntraversableUtterance {
        utterance: String,
        min_duration: usize,
        frames: usize,
    },

    /// Two zero-duration models follow each other in a model sequence.
    #[error("utterance '{utterance}': consecutive tee models at positions {position} and {next}", next = .position + 1)]
    ConsecutiveTeeModels { utterance: String, position: usize },

    /// No pattern in a whole EM pass was usable.
    #[error("no usable training patterns in iteration {iteration}")]
    Exhausted { iteration: usize },

    /// A scratch buffer was sized for fewer frames or states than a pattern needs.
    #[error("scratch buffer holds {capacity} {what}, {required} required")]
    BufferTooSmall {
        what: &'static str,
        capacity: usize,
        required: usize,
    },

    /// Training was cancelled between patterns.
    #[error("training cancelled")]
    Cancelled,
}

/// Result type for training operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn configuration(
        parameter: &'static str,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Error::Configuration {
            parameter,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = Error::Consistency {
            context: "model 'aa'".to_string(),
            forward: -10.0,
            backward: -12.0,
            frames: 4,
        };
        let text = err.to_string();
        assert!(text.contains("model 'aa'"));
        assert!(text.contains("4 frames"));

        let err = Error::ConsecutiveTeeModels {
            utterance: "u1".to_string(),
            position: 2,
        };
        assert_eq!(
            err.to_string(),
            "utterance 'u1': consecutive tee models at positions 2 and 3"
        );
    }

    #[test]
    fn test_configuration_helper() {
        let err = Error::configuration("max_iterations", 0, "must be in 1..=1000");
        assert!(matches!(
            err,
            Error::Configuration {
                parameter: "max_iterations",
                ..
            }
        ));
    }
}
