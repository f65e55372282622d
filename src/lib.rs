//! Baum-Welch training for continuous-density hidden Markov models.
//!
//! Two training shapes share one EM controller ([`trainer::iterate`]):
//!
//! - isolated: one [`Hmm`] and the patterns of that model
//!   ([`trainer::isolated::train`])
//! - embedded: an [`HmmSet`] with tied parameters and utterances labelled
//!   with model sequences ([`trainer::embedded::train`])
//!
//! Probabilities are kept in the log domain with a finite floor (see
//! [`log_math`]). A training run is configured by a [`TrainingConfig`] and
//! carried by a [`TrainingSession`].

pub mod accumulator;
pub mod config;
pub mod embedded;
pub mod error;
pub mod forward_backward;
pub mod log_math;
pub mod model;
pub mod observation;
pub mod pattern;
pub mod reestimate;
pub mod report;
pub mod session;
pub mod synthetic;
pub mod trainer;

pub use config::{OccupancyPolicy, PruningConfig, TrainingConfig};
pub use error::{Error, Result};
pub use model::{Gaussian, GaussianMixture, Hmm, HmmSet, PhysicalHmm, TransitionMatrix};
pub use pattern::{Pattern, Utterance};
pub use report::{OccupancyReport, TrainingReport};
pub use session::{CancelHandle, TrainingSession};
pub use trainer::embedded::train as train_embedded;
pub use trainer::isolated::train as train_isolated;
pub use trainer::{EmTrainer, SkipReason, Trained, TrainingState};
