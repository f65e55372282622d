//! HMM parameters.
//!
//! - [`Gaussian`] / [`GaussianMixture`]: diagonal-covariance output densities
//! - [`TransitionMatrix`]: entry/exit topology in natural and log domain
//! - [`Hmm`]: a single model owning its parameters (isolated training)
//! - [`HmmSet`] / [`PhysicalHmm`]: models over tied parameter pools (embedded training)

pub mod gaussian;
pub mod hmm;
pub mod shared;
pub mod transition;

pub use gaussian::{Gaussian, GaussianMixture};
pub use hmm::Hmm;
pub use shared::{HmmSet, PhysicalHmm};
pub use transition::TransitionMatrix;
