//! M-step: new parameters from accumulated statistics.
//!
//! Every function takes the prior parameters by reference and returns fresh
//! ones; nothing is updated in place. Parameters without enough evidence keep
//! their prior values.

use log::{debug, warn};
use ndarray::{Array1, Array2};

use crate::accumulator::{MixtureAccumulator, TransitionAccumulator};
use crate::config::{OccupancyPolicy, TrainingConfig};
use crate::error::{Error, Result};
use crate::model::{Gaussian, GaussianMixture, TransitionMatrix};

/// What an update left untouched or removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Transition rows that kept their prior values for lack of occupancy.
    pub retained_rows: usize,
    /// Transition matrices or mixtures skipped as a whole.
    pub retained_parameters: usize,
    /// Components that kept their prior mean and variance.
    pub retained_components: usize,
    /// Variance elements raised to the floor.
    pub floored_variances: usize,
    /// Components dropped for falling below the minimum weight.
    pub discarded_components: usize,
}

impl UpdateSummary {
    pub fn merge(&mut self, other: &Self) {
        self.retained_rows += other.retained_rows;
        self.retained_parameters += other.retained_parameters;
        self.retained_components += other.retained_components;
        self.floored_variances += other.floored_variances;
        self.discarded_components += other.discarded_components;
    }
}

/// Reestimate a transition matrix from soft counts.
///
/// Row `i` becomes `count[i][j] / occ[i]`, renormalised. A row with no
/// occupancy keeps its prior values, or fails under
/// [`OccupancyPolicy::Abort`].
///
/// # Arguments
///
/// * `name` - Label used in warnings and errors
/// * `prior` - Current matrix
/// * `acc` - Counts gathered for `prior`
/// * `policy` - Handling of zero-occupancy rows
/// * `summary` - Counts retained rows
///
/// # Errors
///
/// `DegenerateOccupancy` under [`OccupancyPolicy::Abort`].
pub fn reestimate_transitions(
    name: &str,
    prior: &TransitionMatrix,
    acc: &TransitionAccumulator,
    policy: OccupancyPolicy,
    summary: &mut UpdateSummary,
) -> Result<TransitionMatrix> {
    let n = prior.num_states();
    if acc.num_states() != n {
        return Err(Error::InvalidInput(format!(
            "'{}': statistics for {} states, matrix has {}",
            name,
            acc.num_states(),
            n
        )));
    }
    let exit = prior.exit();
    let mut prob = Array2::zeros((n, n));
    for i in 0..exit {
        let occ = acc.occupancy(i);
        let row_sum: f64 = acc.counts().row(i).sum();
        if !(occ > 0.0) || !(row_sum > 0.0) {
            match policy {
                OccupancyPolicy::Abort => {
                    return Err(Error::DegenerateOccupancy {
                        model: name.to_string(),
                        row: i,
                    })
                }
                OccupancyPolicy::Retain => {
                    warn!("'{}': row {} has zero occupancy, keeping prior row", name, i);
                    summary.retained_rows += 1;
                    prob.row_mut(i).assign(&prior.prob().row(i));
                    continue;
                }
            }
        }
        let mut row = prob.row_mut(i);
        for j in 1..n {
            row[j] = acc.counts()[[i, j]] / occ;
        }
        let total = row.sum();
        row.mapv_inplace(|p| p / total);
    }
    Ok(TransitionMatrix::from_normalized(prob))
}

/// Reestimate a mixture from component statistics.
///
/// Components with less than `config.min_component_occupancy` keep their
/// prior mean and variance; variances are floored at
/// `config.covariance_floor`; weights are floored at
/// `config.mixture_weight_floor` and renormalised. Components whose weight
/// ends below `config.min_mixture_weight` are discarded, but never all of
/// them. A mixture without any occupancy is returned unchanged.
///
/// # Errors
///
/// `InvalidInput` if the statistics do not match the mixture's shape.
pub fn reestimate_mixture(
    name: &str,
    prior: &GaussianMixture,
    acc: &MixtureAccumulator,
    config: &TrainingConfig,
    summary: &mut UpdateSummary,
) -> Result<GaussianMixture> {
    if acc.components().len() != prior.len() {
        return Err(Error::InvalidInput(format!(
            "'{}': statistics for {} components, mixture has {}",
            name,
            acc.components().len(),
            prior.len()
        )));
    }
    let total = acc.occupancy();
    if !(total > 0.0) {
        warn!("'{}': mixture has zero occupancy, keeping prior", name);
        summary.retained_parameters += 1;
        return Ok(prior.clone());
    }

    let mut updated = Vec::with_capacity(prior.len());
    for (component, stats) in prior.components().iter().zip(acc.components()) {
        let occ = stats.occupancy();
        let weight = (occ / total).max(config.mixture_weight_floor);
        let estimate = if occ < config.min_component_occupancy {
            None
        } else {
            stats.mean().zip(stats.variance())
        };
        let (mean, variance) = match estimate {
            Some((mean, mut variance)) => {
                for (v, &old) in variance.iter_mut().zip(component.variance()) {
                    if *v < config.covariance_floor {
                        *v = config.covariance_floor;
                        summary.floored_variances += 1;
                    }
                    if !(*v > 0.0) {
                        *v = old;
                    }
                }
                (mean, variance)
            }
            None => {
                debug!(
                    "'{}': component occupancy {:.3} below {}, keeping prior",
                    name, occ, config.min_component_occupancy
                );
                summary.retained_components += 1;
                (component.mean().clone(), component.variance().clone())
            }
        };
        updated.push((mean, variance, weight));
    }

    normalize_weights(&mut updated);
    let kept = updated
        .iter()
        .filter(|(_, _, w)| *w >= config.min_mixture_weight)
        .count();
    if kept > 0 && kept < updated.len() {
        let discarded = updated.len() - kept;
        warn!("'{}': discarding {} light components", name, discarded);
        summary.discarded_components += discarded;
        updated.retain(|(_, _, w)| *w >= config.min_mixture_weight);
        normalize_weights(&mut updated);
    }

    let components = updated
        .into_iter()
        .map(|(mean, variance, weight)| Gaussian::new(mean, variance, weight.min(1.0)))
        .collect::<Result<Vec<_>>>()?;
    Ok(GaussianMixture::from_normalized(components))
}

fn normalize_weights(components: &mut [(Array1<f64>, Array1<f64>, f64)]) {
    let sum: f64 = components.iter().map(|(_, _, w)| w).sum();
    if sum > 0.0 {
        for (_, _, w) in components.iter_mut() {
            *w /= sum;
        }
    }
}
