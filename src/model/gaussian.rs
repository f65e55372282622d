use ndarray::{Array1, ArrayView1};
use std::f64::consts::PI;

use crate::error::{Error, Result};
use crate::log_math::{log_add, safe_ln, LOG_ZERO};

/// Tolerance on the natural-domain weight sum of a mixture.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

/// A diagonal-covariance Gaussian mixture component.
#[derive(Debug, Clone, PartialEq)]
pub struct Gaussian {
    mean: Array1<f64>,
    variance: Array1<f64>,
    log_weight: f64,
    /// `D ln(2 pi) + sum ln(var)`, cached for density evaluation.
    gconst: f64,
}

impl Gaussian {
    /// Create a component from its mean, diagonal variance and natural-domain weight.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the vectors are empty or differ in length, a variance
    /// is not strictly positive, or the weight is outside `[0, 1]`.
    pub fn new(mean: Array1<f64>, variance: Array1<f64>, weight: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&weight) {
            return Err(Error::InvalidInput(format!(
                "mixture weight {} is outside [0, 1]",
                weight
            )));
        }
        Self::with_log_weight(mean, variance, safe_ln(weight))
    }

    /// Create a component with its weight already in the log domain.
    pub fn with_log_weight(
        mean: Array1<f64>,
        variance: Array1<f64>,
        log_weight: f64,
    ) -> Result<Self> {
        if mean.is_empty() {
            return Err(Error::InvalidInput(
                "Gaussian must have at least one dimension".to_string(),
            ));
        }
        if mean.len() != variance.len() {
            return Err(Error::InvalidInput(format!(
                "mean has {} dimensions but variance has {}",
                mean.len(),
                variance.len()
            )));
        }
        if let Some(v) = variance.iter().find(|v| !(**v > 0.0) || !v.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "variance {} must be finite and positive",
                v
            )));
        }
        let gconst = mean.len() as f64 * (2.0 * PI).ln() + variance.iter().map(|v| v.ln()).sum::<f64>();
        Ok(Self {
            mean,
            variance,
            log_weight,
            gconst,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn variance(&self) -> &Array1<f64> {
        &self.variance
    }

    pub fn log_weight(&self) -> f64 {
        self.log_weight
    }

    pub fn weight(&self) -> f64 {
        if self.log_weight <= LOG_ZERO {
            0.0
        } else {
            self.log_weight.exp()
        }
    }

    /// Log density of `obs`, excluding the mixture weight.
    pub fn log_density(&self, obs: ArrayView1<f64>) -> f64 {
        let mahalanobis: f64 = obs
            .iter()
            .zip(self.mean.iter())
            .zip(self.variance.iter())
            .map(|((&x, &mu), &var)| {
                let d = x - mu;
                d * d / var
            })
            .sum();
        -0.5 * (self.gconst + mahalanobis)
    }
}

/// Output distribution of one emitting state.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMixture {
    components: Vec<Gaussian>,
}

impl GaussianMixture {
    /// Build a mixture from its components.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if there are no components, dimensions disagree, or the
    /// weights do not sum to one.
    pub fn new(components: Vec<Gaussian>) -> Result<Self> {
        let first = components.first().ok_or_else(|| {
            Error::InvalidInput("mixture must have at least one component".to_string())
        })?;
        let dim = first.dim();
        if let Some(c) = components.iter().find(|c| c.dim() != dim) {
            return Err(Error::InvalidInput(format!(
                "mixture components disagree on dimension: {} vs {}",
                dim,
                c.dim()
            )));
        }
        let total: f64 = components.iter().map(Gaussian::weight).sum();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(Error::InvalidInput(format!(
                "mixture weights sum to {}, expected 1",
                total
            )));
        }
        Ok(Self { components })
    }

    /// A single-component mixture.
    pub fn single(mean: Array1<f64>, variance: Array1<f64>) -> Result<Self> {
        Self::new(vec![Gaussian::new(mean, variance, 1.0)?])
    }

    /// Used by the reestimator, which has already normalised the weights.
    pub(crate) fn from_normalized(components: Vec<Gaussian>) -> Self {
        Self { components }
    }

    pub fn dim(&self) -> usize {
        self.components[0].dim()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[Gaussian] {
        &self.components
    }

    /// Log output probability of `obs`.
    pub fn log_likelihood(&self, obs: ArrayView1<f64>) -> f64 {
        self.components
            .iter()
            .fold(LOG_ZERO, |acc, c| log_add(acc, c.log_weight + c.log_density(obs)))
    }

    /// Per-component weighted log terms written into `terms`; returns their log-sum.
    pub fn component_terms(&self, obs: ArrayView1<f64>, terms: &mut Vec<f64>) -> f64 {
        terms.clear();
        let mut total = LOG_ZERO;
        for c in &self.components {
            let term = c.log_weight + c.log_density(obs);
            terms.push(term);
            total = log_add(total, term);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_standard_normal_density() {
        let g = Gaussian::new(array![0.0], array![1.0], 1.0).unwrap();
        let expected = -0.5 * (2.0 * PI).ln();
        assert_relative_eq!(g.log_density(array![0.0].view()), expected, epsilon = 1e-12);
        assert_relative_eq!(
            g.log_density(array![2.0].view()),
            expected - 2.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_diagonal_density_is_product() {
        let g = Gaussian::new(array![1.0, -1.0], array![2.0, 0.5], 1.0).unwrap();
        let a = Gaussian::new(array![1.0], array![2.0], 1.0).unwrap();
        let b = Gaussian::new(array![-1.0], array![0.5], 1.0).unwrap();
        let obs = array![0.3, 0.1];
        let joint = g.log_density(obs.view());
        let split = a.log_density(array![0.3].view()) + b.log_density(array![0.1].view());
        assert_relative_eq!(joint, split, epsilon = 1e-12);
    }

    #[test]
    fn test_mixture_likelihood() {
        let m = GaussianMixture::new(vec![
            Gaussian::new(array![0.0], array![1.0], 0.25).unwrap(),
            Gaussian::new(array![4.0], array![1.0], 0.75).unwrap(),
        ])
        .unwrap();
        let obs = array![1.0];
        let direct = 0.25 * m.components()[0].log_density(obs.view()).exp()
            + 0.75 * m.components()[1].log_density(obs.view()).exp();
        assert_relative_eq!(m.log_likelihood(obs.view()), direct.ln(), epsilon = 1e-12);

        let mut terms = Vec::new();
        let total = m.component_terms(obs.view(), &mut terms);
        assert_eq!(terms.len(), 2);
        assert_relative_eq!(total, direct.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_components_rejected() {
        assert!(Gaussian::new(array![0.0], array![0.0], 1.0).is_err());
        assert!(Gaussian::new(array![0.0, 1.0], array![1.0], 1.0).is_err());
        assert!(Gaussian::new(array![0.0], array![1.0], 1.5).is_err());
        assert!(GaussianMixture::new(vec![]).is_err());
        let unnormalised = vec![
            Gaussian::new(array![0.0], array![1.0], 0.4).unwrap(),
            Gaussian::new(array![1.0], array![1.0], 0.4).unwrap(),
        ];
        assert!(GaussianMixture::new(unnormalised).is_err());
    }
}
