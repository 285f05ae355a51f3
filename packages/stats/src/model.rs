//! Count model selection and fitting.
//!
//! Chooses between Poisson and Negative Binomial for a historical weekly
//! count series via an overdispersion test (sample variance > sample
//! mean), with a method-of-moments NB fit. Degenerate NB parameters fall
//! back to Poisson, tagged distinctly so reporting can tell an intended
//! NB from a fallback.

use hotspot_models::ModelChoice;
use statrs::distribution::{DiscreteCDF as _, NegativeBinomial, Poisson};
use statrs::statistics::{DiscreteDistribution as _, Distribution as _};

use crate::StatsError;

/// Sample mean and sample variance (ddof = 1) of a count series.
///
/// Variance is 0 for fewer than two observations.
#[must_use]
pub fn sample_mean_variance(counts: &[u64]) -> (f64, f64) {
    if counts.is_empty() {
        return (0.0, 0.0);
    }
    #[allow(clippy::cast_precision_loss)]
    let n = counts.len() as f64;
    #[allow(clippy::cast_precision_loss)]
    let mean = counts.iter().map(|&c| c as f64).sum::<f64>() / n;
    if counts.len() < 2 {
        return (mean, 0.0);
    }
    #[allow(clippy::cast_precision_loss)]
    let variance = counts
        .iter()
        .map(|&c| {
            let d = c as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1.0);
    (mean, variance)
}

/// Method-of-moments NB parameters: p = mean/var, n = mean * p / (1 - p).
///
/// Returns `None` when the parameters are non-finite or out of domain
/// (p outside (0, 1], n <= 0), in which case the caller falls back to
/// Poisson with the fallback tag.
fn negative_binomial_params(mean: f64, variance: f64) -> Option<(f64, f64)> {
    let p = mean / variance;
    let n = mean * p / (1.0 - p);
    (p.is_finite() && n.is_finite() && p > 0.0 && p <= 1.0 && n > 0.0).then_some((n, p))
}

enum CountDistribution {
    Poisson(Poisson),
    NegativeBinomial(NegativeBinomial),
}

/// A fitted count distribution for one series' historical weeks.
pub struct FittedModel {
    dist: CountDistribution,
    choice: ModelChoice,
    historical_mean: f64,
    historical_variance: f64,
}

impl FittedModel {
    /// Fits a model to a historical weekly count series.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::EmptyHistory`] if the counts sum to zero
    /// (callers must exclude such series), or a distribution error if
    /// the Poisson constructor rejects the mean.
    pub fn fit(historical: &[u64]) -> Result<Self, StatsError> {
        if historical.iter().sum::<u64>() == 0 {
            return Err(StatsError::EmptyHistory);
        }
        let (mean, variance) = sample_mean_variance(historical);
        Self::from_moments(mean, variance)
    }

    fn from_moments(mean: f64, variance: f64) -> Result<Self, StatsError> {
        if variance > mean && mean > 0.0 {
            if let Some((n, p)) = negative_binomial_params(mean, variance)
                && let Ok(dist) = NegativeBinomial::new(n, p)
            {
                return Ok(Self {
                    dist: CountDistribution::NegativeBinomial(dist),
                    choice: ModelChoice::NegativeBinomial,
                    historical_mean: mean,
                    historical_variance: variance,
                });
            }
            log::debug!(
                "Degenerate NB parameters (mean={mean}, var={variance}); falling back to Poisson"
            );
            return Ok(Self {
                dist: CountDistribution::Poisson(Poisson::new(mean)?),
                choice: ModelChoice::PoissonFallback,
                historical_mean: mean,
                historical_variance: variance,
            });
        }

        Ok(Self {
            dist: CountDistribution::Poisson(Poisson::new(mean)?),
            choice: ModelChoice::Poisson,
            historical_mean: mean,
            historical_variance: variance,
        })
    }

    /// Which model family was selected.
    #[must_use]
    pub const fn choice(&self) -> ModelChoice {
        self.choice
    }

    /// Sample mean of the historical counts.
    #[must_use]
    pub const fn historical_mean(&self) -> f64 {
        self.historical_mean
    }

    /// Sample variance of the historical counts.
    #[must_use]
    pub const fn historical_variance(&self) -> f64 {
        self.historical_variance
    }

    /// P(X >= count) under the fitted distribution, computed as the
    /// upper tail including `count` itself. Exactly 1.0 for a count of
    /// 0: no event is never anomalous.
    #[must_use]
    pub fn survival(&self, count: u64) -> f64 {
        if count == 0 {
            return 1.0;
        }
        match &self.dist {
            CountDistribution::Poisson(d) => d.sf(count - 1),
            CountDistribution::NegativeBinomial(d) => d.sf(count - 1),
        }
    }

    /// The fitted distribution's mean.
    #[must_use]
    pub fn mean(&self) -> f64 {
        match &self.dist {
            CountDistribution::Poisson(d) => d.mean(),
            CountDistribution::NegativeBinomial(d) => d.mean(),
        }
        .unwrap_or(self.historical_mean)
    }

    /// The fitted distribution's standard deviation.
    #[must_use]
    pub fn std_dev(&self) -> f64 {
        match &self.dist {
            CountDistribution::Poisson(d) => d.variance(),
            CountDistribution::NegativeBinomial(d) => d.variance(),
        }
        .map_or(0.0, f64::sqrt)
    }

    /// Effect size: (count - mean) / std_dev, or 0 when std_dev is 0.
    #[must_use]
    pub fn z_score(&self, count: u64) -> f64 {
        let std_dev = self.std_dev();
        if std_dev > 0.0 {
            #[allow(clippy::cast_precision_loss)]
            let diff = count as f64 - self.mean();
            diff / std_dev
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_variance_uses_ddof_one() {
        let (mean, variance) = sample_mean_variance(&[2, 4, 6]);
        assert!((mean - 4.0).abs() < 1e-12);
        assert!((variance - 4.0).abs() < 1e-12);
    }

    #[test]
    fn underdispersed_series_selects_poisson() {
        // Constant counts: variance 0 <= mean 5
        let model = FittedModel::fit(&[5, 5, 5, 5]).unwrap();
        assert_eq!(model.choice(), ModelChoice::Poisson);
        assert!((model.mean() - 5.0).abs() < 1e-12);
        assert!((model.std_dev() - 5.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn overdispersed_series_selects_negative_binomial() {
        // mean 5.7, variance ~32.9
        let model = FittedModel::fit(&[1, 3, 5, 7, 9, 20, 0, 2, 4, 6]).unwrap();
        let (mean, variance) = sample_mean_variance(&[1, 3, 5, 7, 9, 20, 0, 2, 4, 6]);
        assert!(variance > mean);
        assert_eq!(model.choice(), ModelChoice::NegativeBinomial);
        // The method-of-moments fit reproduces the sample mean, and the
        // fitted spread reflects the overdispersion.
        assert!((model.mean() - mean).abs() < 1e-9);
        assert!(model.std_dev() > model.mean().sqrt());
    }

    #[test]
    fn degenerate_nb_parameters_are_rejected() {
        assert!(negative_binomial_params(5.0, f64::INFINITY).is_none());
        assert!(negative_binomial_params(5.0, f64::NAN).is_none());
        // Zero mean gives p = 0, outside (0, 1].
        assert!(negative_binomial_params(0.0, 1.0).is_none());

        let (n, p) = negative_binomial_params(5.7, 32.9).unwrap();
        assert!(p > 0.0 && p <= 1.0);
        assert!(n > 0.0);
    }

    #[test]
    fn degenerate_overdispersion_falls_back_to_tagged_poisson() {
        let model = FittedModel::from_moments(5.0, f64::INFINITY).unwrap();
        assert_eq!(model.choice(), ModelChoice::PoissonFallback);
        assert!((model.mean() - 5.0).abs() < 1e-12);
        assert!((model.survival(0) - 1.0).abs() < f64::EPSILON);
        assert!(model.survival(50) < 1e-20);
    }

    #[test]
    fn all_zero_history_is_a_precondition_violation() {
        assert!(matches!(
            FittedModel::fit(&[0, 0, 0]),
            Err(StatsError::EmptyHistory)
        ));
    }

    #[test]
    fn survival_at_zero_is_exactly_one() {
        let poisson = FittedModel::fit(&[5, 5, 5, 5]).unwrap();
        assert!((poisson.survival(0) - 1.0).abs() < f64::EPSILON);

        let nb = FittedModel::fit(&[1, 3, 5, 7, 9, 20, 0, 2, 4, 6]).unwrap();
        assert!((nb.survival(0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn survival_includes_the_observed_count() {
        // Poisson(5): P(X >= 1) = 1 - P(X = 0) = 1 - e^-5
        let model = FittedModel::fit(&[5, 5, 5, 5]).unwrap();
        let expected = 1.0 - (-5.0_f64).exp();
        assert!((model.survival(1) - expected).abs() < 1e-12);
    }

    #[test]
    fn extreme_count_has_a_vanishing_p_value_and_large_z() {
        let model = FittedModel::fit(&[5, 5, 5, 5]).unwrap();
        assert!(model.survival(50) < 1e-20);
        assert!(model.z_score(50) > 10.0);
    }

    #[test]
    fn z_score_sign_follows_the_deviation() {
        let model = FittedModel::fit(&[5, 5, 5, 5]).unwrap();
        assert!(model.z_score(0) < 0.0);
        assert!(model.z_score(5) < 1e-12);
        assert!(model.z_score(10) > 0.0);
    }
}
