//! Ordinary least squares trend fit.
//!
//! Regresses weekly counts against a sequential time-step index and
//! reports the slope with a two-sided Student-t p-value. Degenerate
//! cases (two points, perfect fits, flat series) yield a slope with no
//! p-value instead of failing.

use statrs::distribution::{ContinuousCDF as _, StudentsT};

/// Result of one trend regression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendRegression {
    /// OLS slope of count per week.
    pub slope: f64,
    /// Two-sided p-value of the slope, when computable.
    pub p_value: Option<f64>,
}

/// Fits count vs. 0..n week index. Returns `None` for fewer than two
/// points.
#[must_use]
pub fn linear_trend(counts: &[u64]) -> Option<TrendRegression> {
    let n = counts.len();
    if n < 2 {
        return None;
    }

    #[allow(clippy::cast_precision_loss)]
    let n_f = n as f64;
    #[allow(clippy::cast_precision_loss)]
    let mean_x = (n_f - 1.0) / 2.0;
    #[allow(clippy::cast_precision_loss)]
    let mean_y = counts.iter().map(|&c| c as f64).sum::<f64>() / n_f;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for (i, &count) in counts.iter().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let dx = i as f64 - mean_x;
        #[allow(clippy::cast_precision_loss)]
        let dy = count as f64 - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }

    let slope = sxy / sxx;

    let df = n_f - 2.0;
    if df < 1.0 {
        // Two points determine a line exactly; no residual to test.
        return Some(TrendRegression {
            slope,
            p_value: None,
        });
    }

    let rss = (syy - slope * sxy).max(0.0);
    let se_squared = rss / df / sxx;
    if se_squared <= 0.0 {
        // Perfect fit: any nonzero slope is maximally significant.
        let p_value = if slope == 0.0 { None } else { Some(0.0) };
        return Some(TrendRegression { slope, p_value });
    }

    let t = slope / se_squared.sqrt();
    let p_value = StudentsT::new(0.0, 1.0, df)
        .ok()
        .map(|dist| (2.0 * dist.sf(t.abs())).clamp(0.0, 1.0));

    Some(TrendRegression { slope, p_value })
}
