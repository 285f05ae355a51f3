//! Per-series anomaly and trend analysis.
//!
//! Takes one aggregated weekly series, densifies it (zero-filling gap
//! weeks), applies the minimum-data gates, and computes anomaly
//! statistics for the trailing anomaly window plus one trend regression
//! per configured trend window. Series without enough signal are
//! excluded from output entirely; exclusion is not an error.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use hotspot_models::{AnomalyWeek, ModelChoice, TrendFinding};

use crate::model::FittedModel;
use crate::regression::linear_trend;
use crate::StatsError;

/// Minimum historical weeks beyond the largest window for a stable
/// baseline.
const MIN_BASELINE_WEEKS: usize = 4;

/// Analysis window configuration shared by every series in a run.
#[derive(Debug, Clone)]
pub struct AnalysisWindows {
    /// Trailing anomaly window length in weeks.
    pub anomaly_weeks: u32,
    /// Trend window lengths in weeks, one regression each.
    pub trend_weeks: Vec<u32>,
    /// Minimum summed events in a trend window for a regression to run.
    pub min_trend_events: u64,
    /// Significance threshold alpha for trend classification.
    pub trend_alpha: f64,
}

impl AnalysisWindows {
    /// The longest configured window; the historical baseline is
    /// everything at or before `as_of` minus this many weeks.
    #[must_use]
    pub fn max_window(&self) -> u32 {
        self.trend_weeks
            .iter()
            .copied()
            .chain(std::iter::once(self.anomaly_weeks))
            .max()
            .unwrap_or(self.anomaly_weeks)
    }
}

/// The statistical portion of one series result. The pipeline driver
/// attaches the spatial/group identity.
#[derive(Debug, Clone)]
pub struct SeriesAnalysis {
    /// Selected model family.
    pub model_used: ModelChoice,
    /// Historical weekly sample mean.
    pub historical_weekly_avg: f64,
    /// Historical weekly sample variance.
    pub historical_weekly_var: f64,
    /// Densified weekly series (always populated; serialization is the
    /// driver's choice).
    pub full_series: BTreeMap<NaiveDate, u64>,
    /// Per-week anomaly findings for the anomaly window.
    pub anomaly_analysis: Vec<AnomalyWeek>,
    /// Trend findings keyed by "<length>_weeks".
    pub trend_analysis: BTreeMap<String, TrendFinding>,
}

/// Analyzes one sparse weekly series against the global as-of date.
///
/// Returns `Ok(None)` when the series is excluded: fewer than
/// `max_window + 4` densified weeks, no buckets at or before the as-of
/// date, or an all-zero historical baseline.
///
/// # Errors
///
/// Returns [`StatsError`] only for model construction failures, which
/// indicate a bug rather than bad data.
pub fn analyze_series(
    sparse: &[(NaiveDate, u64)],
    as_of: NaiveDateTime,
    windows: &AnalysisWindows,
) -> Result<Option<SeriesAnalysis>, StatsError> {
    let as_of_date = as_of.date();

    let Some(dense) = densify(sparse, as_of_date) else {
        return Ok(None);
    };

    let max_window = windows.max_window();
    if dense.len() < max_window as usize + MIN_BASELINE_WEEKS {
        return Ok(None);
    }

    let historical_cutoff = as_of_date - Duration::weeks(i64::from(max_window));
    let historical: Vec<u64> = dense
        .iter()
        .filter(|(week, _)| *week <= historical_cutoff)
        .map(|&(_, count)| count)
        .collect();
    if historical.iter().sum::<u64>() == 0 {
        return Ok(None);
    }

    let model = FittedModel::fit(&historical)?;

    let anomaly_cutoff = as_of_date - Duration::weeks(i64::from(windows.anomaly_weeks));
    let anomaly_analysis: Vec<AnomalyWeek> = dense
        .iter()
        .filter(|(week, _)| *week > anomaly_cutoff)
        .map(|&(week, count)| AnomalyWeek {
            week,
            count,
            anomaly_p_value: model.survival(count),
            z_score: model.z_score(count),
        })
        .collect();

    let mut trend_analysis = BTreeMap::new();
    for &length in &windows.trend_weeks {
        let cutoff = as_of_date - Duration::weeks(i64::from(length));
        let counts: Vec<u64> = dense
            .iter()
            .filter(|(week, _)| *week > cutoff)
            .map(|&(_, count)| count)
            .collect();
        trend_analysis.insert(
            format!("{length}_weeks"),
            classify_trend(&counts, windows.min_trend_events, windows.trend_alpha),
        );
    }

    Ok(Some(SeriesAnalysis {
        model_used: model.choice(),
        historical_weekly_avg: model.historical_mean(),
        historical_weekly_var: model.historical_variance(),
        full_series: dense.into_iter().collect(),
        anomaly_analysis,
        trend_analysis,
    }))
}

/// Zero-fills gap weeks from the first bucket to the last bucket at or
/// before the as-of date. Returns `None` when no bucket qualifies.
fn densify(sparse: &[(NaiveDate, u64)], as_of_date: NaiveDate) -> Option<Vec<(NaiveDate, u64)>> {
    let bounded: BTreeMap<NaiveDate, u64> = sparse
        .iter()
        .filter(|(week, _)| *week <= as_of_date)
        .copied()
        .collect();
    let (&first, _) = bounded.first_key_value()?;
    let (&last, _) = bounded.last_key_value()?;

    let mut dense = Vec::new();
    let mut week = first;
    while week <= last {
        dense.push((week, bounded.get(&week).copied().unwrap_or(0)));
        week += Duration::weeks(1);
    }
    Some(dense)
}

fn classify_trend(counts: &[u64], min_trend_events: u64, alpha: f64) -> TrendFinding {
    if counts.len() < 2 || counts.iter().sum::<u64>() < min_trend_events {
        return TrendFinding {
            slope: None,
            p_value: None,
            description: "Not Enough Data".to_owned(),
        };
    }

    let Some(fit) = linear_trend(counts) else {
        return TrendFinding {
            slope: None,
            p_value: None,
            description: "Not Enough Data".to_owned(),
        };
    };

    let direction = if fit.slope > 0.0 { "Upward" } else { "Downward" };
    let description = match fit.p_value {
        Some(p) if p < alpha => format!("Significant {direction} Trend"),
        Some(p) if p < 2.0 * alpha => format!("Potential {direction} Trend"),
        Some(_) => "Not Significant".to_owned(),
        None => "Not Significant".to_owned(),
    };

    TrendFinding {
        slope: Some(fit.slope),
        p_value: fit.p_value,
        description,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sundays(start: (i32, u32, u32), counts: &[u64]) -> Vec<(NaiveDate, u64)> {
        let first = NaiveDate::from_ymd_opt(start.0, start.1, start.2).unwrap();
        counts
            .iter()
            .enumerate()
            .map(|(i, &c)| (first + Duration::weeks(i64::try_from(i).unwrap()), c))
            .collect()
    }

    fn windows() -> AnalysisWindows {
        AnalysisWindows {
            anomaly_weeks: 1,
            trend_weeks: vec![4],
            min_trend_events: 4,
            trend_alpha: 0.05,
        }
    }

    fn as_of_from(series: &[(NaiveDate, u64)]) -> NaiveDateTime {
        series.last().unwrap().0.and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn spike_after_stable_history_is_a_strong_anomaly() {
        // 2024-01-07 is a Sunday; 8 weeks, last one spikes.
        let series = sundays((2024, 1, 7), &[5, 5, 5, 5, 5, 5, 5, 50]);
        let analysis = analyze_series(&series, as_of_from(&series), &windows())
            .unwrap()
            .unwrap();

        assert_eq!(analysis.model_used, ModelChoice::Poisson);
        assert!((analysis.historical_weekly_avg - 5.0).abs() < 1e-12);
        assert!(analysis.historical_weekly_var.abs() < 1e-12);

        assert_eq!(analysis.anomaly_analysis.len(), 1);
        let spike = &analysis.anomaly_analysis[0];
        assert_eq!(spike.count, 50);
        assert!(spike.anomaly_p_value < 1e-20);
        assert!(spike.z_score > 10.0);

        let trend = &analysis.trend_analysis["4_weeks"];
        assert!(trend.slope.unwrap() > 0.0);
    }

    #[test]
    fn minimum_data_gate_is_exact() {
        // max window 4 => requires 8 weeks; 7 is excluded, 8 included.
        let seven = sundays((2024, 1, 7), &[5, 5, 5, 5, 5, 5, 5]);
        assert!(analyze_series(&seven, as_of_from(&seven), &windows())
            .unwrap()
            .is_none());

        let eight = sundays((2024, 1, 7), &[5, 5, 5, 5, 5, 5, 5, 5]);
        assert!(analyze_series(&eight, as_of_from(&eight), &windows())
            .unwrap()
            .is_some());
    }

    #[test]
    fn zero_history_is_excluded() {
        let series = sundays((2024, 1, 7), &[0, 0, 0, 0, 3, 4, 5, 6]);
        assert!(analyze_series(&series, as_of_from(&series), &windows())
            .unwrap()
            .is_none());
    }

    #[test]
    fn gap_weeks_are_zero_filled() {
        let first = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        // Buckets at weeks 0..=6 and 9; weeks 7 and 8 are gaps.
        let mut series: Vec<(NaiveDate, u64)> = (0..7)
            .map(|i| (first + Duration::weeks(i), 5))
            .collect();
        series.push((first + Duration::weeks(9), 2));

        let analysis = analyze_series(&series, as_of_from(&series), &windows())
            .unwrap()
            .unwrap();
        assert_eq!(analysis.full_series.len(), 10);
        assert_eq!(analysis.full_series[&(first + Duration::weeks(7))], 0);
        assert_eq!(analysis.full_series[&(first + Duration::weeks(8))], 0);
        // The gap weeks participate in the trend window as zeros.
        let trend = &analysis.trend_analysis["4_weeks"];
        assert!(trend.slope.unwrap() < 0.0);
        assert_eq!(trend.description, "Not Significant");
    }

    #[test]
    fn buckets_after_the_as_of_date_are_ignored() {
        let series = sundays((2024, 1, 7), &[5, 5, 5, 5, 5, 5, 5, 5, 99]);
        // As-of pinned to week 8, so the trailing 99 is out of scope.
        let as_of = series[7].0.and_hms_opt(12, 0, 0).unwrap();
        let analysis = analyze_series(&series, as_of, &windows()).unwrap().unwrap();
        assert_eq!(analysis.full_series.len(), 8);
        assert_eq!(analysis.anomaly_analysis.last().unwrap().count, 5);
    }

    #[test]
    fn zero_count_weeks_are_never_anomalous() {
        let series = sundays((2024, 1, 7), &[5, 5, 5, 5, 5, 5, 5, 0]);
        let analysis = analyze_series(&series, as_of_from(&series), &windows())
            .unwrap()
            .unwrap();
        let last = analysis.anomaly_analysis.last().unwrap();
        assert_eq!(last.count, 0);
        assert!((last.anomaly_p_value - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn trend_below_minimum_events_is_not_enough_data() {
        let mut config = windows();
        config.min_trend_events = 10;
        let series = sundays((2024, 1, 7), &[5, 5, 5, 5, 1, 1, 1, 1]);
        let analysis = analyze_series(&series, as_of_from(&series), &config)
            .unwrap()
            .unwrap();
        let trend = &analysis.trend_analysis["4_weeks"];
        assert_eq!(trend.description, "Not Enough Data");
        assert!(trend.slope.is_none());
        assert!(trend.p_value.is_none());
    }

    #[test]
    fn multiple_trend_windows_produce_one_finding_each() {
        let mut config = windows();
        config.trend_weeks = vec![4, 8];
        let series = sundays(
            (2024, 1, 7),
            &[5, 5, 5, 5, 5, 6, 7, 8, 9, 10, 11, 12],
        );
        let analysis = analyze_series(&series, as_of_from(&series), &config)
            .unwrap()
            .unwrap();
        assert_eq!(analysis.trend_analysis.len(), 2);
        assert!(analysis.trend_analysis.contains_key("4_weeks"));
        let eight = &analysis.trend_analysis["8_weeks"];
        assert!(eight.slope.unwrap() > 0.0);
        assert_eq!(eight.description, "Significant Upward Trend");
    }

    #[test]
    fn low_single_counts_still_get_raw_statistics() {
        // Historical average below 1 with single-count recent weeks:
        // detection emits the raw p-value/z-score; filtering such noise
        // is a reporting concern, not a detection concern.
        let mut config = windows();
        config.anomaly_weeks = 4;
        config.min_trend_events = 1;
        let series = sundays((2024, 1, 7), &[1, 0, 0, 1, 1, 1, 1, 1]);
        let analysis = analyze_series(&series, as_of_from(&series), &config)
            .unwrap()
            .unwrap();
        assert_eq!(analysis.anomaly_analysis.len(), 4);
        for week in &analysis.anomaly_analysis {
            assert_eq!(week.count, 1);
            assert!(week.anomaly_p_value > 0.0 && week.anomaly_p_value < 1.0);
        }
    }
}
