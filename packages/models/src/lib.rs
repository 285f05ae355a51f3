#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Shared configuration and result models for the hotspot analysis
//! pipeline.
//!
//! Everything that crosses a crate boundary lives here: the stage
//! configuration surface, the per-series analysis result types, and the
//! job status record pushed to the external status channel.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Errors raised while validating a [`StageConfig`] before any I/O runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No data sources were supplied.
    #[error("No data sources configured")]
    NoSources,

    /// A source is missing a required column mapping.
    #[error("Source '{url}' is missing required column mapping: {field}")]
    MissingColumn {
        /// Source URL or path.
        url: String,
        /// Name of the missing mapping field.
        field: &'static str,
    },

    /// A source delimiter that is not a single ASCII byte.
    #[error("Source '{url}' has a non-ASCII delimiter: {delimiter:?}")]
    NonAsciiDelimiter {
        /// Source URL or path.
        url: String,
        /// The rejected delimiter.
        delimiter: char,
    },

    /// H3 resolution outside the valid 0..=15 range.
    #[error("Invalid H3 resolution {0} (must be 0..=15)")]
    InvalidResolution(u8),

    /// An analysis window length of zero weeks.
    #[error("Analysis window lengths must be at least 1 week")]
    ZeroWindow,

    /// No trend windows configured.
    #[error("At least one trend window length is required")]
    NoTrendWindows,

    /// A p-value threshold outside (0, 1).
    #[error("p-value threshold {0} must be in (0, 1)")]
    InvalidPValue(f64),

    /// Chunk size of zero rows.
    #[error("chunksize must be at least 1 row")]
    ZeroChunkSize,
}

/// Column mapping and fetch settings for one tabular data source.
///
/// Each source declares its own column names; the aggregator renames them
/// to canonical internal names so sources with different schemas merge
/// into one analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    /// URL (`http(s)://`) or local path of the CSV file.
    pub url: String,
    /// Name of the event timestamp column.
    pub timestamp_col: String,
    /// Name of the latitude column.
    pub lat_col: String,
    /// Name of the longitude column.
    pub lon_col: String,
    /// Name of the secondary grouping column (e.g. offense category).
    pub group_col: String,
    /// Field delimiter (defaults to comma).
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Whether the file is gzip-compressed.
    #[serde(default)]
    pub gzip: bool,
}

const fn default_delimiter() -> char {
    ','
}

/// Which subset of significant findings gets a plot after the analysis
/// pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlotGeneration {
    /// Plot groups with a significant trend or a significant anomaly.
    #[default]
    Both,
    /// Plot only groups with a significant trend.
    Trends,
    /// Plot only groups with a significant anomaly week.
    Anomalies,
    /// Generate no plots.
    None,
}

/// Full configuration surface for the H3 anomaly stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Data sources to aggregate, each with its own column mapping.
    pub sources: Vec<SourceSpec>,
    /// H3 resolution for spatial bucketing (higher = smaller cells).
    #[serde(default = "default_h3_resolution")]
    pub h3_resolution: u8,
    /// Minimum summed events in a trend window for a regression to run.
    #[serde(default = "default_min_trend_events")]
    pub min_trend_events: u64,
    /// Optional inclusion filter column (matched against raw headers).
    #[serde(default)]
    pub filter_col: Option<String>,
    /// Allowed values for the filter column.
    #[serde(default)]
    pub filter_values: Vec<String>,
    /// Trend window lengths in weeks (one regression per length).
    #[serde(default = "default_trend_windows")]
    pub analysis_weeks_trend: Vec<u32>,
    /// Anomaly window length in weeks.
    #[serde(default = "default_anomaly_weeks")]
    pub analysis_weeks_anomaly: u32,
    /// Significance threshold for anomaly p-values (plot selection).
    #[serde(default = "default_p_value")]
    pub p_value_anomaly: f64,
    /// Significance threshold alpha for trend p-values.
    #[serde(default = "default_p_value")]
    pub p_value_trend: f64,
    /// Which significant findings get plots.
    #[serde(default)]
    pub plot_generation: PlotGeneration,
    /// Include the full weekly series in each result (can be large).
    #[serde(default)]
    pub save_full_series: bool,
    /// Maximum rows per chunk read from a source.
    #[serde(default = "default_chunksize")]
    pub chunksize: usize,
    /// Return the stored artifact verbatim if it already exists.
    #[serde(default)]
    pub skip_existing: bool,
}

const fn default_h3_resolution() -> u8 {
    8
}

const fn default_min_trend_events() -> u64 {
    4
}

fn default_trend_windows() -> Vec<u32> {
    vec![4]
}

const fn default_anomaly_weeks() -> u32 {
    4
}

const fn default_p_value() -> f64 {
    0.05
}

const fn default_chunksize() -> usize {
    50_000
}

impl StageConfig {
    /// Validates the configuration before any I/O runs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing sources, missing column
    /// mappings, or out-of-domain numeric settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        for source in &self.sources {
            for (field, value) in [
                ("timestamp_col", &source.timestamp_col),
                ("lat_col", &source.lat_col),
                ("lon_col", &source.lon_col),
                ("group_col", &source.group_col),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::MissingColumn {
                        url: source.url.clone(),
                        field,
                    });
                }
            }
            // The CSV layer takes a single-byte delimiter.
            if !source.delimiter.is_ascii() {
                return Err(ConfigError::NonAsciiDelimiter {
                    url: source.url.clone(),
                    delimiter: source.delimiter,
                });
            }
        }
        if self.h3_resolution > 15 {
            return Err(ConfigError::InvalidResolution(self.h3_resolution));
        }
        if self.analysis_weeks_trend.is_empty() {
            return Err(ConfigError::NoTrendWindows);
        }
        if self.analysis_weeks_anomaly == 0 || self.analysis_weeks_trend.contains(&0) {
            return Err(ConfigError::ZeroWindow);
        }
        for p in [self.p_value_anomaly, self.p_value_trend] {
            if !(p > 0.0 && p < 1.0) {
                return Err(ConfigError::InvalidPValue(p));
            }
        }
        if self.chunksize == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        Ok(())
    }

    /// The longest configured window in weeks. The historical baseline is
    /// everything at or before `as_of - max_window_weeks`.
    #[must_use]
    pub fn max_window_weeks(&self) -> u32 {
        self.analysis_weeks_trend
            .iter()
            .copied()
            .chain(std::iter::once(self.analysis_weeks_anomaly))
            .max()
            .unwrap_or(self.analysis_weeks_anomaly)
    }
}

/// Probability model selected for a series' historical weekly counts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
pub enum ModelChoice {
    /// Poisson chosen directly (variance <= mean).
    #[serde(rename = "Poisson")]
    #[strum(to_string = "Poisson")]
    Poisson,
    /// Clean Negative Binomial method-of-moments fit.
    #[serde(rename = "Negative Binomial")]
    #[strum(to_string = "Negative Binomial")]
    NegativeBinomial,
    /// Overdispersion detected but the NB parameters were degenerate, so
    /// the model fell back to Poisson. Tagged distinctly so reporting can
    /// tell an intended NB from a fallback.
    #[serde(rename = "Poisson (NB fallback)")]
    #[strum(to_string = "Poisson (NB fallback)")]
    PoissonFallback,
}

/// Anomaly statistics for one recent week of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyWeek {
    /// Week-ending date (Sunday).
    pub week: NaiveDate,
    /// Observed event count.
    pub count: u64,
    /// P(X >= count) under the fitted model; 1.0 when count is 0.
    pub anomaly_p_value: f64,
    /// (count - mean) / std_dev; 0 when std_dev is 0.
    pub z_score: f64,
}

/// Trend regression outcome for one trend window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendFinding {
    /// OLS slope of count vs. week index; `None` when not computed.
    pub slope: Option<f64>,
    /// Two-sided p-value of the slope; `None` when not computed.
    pub p_value: Option<f64>,
    /// Qualitative classification, e.g. "Significant Upward Trend".
    pub description: String,
}

/// Full analysis result for one (cell, group) or city-wide (group) series.
///
/// Written once to the result stream and never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesResult {
    /// H3 cell index as its canonical hex string; absent for city-wide
    /// results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h3_index: Option<String>,
    /// Latitude of the cell center.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    /// Longitude of the cell center.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// Secondary group value (e.g. offense category).
    pub group: String,
    /// Set to "City-Wide" on baseline results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_group_name: Option<String>,
    /// Model family the selector chose.
    pub model_used: ModelChoice,
    /// Historical weekly mean.
    pub historical_weekly_avg: f64,
    /// Historical weekly sample variance.
    pub historical_weekly_var: f64,
    /// Full densified weekly series; present only when
    /// `save_full_series` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_weekly_series: Option<BTreeMap<NaiveDate, u64>>,
    /// Per-week anomaly findings for the trailing anomaly window.
    pub anomaly_analysis: Vec<AnomalyWeek>,
    /// Trend findings keyed by window length, e.g. "4_weeks".
    pub trend_analysis: BTreeMap<String, TrendFinding>,
}

/// Top-level stage output artifact.
///
/// The driver streams this structure to storage one result at a time;
/// this type exists for reading artifacts back and for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    /// "success" for completed runs.
    pub status: String,
    /// Stage identifier.
    pub stage_name: String,
    /// Parameters the stage ran with.
    pub parameters: serde_json::Value,
    /// Localized (cell, group) results.
    pub results: Vec<SeriesResult>,
    /// City-wide baseline (group) results.
    pub city_wide_results: Vec<SeriesResult>,
}

/// Job progress record pushed to the external status channel.
///
/// Overwritten in place on every update, never accumulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// "processing", "completed", or "failed".
    pub status: String,
    /// Current pipeline state, e.g. "aggregating".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// Coarse percent complete, 0..=100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Free-text detail for the status endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_detail: Option<String>,
    /// Human-readable failure cause; set only on "failed".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobStatus {
    /// An in-flight status record.
    #[must_use]
    pub fn processing(stage: &str, progress: u8, detail: &str) -> Self {
        Self {
            status: "processing".to_owned(),
            current_stage: Some(stage.to_owned()),
            progress: Some(progress.min(100)),
            stage_detail: Some(detail.to_owned()),
            error_message: None,
        }
    }

    /// The terminal success record.
    #[must_use]
    pub fn completed() -> Self {
        Self {
            status: "completed".to_owned(),
            current_stage: None,
            progress: Some(100),
            stage_detail: None,
            error_message: None,
        }
    }

    /// The terminal failure record with the causal message attached.
    #[must_use]
    pub fn failed(message: &str) -> Self {
        Self {
            status: "failed".to_owned(),
            current_stage: None,
            progress: None,
            stage_detail: None,
            error_message: Some(message.to_owned()),
        }
    }
}
