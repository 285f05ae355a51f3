//! Plot selection interface.
//!
//! The driver decides *which* series deserve a plot and supplies the
//! series data; rendering belongs to an external collaborator behind
//! [`PlotSink`].

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::NaiveDate;
use hotspot_models::AnomalyWeek;
use regex::Regex;

use crate::PipelineError;

/// Everything a renderer needs for one comparative time-series plot.
#[derive(Debug, Clone)]
pub struct PlotRequest {
    /// H3 cell token of the localized series.
    pub cell: String,
    /// Secondary group value.
    pub group: String,
    /// The localized weekly series.
    pub series: BTreeMap<NaiveDate, u64>,
    /// Matching city-wide baseline series, when one was analyzed.
    pub city_wide: Option<BTreeMap<NaiveDate, u64>>,
    /// The significant anomaly weeks to highlight.
    pub anomalies: Vec<AnomalyWeek>,
}

/// Destination for generated plots.
pub trait PlotSink: Send + Sync {
    /// Saves one plot for the given job.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the sink cannot persist the plot.
    fn save_plot(
        &self,
        job_id: &str,
        filename: &str,
        request: &PlotRequest,
    ) -> Result<(), PipelineError>;
}

/// A sink that drops every plot. Used when plot generation is disabled
/// or no renderer is wired up.
pub struct NullPlotSink;

impl PlotSink for NullPlotSink {
    fn save_plot(
        &self,
        _job_id: &str,
        _filename: &str,
        _request: &PlotRequest,
    ) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Strips characters that are invalid in filenames from a group value.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| {
        Regex::new(r#"[\\/*?:"<>|]"#).unwrap_or_else(|_| unreachable!("static pattern"))
    });
    invalid.replace_all(name, "").into_owned()
}
