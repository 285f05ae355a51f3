#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Statistical kernel for the hotspot analysis pipeline.
//!
//! [`model`] selects and fits a per-series count distribution (Poisson
//! vs. Negative Binomial via an overdispersion test), [`regression`]
//! provides the OLS trend fit, and [`analyzer`] applies both to one
//! aggregated weekly series with the configured analysis windows.

pub mod analyzer;
pub mod model;
pub mod regression;

pub use analyzer::{AnalysisWindows, SeriesAnalysis, analyze_series};
pub use model::FittedModel;

/// Errors from model fitting.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    /// Fit requested on a series whose historical counts sum to zero.
    /// Callers must exclude such series instead of fitting.
    #[error("Cannot fit a count model to an all-zero history")]
    EmptyHistory,

    /// Distribution construction failure from the underlying library.
    #[error("Distribution error: {0}")]
    Distribution(#[from] statrs::StatsError),
}
