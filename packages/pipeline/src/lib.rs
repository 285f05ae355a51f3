#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Pipeline driver for the H3 anomaly stage.
//!
//! Drives aggregation across all configured sources, iterates every
//! distinct (cell, group) and city-wide (group) key through the
//! statistical kernel, streams each result to durable storage
//! incrementally, reports coarse progress to the external status
//! channel, and selects significant findings for plotting. The storage,
//! status, and plot backends are traits; local implementations live in
//! [`store`], [`status`], and [`plot`].

pub mod driver;
pub mod plot;
pub mod status;
pub mod store;

pub use driver::{STAGE_NAME, StageRunner};

/// Errors that mark a run as failed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Invalid configuration, rejected before any I/O.
    #[error("Configuration error: {0}")]
    Config(#[from] hotspot_models::ConfigError),

    /// Unrecoverable source fetch/decode failure.
    #[error("Source error: {0}")]
    Source(#[from] hotspot_source::SourceError),

    /// Aggregation store failure.
    #[error("{0}")]
    Aggregate(#[from] hotspot_aggregate::AggregateError),

    /// Statistical kernel failure.
    #[error("Stats error: {0}")]
    Stats(#[from] hotspot_stats::StatsError),

    /// Artifact or accumulator I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
