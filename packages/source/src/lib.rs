#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Chunked CSV source reading and row parsing.
//!
//! Sources are read one bounded chunk at a time so arbitrarily large
//! files never require more than one chunk of rows in memory. Row-level
//! validation (timestamps, coordinates) lives in [`parsing`]; the chunk
//! reader itself only streams records.

pub mod chunk;
pub mod parsing;

pub use chunk::{CsvChunkReader, RowChunk};

/// Errors from source fetching and CSV decoding.
///
/// All of these are unrecoverable I/O/format failures: a chunk error from
/// the CSV layer aborts the run, unlike per-row data problems which are
/// dropped locally.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// HTTP fetch failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local file I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV decoding failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
