#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! H3 spatial cell indexing.
//!
//! Maps (latitude, longitude, resolution) triples to discrete H3 cell
//! identifiers and back to representative cell centers. The mapping is
//! deterministic and total over valid coordinates; the resolution is a
//! configuration input that trades cell count against spatial precision.

use std::fmt;
use std::str::FromStr;

use h3o::{CellIndex, LatLng, Resolution};

/// Errors from spatial cell computation.
#[derive(Debug, thiserror::Error)]
pub enum SpatialError {
    /// Resolution outside the H3 0..=15 range.
    #[error("Invalid H3 resolution: {0}")]
    InvalidResolution(u8),

    /// Latitude/longitude outside the valid domain.
    #[error("Invalid coordinate: ({lat}, {lon})")]
    InvalidCoordinate {
        /// Latitude in degrees.
        lat: f64,
        /// Longitude in degrees.
        lon: f64,
    },

    /// A cell token that is not a valid H3 index.
    #[error("Invalid H3 cell token: {0}")]
    InvalidCell(String),
}

/// A discrete H3 spatial cell identifier.
///
/// Stable under repeated computation for the same input; displays as the
/// canonical 15-character hex token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(CellIndex);

impl CellId {
    /// The representative center coordinate of the cell as `(lat, lon)`.
    ///
    /// This is the inverse representative point, not a round-trip of the
    /// original coordinate.
    #[must_use]
    pub fn center(self) -> (f64, f64) {
        let center = LatLng::from(self.0);
        (center.lat(), center.lng())
    }

    /// The raw 64-bit H3 index (for compact storage).
    #[must_use]
    pub fn to_raw(self) -> u64 {
        self.0.into()
    }

    /// Reconstructs a cell from its raw 64-bit index.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidCell`] if the bits are not a valid
    /// H3 cell index.
    pub fn from_raw(raw: u64) -> Result<Self, SpatialError> {
        CellIndex::try_from(raw)
            .map(Self)
            .map_err(|_| SpatialError::InvalidCell(format!("{raw:#x}")))
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CellId {
    type Err = SpatialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CellIndex::from_str(s)
            .map(Self)
            .map_err(|_| SpatialError::InvalidCell(s.to_owned()))
    }
}

/// Assigns coordinates to H3 cells at a fixed resolution.
#[derive(Debug, Clone, Copy)]
pub struct SpatialIndexer {
    resolution: Resolution,
}

impl SpatialIndexer {
    /// Creates an indexer at the given H3 resolution.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidResolution`] for resolutions
    /// outside 0..=15.
    pub fn new(resolution: u8) -> Result<Self, SpatialError> {
        let resolution = Resolution::try_from(resolution)
            .map_err(|_| SpatialError::InvalidResolution(resolution))?;
        Ok(Self { resolution })
    }

    /// The configured resolution.
    #[must_use]
    pub const fn resolution(&self) -> u8 {
        self.resolution as u8
    }

    /// Maps a coordinate to its H3 cell.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidCoordinate`] for coordinates
    /// outside `[-90, 90]` / `[-180, 180]` or non-finite values.
    pub fn cell_of(&self, lat: f64, lon: f64) -> Result<CellId, SpatialError> {
        // h3o accepts any finite degrees and wraps them; out-of-range
        // input here is always bad data, so reject it instead.
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(SpatialError::InvalidCoordinate { lat, lon });
        }
        let coord =
            LatLng::new(lat, lon).map_err(|_| SpatialError::InvalidCoordinate { lat, lon })?;
        Ok(CellId(coord.to_cell(self.resolution)))
    }
}
