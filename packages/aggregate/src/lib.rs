#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Disk-backed weekly count aggregation.
//!
//! Converts heterogeneous per-source row chunks into an immutable
//! aggregate count table keyed by (H3 cell, group, week-ending Sunday)
//! plus a city-wide (group, week) baseline, without ever holding more
//! than one chunk of rows in memory.
//!
//! Each chunk is partially grouped in memory and the partial sums are
//! appended to a `DuckDB` staging table. A final consolidation pass sums
//! duplicate keys into the `weekly_counts` table, so the count for a key
//! is exact regardless of how rows were split across chunks or sources.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use hotspot_models::SourceSpec;
use hotspot_source::RowChunk;
use hotspot_source::parsing::{parse_coordinates, parse_timestamp, week_ending};
use hotspot_spatial::{CellId, SpatialIndexer};

const WEEK_FORMAT: &str = "%Y-%m-%d";

/// Errors from the aggregation store.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// `DuckDB` failure in the accumulation store.
    #[error("Aggregate store error: {0}")]
    Db(#[from] duckdb::Error),

    /// Spatial indexing failure (invalid resolution).
    #[error("Spatial error: {0}")]
    Spatial(#[from] hotspot_spatial::SpatialError),

    /// A stored week string that does not parse back to a date.
    #[error("Corrupt week key in aggregate table: {0}")]
    CorruptWeek(String),
}

/// Outcome of absorbing one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// The whole chunk was skipped (missing required column).
    pub skipped: bool,
    /// Rows that contributed to an aggregate bucket.
    pub rows_kept: u64,
    /// Rows dropped for an unparsable timestamp or bad coordinates.
    pub rows_dropped: u64,
    /// Rows removed by the inclusion filter.
    pub rows_filtered: u64,
}

/// Identifies one localized series in the aggregate table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeriesKey {
    /// The spatial cell.
    pub cell: CellId,
    /// The secondary group value.
    pub group: String,
}

/// Accumulates weekly partial sums into a disk-backed staging table.
///
/// Owned exclusively during the aggregation phase; [`Self::finish`]
/// consolidates and hands the table off read-only for analysis.
pub struct WeeklyAccumulator {
    conn: duckdb::Connection,
    path: PathBuf,
    indexer: SpatialIndexer,
    filter: Option<(String, BTreeSet<String>)>,
    as_of: Option<NaiveDateTime>,
    rows_kept: u64,
}

impl WeeklyAccumulator {
    /// Opens (or recreates) the accumulation store at `path`.
    ///
    /// `filter_col`/`filter_values` configure the optional inclusion
    /// filter applied to every source.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] if the store cannot be created or the
    /// H3 resolution is invalid.
    pub fn open(
        path: &Path,
        h3_resolution: u8,
        filter_col: Option<&str>,
        filter_values: &[String],
    ) -> Result<Self, AggregateError> {
        let indexer = SpatialIndexer::new(h3_resolution)?;

        if path.exists() {
            // Stale accumulator from an aborted run; start fresh.
            std::fs::remove_file(path).ok();
        }
        let conn = duckdb::Connection::open(path)?;
        conn.execute_batch(
            "SET threads = 4;
             SET memory_limit = '512MB';

             CREATE TABLE weekly_staging (
                 cell BIGINT,
                 grp VARCHAR NOT NULL,
                 week VARCHAR NOT NULL,
                 cnt BIGINT NOT NULL
             );",
        )?;

        let filter = filter_col.filter(|_| !filter_values.is_empty()).map(|col| {
            (
                col.trim().to_owned(),
                filter_values.iter().cloned().collect::<BTreeSet<String>>(),
            )
        });

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            indexer,
            filter,
            as_of: None,
            rows_kept: 0,
        })
    }

    /// Validates, buckets, and accumulates one chunk of rows.
    ///
    /// A chunk missing a required column is skipped with a warning and
    /// reported via [`ChunkOutcome::skipped`]; individual bad rows are
    /// dropped and counted. Only store failures are errors.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Db`] if appending partial sums fails.
    pub fn absorb_chunk(
        &mut self,
        spec: &SourceSpec,
        chunk: &RowChunk,
    ) -> Result<ChunkOutcome, AggregateError> {
        let Some(columns) = self.resolve_columns(spec, chunk) else {
            return Ok(ChunkOutcome {
                skipped: true,
                ..ChunkOutcome::default()
            });
        };

        let mut outcome = ChunkOutcome::default();
        let mut localized: BTreeMap<(u64, &str, NaiveDate), i64> = BTreeMap::new();
        let mut city_wide: BTreeMap<(&str, NaiveDate), i64> = BTreeMap::new();

        for row in &chunk.rows {
            if let Some((filter_idx, allowed)) = columns.filter.as_ref()
                && !allowed.contains(row.get(*filter_idx).unwrap_or("").trim())
            {
                outcome.rows_filtered += 1;
                continue;
            }

            let Some(timestamp) = row.get(columns.timestamp).and_then(parse_timestamp) else {
                outcome.rows_dropped += 1;
                continue;
            };
            let Some((lat, lon)) = parse_coordinates(
                row.get(columns.lat).unwrap_or(""),
                row.get(columns.lon).unwrap_or(""),
            ) else {
                outcome.rows_dropped += 1;
                continue;
            };
            // Range was validated above, so this cannot fail for finite input.
            let Ok(cell) = self.indexer.cell_of(lat, lon) else {
                outcome.rows_dropped += 1;
                continue;
            };

            let group = row.get(columns.group).unwrap_or("").trim();
            let week = week_ending(timestamp.date());

            self.as_of = Some(self.as_of.map_or(timestamp, |prev| prev.max(timestamp)));
            *localized.entry((cell.to_raw(), group, week)).or_insert(0) += 1;
            *city_wide.entry((group, week)).or_insert(0) += 1;
            outcome.rows_kept += 1;
        }

        self.append_partials(&localized, &city_wide)?;
        self.rows_kept += outcome.rows_kept;

        log::debug!(
            "[{}] chunk absorbed: {} kept, {} dropped, {} filtered",
            spec.url,
            outcome.rows_kept,
            outcome.rows_dropped,
            outcome.rows_filtered
        );
        Ok(outcome)
    }

    /// Consolidates staged partial sums into the immutable aggregate
    /// table and hands it off read-only.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Db`] if the consolidation pass fails.
    pub fn finish(self) -> Result<AggregateTable, AggregateError> {
        self.conn.execute_batch(
            "CREATE TABLE weekly_counts AS
             SELECT cell, grp, week, CAST(SUM(cnt) AS BIGINT) AS cnt
             FROM weekly_staging
             GROUP BY cell, grp, week;

             DROP TABLE weekly_staging;

             CREATE INDEX idx_weekly_counts_key ON weekly_counts (cell, grp);",
        )?;

        log::info!(
            "Aggregation consolidated: {} qualifying rows, as-of {:?}",
            self.rows_kept,
            self.as_of
        );

        Ok(AggregateTable {
            conn: self.conn,
            path: self.path,
            as_of: self.as_of,
        })
    }

    fn resolve_columns(&self, spec: &SourceSpec, chunk: &RowChunk) -> Option<Columns> {
        let mut missing = Vec::new();
        let mut lookup = |name: &str| {
            chunk.column(name).or_else(|| {
                missing.push(name.to_owned());
                None
            })
        };

        let timestamp = lookup(&spec.timestamp_col);
        let lat = lookup(&spec.lat_col);
        let lon = lookup(&spec.lon_col);
        let group = lookup(&spec.group_col);
        let filter = self
            .filter
            .as_ref()
            .map(|(col, allowed)| lookup(col).map(|idx| (idx, allowed.clone())));

        if !missing.is_empty() {
            log::warn!(
                "[{}] skipping chunk: missing required column(s) {}",
                spec.url,
                missing.join(", ")
            );
            return None;
        }

        Some(Columns {
            timestamp: timestamp?,
            lat: lat?,
            lon: lon?,
            group: group?,
            filter: filter.flatten(),
        })
    }

    fn append_partials(
        &mut self,
        localized: &BTreeMap<(u64, &str, NaiveDate), i64>,
        city_wide: &BTreeMap<(&str, NaiveDate), i64>,
    ) -> Result<(), AggregateError> {
        if localized.is_empty() && city_wide.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO weekly_staging (cell, grp, week, cnt) VALUES (?, ?, ?, ?)",
            )?;

            for ((cell, group, week), count) in localized {
                #[allow(clippy::cast_possible_wrap)]
                let cell_bits = *cell as i64;
                stmt.execute(duckdb::params![
                    cell_bits,
                    group,
                    week.format(WEEK_FORMAT).to_string(),
                    count
                ])?;
            }
            for ((group, week), count) in city_wide {
                stmt.execute(duckdb::params![
                    None::<i64>,
                    group,
                    week.format(WEEK_FORMAT).to_string(),
                    count
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

struct Columns {
    timestamp: usize,
    lat: usize,
    lon: usize,
    group: usize,
    filter: Option<(usize, BTreeSet<String>)>,
}

/// The consolidated, read-only aggregate count table.
pub struct AggregateTable {
    conn: duckdb::Connection,
    path: PathBuf,
    as_of: Option<NaiveDateTime>,
}

impl AggregateTable {
    /// The latest observed event time across all sources, or `None` if
    /// no qualifying rows were seen.
    #[must_use]
    pub const fn as_of(&self) -> Option<NaiveDateTime> {
        self.as_of
    }

    /// Whether any qualifying rows were aggregated.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.as_of.is_none()
    }

    /// All distinct localized (cell, group) keys.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] on query failure or a corrupt cell.
    pub fn localized_keys(&self) -> Result<Vec<SeriesKey>, AggregateError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT cell, grp FROM weekly_counts
             WHERE cell IS NOT NULL ORDER BY cell, grp",
        )?;
        let mut rows = stmt.query([])?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next()? {
            let cell_bits: i64 = row.get(0)?;
            let group: String = row.get(1)?;
            #[allow(clippy::cast_sign_loss)]
            let cell = CellId::from_raw(cell_bits as u64)?;
            keys.push(SeriesKey { cell, group });
        }
        Ok(keys)
    }

    /// All distinct city-wide group keys.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] on query failure.
    pub fn city_wide_keys(&self) -> Result<Vec<String>, AggregateError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT grp FROM weekly_counts WHERE cell IS NULL ORDER BY grp",
        )?;
        let mut rows = stmt.query([])?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next()? {
            keys.push(row.get::<_, String>(0)?);
        }
        Ok(keys)
    }

    /// The sparse weekly series for one key, ordered by week. Pass
    /// `None` for the city-wide baseline of `group`.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] on query failure or a corrupt week.
    pub fn series(
        &self,
        cell: Option<CellId>,
        group: &str,
    ) -> Result<Vec<(NaiveDate, u64)>, AggregateError> {
        let mut series = Vec::new();

        let collect = |rows: &mut duckdb::Rows<'_>,
                       out: &mut Vec<(NaiveDate, u64)>|
         -> Result<(), AggregateError> {
            while let Some(row) = rows.next()? {
                let week_raw: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                let week = NaiveDate::parse_from_str(&week_raw, WEEK_FORMAT)
                    .map_err(|_| AggregateError::CorruptWeek(week_raw.clone()))?;
                out.push((week, count.max(0).unsigned_abs()));
            }
            Ok(())
        };

        if let Some(cell) = cell {
            #[allow(clippy::cast_possible_wrap)]
            let cell_bits = cell.to_raw() as i64;
            let mut stmt = self.conn.prepare(
                "SELECT week, cnt FROM weekly_counts
                 WHERE cell = ? AND grp = ? ORDER BY week",
            )?;
            let mut rows = stmt.query(duckdb::params![cell_bits, group])?;
            collect(&mut rows, &mut series)?;
        } else {
            let mut stmt = self.conn.prepare(
                "SELECT week, cnt FROM weekly_counts
                 WHERE cell IS NULL AND grp = ? ORDER BY week",
            )?;
            let mut rows = stmt.query(duckdb::params![group])?;
            collect(&mut rows, &mut series)?;
        }

        Ok(series)
    }

    /// Deletes the backing store file. The table is an intermediate, not
    /// a deliverable; callers drop it once analysis completes.
    pub fn discard(self) {
        let path = self.path.clone();
        drop(self.conn);
        if let Err(e) = std::fs::remove_file(&path) {
            log::warn!("Failed to remove aggregate store {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn spec() -> SourceSpec {
        SourceSpec {
            url: "test.csv".to_owned(),
            timestamp_col: "date".to_owned(),
            lat_col: "lat".to_owned(),
            lon_col: "lon".to_owned(),
            group_col: "category".to_owned(),
            delimiter: ',',
            gzip: false,
        }
    }

    fn chunk_of(rows: &[[&str; 4]]) -> RowChunk {
        let headers = Arc::new(vec![
            "date".to_owned(),
            "lat".to_owned(),
            "lon".to_owned(),
            "category".to_owned(),
        ]);
        RowChunk {
            headers,
            rows: rows
                .iter()
                .map(|r| csv::StringRecord::from(r.to_vec()))
                .collect(),
        }
    }

    fn temp_store(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("hotspot_aggregate_tests");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("{name}.duckdb"))
    }

    fn open(name: &str) -> WeeklyAccumulator {
        WeeklyAccumulator::open(&temp_store(name), 8, None, &[]).unwrap()
    }

    const ROWS: &[[&str; 4]] = &[
        ["2024-01-03 10:00:00", "41.8781", "-87.6298", "THEFT"],
        ["2024-01-04 11:00:00", "41.8781", "-87.6298", "THEFT"],
        ["2024-01-10 09:00:00", "41.8781", "-87.6298", "THEFT"],
        ["2024-01-03 12:00:00", "41.8781", "-87.6298", "ASSAULT"],
        ["2024-01-03 13:00:00", "38.9072", "-77.0369", "THEFT"],
    ];

    fn dump(table: &AggregateTable) -> Vec<(Option<String>, String, NaiveDate, u64)> {
        let mut out = Vec::new();
        for group in table.city_wide_keys().unwrap() {
            for (week, count) in table.series(None, &group).unwrap() {
                out.push((None, group.clone(), week, count));
            }
        }
        for key in table.localized_keys().unwrap() {
            for (week, count) in table.series(Some(key.cell), &key.group).unwrap() {
                out.push((Some(key.cell.to_string()), key.group.clone(), week, count));
            }
        }
        out.sort();
        out
    }

    #[test]
    fn aggregation_is_associative_across_chunk_boundaries() {
        let mut one = open("assoc_single");
        one.absorb_chunk(&spec(), &chunk_of(ROWS)).unwrap();
        let whole = one.finish().unwrap();

        let mut many = open("assoc_split");
        for row in ROWS {
            many.absorb_chunk(&spec(), &chunk_of(&[*row])).unwrap();
        }
        let split = many.finish().unwrap();

        assert_eq!(dump(&whole), dump(&split));
        assert_eq!(whole.as_of(), split.as_of());
        whole.discard();
        split.discard();
    }

    #[test]
    fn counts_bucket_by_cell_group_and_week() {
        let mut acc = open("buckets");
        acc.absorb_chunk(&spec(), &chunk_of(ROWS)).unwrap();
        let table = acc.finish().unwrap();

        // Chicago THEFT: two events in week ending 2024-01-07, one in
        // week ending 2024-01-14.
        let keys = table.localized_keys().unwrap();
        let chicago_theft = keys
            .iter()
            .find(|k| k.group == "THEFT" && k.cell.center().0 > 41.0 && k.cell.center().0 < 42.0)
            .unwrap();
        let series = table.series(Some(chicago_theft.cell), "THEFT").unwrap();
        assert_eq!(
            series,
            vec![
                (NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(), 2),
                (NaiveDate::from_ymd_opt(2024, 1, 14).unwrap(), 1),
            ]
        );

        // City-wide THEFT ignores the cell: 3 + 1 across both cities.
        let city = table.series(None, "THEFT").unwrap();
        assert_eq!(
            city,
            vec![
                (NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(), 3),
                (NaiveDate::from_ymd_opt(2024, 1, 14).unwrap(), 1),
            ]
        );
        table.discard();
    }

    #[test]
    fn invalid_rows_never_contribute() {
        let mut acc = open("invalid_rows");
        let outcome = acc
            .absorb_chunk(
                &spec(),
                &chunk_of(&[
                    ["2024-01-03", "41.8781", "-87.6298", "THEFT"],
                    ["2024-01-03", "0", "0", "THEFT"],
                    ["2024-01-03", "-1", "-1", "THEFT"],
                    ["2024-01-03", "95.0", "-87.6298", "THEFT"],
                    ["2024-01-03", "41.8781", "-200.0", "THEFT"],
                    ["not-a-date", "41.8781", "-87.6298", "THEFT"],
                    ["2024-01-03", "", "-87.6298", "THEFT"],
                ]),
            )
            .unwrap();
        assert_eq!(outcome.rows_kept, 1);
        assert_eq!(outcome.rows_dropped, 6);

        let table = acc.finish().unwrap();
        assert_eq!(table.series(None, "THEFT").unwrap(), vec![(
            NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(),
            1
        )]);
        table.discard();
    }

    #[test]
    fn chunk_with_missing_column_is_skipped() {
        let mut acc = open("missing_col");
        let headers = Arc::new(vec![
            "when".to_owned(),
            "lat".to_owned(),
            "lon".to_owned(),
            "category".to_owned(),
        ]);
        let chunk = RowChunk {
            headers,
            rows: vec![csv::StringRecord::from(vec![
                "2024-01-03",
                "41.8781",
                "-87.6298",
                "THEFT",
            ])],
        };
        let outcome = acc.absorb_chunk(&spec(), &chunk).unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.rows_kept, 0);

        let table = acc.finish().unwrap();
        assert!(table.is_empty());
        table.discard();
    }

    #[test]
    fn inclusion_filter_keeps_only_allowed_values() {
        let path = temp_store("filtered");
        let mut acc = WeeklyAccumulator::open(
            &path,
            8,
            Some("category"),
            &["THEFT".to_owned()],
        )
        .unwrap();
        let outcome = acc.absorb_chunk(&spec(), &chunk_of(ROWS)).unwrap();
        assert_eq!(outcome.rows_filtered, 1);
        assert_eq!(outcome.rows_kept, 4);

        let table = acc.finish().unwrap();
        assert!(table.series(None, "ASSAULT").unwrap().is_empty());
        table.discard();
    }

    #[test]
    fn as_of_is_the_running_max_across_chunks() {
        let mut acc = open("as_of");
        acc.absorb_chunk(
            &spec(),
            &chunk_of(&[["2024-02-01 12:00:00", "41.8781", "-87.6298", "THEFT"]]),
        )
        .unwrap();
        acc.absorb_chunk(
            &spec(),
            &chunk_of(&[["2024-01-15 08:00:00", "41.8781", "-87.6298", "THEFT"]]),
        )
        .unwrap();
        let table = acc.finish().unwrap();
        assert_eq!(
            table.as_of().unwrap().to_string(),
            "2024-02-01 12:00:00"
        );
        table.discard();
    }
}
