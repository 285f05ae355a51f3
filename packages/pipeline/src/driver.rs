//! The H3 anomaly stage driver.
//!
//! Single-run state machine: initializing -> aggregating (per-source)
//! -> analyzing (per-group) -> generating plots -> complete, with any
//! unrecoverable error transitioning to failed and the message pushed
//! to the status channel. Localized results stream to the artifact
//! writer one self-contained JSON object at a time, so peak memory is
//! bounded by one chunk of rows plus one series even when group
//! cardinality is large.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use hotspot_aggregate::{AggregateTable, WeeklyAccumulator};
use hotspot_models::{AnomalyWeek, JobStatus, PlotGeneration, SeriesResult, StageConfig};
use hotspot_source::CsvChunkReader;
use hotspot_spatial::CellId;
use hotspot_stats::{AnalysisWindows, SeriesAnalysis, analyze_series};

use crate::PipelineError;
use crate::plot::{PlotRequest, PlotSink, sanitize_filename};
use crate::status::StatusSink;
use crate::store::ArtifactStore;

/// Stage identifier; also names the result artifact (`h3_anomaly.json`).
pub const STAGE_NAME: &str = "h3_anomaly";

/// Progress is reported at most this often by group count...
const PROGRESS_GROUP_INTERVAL: usize = 250;
/// ...or this often by wall clock, whichever first.
const PROGRESS_TIME_INTERVAL: Duration = Duration::from_secs(2);

/// Runs the H3 anomaly stage for one job.
pub struct StageRunner<'a> {
    job_id: &'a str,
    config: &'a StageConfig,
    store: &'a dyn ArtifactStore,
    plots: &'a dyn PlotSink,
    status: &'a dyn StatusSink,
    work_dir: PathBuf,
}

struct PlotCandidate {
    cell: CellId,
    group: String,
    series: BTreeMap<NaiveDate, u64>,
    anomalies: Vec<AnomalyWeek>,
}

impl<'a> StageRunner<'a> {
    /// Creates a runner. `work_dir` holds the job's disk-backed
    /// aggregation store and must be job-isolated.
    pub fn new(
        job_id: &'a str,
        config: &'a StageConfig,
        store: &'a dyn ArtifactStore,
        plots: &'a dyn PlotSink,
        status: &'a dyn StatusSink,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            job_id,
            config,
            store,
            plots,
            status,
            work_dir: work_dir.into(),
        }
    }

    /// Runs the stage and returns the stored result artifact.
    ///
    /// With `skip_existing` set and a prior artifact present, returns
    /// that artifact verbatim without recomputation. On failure the job
    /// status transitions to "failed" with the causal message; partial
    /// artifacts are never visible under the final name, but results
    /// already committed by a previous run stay in place.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] for configuration errors, source I/O
    /// failures, aggregation store failures, or artifact write failures.
    pub fn run(&self) -> Result<serde_json::Value, PipelineError> {
        match self.run_inner() {
            Ok(value) => {
                self.push_status(&JobStatus::completed());
                Ok(value)
            }
            Err(e) => {
                log::error!("[{}] {STAGE_NAME} failed: {e}", self.job_id);
                self.push_status(&JobStatus::failed(&e.to_string()));
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn run_inner(&self) -> Result<serde_json::Value, PipelineError> {
        self.config.validate()?;
        let artifact_name = format!("{STAGE_NAME}.json");

        if self.config.skip_existing && self.store.exists(self.job_id, &artifact_name)? {
            log::info!(
                "[{}] Skipping {STAGE_NAME}: output already exists",
                self.job_id
            );
            return self.store.read(self.job_id, &artifact_name);
        }

        self.push_status(&JobStatus::processing("initializing", 0, "Starting job"));
        let parameters = serde_json::to_value(self.config)?;

        let table = self.aggregate()?;

        let Some(as_of) = table.as_of() else {
            log::info!("[{}] No qualifying rows; writing empty result", self.job_id);
            let value = self.write_empty(&artifact_name, &parameters)?;
            table.discard();
            return Ok(value);
        };
        log::info!("[{}] Analysis as-of date: {as_of}", self.job_id);

        let windows = AnalysisWindows {
            anomaly_weeks: self.config.analysis_weeks_anomaly,
            trend_weeks: self.config.analysis_weeks_trend.clone(),
            min_trend_events: self.config.min_trend_events,
            trend_alpha: self.config.p_value_trend,
        };

        // City-wide baselines first; retained in memory (one per group)
        // as context for plot generation.
        let mut city_results: Vec<SeriesResult> = Vec::new();
        let mut city_series: BTreeMap<String, BTreeMap<NaiveDate, u64>> = BTreeMap::new();
        for group in table.city_wide_keys()? {
            let sparse = table.series(None, &group)?;
            if let Some(analysis) = analyze_series(&sparse, as_of, &windows)? {
                city_series.insert(group.clone(), analysis.full_series.clone());
                city_results.push(self.build_result(None, &group, analysis));
            }
        }

        let keys = table.localized_keys()?;
        let total_groups = keys.len();
        self.push_status(&JobStatus::processing(
            "analyzing",
            40,
            &format!("Analyzing {total_groups} localized series"),
        ));

        let mut writer = self.store.create(self.job_id, &artifact_name)?;
        writer.write_all(b"{\"status\":\"success\",\"stage_name\":\"")?;
        writer.write_all(STAGE_NAME.as_bytes())?;
        writer.write_all(b"\",\"parameters\":")?;
        serde_json::to_writer(&mut writer, &parameters)?;
        writer.write_all(b",\"city_wide_results\":")?;
        serde_json::to_writer(&mut writer, &city_results)?;
        writer.write_all(b",\"results\":[")?;

        let mut plot_candidates: Vec<PlotCandidate> = Vec::new();
        let mut emitted = 0usize;
        let mut last_report = Instant::now();

        for (done, key) in keys.iter().enumerate() {
            let sparse = table.series(Some(key.cell), &key.group)?;
            let Some(analysis) = analyze_series(&sparse, as_of, &windows)? else {
                continue;
            };

            let significant_anomalies: Vec<AnomalyWeek> = analysis
                .anomaly_analysis
                .iter()
                .filter(|w| w.anomaly_p_value < self.config.p_value_anomaly)
                .cloned()
                .collect();
            let significant_trend = analysis
                .trend_analysis
                .values()
                .any(|t| t.p_value.is_some_and(|p| p < self.config.p_value_trend));
            if wants_plot(
                self.config.plot_generation,
                significant_trend,
                !significant_anomalies.is_empty(),
            ) {
                plot_candidates.push(PlotCandidate {
                    cell: key.cell,
                    group: key.group.clone(),
                    series: analysis.full_series.clone(),
                    anomalies: significant_anomalies,
                });
            }

            let result = self.build_result(Some(key.cell), &key.group, analysis);
            if emitted > 0 {
                writer.write_all(b",")?;
            }
            serde_json::to_writer(&mut writer, &result)?;
            emitted += 1;

            if (done + 1) % PROGRESS_GROUP_INTERVAL == 0
                || last_report.elapsed() >= PROGRESS_TIME_INTERVAL
            {
                #[allow(clippy::cast_possible_truncation)]
                let percent = (40 + 50 * (done + 1) / total_groups.max(1)) as u8;
                self.push_status(&JobStatus::processing(
                    "analyzing",
                    percent,
                    &format!("Analyzed {}/{total_groups} series", done + 1),
                ));
                last_report = Instant::now();
            }
        }

        writer.write_all(b"]}")?;
        writer.commit()?;
        log::info!(
            "[{}] Wrote {emitted} localized and {} city-wide results",
            self.job_id,
            city_results.len()
        );

        self.generate_plots(plot_candidates, &city_series)?;

        table.discard();
        self.store.read(self.job_id, &artifact_name)
    }

    fn aggregate(&self) -> Result<AggregateTable, PipelineError> {
        std::fs::create_dir_all(&self.work_dir)?;
        let store_path = self
            .work_dir
            .join(format!("{}_weekly.duckdb", self.job_id));

        let mut accumulator = WeeklyAccumulator::open(
            &store_path,
            self.config.h3_resolution,
            self.config.filter_col.as_deref(),
            &self.config.filter_values,
        )?;

        let total = self.config.sources.len();
        for (index, source) in self.config.sources.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let percent = (40 * index / total.max(1)) as u8;
            self.push_status(&JobStatus::processing(
                "aggregating",
                percent,
                &format!("Aggregating source {}/{total}: {}", index + 1, source.url),
            ));

            let mut reader = CsvChunkReader::open(source, self.config.chunksize)?;
            let mut kept = 0u64;
            let mut dropped = 0u64;
            let mut skipped_chunks = 0u64;
            while let Some(chunk) = reader.next_chunk()? {
                let outcome = accumulator.absorb_chunk(source, &chunk)?;
                kept += outcome.rows_kept;
                dropped += outcome.rows_dropped + outcome.rows_filtered;
                if outcome.skipped {
                    skipped_chunks += 1;
                }
            }
            log::info!(
                "[{}] {}: {kept} rows kept, {dropped} dropped/filtered, {skipped_chunks} chunks skipped",
                self.job_id,
                source.url
            );
        }

        Ok(accumulator.finish()?)
    }

    fn build_result(
        &self,
        cell: Option<CellId>,
        group: &str,
        analysis: SeriesAnalysis,
    ) -> SeriesResult {
        let (h3_index, lat, lon, primary_group_name) = cell.map_or_else(
            || (None, None, None, Some("City-Wide".to_owned())),
            |cell| {
                let (lat, lon) = cell.center();
                (Some(cell.to_string()), Some(lat), Some(lon), None)
            },
        );
        let full_weekly_series = self
            .config
            .save_full_series
            .then(|| analysis.full_series.clone());

        SeriesResult {
            h3_index,
            lat,
            lon,
            group: group.to_owned(),
            primary_group_name,
            model_used: analysis.model_used,
            historical_weekly_avg: analysis.historical_weekly_avg,
            historical_weekly_var: analysis.historical_weekly_var,
            full_weekly_series,
            anomaly_analysis: analysis.anomaly_analysis,
            trend_analysis: analysis.trend_analysis,
        }
    }

    fn generate_plots(
        &self,
        candidates: Vec<PlotCandidate>,
        city_series: &BTreeMap<String, BTreeMap<NaiveDate, u64>>,
    ) -> Result<(), PipelineError> {
        if candidates.is_empty() {
            return Ok(());
        }
        self.push_status(&JobStatus::processing(
            "generating_plots",
            95,
            &format!("Generating {} plots", candidates.len()),
        ));

        let mut generated: BTreeSet<(String, String)> = BTreeSet::new();
        for candidate in candidates {
            let cell_token = candidate.cell.to_string();
            if !generated.insert((cell_token.clone(), candidate.group.clone())) {
                continue;
            }

            let filename = format!(
                "plot_{cell_token}_{}.png",
                sanitize_filename(&candidate.group)
            );
            let request = PlotRequest {
                cell: cell_token,
                city_wide: city_series.get(&candidate.group).cloned(),
                group: candidate.group,
                series: candidate.series,
                anomalies: candidate.anomalies,
            };
            self.plots.save_plot(self.job_id, &filename, &request)?;
        }
        Ok(())
    }

    fn write_empty(
        &self,
        artifact_name: &str,
        parameters: &serde_json::Value,
    ) -> Result<serde_json::Value, PipelineError> {
        let value = serde_json::json!({
            "status": "success",
            "stage_name": STAGE_NAME,
            "parameters": parameters,
            "results": [],
            "city_wide_results": [],
        });
        let mut writer = self.store.create(self.job_id, artifact_name)?;
        serde_json::to_writer(&mut writer, &value)?;
        writer.commit()?;
        Ok(value)
    }

    /// Best-effort status push: failures are logged, never fatal.
    fn push_status(&self, status: &JobStatus) {
        if let Err(e) = self.status.update(self.job_id, status) {
            log::warn!("[{}] Failed to report status: {e}", self.job_id);
        }
    }
}

const fn wants_plot(
    mode: PlotGeneration,
    significant_trend: bool,
    significant_anomaly: bool,
) -> bool {
    match mode {
        PlotGeneration::Both => significant_trend || significant_anomaly,
        PlotGeneration::Trends => significant_trend,
        PlotGeneration::Anomalies => significant_anomaly,
        PlotGeneration::None => false,
    }
}
