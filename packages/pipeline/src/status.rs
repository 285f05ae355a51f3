//! Job status reporting.
//!
//! The driver owns the job progress record and overwrites it in place
//! through a [`StatusSink`]. Reporting is best-effort: sink failures are
//! logged by the driver and never fail the job.

use hotspot_models::JobStatus;

use crate::PipelineError;

/// External status channel keyed by job id.
pub trait StatusSink: Send + Sync {
    /// Overwrites the job's status record.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] on channel failure; callers treat this
    /// as non-fatal.
    fn update(&self, job_id: &str, status: &JobStatus) -> Result<(), PipelineError>;
}

/// A sink that logs each status record instead of persisting it.
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn update(&self, job_id: &str, status: &JobStatus) -> Result<(), PipelineError> {
        log::info!(
            "[{job_id}] {} stage={:?} progress={:?} detail={:?}",
            status.status,
            status.current_stage,
            status.progress,
            status.stage_detail
        );
        Ok(())
    }
}

/// A sink that swallows every update.
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn update(&self, _job_id: &str, _status: &JobStatus) -> Result<(), PipelineError> {
        Ok(())
    }
}
