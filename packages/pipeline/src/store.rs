//! Result artifact storage.
//!
//! Artifacts are keyed by (job id, name); each job gets an isolated
//! namespace. The local implementation writes to a temporary name and
//! atomically renames on commit, so a mid-run failure never leaves a
//! truncated artifact under the final name.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::PipelineError;

/// An in-progress artifact write. Dropping without [`Self::commit`]
/// discards the write.
pub trait ArtifactWriter: Write + Send {
    /// Finalizes the artifact, making it visible under its name.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if flushing or renaming fails.
    fn commit(self: Box<Self>) -> Result<(), PipelineError>;
}

/// Durable storage for result artifacts.
pub trait ArtifactStore: Send + Sync {
    /// Whether an artifact exists under this job id and name.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] on storage failure.
    fn exists(&self, job_id: &str, name: &str) -> Result<bool, PipelineError>;

    /// Reads an artifact back as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the artifact is missing or not
    /// valid JSON.
    fn read(&self, job_id: &str, name: &str) -> Result<serde_json::Value, PipelineError>;

    /// Opens a streaming writer for a new artifact.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] on storage failure.
    fn create(&self, job_id: &str, name: &str) -> Result<Box<dyn ArtifactWriter>, PipelineError>;
}

/// Filesystem-backed artifact store: `{base_dir}/{job_id}/{name}`.
pub struct LocalArtifactStore {
    base_dir: PathBuf,
}

impl LocalArtifactStore {
    /// Creates a store rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The directory holding one job's artifacts.
    #[must_use]
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.base_dir.join(job_id)
    }

    fn artifact_path(&self, job_id: &str, name: &str) -> PathBuf {
        self.job_dir(job_id).join(name)
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn exists(&self, job_id: &str, name: &str) -> Result<bool, PipelineError> {
        Ok(self.artifact_path(job_id, name).exists())
    }

    fn read(&self, job_id: &str, name: &str) -> Result<serde_json::Value, PipelineError> {
        let file = File::open(self.artifact_path(job_id, name))?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    fn create(&self, job_id: &str, name: &str) -> Result<Box<dyn ArtifactWriter>, PipelineError> {
        let dir = self.job_dir(job_id);
        std::fs::create_dir_all(&dir)?;

        let final_path = dir.join(name);
        let tmp_path = dir.join(format!("{name}.tmp"));
        let file = File::create(&tmp_path)?;

        Ok(Box::new(LocalArtifactWriter {
            writer: BufWriter::new(file),
            tmp_path,
            final_path,
            committed: false,
        }))
    }
}

struct LocalArtifactWriter {
    writer: BufWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl Write for LocalArtifactWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl ArtifactWriter for LocalArtifactWriter {
    fn commit(mut self: Box<Self>) -> Result<(), PipelineError> {
        self.writer.flush()?;
        std::fs::rename(&self.tmp_path, &self.final_path)?;
        self.committed = true;
        log::debug!("Committed artifact {}", self.final_path.display());
        Ok(())
    }
}

impl Drop for LocalArtifactWriter {
    fn drop(&mut self) {
        if !self.committed {
            std::fs::remove_file(&self.tmp_path).ok();
        }
    }
}
