//! Per-request task state.

use std::io;
use std::path::{Path, PathBuf};

/// One top-level request's identity and scratch space.
///
/// All nested calls made while serving the request share the task, and with it
/// the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    task_id: String,
    scratch_dir: PathBuf,
}

impl TaskContext {
    pub fn new(scratch_root: impl AsRef<Path>, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let scratch_dir = scratch_root.as_ref().join(&task_id);
        Self {
            task_id,
            scratch_dir,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Create the scratch directory if it does not exist yet.
    ///
    /// Returns `true` when this call created it.
    pub fn ensure_scratch_dir(&self) -> io::Result<bool> {
        if self.scratch_dir.is_dir() {
            return Ok(false);
        }
        std::fs::create_dir_all(&self.scratch_dir)?;
        tracing::debug!(
            task_id = %self.task_id,
            dir = %self.scratch_dir.display(),
            "Created scratch directory"
        );
        Ok(true)
    }
}
