//! Language stacks: how to materialize the shim and launch it.

use std::io;
use std::path::PathBuf;

use crate::bridge::transport::remove_if_exists;

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("unknown stack '{0}' (expected one of: python, nodejs, shell)")]
    Unknown(String),
    #[error("failed to copy shim file {file}: {source}")]
    Copy {
        file: String,
        #[source]
        source: io::Error,
    },
    #[error("shim command is empty")]
    EmptyCommand,
}

/// Extension point for language-specific shims.
pub trait Stack: Send + Sync {
    fn name(&self) -> &str;

    /// Place the shim code into the working directory.
    fn copy_shim(&self) -> Result<(), StackError>;

    /// Remove whatever `copy_shim` placed. Must tolerate partial or absent copies.
    fn del_shim(&self) -> io::Result<()>;

    /// Argument vector that launches the shim.
    fn shim_command(&self) -> Vec<String>;
}

/// Stack defined by a set of shim files and a launch command.
#[derive(Debug, Clone)]
pub struct ShimStack {
    name: String,
    files: Vec<String>,
    command: Vec<String>,
    source_dir: Option<PathBuf>,
    work_dir: PathBuf,
}

impl ShimStack {
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Result<Self, StackError> {
        if command.is_empty() {
            return Err(StackError::EmptyCommand);
        }
        Ok(Self {
            name: name.into(),
            files: Vec::new(),
            command,
            source_dir: None,
            work_dir: work_dir.into(),
        })
    }

    /// Built-in stack selected by configuration key.
    pub fn builtin(key: &str, work_dir: impl Into<PathBuf>) -> Result<Self, StackError> {
        let (file, program) = match key {
            "python" => ("stackrun_shim.py", "python3"),
            "nodejs" => ("stackrun_shim.js", "node"),
            "shell" => ("stackrun_shim.sh", "sh"),
            other => return Err(StackError::Unknown(other.to_string())),
        };
        let command = vec![program.to_string(), file.to_string()];
        Ok(Self::new(key, command, work_dir)?.with_files(vec![file.to_string()]))
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    /// Directory the shim files are copied from. Without one, `copy_shim` is a no-op.
    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    /// Replace the launch command, keeping the shim files.
    pub fn with_command(mut self, command: Vec<String>) -> Result<Self, StackError> {
        if command.is_empty() {
            return Err(StackError::EmptyCommand);
        }
        self.command = command;
        Ok(self)
    }
}

impl Stack for ShimStack {
    fn name(&self) -> &str {
        &self.name
    }

    fn copy_shim(&self) -> Result<(), StackError> {
        let Some(source_dir) = &self.source_dir else {
            tracing::debug!(stack = %self.name, "No shim source configured, skipping copy");
            return Ok(());
        };
        for file in &self.files {
            let src = source_dir.join(file);
            let dest = self.work_dir.join(file);
            std::fs::copy(&src, &dest).map_err(|source| StackError::Copy {
                file: src.display().to_string(),
                source,
            })?;
            tracing::debug!(stack = %self.name, file = %dest.display(), "Copied shim file");
        }
        Ok(())
    }

    fn del_shim(&self) -> io::Result<()> {
        if self.source_dir.is_none() {
            return Ok(());
        }
        for file in &self.files {
            remove_if_exists(&self.work_dir.join(file))?;
        }
        Ok(())
    }

    fn shim_command(&self) -> Vec<String> {
        self.command.clone()
    }
}
