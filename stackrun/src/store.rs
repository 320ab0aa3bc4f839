//! Request source and artifact sink.
//!
//! The invocation reads its inbound request from a store and hands the
//! response and log artifacts back to it. Only the local-filesystem store is
//! provided here.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read request from {path}: {source}")]
    ReadRequest {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("not a file: {0}")]
    NotAFile(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch the raw inbound request document.
    async fn get_request(&self) -> Result<String, StoreError>;

    /// Record the task id so artifacts can be correlated with this invocation.
    fn set_task_id(&self, task_id: &str);

    /// Persist the final JSON-RPC response.
    async fn put_response(&self, response: &str) -> Result<(), StoreError>;

    /// Persist an artifact file (e.g. the log).
    async fn put_file(&self, path: &Path) -> Result<(), StoreError>;
}

/// Store backed by a request file and an output directory.
pub struct LocalStore {
    request_file: PathBuf,
    output_dir: PathBuf,
    task_id: Mutex<Option<String>>,
}

impl LocalStore {
    pub const RESPONSE_FILE: &'static str = "response.json";

    pub fn new(request_file: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            request_file: request_file.into(),
            output_dir: output_dir.into(),
            task_id: Mutex::new(None),
        }
    }

    pub fn response_path(&self) -> PathBuf {
        self.output_dir.join(Self::RESPONSE_FILE)
    }

    pub fn task_id(&self) -> Option<String> {
        self.task_id.lock().ok().and_then(|guard| guard.clone())
    }

    /// Where an artifact lands in the output directory. It keeps its file
    /// name unless that would be the source file itself, in which case the
    /// task id is prepended so the copy survives cleanup of the original.
    async fn artifact_path(&self, src: &Path, name: &str) -> PathBuf {
        let dest = self.output_dir.join(name);
        let same_file = match (
            tokio::fs::canonicalize(&self.output_dir).await,
            tokio::fs::canonicalize(src).await,
        ) {
            (Ok(dir), Ok(src)) => dir.join(name) == src,
            _ => dest == src,
        };
        if !same_file {
            return dest;
        }
        let prefix = self.task_id().unwrap_or_else(|| "task".to_string());
        self.output_dir.join(format!("{prefix}-{name}"))
    }

    async fn ensure_output_dir(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| StoreError::Write {
                path: self.output_dir.display().to_string(),
                source,
            })
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn get_request(&self) -> Result<String, StoreError> {
        tracing::debug!(path = %self.request_file.display(), "Reading request");
        tokio::fs::read_to_string(&self.request_file)
            .await
            .map_err(|source| StoreError::ReadRequest {
                path: self.request_file.display().to_string(),
                source,
            })
    }

    fn set_task_id(&self, task_id: &str) {
        tracing::info!(%task_id, "Assigned task id");
        match self.task_id.lock() {
            Ok(mut guard) => *guard = Some(task_id.to_string()),
            Err(_) => tracing::error!("Task id lock poisoned"),
        }
    }

    async fn put_response(&self, response: &str) -> Result<(), StoreError> {
        self.ensure_output_dir().await?;
        let path = self.response_path();
        tracing::debug!(path = %path.display(), "Writing response");
        tokio::fs::write(&path, response)
            .await
            .map_err(|source| StoreError::Write {
                path: path.display().to_string(),
                source,
            })
    }

    async fn put_file(&self, path: &Path) -> Result<(), StoreError> {
        let name = path
            .file_name()
            .ok_or_else(|| StoreError::NotAFile(path.display().to_string()))?;
        self.ensure_output_dir().await?;
        let dest = self.artifact_path(path, &name.to_string_lossy()).await;
        tracing::debug!(src = %path.display(), dest = %dest.display(), "Storing file");
        tokio::fs::copy(path, &dest)
            .await
            .map(|_| ())
            .map_err(|source| StoreError::Write {
                path: dest.display().to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_request_file() {
        let dir = tempfile::tempdir().unwrap();
        let req = dir.path().join("request.json");
        std::fs::write(&req, r#"{"req": {}}"#).unwrap();

        let store = LocalStore::new(&req, dir.path().join("out"));
        assert_eq!(store.get_request().await.unwrap(), r#"{"req": {}}"#);
    }

    #[tokio::test]
    async fn missing_request_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("nope.json"), dir.path());
        let err = store.get_request().await.unwrap_err();
        assert!(matches!(err, StoreError::ReadRequest { .. }));
    }

    #[tokio::test]
    async fn writes_response_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let store = LocalStore::new(dir.path().join("request.json"), &out);

        store.set_task_id("task-1");
        assert_eq!(store.task_id().as_deref(), Some("task-1"));

        store.put_response(r#"{"result": 1}"#).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(out.join("response.json")).unwrap(),
            r#"{"result": 1}"#
        );

        let log = dir.path().join("stackrun.log");
        std::fs::write(&log, "line\n").unwrap();
        store.put_file(&log).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(out.join("stackrun.log")).unwrap(),
            "line\n"
        );
    }

    #[tokio::test]
    async fn file_already_in_output_dir_gets_task_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("request.json"), dir.path());
        store.set_task_id("task-9");

        let log = dir.path().join("stackrun.log");
        std::fs::write(&log, "line\n").unwrap();
        store.put_file(&log).await.unwrap();

        assert_eq!(std::fs::read_to_string(&log).unwrap(), "line\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("task-9-stackrun.log")).unwrap(),
            "line\n"
        );
    }
}
