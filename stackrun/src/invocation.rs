//! Invocation bridge - serves exactly one inbound request per process.
//!
//! Flow:
//! 1. Starting: read the request from the store, normalize it, record the task
//!    id, recreate the channel pair, materialize the shim
//! 2. Dispatching: hand the envelopes to the contract server with the shim
//!    forwarder as the external caller
//! 3. ShuttingDown: persist the response and the log artifact
//! 4. Cleanup (always): remove the shim, the channel pair and the log file

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use stackrun_contract::{DispatchError, Server};

use crate::bridge::transport::{ChannelPaths, FifoTransport, remove_if_exists};
use crate::config::BridgeConfig;
use crate::envelope::{self, NormalizedRequest};
use crate::forwarder::{ForwardError, ShimForwarder};
use crate::stack::{Stack, StackError};
use crate::store::{Store, StoreError};

/// Exit status for a completed invocation.
pub const EXIT_OK: i32 = 0;
/// Exit status for any unhandled failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Starting,
    Dispatching,
    ShuttingDown,
    Done,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("failed to prepare channels: {0}")]
    Transport(#[source] io::Error),

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("invocation already ran")]
    AlreadyRan,
}

/// Releases everything the invocation materialized, on every exit path.
struct Cleanup {
    stack: Arc<dyn Stack>,
    channels: ChannelPaths,
    log_file: PathBuf,
    transport: Option<FifoTransport>,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up invocation");
        if let Err(e) = self.stack.del_shim() {
            tracing::warn!(error = %e, stack = %self.stack.name(), "Failed to remove shim");
        }
        // Dropping the transport removes the endpoints it created; the explicit
        // removals also cover a failure between creating the first and second FIFO.
        drop(self.transport.take());
        for path in [&self.channels.request, &self.channels.response, &self.log_file] {
            if let Err(e) = remove_if_exists(path) {
                tracing::warn!(error = %e, path = %path.display(), "Failed to remove file");
            }
        }
    }
}

pub struct InvocationBridge {
    config: BridgeConfig,
    server: Server,
    store: Arc<dyn Store>,
    stack: Arc<dyn Stack>,
    state: BridgeState,
}

impl InvocationBridge {
    pub fn new(
        config: BridgeConfig,
        server: Server,
        store: Arc<dyn Store>,
        stack: Arc<dyn Stack>,
    ) -> Self {
        Self {
            config,
            server,
            store,
            stack,
            state: BridgeState::Idle,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    fn transition(&mut self, next: BridgeState) {
        tracing::debug!(from = ?self.state, to = ?next, "Invocation state change");
        self.state = next;
    }

    /// Run the invocation and map the outcome to a process exit status.
    pub async fn execute(&mut self) -> i32 {
        match self.run().await {
            Ok(_) => {
                tracing::info!("Service call complete");
                EXIT_OK
            }
            Err(_) => EXIT_FAILURE,
        }
    }

    /// Run startup, dispatch and shutdown; cleanup runs whatever happens.
    ///
    /// Returns the response that was persisted.
    pub async fn run(&mut self) -> Result<Value, BridgeError> {
        if self.state != BridgeState::Idle {
            return Err(BridgeError::AlreadyRan);
        }

        let mut cleanup = Cleanup {
            stack: self.stack.clone(),
            channels: self.config.channels.clone(),
            log_file: self.config.log_file.clone(),
            transport: None,
        };

        let result = self.run_phases(&mut cleanup).await;
        match &result {
            Ok(_) => self.transition(BridgeState::Done),
            Err(e) => {
                self.transition(BridgeState::Failed);
                log_failure(e);
            }
        }
        drop(cleanup);
        result
    }

    async fn run_phases(&mut self, cleanup: &mut Cleanup) -> Result<Value, BridgeError> {
        self.transition(BridgeState::Starting);
        let request = self.startup(cleanup).await?;

        self.transition(BridgeState::Dispatching);
        let transport = cleanup
            .transport
            .as_ref()
            .ok_or_else(|| BridgeError::Transport(io::Error::other("channels not created")))?;
        let response = self.dispatch(request, transport).await?;

        self.transition(BridgeState::ShuttingDown);
        self.shutdown(&response).await?;
        Ok(response)
    }

    async fn startup(&self, cleanup: &mut Cleanup) -> Result<NormalizedRequest, BridgeError> {
        tracing::debug!("Starting up service");

        let raw = self
            .store
            .get_request()
            .await
            .map_err(|e| BridgeError::MalformedRequest(e.to_string()))?;
        let request = envelope::normalize(&raw, &self.config.default_service)
            .map_err(|e| BridgeError::MalformedRequest(e.to_string()))?;
        tracing::info!(task_id = %request.task_id, input = %request.reqs, "Input");

        self.store.set_task_id(&request.task_id);

        let transport =
            FifoTransport::create(self.config.channels.clone()).map_err(BridgeError::Transport)?;
        cleanup.transport = Some(transport);

        self.stack.copy_shim()?;
        Ok(request)
    }

    async fn dispatch(
        &self,
        request: NormalizedRequest,
        transport: &FifoTransport,
    ) -> Result<Value, BridgeError> {
        let forwarder = ShimForwarder::new(
            transport,
            self.stack.as_ref(),
            &self.config.work_dir,
            &self.config.scratch_root,
        )
        .with_timeout(self.config.exchange_timeout);

        let response = self
            .server
            .call(request.reqs, &request.task_id, &forwarder)
            .await?;
        Ok(response)
    }

    async fn shutdown(&self, response: &Value) -> Result<(), BridgeError> {
        tracing::info!(output = %response, "Output");
        tracing::debug!("Shutting down service");

        let encoded = serde_json::to_string(response).map_err(BridgeError::Encode)?;
        self.store.put_response(&encoded).await?;

        let log_file = &self.config.log_file;
        if log_file.is_file() {
            self.store.put_file(log_file).await?;
        } else {
            tracing::debug!(path = %log_file.display(), "No log file to store");
        }
        Ok(())
    }
}

/// Cause chain rendered the way anyhow's `{:#}` renders it.
fn error_chain(err: &BridgeError) -> String {
    anyhow::Chain::new(err)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

fn log_failure(err: &BridgeError) {
    tracing::error!(error = %error_chain(err), "Unhandled error during invocation");

    if let BridgeError::Dispatch(DispatchError::Caller { source, .. }) = err
        && let Some(ForwardError::Subprocess { output, .. }) = source.downcast_ref::<ForwardError>()
    {
        for line in output.lines() {
            tracing::error!(target: "stackrun::shim", "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::ShimStack;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use stackrun_contract::Contract;

    /// In-memory store recording everything the bridge hands it.
    #[derive(Default)]
    struct MemoryStore {
        request: Option<String>,
        task_id: Mutex<Option<String>>,
        response: Mutex<Option<String>>,
        files: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn get_request(&self) -> Result<String, StoreError> {
            self.request.clone().ok_or_else(|| StoreError::ReadRequest {
                path: "<memory>".to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            })
        }

        fn set_task_id(&self, task_id: &str) {
            *self.task_id.lock().unwrap() = Some(task_id.to_string());
        }

        async fn put_response(&self, response: &str) -> Result<(), StoreError> {
            *self.response.lock().unwrap() = Some(response.to_string());
            Ok(())
        }

        async fn put_file(&self, path: &Path) -> Result<(), StoreError> {
            self.files.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    fn bridge(work: &Path, store: Arc<MemoryStore>) -> InvocationBridge {
        let contract = Contract::from_json(
            r#"[{"type": "interface", "name": "Default", "functions": [
                {"name": "ping", "params": []}
            ]}]"#,
        )
        .unwrap();
        let stack = ShimStack::new("shell", vec!["true".to_string()], work).unwrap();
        InvocationBridge::new(
            BridgeConfig::new(work),
            Server::new(contract),
            store,
            Arc::new(stack),
        )
    }

    #[tokio::test]
    async fn missing_request_fails_and_cleans_up() {
        let work = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let mut bridge = bridge(work.path(), store.clone());

        let err = bridge.run().await.unwrap_err();
        assert!(matches!(err, BridgeError::MalformedRequest(_)));
        assert_eq!(bridge.state(), BridgeState::Failed);
        assert!(store.response.lock().unwrap().is_none());
        assert!(!work.path().join("req.json").exists());
        assert!(!work.path().join("resp.json").exists());
    }

    #[tokio::test]
    async fn no_calls_needed_for_unknown_method() {
        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("stackrun.log"), "log line\n").unwrap();
        let store = Arc::new(MemoryStore {
            request: Some(r#"{"id": "task-7", "req": {"method": "missing"}}"#.to_string()),
            ..Default::default()
        });
        let mut bridge = bridge(work.path(), store.clone());

        assert_eq!(bridge.execute().await, EXIT_OK);
        assert_eq!(bridge.state(), BridgeState::Done);
        assert_eq!(store.task_id.lock().unwrap().as_deref(), Some("task-7"));

        let response: Value =
            serde_json::from_str(store.response.lock().unwrap().as_deref().unwrap()).unwrap();
        assert_eq!(response["error"]["code"], -32601);

        assert_eq!(
            store.files.lock().unwrap().as_slice(),
            &[work.path().join("stackrun.log")]
        );
        assert!(!work.path().join("stackrun.log").exists());
        assert!(!work.path().join("req.json").exists());
    }

    #[test]
    fn failure_chain_includes_causes() {
        let err = BridgeError::Store(StoreError::Write {
            path: "/out/response.json".to_string(),
            source: io::Error::other("disk full"),
        });
        assert_eq!(
            error_chain(&err),
            "failed to write /out/response.json: disk full: disk full"
        );
    }

    #[tokio::test]
    async fn bridge_runs_only_once() {
        let work = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore {
            request: Some(r#"{"req": {"method": "missing"}}"#.to_string()),
            ..Default::default()
        });
        let mut bridge = bridge(work.path(), store);
        bridge.run().await.unwrap();
        assert!(matches!(
            bridge.run().await.unwrap_err(),
            BridgeError::AlreadyRan
        ));
    }
}
