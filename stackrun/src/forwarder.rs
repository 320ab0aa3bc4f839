//! External call forwarder - runs one nested call in a fresh shim subprocess.
//!
//! Flow per call:
//! 1. Ensure the task's scratch directory exists
//! 2. Spawn the shim (stdout and stderr merged into one captured pipe)
//! 3. Write the request document, read the response document; a shim that
//!    exits without ever opening its end fails the call instead of hanging it
//! 4. Wait for the shim to exit; a non-zero exit wins over any response
//! 5. Map `{"error": ...}` responses onto typed errors, otherwise return `result`

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use stackrun_contract::{CallError, ERR_METHOD_NOT_FOUND, ExternalCaller, RpcError};

use crate::bridge::protocol::{ShimOutcome, ShimRequest, ShimResponse};
use crate::bridge::transport::{FifoTransport, join_error};
use crate::stack::Stack;
use crate::task::TaskContext;

/// How long to keep collecting shim output after it exits. Only matters when
/// the shim leaves a background process holding the pipe open.
const OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// Poll attempts when releasing a blocked exchange.
const ABANDON_ATTEMPTS: usize = 100;

/// How long an exchange may still take once the shim has exited. The response
/// is already in the pipe by then, so this only bounds the reader draining it.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Whichever finishes first while a call is in flight.
enum Race {
    Exchanged(io::Result<Vec<u8>>),
    Exited,
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Method or service {0} not found")]
    MethodNotFound(String),

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// The shim exited unsuccessfully. `output` is its merged stdout/stderr.
    #[error("shim exited unsuccessfully ({status})")]
    Subprocess { status: ExitStatus, output: String },

    #[error("failed to spawn shim '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare scratch directory: {0}")]
    Scratch(#[source] io::Error),

    #[error("channel error: {0}")]
    Transport(#[source] io::Error),

    #[error("invalid shim response: {0}")]
    InvalidResponse(#[source] serde_json::Error),

    #[error("shim did not answer within {0:?}")]
    Timeout(Duration),
}

impl ForwardError {
    /// Exit code of a failed shim, if it exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Subprocess { status, .. } => status.code(),
            _ => None,
        }
    }
}

impl From<ForwardError> for CallError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::MethodNotFound(method) => {
                CallError::Rpc(RpcError::method_not_found(&method))
            }
            ForwardError::Remote { code, message } => CallError::Rpc(RpcError::new(code, message)),
            other => CallError::Fatal(Box::new(other)),
        }
    }
}

/// A launched shim with its output being drained in the background.
struct ShimProcess {
    child: Child,
    output: JoinHandle<io::Result<Vec<u8>>>,
}

impl ShimProcess {
    fn spawn(argv: &[String], work_dir: &Path) -> Result<Self, ForwardError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ForwardError::Spawn {
                program: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty shim command"),
            });
        };
        let spawn_err = |source: io::Error| ForwardError::Spawn {
            program: program.clone(),
            source,
        };

        let (read_end, write_end) = nix::unistd::pipe().map_err(|e| spawn_err(e.into()))?;
        let stderr_end = write_end.try_clone().map_err(spawn_err)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr_end))
            .kill_on_drop(true);
        let child = command.spawn().map_err(spawn_err)?;
        // Release our copies of the write end so the reader sees EOF when the shim exits.
        drop(command);

        let output = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            File::from(read_end).read_to_end(&mut buf)?;
            Ok(buf)
        });

        Ok(Self { child, output })
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for exit without collecting output. Safe to call before `finish`.
    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "Failed to signal shim");
        }
    }

    /// Wait for exit and collect the merged output.
    async fn finish(mut self) -> (io::Result<ExitStatus>, String) {
        let status = self.child.wait().await;
        let output = match tokio::time::timeout(OUTPUT_GRACE, self.output).await {
            Ok(Ok(Ok(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Ok(Err(e))) => {
                tracing::warn!(error = %e, "Failed to read shim output");
                String::new()
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Shim output reader failed");
                String::new()
            }
            Err(_) => {
                tracing::warn!("Shim output still open after exit, giving up on it");
                String::new()
            }
        };
        (status, output)
    }
}

/// Forwards nested calls to the shim over the bridge's channel pair.
///
/// Borrows everything from the invocation; nothing outlives a single call.
pub struct ShimForwarder<'a> {
    transport: &'a FifoTransport,
    stack: &'a dyn Stack,
    work_dir: &'a Path,
    scratch_root: &'a Path,
    timeout: Option<Duration>,
}

impl<'a> ShimForwarder<'a> {
    pub fn new(
        transport: &'a FifoTransport,
        stack: &'a dyn Stack,
        work_dir: &'a Path,
        scratch_root: &'a Path,
    ) -> Self {
        Self {
            transport,
            stack,
            work_dir,
            scratch_root,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute one nested call.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        task_id: &str,
    ) -> Result<Value, ForwardError> {
        let task = TaskContext::new(self.scratch_root, task_id);
        task.ensure_scratch_dir().map_err(ForwardError::Scratch)?;

        let request = ShimRequest {
            method: method.to_string(),
            params,
            task_id: task_id.to_string(),
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| ForwardError::Transport(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let mut shim = ShimProcess::spawn(&self.stack.shim_command(), self.work_dir)?;
        tracing::debug!(%method, %task_id, pid = ?shim.id(), stack = %self.stack.name(), "Launched shim");

        let mut pending = self.transport.spawn_exchange(payload);
        let deadline = async {
            match self.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        let race = tokio::select! {
            joined = &mut pending => Race::Exchanged(joined.map_err(join_error).and_then(|r| r)),
            _ = shim.wait() => Race::Exited,
            () = deadline => Race::TimedOut,
        };

        let exchanged = match race {
            Race::Exchanged(result) => result,
            Race::Exited => match tokio::time::timeout(EXIT_GRACE, &mut pending).await {
                Ok(joined) => joined.map_err(join_error).and_then(|r| r),
                Err(_) => {
                    // Never opened its end of the channel pair.
                    self.transport.abandon(pending, ABANDON_ATTEMPTS).await;
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "shim exited before completing the exchange",
                    ))
                }
            },
            Race::TimedOut => {
                let limit = self.timeout.unwrap_or_default();
                tracing::warn!(%method, %task_id, timeout = ?limit, "Shim exchange timed out");
                shim.kill();
                self.transport.abandon(pending, ABANDON_ATTEMPTS).await;
                let (_, output) = shim.finish().await;
                log_output(task_id, &output);
                return Err(ForwardError::Timeout(limit));
            }
        };

        if exchanged.is_err() {
            // The shim can't be trusted to exit on its own once the handshake broke.
            shim.kill();
        }

        let (status, output) = shim.finish().await;
        log_output(task_id, &output);
        let status = status.map_err(ForwardError::Transport)?;

        // Exit status first: a failed shim's response is not trustworthy.
        if status.code().is_some_and(|code| code != 0) || (exchanged.is_ok() && !status.success())
        {
            tracing::info!(%method, %task_id, %status, "Shim failed");
            return Err(ForwardError::Subprocess { status, output });
        }

        let bytes = exchanged.map_err(ForwardError::Transport)?;
        let response: ShimResponse =
            serde_json::from_slice(&bytes).map_err(ForwardError::InvalidResponse)?;

        match response.into_outcome() {
            ShimOutcome::Error { code, .. } if code == ERR_METHOD_NOT_FOUND => {
                Err(ForwardError::MethodNotFound(method.to_string()))
            }
            ShimOutcome::Error { code, message } => Err(ForwardError::Remote { code, message }),
            ShimOutcome::Result(result) => {
                tracing::debug!(%method, %task_id, "Shim call succeeded");
                Ok(result)
            }
        }
    }
}

fn log_output(task_id: &str, output: &str) {
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        tracing::debug!(target: "stackrun::shim", %task_id, "{}", line);
    }
}

#[async_trait]
impl ExternalCaller for ShimForwarder<'_> {
    async fn forward(
        &self,
        method: &str,
        params: Value,
        task_id: &str,
    ) -> Result<Value, CallError> {
        self.call(method, params, task_id).await.map_err(|e| {
            tracing::debug!(%method, error = %e, "Forwarded call failed");
            CallError::from(e)
        })
    }
}
