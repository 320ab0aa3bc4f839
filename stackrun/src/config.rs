//! Invocation configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::transport::ChannelPaths;
use crate::envelope::DEFAULT_SERVICE;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Directory the shim runs in; channels and shim files live here.
    pub work_dir: PathBuf,
    pub channels: ChannelPaths,
    /// Per-task scratch directories are created under this root.
    pub scratch_root: PathBuf,
    /// Log artifact persisted at shutdown and removed at cleanup.
    pub log_file: PathBuf,
    pub default_service: String,
    /// Upper bound on one channel exchange. `None` blocks until the shim answers.
    pub exchange_timeout: Option<Duration>,
}

impl BridgeConfig {
    pub const SCRATCH_DIR: &'static str = ".stackrun";
    pub const LOG_FILE: &'static str = "stackrun.log";

    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            channels: ChannelPaths::in_dir(&work_dir),
            scratch_root: work_dir.join(Self::SCRATCH_DIR),
            log_file: work_dir.join(Self::LOG_FILE),
            default_service: DEFAULT_SERVICE.to_string(),
            exchange_timeout: None,
            work_dir,
        }
    }

    pub fn with_channels(mut self, channels: ChannelPaths) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = path.into();
        self
    }

    pub fn with_default_service(mut self, service: impl Into<String>) -> Self {
        self.default_service = service.into();
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exchange_timeout = timeout;
        self
    }
}
