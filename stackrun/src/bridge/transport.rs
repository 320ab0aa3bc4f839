//! FIFO channel pair for shim IPC.
//!
//! Two named pipes live at well-known paths in the working directory: the
//! request channel (we write, the shim reads) and the response channel (the
//! shim writes, we read). Opening a FIFO blocks until the peer opens the other
//! end, which gives the synchronous handshake: a write completes only once the
//! shim has picked the request up, and a read completes once the shim has
//! written its answer and closed.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tokio::task::JoinHandle;

/// Locations of the request and response channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    pub request: PathBuf,
    pub response: PathBuf,
}

impl ChannelPaths {
    pub const REQUEST_FILE: &'static str = "req.json";
    pub const RESPONSE_FILE: &'static str = "resp.json";

    /// Default channel names inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            request: dir.join(Self::REQUEST_FILE),
            response: dir.join(Self::RESPONSE_FILE),
        }
    }
}

/// A blocking request/response exchange running on the blocking pool.
pub type PendingExchange = JoinHandle<io::Result<Vec<u8>>>;

/// Owner of the channel endpoints. Dropping it removes both FIFOs.
pub struct FifoTransport {
    paths: ChannelPaths,
}

impl FifoTransport {
    /// Remove any stale endpoints and create both FIFOs fresh.
    pub fn create(paths: ChannelPaths) -> io::Result<Self> {
        tracing::debug!(
            request = %paths.request.display(),
            response = %paths.response.display(),
            "Creating channel pair"
        );

        for path in [&paths.request, &paths.response] {
            remove_if_exists(path)?;
            nix::unistd::mkfifo(path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR)?;
            tracing::trace!(path = %path.display(), "Created fifo");
        }

        Ok(Self { paths })
    }

    /// Start one exchange: write `request` to the request channel, then read
    /// the full response document. Both steps block until the shim opens its end.
    pub fn spawn_exchange(&self, request: Vec<u8>) -> PendingExchange {
        let paths = self.paths.clone();
        tokio::task::spawn_blocking(move || {
            tracing::trace!(bytes = request.len(), "Writing request");
            let mut writer = OpenOptions::new().write(true).open(&paths.request)?;
            writer.write_all(&request)?;
            drop(writer);

            tracing::trace!("Waiting for response");
            let mut reader = File::open(&paths.response)?;
            let mut response = Vec::new();
            reader.read_to_end(&mut response)?;
            tracing::trace!(bytes = response.len(), "Read response");
            Ok(response)
        })
    }

    /// Release a blocked exchange whose peer has gone away.
    ///
    /// Opens the far end of each channel without blocking, which lets a pending
    /// `open` on our side complete. Keeps poking until the exchange finishes or
    /// `attempts` run out.
    pub async fn abandon(&self, mut pending: PendingExchange, attempts: usize) {
        for _ in 0..attempts {
            self.unblock();
            if tokio::time::timeout(Duration::from_millis(50), &mut pending)
                .await
                .is_ok()
            {
                tracing::debug!("Abandoned exchange released");
                return;
            }
        }
        tracing::warn!("Channel exchange still blocked after abandoning it");
    }

    fn unblock(&self) {
        let nonblock = OFlag::O_NONBLOCK.bits();
        // Errors are expected here: ENXIO when nobody is waiting on the far side.
        let _ = OpenOptions::new()
            .read(true)
            .custom_flags(nonblock)
            .open(&self.paths.request);
        let _ = OpenOptions::new()
            .write(true)
            .custom_flags(nonblock)
            .open(&self.paths.response);
    }

    /// Remove both endpoints. Already-absent endpoints are fine.
    pub fn cleanup(&mut self) -> io::Result<()> {
        tracing::debug!("Removing channel pair");
        remove_if_exists(&self.paths.request)?;
        remove_if_exists(&self.paths.response)?;
        Ok(())
    }
}

impl Drop for FifoTransport {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to remove channel pair");
        }
    }
}

/// Remove a file, treating "not found" as success.
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Map an exchange join failure (panic or runtime shutdown) onto an io error.
pub fn join_error(e: tokio::task::JoinError) -> io::Error {
    io::Error::other(format!("channel exchange task failed: {e}"))
}
