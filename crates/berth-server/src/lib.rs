//! berth-server: the abstract server capability and its drivers.
//!
//! The deployment engine talks to the remote side exclusively through
//! the [`Server`] trait. Drivers exist for a locally mounted target
//! (`file://`), SFTP (`sftp://`, via ssh2) and FTP/FTPS (`ftp://`,
//! `ftps://`, via suppaftp). Driver instances are not thread-safe; the
//! uploader gives each worker its own session.
//!
//! Every `rel` argument is a `/`-rooted path under the server base
//! directory from the remote URL; drivers prepend the base internally.

pub mod ftp;
pub mod local;
mod progress;
pub mod sftp;

use berth_core::error::{DeployError, DeployResult};
use berth_core::remote::{RemoteUrl, Scheme};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Upload progress callback, invoked with a monotonic percentage 0..=100.
pub type ProgressFn = Box<dyn Fn(u8) + Send + Sync>;

/// Driver-independent connection settings.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// FTP passive mode (ignored by other drivers).
    pub passive_mode: bool,
    /// Mode applied to uploaded files when set.
    pub file_permissions: Option<u32>,
    /// Mode applied to created directories when set.
    pub dir_permissions: Option<u32>,
}

/// One connected session against the deployment target.
pub trait Server {
    /// Download `rel` into the local file `local_abs`.
    fn read_file(&mut self, rel: &str, local_abs: &Path) -> DeployResult<()>;

    /// Upload the local file `local_abs` to `rel`, reporting progress.
    fn write_file(
        &mut self,
        local_abs: &Path,
        rel: &str,
        progress: Option<&ProgressFn>,
    ) -> DeployResult<()>;

    /// Rename within the server. An existing `new_rel` is replaced and
    /// its permissions are preserved onto the renamed file.
    fn rename_file(&mut self, old_rel: &str, new_rel: &str) -> DeployResult<()>;

    /// Remove a file; a missing file is not an error.
    fn remove_file(&mut self, rel: &str) -> DeployResult<()>;

    /// Create a directory, parents included; idempotent.
    fn create_dir(&mut self, rel: &str) -> DeployResult<()>;

    /// Remove a directory; idempotent on missing, fails when non-empty.
    fn remove_dir(&mut self, rel: &str) -> DeployResult<()>;

    /// Recursively empty a directory. Children are staged away under
    /// unique names before deletion so an interrupted purge does not
    /// leave half-deleted user-visible state.
    fn purge(&mut self, rel: &str, progress: Option<&ProgressFn>) -> DeployResult<()>;

    /// Best-effort permission change; drivers without the concept no-op.
    fn chmod(&mut self, rel: &str, mode: u32) -> DeployResult<()>;

    /// The remote base path from the URL.
    fn base_dir(&self) -> &str;

    /// Run a shell command on the server, returning its stdout.
    fn execute(&mut self, cmd: &str) -> DeployResult<String>;
}

/// Open a session for `url`. The URL must already carry a concrete
/// password; the `STDIN` sentinel is resolved by the caller before
/// connecting so that pooled worker sessions never prompt.
pub fn connect(url: &RemoteUrl, opts: &ConnectOptions) -> DeployResult<Box<dyn Server + Send>> {
    match url.scheme {
        Scheme::File => Ok(Box::new(local::LocalServer::connect(url, opts)?)),
        Scheme::Sftp => Ok(Box::new(sftp::SftpServer::connect(url, opts)?)),
        Scheme::Ftp | Scheme::Ftps => Ok(Box::new(ftp::FtpServer::connect(url, opts)?)),
    }
}

/// `connect` with exponential backoff on transient failures.
pub fn connect_with_retry(
    url: &RemoteUrl,
    opts: &ConnectOptions,
    attempts: usize,
) -> DeployResult<Box<dyn Server + Send>> {
    let mut delay = Duration::from_secs(1);
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match connect(url, opts) {
            Ok(server) => return Ok(server),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    attempt,
                    attempts,
                    delay_secs = delay.as_secs(),
                    "connect failed, retrying: {e}"
                );
                std::thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_secs(30));
            }
            Err(e) => return Err(e),
        }
    }
    Err(DeployError::Connection("connect attempts exhausted".into()))
}
