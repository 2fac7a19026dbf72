//! FTP and FTPS driver over suppaftp.
//!
//! FTPS upgrades the control connection with native-tls right after
//! connect, before credentials are sent. FTP has no portable way to stat
//! permissions, so `rename_file` cannot preserve the replaced target's
//! mode here; `chmod` goes through `SITE CHMOD` and is best-effort.

use crate::progress::copy_with_progress;
use crate::{ConnectOptions, ProgressFn, Server};
use berth_core::error::{DeployError, DeployResult};
use berth_core::paths::join_under_base;
use berth_core::remote::{RemoteUrl, Scheme};
use std::path::Path;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{FtpError, Mode, NativeTlsConnector, NativeTlsFtpStream, Status};
use tracing::{debug, warn};

pub struct FtpServer {
    stream: NativeTlsFtpStream,
    base: String,
    file_permissions: Option<u32>,
    dir_permissions: Option<u32>,
}

fn is_missing(err: &FtpError) -> bool {
    matches!(
        err,
        FtpError::UnexpectedResponse(resp) if resp.status == Status::FileUnavailable
    )
}

fn transport(op: &str, rel: &str, err: FtpError) -> DeployError {
    DeployError::Transport(format!("ftp {op} {rel}: {err}"))
}

impl FtpServer {
    pub fn connect(url: &RemoteUrl, opts: &ConnectOptions) -> DeployResult<Self> {
        let addr = format!("{}:{}", url.host, url.port);
        let mut stream = NativeTlsFtpStream::connect(&addr)
            .map_err(|e| DeployError::Connection(format!("cannot reach {addr}: {e}")))?;

        if url.scheme == Scheme::Ftps {
            let tls = TlsConnector::new()
                .map_err(|e| DeployError::Connection(format!("tls init: {e}")))?;
            stream = stream
                .into_secure(NativeTlsConnector::from(tls), &url.host)
                .map_err(|e| DeployError::Connection(format!("ftps negotiation: {e}")))?;
        }

        let user = url.user.as_deref().unwrap_or("anonymous");
        let password = url.password.as_deref().unwrap_or("");
        stream
            .login(user, password)
            .map_err(|e| DeployError::Connection(format!("login as {user}: {e}")))?;

        stream.set_mode(if opts.passive_mode {
            Mode::Passive
        } else {
            Mode::Active
        });
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| DeployError::Connection(format!("binary mode: {e}")))?;
        debug!(host = %url.host, user, passive = opts.passive_mode, "ftp session established");

        Ok(FtpServer {
            stream,
            base: url.path.clone(),
            file_permissions: opts.file_permissions,
            dir_permissions: opts.dir_permissions,
        })
    }

    fn abs(&self, rel: &str) -> String {
        join_under_base(&self.base, rel)
    }

    /// List child names of a directory; servers disagree on whether NLST
    /// returns bare names or full paths, so both are normalized to names.
    fn child_names(&mut self, abs: &str) -> DeployResult<Vec<String>> {
        let raw = match self.stream.nlst(Some(abs)) {
            Ok(v) => v,
            Err(e) if is_missing(&e) => return Ok(Vec::new()),
            Err(e) => return Err(transport("nlst", abs, e)),
        };
        Ok(raw
            .into_iter()
            .filter_map(|entry| {
                let name = entry.rsplit('/').next().unwrap_or(&entry).to_string();
                (!name.is_empty() && name != "." && name != "..").then_some(name)
            })
            .collect())
    }

    /// Delete a path of unknown kind: try as file, fall back to a
    /// recursive directory delete. FTP offers nothing better portably.
    fn remove_any(&mut self, abs: &str) -> DeployResult<()> {
        match self.stream.rm(abs) {
            Ok(()) => return Ok(()),
            Err(e) if is_missing(&e) => {}
            Err(_) => {}
        }
        let children = self.child_names(abs)?;
        for name in children {
            self.remove_any(&format!("{abs}/{name}"))?;
        }
        match self.stream.rmdir(abs) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(transport("rmdir", abs, e)),
        }
    }

    fn site_chmod(&mut self, abs: &str, mode: u32) -> Result<(), FtpError> {
        self.stream
            .site(format!("CHMOD {mode:o} {abs}"))
            .map(|_| ())
    }
}

impl Server for FtpServer {
    fn read_file(&mut self, rel: &str, local_abs: &Path) -> DeployResult<()> {
        let abs = self.abs(rel);
        let mut src = match self.stream.retr_as_stream(&abs) {
            Ok(s) => s,
            Err(e) if is_missing(&e) => return Err(DeployError::NotFound(rel.to_string())),
            Err(e) => return Err(transport("retr", rel, e)),
        };
        let mut dst = std::fs::File::create(local_abs)?;
        let copied = std::io::copy(&mut src, &mut dst)
            .map_err(|e| DeployError::Transport(format!("ftp download {rel}: {e}")));
        self.stream
            .finalize_retr_stream(src)
            .map_err(|e| transport("retr finalize", rel, e))?;
        copied?;
        Ok(())
    }

    fn write_file(
        &mut self,
        local_abs: &Path,
        rel: &str,
        progress: Option<&ProgressFn>,
    ) -> DeployResult<()> {
        let abs = self.abs(rel);
        let mut src = std::fs::File::open(local_abs)?;
        let total = src.metadata()?.len();
        let mut dst = self
            .stream
            .put_with_stream(&abs)
            .map_err(|e| transport("stor", rel, e))?;
        let copied = copy_with_progress(&mut src, &mut dst, total, progress)
            .map_err(|e| DeployError::Transport(format!("ftp upload {rel}: {e}")));
        self.stream
            .finalize_put_stream(dst)
            .map_err(|e| transport("stor finalize", rel, e))?;
        copied?;
        if let Some(mode) = self.file_permissions {
            if let Err(e) = self.site_chmod(&abs, mode) {
                warn!(rel, "SITE CHMOD not honored: {e}");
            }
        }
        Ok(())
    }

    fn rename_file(&mut self, old_rel: &str, new_rel: &str) -> DeployResult<()> {
        let old = self.abs(old_rel);
        let new = self.abs(new_rel);
        // RNTO onto an existing name is server-dependent; clear the
        // target first so the rename is deterministic everywhere.
        match self.stream.rm(&new) {
            Ok(()) => {}
            Err(e) if is_missing(&e) => {}
            Err(e) => return Err(transport("rm", new_rel, e)),
        }
        self.stream
            .rename(&old, &new)
            .map_err(|e| transport("rename", new_rel, e))
    }

    fn remove_file(&mut self, rel: &str) -> DeployResult<()> {
        match self.stream.rm(&self.abs(rel)) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(transport("rm", rel, e)),
        }
    }

    fn create_dir(&mut self, rel: &str) -> DeployResult<()> {
        let mut partial = String::new();
        for comp in rel.split('/').filter(|c| !c.is_empty()) {
            partial.push('/');
            partial.push_str(comp);
            let abs = self.abs(&partial);
            match self.stream.mkdir(&abs) {
                Ok(()) => {
                    if let Some(mode) = self.dir_permissions {
                        if let Err(e) = self.site_chmod(&abs, mode) {
                            warn!(rel = %partial, "SITE CHMOD not honored: {e}");
                        }
                    }
                }
                // most servers answer 550 for an already existing dir
                Err(FtpError::UnexpectedResponse(_)) => {}
                Err(e) => return Err(transport("mkdir", &partial, e)),
            }
        }
        Ok(())
    }

    fn remove_dir(&mut self, rel: &str) -> DeployResult<()> {
        match self.stream.rmdir(&self.abs(rel)) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(transport("rmdir", rel, e)),
        }
    }

    fn purge(&mut self, rel: &str, progress: Option<&ProgressFn>) -> DeployResult<()> {
        let dir = self.abs(rel);
        let children = self.child_names(&dir)?;

        // Stage children under unique names first.
        let mut staged = Vec::new();
        for (i, name) in children.into_iter().enumerate() {
            let from = format!("{dir}/{name}");
            let to = format!("{dir}/.{name}.purge{i}");
            match self.stream.rename(&from, &to) {
                Ok(()) => staged.push(to),
                Err(_) => staged.push(from),
            }
        }
        let total = staged.len();
        for (i, path) in staged.into_iter().enumerate() {
            self.remove_any(&path)?;
            if let Some(cb) = progress {
                cb((((i + 1) * 100) / total.max(1)) as u8);
            }
        }
        Ok(())
    }

    fn chmod(&mut self, rel: &str, mode: u32) -> DeployResult<()> {
        let abs = self.abs(rel);
        if let Err(e) = self.site_chmod(&abs, mode) {
            warn!(rel, "SITE CHMOD not honored: {e}");
        }
        Ok(())
    }

    fn base_dir(&self) -> &str {
        &self.base
    }

    fn execute(&mut self, _cmd: &str) -> DeployResult<String> {
        Err(DeployError::Unsupported("shell execution over FTP"))
    }
}

impl Drop for FtpServer {
    fn drop(&mut self) {
        let _ = self.stream.quit();
    }
}
