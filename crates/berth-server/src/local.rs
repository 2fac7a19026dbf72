//! Local filesystem driver for `file://` targets.
//!
//! Deploying onto a mounted volume goes through the same staged-upload
//! and rename dance as the network drivers, so the atomicity story is
//! identical. `execute` is unsupported here.

use crate::progress::copy_with_progress;
use crate::{ConnectOptions, ProgressFn, Server};
use berth_core::error::{DeployError, DeployResult};
use berth_core::remote::RemoteUrl;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct LocalServer {
    base: PathBuf,
    base_str: String,
    file_permissions: Option<u32>,
    dir_permissions: Option<u32>,
}

impl LocalServer {
    pub fn connect(url: &RemoteUrl, opts: &ConnectOptions) -> DeployResult<Self> {
        let base = PathBuf::from(&url.path);
        fs::create_dir_all(&base).map_err(|e| {
            DeployError::Connection(format!("cannot open target dir {}: {e}", base.display()))
        })?;
        debug!(base = %base.display(), "local target ready");
        Ok(LocalServer {
            base,
            base_str: url.path.clone(),
            file_permissions: opts.file_permissions,
            dir_permissions: opts.dir_permissions,
        })
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.base.join(rel.trim_start_matches('/'))
    }

    fn purge_entry(&self, path: &Path) -> DeployResult<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(DeployError::Transport(e.to_string())),
        };
        let res = if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        res.map_err(|e| DeployError::Transport(format!("purge {}: {e}", path.display())))
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn get_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode())
}

#[cfg(not(unix))]
fn get_mode(_path: &Path) -> Option<u32> {
    None
}

impl Server for LocalServer {
    fn read_file(&mut self, rel: &str, local_abs: &Path) -> DeployResult<()> {
        let src = self.abs(rel);
        match fs::copy(&src, local_abs) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(DeployError::NotFound(rel.to_string()))
            }
            Err(e) => Err(DeployError::Transport(format!("read {rel}: {e}"))),
        }
    }

    fn write_file(
        &mut self,
        local_abs: &Path,
        rel: &str,
        progress: Option<&ProgressFn>,
    ) -> DeployResult<()> {
        let dst = self.abs(rel);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DeployError::Transport(format!("mkdir for {rel}: {e}")))?;
        }
        let mut src = fs::File::open(local_abs)?;
        let total = src.metadata()?.len();
        let mut out = fs::File::create(&dst)
            .map_err(|e| DeployError::Transport(format!("create {rel}: {e}")))?;
        copy_with_progress(&mut src, &mut out, total, progress)
            .map_err(|e| DeployError::Transport(format!("write {rel}: {e}")))?;
        if let Some(mode) = self.file_permissions {
            set_mode(&dst, mode)
                .map_err(|e| DeployError::Transport(format!("chmod {rel}: {e}")))?;
        }
        Ok(())
    }

    fn rename_file(&mut self, old_rel: &str, new_rel: &str) -> DeployResult<()> {
        let old = self.abs(old_rel);
        let new = self.abs(new_rel);
        let prior_mode = get_mode(&new);
        fs::rename(&old, &new)
            .map_err(|e| DeployError::Transport(format!("rename {old_rel} -> {new_rel}: {e}")))?;
        if let Some(mode) = prior_mode {
            let _ = set_mode(&new, mode);
        }
        Ok(())
    }

    fn remove_file(&mut self, rel: &str) -> DeployResult<()> {
        match fs::remove_file(self.abs(rel)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DeployError::Transport(format!("remove {rel}: {e}"))),
        }
    }

    fn create_dir(&mut self, rel: &str) -> DeployResult<()> {
        let dir = self.abs(rel);
        let existed = dir.is_dir();
        fs::create_dir_all(&dir)
            .map_err(|e| DeployError::Transport(format!("mkdir {rel}: {e}")))?;
        if !existed {
            if let Some(mode) = self.dir_permissions {
                let _ = set_mode(&dir, mode);
            }
        }
        Ok(())
    }

    fn remove_dir(&mut self, rel: &str) -> DeployResult<()> {
        match fs::remove_dir(self.abs(rel)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DeployError::Transport(format!("rmdir {rel}: {e}"))),
        }
    }

    fn purge(&mut self, rel: &str, progress: Option<&ProgressFn>) -> DeployResult<()> {
        let dir = self.abs(rel);
        let entries = match fs::read_dir(&dir) {
            Ok(it) => it.collect::<Result<Vec<_>, _>>().map_err(|e| {
                DeployError::Transport(format!("list {rel}: {e}"))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(DeployError::Transport(format!("list {rel}: {e}"))),
        };

        // Stage children away first so a failure mid-purge never leaves a
        // half-emptied directory under its user-visible names.
        let mut staged = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let from = entry.path();
            let to = dir.join(format!(
                ".{}.purge{}",
                entry.file_name().to_string_lossy(),
                i
            ));
            match fs::rename(&from, &to) {
                Ok(()) => staged.push(to),
                Err(_) => staged.push(from),
            }
        }
        let total = staged.len();
        for (i, path) in staged.iter().enumerate() {
            self.purge_entry(path)?;
            if let Some(cb) = progress {
                cb((((i + 1) * 100) / total.max(1)) as u8);
            }
        }
        Ok(())
    }

    fn chmod(&mut self, rel: &str, mode: u32) -> DeployResult<()> {
        set_mode(&self.abs(rel), mode)
            .map_err(|e| DeployError::Transport(format!("chmod {rel}: {e}")))
    }

    fn base_dir(&self) -> &str {
        &self.base_str
    }

    fn execute(&mut self, _cmd: &str) -> DeployResult<String> {
        Err(DeployError::Unsupported("shell execution on file:// target"))
    }
}
