//! SFTP driver over ssh2.
//!
//! Authentication order: explicit password when the URL carries one,
//! otherwise the local SSH agent. `execute` runs over a fresh channel
//! session per command. Renames use the POSIX atomic-overwrite rename
//! where the server supports it, with a remove-then-rename fallback.

use crate::progress::copy_with_progress;
use crate::{ConnectOptions, ProgressFn, Server};
use berth_core::error::{DeployError, DeployResult};
use berth_core::paths::join_under_base;
use berth_core::remote::RemoteUrl;
use ssh2::{ErrorCode, FileStat, OpenFlags, OpenType, RenameFlags, Session, Sftp};
use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// SSH_FX_NO_SUCH_FILE from the sftp protocol
const FX_NO_SUCH_FILE: i32 = 2;

pub struct SftpServer {
    session: Session,
    sftp: Sftp,
    base: String,
    file_permissions: Option<u32>,
    dir_permissions: Option<u32>,
}

fn is_missing(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::SFTP(FX_NO_SUCH_FILE))
}

fn transport(op: &str, rel: &str, err: ssh2::Error) -> DeployError {
    DeployError::Transport(format!("sftp {op} {rel}: {err}"))
}

impl SftpServer {
    pub fn connect(url: &RemoteUrl, opts: &ConnectOptions) -> DeployResult<Self> {
        let user = url.user.as_deref().ok_or_else(|| {
            DeployError::Connection("sftp URL is missing a user".to_string())
        })?;

        let tcp = TcpStream::connect((url.host.as_str(), url.port)).map_err(|e| {
            DeployError::Connection(format!("cannot reach {}:{}: {e}", url.host, url.port))
        })?;
        let mut session = Session::new()
            .map_err(|e| DeployError::Connection(format!("ssh session init: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| DeployError::Connection(format!("ssh handshake: {e}")))?;

        if let Some(password) = &url.password {
            session
                .userauth_password(user, password)
                .map_err(|e| DeployError::Connection(format!("password auth for {user}: {e}")))?;
        } else {
            session
                .userauth_agent(user)
                .map_err(|e| DeployError::Connection(format!("agent auth for {user}: {e}")))?;
        }
        if !session.authenticated() {
            return Err(DeployError::Connection(format!(
                "authentication for {user}@{} did not complete",
                url.host
            )));
        }

        let sftp = session
            .sftp()
            .map_err(|e| DeployError::Connection(format!("opening sftp subsystem: {e}")))?;
        debug!(host = %url.host, user, "sftp session established");

        Ok(SftpServer {
            session,
            sftp,
            base: url.path.clone(),
            file_permissions: opts.file_permissions,
            dir_permissions: opts.dir_permissions,
        })
    }

    fn abs(&self, rel: &str) -> PathBuf {
        PathBuf::from(join_under_base(&self.base, rel))
    }

    fn setstat_mode(&self, path: &Path, mode: u32) -> Result<(), ssh2::Error> {
        self.sftp.setstat(
            path,
            FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode),
                atime: None,
                mtime: None,
            },
        )
    }

    fn remove_tree(&self, path: &Path) -> DeployResult<()> {
        let rel = path.display().to_string();
        let entries = match self.sftp.readdir(path) {
            Ok(e) => e,
            Err(e) if is_missing(&e) => return Ok(()),
            Err(e) => return Err(transport("readdir", &rel, e)),
        };
        for (child, stat) in entries {
            if stat.is_dir() {
                self.remove_tree(&child)?;
            } else {
                self.sftp
                    .unlink(&child)
                    .map_err(|e| transport("unlink", &child.display().to_string(), e))?;
            }
        }
        self.sftp
            .rmdir(path)
            .map_err(|e| transport("rmdir", &rel, e))
    }
}

impl Server for SftpServer {
    fn read_file(&mut self, rel: &str, local_abs: &Path) -> DeployResult<()> {
        let remote = self.abs(rel);
        let mut src = match self.sftp.open(&remote) {
            Ok(f) => f,
            Err(e) if is_missing(&e) => return Err(DeployError::NotFound(rel.to_string())),
            Err(e) => return Err(transport("open", rel, e)),
        };
        let mut dst = std::fs::File::create(local_abs)?;
        std::io::copy(&mut src, &mut dst)
            .map_err(|e| DeployError::Transport(format!("sftp download {rel}: {e}")))?;
        Ok(())
    }

    fn write_file(
        &mut self,
        local_abs: &Path,
        rel: &str,
        progress: Option<&ProgressFn>,
    ) -> DeployResult<()> {
        let remote = self.abs(rel);
        let mut src = std::fs::File::open(local_abs)?;
        let total = src.metadata()?.len();
        let mut dst = self
            .sftp
            .open_mode(
                &remote,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                self.file_permissions.unwrap_or(0o644) as i32,
                OpenType::File,
            )
            .map_err(|e| transport("create", rel, e))?;
        copy_with_progress(&mut src, &mut dst, total, progress)
            .map_err(|e| DeployError::Transport(format!("sftp upload {rel}: {e}")))?;
        drop(dst);
        if let Some(mode) = self.file_permissions {
            // open_mode honors the umask; enforce the exact mode
            self.setstat_mode(&remote, mode)
                .map_err(|e| transport("chmod", rel, e))?;
        }
        Ok(())
    }

    fn rename_file(&mut self, old_rel: &str, new_rel: &str) -> DeployResult<()> {
        let old = self.abs(old_rel);
        let new = self.abs(new_rel);
        let prior_mode = self.sftp.stat(&new).ok().and_then(|s| s.perm);

        let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
        if let Err(first) = self.sftp.rename(&old, &new, Some(flags)) {
            // Servers without posix-rename: replace by hand.
            debug!(old = old_rel, new = new_rel, "atomic rename refused ({first}), falling back");
            if let Err(e) = self.sftp.unlink(&new) {
                if !is_missing(&e) {
                    return Err(transport("unlink", new_rel, e));
                }
            }
            self.sftp
                .rename(&old, &new, None)
                .map_err(|e| transport("rename", new_rel, e))?;
        }
        if let Some(mode) = prior_mode {
            if let Err(e) = self.setstat_mode(&new, mode) {
                warn!(rel = new_rel, "could not restore permissions: {e}");
            }
        }
        Ok(())
    }

    fn remove_file(&mut self, rel: &str) -> DeployResult<()> {
        match self.sftp.unlink(&self.abs(rel)) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(transport("unlink", rel, e)),
        }
    }

    fn create_dir(&mut self, rel: &str) -> DeployResult<()> {
        // Recursive: create each missing component from the base down.
        let mode = self.dir_permissions.unwrap_or(0o755) as i32;
        let mut partial = String::new();
        for comp in rel.split('/').filter(|c| !c.is_empty()) {
            partial.push('/');
            partial.push_str(comp);
            let path = self.abs(&partial);
            if self.sftp.stat(&path).is_ok() {
                continue;
            }
            match self.sftp.mkdir(&path, mode) {
                Ok(()) => {
                    if let Some(m) = self.dir_permissions {
                        let _ = self.setstat_mode(&path, m);
                    }
                }
                // A sibling worker may have created it between stat and mkdir.
                Err(_) if self.sftp.stat(&path).is_ok() => {}
                Err(e) => return Err(transport("mkdir", &partial, e)),
            }
        }
        Ok(())
    }

    fn remove_dir(&mut self, rel: &str) -> DeployResult<()> {
        match self.sftp.rmdir(&self.abs(rel)) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(transport("rmdir", rel, e)),
        }
    }

    fn purge(&mut self, rel: &str, progress: Option<&ProgressFn>) -> DeployResult<()> {
        let dir = self.abs(rel);
        let entries = match self.sftp.readdir(&dir) {
            Ok(e) => e,
            Err(e) if is_missing(&e) => return Ok(()),
            Err(e) => return Err(transport("readdir", rel, e)),
        };

        // Stage children under unique names before deleting anything.
        let mut staged = Vec::new();
        for (i, (child, stat)) in entries.into_iter().enumerate() {
            let name = child
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let tmp = dir.join(format!(".{name}.purge{i}"));
            match self.sftp.rename(&child, &tmp, None) {
                Ok(()) => staged.push((tmp, stat)),
                Err(_) => staged.push((child, stat)),
            }
        }
        let total = staged.len();
        for (i, (path, stat)) in staged.into_iter().enumerate() {
            if stat.is_dir() {
                self.remove_tree(&path)?;
            } else {
                match self.sftp.unlink(&path) {
                    Ok(()) => {}
                    Err(e) if is_missing(&e) => {}
                    Err(e) => return Err(transport("unlink", &path.display().to_string(), e)),
                }
            }
            if let Some(cb) = progress {
                cb((((i + 1) * 100) / total.max(1)) as u8);
            }
        }
        Ok(())
    }

    fn chmod(&mut self, rel: &str, mode: u32) -> DeployResult<()> {
        self.setstat_mode(&self.abs(rel), mode)
            .map_err(|e| transport("chmod", rel, e))
    }

    fn base_dir(&self) -> &str {
        &self.base
    }

    fn execute(&mut self, cmd: &str) -> DeployResult<String> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| DeployError::Transport(format!("exec channel: {e}")))?;
        channel
            .exec(cmd)
            .map_err(|e| DeployError::Transport(format!("exec `{cmd}`: {e}")))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| DeployError::Transport(format!("exec `{cmd}` stdout: {e}")))?;
        let mut stderr = String::new();
        let _ = channel.stderr().read_to_string(&mut stderr);

        channel
            .wait_close()
            .map_err(|e| DeployError::Transport(format!("exec `{cmd}` close: {e}")))?;
        let status = channel
            .exit_status()
            .map_err(|e| DeployError::Transport(format!("exec `{cmd}` status: {e}")))?;
        if status != 0 {
            return Err(DeployError::Transport(format!(
                "`{cmd}` exited with {status}: {}",
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}
