//! Hook job execution.
//!
//! `local:` shells spawn with the inherited environment and the local
//! root as working directory; `remote:` shells delegate to the server's
//! exec channel; bare URLs are HTTP GETs where any 2xx is success;
//! `upload:` jobs push one local file through the regular write path.

use berth_core::error::{DeployError, DeployResult};
use berth_core::job::Job;
use berth_core::paths::normalize_rel;
use berth_server::Server;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

fn hook_err(job: &Job, detail: impl Into<String>) -> DeployError {
    DeployError::Hook {
        job: job.label(),
        detail: detail.into(),
    }
}

/// Run one job, returning its captured output on success.
pub fn run_job(
    job: &Job,
    local_root: &Path,
    server: &mut dyn Server,
) -> DeployResult<String> {
    info!(job = %job.label(), "running hook");
    match job {
        Job::LocalShell { cmd } => {
            let output = shell_command(cmd)
                .current_dir(local_root)
                .output()
                .map_err(|e| hook_err(job, format!("spawn failed: {e}")))?;
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(hook_err(
                    job,
                    format!("{} — {}", output.status, stderr.trim()),
                ));
            }
            debug!(job = %job.label(), "local shell ok");
            Ok(stdout)
        }
        Job::RemoteShell { cmd } => server
            .execute(cmd)
            .map_err(|e| hook_err(job, e.to_string())),
        Job::HttpGet { url } => {
            let response = reqwest::blocking::get(url)
                .map_err(|e| hook_err(job, format!("request failed: {e}")))?;
            let status = response.status();
            let body = response.text().unwrap_or_default();
            if !status.is_success() {
                return Err(hook_err(job, format!("HTTP {status}")));
            }
            Ok(body)
        }
        Job::UploadCopy { src, dst } => {
            let dst_rel = normalize_rel(dst)?;
            let src_abs = local_root.join(src.trim_start_matches('/'));
            if !src_abs.is_file() {
                return Err(hook_err(
                    job,
                    format!("source `{}` does not exist", src_abs.display()),
                ));
            }
            server
                .write_file(&src_abs, &dst_rel, None)
                .map_err(|e| hook_err(job, e.to_string()))?;
            Ok(String::new())
        }
    }
}

#[cfg(unix)]
fn shell_command(cmd: &str) -> Command {
    let mut c = Command::new("sh");
    c.arg("-c").arg(cmd);
    c
}

#[cfg(windows)]
fn shell_command(cmd: &str) -> Command {
    let mut c = Command::new("cmd");
    c.arg("/C").arg(cmd);
    c
}
