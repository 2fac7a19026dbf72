//! Hook job descriptors.
//!
//! Jobs appear in the `before[]`, `afterUpload[]` and `after[]` config
//! lists. The textual form uses a prefix to pick the variant:
//! `local:` and `remote:` shell commands, `upload:` copy-from-local,
//! and a bare `http://` / `https://` URL for an HTTP GET.

use crate::error::{DeployError, DeployResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    LocalShell { cmd: String },
    RemoteShell { cmd: String },
    HttpGet { url: String },
    UploadCopy { src: String, dst: String },
}

impl Job {
    pub fn parse(raw: &str) -> DeployResult<Job> {
        let raw = raw.trim();
        if let Some(cmd) = raw.strip_prefix("local:") {
            return Ok(Job::LocalShell {
                cmd: cmd.trim().to_string(),
            });
        }
        if let Some(cmd) = raw.strip_prefix("remote:") {
            return Ok(Job::RemoteShell {
                cmd: cmd.trim().to_string(),
            });
        }
        if let Some(spec) = raw.strip_prefix("upload:") {
            let mut parts = spec.split_whitespace();
            let (src, dst) = match (parts.next(), parts.next(), parts.next()) {
                (Some(src), Some(dst), None) => (src, dst),
                _ => {
                    return Err(DeployError::Config(format!(
                        "upload job needs exactly `srcRel dstRel`: `{raw}`"
                    )))
                }
            };
            return Ok(Job::UploadCopy {
                src: src.to_string(),
                dst: dst.to_string(),
            });
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(Job::HttpGet {
                url: raw.to_string(),
            });
        }
        Err(DeployError::Config(format!(
            "unrecognized job `{raw}` (expected local:, remote:, upload: or an http(s) URL)"
        )))
    }

    /// Jobs marked `local:` run even when a deployment short-circuits on
    /// an empty diff, and in test mode.
    pub fn is_local(&self) -> bool {
        matches!(self, Job::LocalShell { .. })
    }

    /// Identity used in hook failure reports and logs.
    pub fn label(&self) -> String {
        match self {
            Job::LocalShell { cmd } => format!("local: {cmd}"),
            Job::RemoteShell { cmd } => format!("remote: {cmd}"),
            Job::HttpGet { url } => url.clone(),
            Job::UploadCopy { src, dst } => format!("upload: {src} {dst}"),
        }
    }
}
