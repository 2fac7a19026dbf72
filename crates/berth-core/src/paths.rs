//! Relative-path normalization for the deployment wire form.
//!
//! Every path that crosses the Server boundary or appears in a manifest
//! is a POSIX-style path rooted at `/` with no `.` or `..` components.

use crate::error::{DeployError, DeployResult};

/// Normalize a path fragment into the canonical `/`-rooted wire form.
///
/// Backslashes become `/`, repeated separators collapse, and `.` / `..`
/// components are rejected rather than resolved: a manifest must never
/// address anything outside the deployment base.
pub fn normalize_rel(path: &str) -> DeployResult<String> {
    let unified = path.replace('\\', "/");
    let mut out = String::with_capacity(unified.len() + 1);
    for comp in unified.split('/') {
        match comp {
            "" => continue,
            "." | ".." => {
                return Err(DeployError::Config(format!(
                    "path `{path}` contains a `{comp}` component"
                )))
            }
            c => {
                out.push('/');
                out.push_str(c);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Join a `/`-rooted relative path onto a server base directory.
pub fn join_under_base(base: &str, rel: &str) -> String {
    let base = base.trim_end_matches('/');
    if rel == "/" {
        if base.is_empty() {
            return "/".to_string();
        }
        return base.to_string();
    }
    format!("{base}{rel}")
}

/// Parent of a `/`-rooted relative path, or `None` at the root.
pub fn parent_rel(rel: &str) -> Option<&str> {
    let idx = rel.rfind('/')?;
    match idx {
        0 if rel.len() == 1 => None,
        0 => Some("/"),
        _ => Some(&rel[..idx]),
    }
}
