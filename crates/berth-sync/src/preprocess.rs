//! Preprocessing pipeline: selected files are transformed into a cached
//! temp representation used for both hashing and upload, so the manifest
//! and the wire bytes always agree.
//!
//! `*.js` and `*.css` are compacted (comment stripping plus whitespace
//! collapsing); any other configured mask gets an identity copy.

use berth_core::error::{DeployError, DeployResult};
use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct Preprocessor {
    masks: Vec<Pattern>,
    temp_root: PathBuf,
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

impl Preprocessor {
    pub fn new(masks: &[String], temp_root: &Path) -> DeployResult<Self> {
        let masks = masks
            .iter()
            .map(|m| {
                Pattern::new(m).map_err(|e| DeployError::Config(format!(
                    "invalid preprocess mask `{m}`: {e}"
                )))
            })
            .collect::<DeployResult<Vec<_>>>()?;
        Ok(Preprocessor {
            masks,
            temp_root: temp_root.to_path_buf(),
        })
    }

    /// Whether `rel` is selected for preprocessing.
    pub fn selects(&self, rel: &str) -> bool {
        let stripped = rel.strip_prefix('/').unwrap_or(rel);
        let name = stripped.rsplit('/').next().unwrap_or(stripped);
        self.masks.iter().any(|m| {
            let target = if m.as_str().contains('/') { stripped } else { name };
            m.matches_with(target, match_options())
        })
    }

    /// Materialize the wire representation of `rel` under the temp root
    /// and return its path, or `None` when the file is not selected and
    /// the original bytes go over the wire unchanged.
    pub fn materialize(&self, rel: &str, abs: &Path) -> DeployResult<Option<PathBuf>> {
        if !self.selects(rel) {
            return Ok(None);
        }
        let out = self.temp_root.join(rel.trim_start_matches('/'));
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let ext = rel.rsplit('.').next().unwrap_or("");
        match ext {
            "js" => {
                let src = std::fs::read_to_string(abs)?;
                std::fs::write(&out, compact_js(&src))?;
            }
            "css" => {
                let src = std::fs::read_to_string(abs)?;
                std::fs::write(&out, compact_css(&src))?;
            }
            _ => {
                std::fs::copy(abs, &out)?;
            }
        }
        debug!(rel, out = %out.display(), "preprocessed");
        Ok(Some(out))
    }

    /// Drop the whole temp tree. Best-effort: survivors are removed by
    /// the next run's `reset`.
    pub fn cleanup(&self) {
        if self.temp_root.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.temp_root) {
                warn!(dir = %self.temp_root.display(), "temp cleanup failed: {e}");
            }
        }
    }

    /// Clear leftovers from a crashed predecessor and start fresh.
    pub fn reset(&self) -> DeployResult<()> {
        self.cleanup();
        std::fs::create_dir_all(&self.temp_root)?;
        Ok(())
    }
}

// ── compactors ─────────────────────────────────────────────────────────────

/// Strip `//` and `/* */` comments and collapse whitespace runs.
/// String and template literals pass through untouched; a newline in a
/// collapsed run survives as `\n` so semicolon insertion is not broken.
pub fn compact_js(src: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        LineComment,
        BlockComment,
        Str(char),
    }
    let mut out = String::with_capacity(src.len());
    let mut state = State::Code;
    let mut escaped = false;
    let mut ws_pending = false;
    let mut ws_has_newline = false;
    let mut chars = src.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                }
                '"' | '\'' | '`' => {
                    flush_ws(&mut out, &mut ws_pending, &mut ws_has_newline);
                    out.push(c);
                    state = State::Str(c);
                }
                c if c.is_whitespace() => {
                    ws_pending = true;
                    if c == '\n' {
                        ws_has_newline = true;
                    }
                }
                c => {
                    flush_ws(&mut out, &mut ws_pending, &mut ws_has_newline);
                    out.push(c);
                }
            },
            State::LineComment => {
                if c == '\n' {
                    ws_pending = true;
                    ws_has_newline = true;
                    state = State::Code;
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    ws_pending = true;
                    state = State::Code;
                }
            }
            State::Str(quote) => {
                out.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == quote {
                    state = State::Code;
                }
            }
        }
    }
    out
}

/// Strip `/* */` comments and collapse whitespace runs to single spaces.
pub fn compact_css(src: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        Comment,
        Str(char),
    }
    let mut out = String::with_capacity(src.len());
    let mut state = State::Code;
    let mut ws_pending = false;
    let mut chars = src.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::Comment;
                }
                '"' | '\'' => {
                    if ws_pending {
                        push_space(&mut out);
                        ws_pending = false;
                    }
                    out.push(c);
                    state = State::Str(c);
                }
                c if c.is_whitespace() => ws_pending = true,
                c => {
                    // whitespace adjacent to structural punctuation is dead
                    if ws_pending && !matches!(c, '{' | '}' | ';' | ',') {
                        push_space(&mut out);
                    }
                    ws_pending = false;
                    out.push(c);
                }
            },
            State::Comment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                }
            }
            State::Str(quote) => {
                out.push(c);
                if c == quote {
                    state = State::Code;
                }
            }
        }
    }
    out.trim().to_string()
}

fn flush_ws(out: &mut String, pending: &mut bool, has_newline: &mut bool) {
    if *pending && !out.is_empty() {
        out.push(if *has_newline { '\n' } else { ' ' });
    }
    *pending = false;
    *has_newline = false;
}

fn push_space(out: &mut String) {
    if !out.is_empty() && !out.ends_with([' ', '{', '}', ';', ',']) {
        out.push(' ');
    }
}
