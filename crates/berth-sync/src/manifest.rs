//! The deployment manifest: the server-side record of what is live.
//!
//! An ordered mapping of `/`-rooted relative paths to content hashes,
//! persisted on the server as one `<hash> <path>` record per line. A
//! path absent from the manifest does not exist on the server (or is
//! scheduled for deletion). Directory entries carry the sentinel hash
//! `dir` and exist to force directory creation.

use berth_core::error::{DeployError, DeployResult};
use std::collections::BTreeMap;

/// Hash value marking a directory entry.
pub const DIR_SENTINEL: &str = "dir";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, String>,
}

/// Outcome of diffing local against remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Paths whose content differs or that are new on the local side.
    pub to_upload: Vec<String>,
    /// Paths present remotely but gone locally.
    pub to_delete: Vec<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.to_upload.is_empty() && self.to_delete.is_empty()
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rel: impl Into<String>, hash: impl Into<String>) {
        self.entries.insert(rel.into(), hash.into());
    }

    pub fn get(&self, rel: &str) -> Option<&str> {
        self.entries.get(rel).map(String::as_str)
    }

    pub fn contains(&self, rel: &str) -> bool {
        self.entries.contains_key(rel)
    }

    pub fn is_dir(&self, rel: &str) -> bool {
        self.get(rel) == Some(DIR_SENTINEL)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Wire form: `<hash><SP><path><LF>` per entry, sorted by path,
    /// UTF-8 without BOM, trailing newline included.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        for (rel, hash) in &self.entries {
            out.push_str(hash);
            out.push(' ');
            out.push_str(rel);
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Parse the wire form. Blank lines and CRLF endings are tolerated;
    /// anything else malformed aborts with the offending line number.
    pub fn parse(data: &[u8]) -> DeployResult<Manifest> {
        let text = std::str::from_utf8(data).map_err(|e| DeployError::ManifestParse {
            line: 0,
            detail: format!("not valid UTF-8: {e}"),
        })?;
        let mut manifest = Manifest::new();
        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (hash, rel) = line.split_once(' ').ok_or_else(|| DeployError::ManifestParse {
                line: i + 1,
                detail: format!("expected `<hash> <path>`, got `{line}`"),
            })?;
            if hash.is_empty() || !rel.starts_with('/') {
                return Err(DeployError::ManifestParse {
                    line: i + 1,
                    detail: format!("malformed record `{line}`"),
                });
            }
            manifest.insert(rel, hash);
        }
        Ok(manifest)
    }

    /// Compute what must move to make the server match `local`.
    pub fn diff(local: &Manifest, remote: &Manifest, allow_delete: bool) -> Diff {
        let to_upload = local
            .iter()
            .filter(|(rel, hash)| remote.get(rel) != Some(hash))
            .map(|(rel, _)| rel.to_string())
            .collect();
        let to_delete = if allow_delete {
            remote
                .paths()
                .filter(|rel| !local.contains(rel))
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        Diff {
            to_upload,
            to_delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manifest(entries: &[(&str, &str)]) -> Manifest {
        let mut m = Manifest::new();
        for (rel, hash) in entries {
            m.insert(*rel, *hash);
        }
        m
    }

    #[test]
    fn serialize_is_sorted_with_trailing_newline() {
        let m = manifest(&[("/b.txt", "2222"), ("/a.txt", "1111")]);
        let text = String::from_utf8(m.serialize()).unwrap();
        assert_eq!(text, "1111 /a.txt\n2222 /b.txt\n");
    }

    #[test]
    fn parse_tolerates_blank_lines_and_crlf() {
        let m = Manifest::parse(b"aaaa /x\r\n\r\n\nbbbb /y/z\n").unwrap();
        assert_eq!(m.get("/x"), Some("aaaa"));
        assert_eq!(m.get("/y/z"), Some("bbbb"));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        let err = Manifest::parse(b"aaaa /ok\njunk-without-space\n").unwrap_err();
        match err {
            DeployError::ManifestParse { line, .. } => assert_eq!(line, 2),
            other => panic!("expected ManifestParse, got {other:?}"),
        }
        assert!(Manifest::parse(b"aaaa relative/path\n").is_err());
        assert!(Manifest::parse(b" /missing-hash\n").is_err());
        assert!(Manifest::parse(&[0xff, 0xfe, b'\n']).is_err());
    }

    #[test]
    fn diff_splits_upload_and_delete() {
        let local = manifest(&[("/a", "h1"), ("/b", "h2-new")]);
        let remote = manifest(&[("/b", "h2-old"), ("/c", "h3")]);
        let diff = Manifest::diff(&local, &remote, true);
        assert_eq!(diff.to_upload, vec!["/a", "/b"]);
        assert_eq!(diff.to_delete, vec!["/c"]);
    }

    #[test]
    fn delete_guard_empties_to_delete() {
        let local = manifest(&[("/a", "h1")]);
        let remote = manifest(&[("/a", "h1"), ("/gone", "h9")]);
        let diff = Manifest::diff(&local, &remote, false);
        assert!(diff.to_upload.is_empty());
        assert!(diff.to_delete.is_empty());
    }

    #[test]
    fn identical_manifests_have_empty_diff() {
        let m = manifest(&[("/a", "h1"), ("/d", DIR_SENTINEL)]);
        assert!(Manifest::diff(&m, &m, true).is_empty());
    }

    #[test]
    fn dir_sentinel_recognized() {
        let m = manifest(&[("/assets", DIR_SENTINEL), ("/assets/app.js", "h")]);
        assert!(m.is_dir("/assets"));
        assert!(!m.is_dir("/assets/app.js"));
    }

    proptest! {
        #[test]
        fn roundtrip_stable(
            entries in proptest::collection::btree_map(
                "/[a-z]{1,8}(/[a-z]{1,8}){0,2}",
                "[0-9a-f]{8,64}",
                0..20,
            )
        ) {
            let mut m = Manifest::new();
            for (rel, hash) in &entries {
                m.insert(rel.clone(), hash.clone());
            }
            let parsed = Manifest::parse(&m.serialize()).unwrap();
            prop_assert_eq!(parsed, m);
        }
    }
}
