//! Local tree scanner: walks the deployment root through the path
//! filter and produces the hashed local manifest.

use crate::hash::hash_file;
use crate::manifest::{Manifest, DIR_SENTINEL};
use crate::preprocess::Preprocessor;
use berth_core::error::{DeployError, DeployResult};
use berth_filter::PathFilter;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffix reserved for staged uploads; local files carrying it are
/// skipped so they can never collide with staging names on the server.
pub const STAGING_SUFFIX: &str = ".deploytmp";

/// One local path participating in the run.
#[derive(Debug, Clone)]
pub struct LocalFile {
    /// `/`-rooted POSIX relative path (the manifest key).
    pub rel: String,
    /// Source path under the local root.
    pub abs: PathBuf,
    /// Bytes that actually go over the wire: the preprocessed temp file
    /// when the path matches a preprocess mask, `abs` otherwise.
    pub upload_abs: PathBuf,
    pub size: u64,
    pub is_dir: bool,
}

/// Walk `root`, apply the filter, preprocess and hash every surviving
/// file, and return the local manifest plus the file records.
pub fn scan_and_hash(
    root: &Path,
    filter: &PathFilter,
    preprocessor: &Preprocessor,
) -> DeployResult<(Manifest, Vec<LocalFile>)> {
    if !root.is_dir() {
        return Err(DeployError::Config(format!(
            "local root `{}` is not a directory",
            root.display()
        )));
    }
    let mut entries = Vec::new();
    walk(root, "", filter, &mut entries)?;
    entries.sort_by(|a, b| a.rel.cmp(&b.rel));

    let mut manifest = Manifest::new();
    let mut files = Vec::with_capacity(entries.len());
    for mut entry in entries {
        if entry.is_dir {
            manifest.insert(entry.rel.clone(), DIR_SENTINEL);
        } else {
            if let Some(materialized) = preprocessor.materialize(&entry.rel, &entry.abs)? {
                entry.size = std::fs::metadata(&materialized)?.len();
                entry.upload_abs = materialized;
            }
            let hash = hash_file(&entry.upload_abs)?;
            manifest.insert(entry.rel.clone(), hash);
        }
        files.push(entry);
    }
    debug!(
        files = files.iter().filter(|f| !f.is_dir).count(),
        dirs = files.iter().filter(|f| f.is_dir).count(),
        "local tree scanned"
    );
    Ok((manifest, files))
}

fn walk(
    dir: &Path,
    rel_prefix: &str,
    filter: &PathFilter,
    out: &mut Vec<LocalFile>,
) -> DeployResult<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| DeployError::Config(format!("cannot read `{}`: {e}", dir.display())))?
        .collect::<Result<_, _>>()?;
    children.sort_by_key(std::fs::DirEntry::file_name);

    for child in children {
        let name = match child.file_name().into_string() {
            Ok(n) => n,
            Err(raw) => {
                return Err(DeployError::Config(format!(
                    "non-UTF-8 file name under `{}`: {raw:?}",
                    dir.display()
                )))
            }
        };
        if name.ends_with(STAGING_SUFFIX) {
            continue;
        }
        let rel = format!("{rel_prefix}/{name}");
        let meta = child.metadata()?;

        if meta.is_dir() {
            if filter.prune_dir(&rel) {
                continue;
            }
            if filter.accepts(&rel, true) {
                out.push(LocalFile {
                    rel: rel.clone(),
                    abs: child.path(),
                    upload_abs: child.path(),
                    size: 0,
                    is_dir: true,
                });
            }
            // over-descend: an unmatched or even rejected directory can
            // still hold re-included descendants
            walk(&child.path(), &rel, filter, out)?;
        } else if meta.is_file() && filter.accepts(&rel, false) {
            out.push(LocalFile {
                rel,
                abs: child.path(),
                upload_abs: child.path(),
                size: meta.len(),
                is_dir: false,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tree(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        dir
    }

    fn plain_preprocessor(temp: &tempfile::TempDir) -> Preprocessor {
        Preprocessor::new(&[], temp.path()).unwrap()
    }

    #[test]
    fn scan_builds_sorted_manifest_with_dir_sentinels() {
        let tree = make_tree(&[("b.txt", "B"), ("sub/a.txt", "A")]);
        let temp = tempfile::tempdir().unwrap();
        let filter = PathFilter::new(&[], &[]).unwrap();
        let (manifest, files) =
            scan_and_hash(tree.path(), &filter, &plain_preprocessor(&temp)).unwrap();

        let paths: Vec<&str> = manifest.paths().collect();
        assert_eq!(paths, vec!["/b.txt", "/sub", "/sub/a.txt"]);
        assert_eq!(manifest.get("/sub"), Some(DIR_SENTINEL));
        assert_eq!(files.len(), 3);
        assert!(files.iter().all(|f| f.rel.starts_with('/')));
    }

    #[test]
    fn identical_content_hashes_equal_across_names() {
        let tree = make_tree(&[("x.txt", "same"), ("y.txt", "same"), ("z.txt", "other")]);
        let temp = tempfile::tempdir().unwrap();
        let filter = PathFilter::new(&[], &[]).unwrap();
        let (manifest, _) =
            scan_and_hash(tree.path(), &filter, &plain_preprocessor(&temp)).unwrap();
        assert_eq!(manifest.get("/x.txt"), manifest.get("/y.txt"));
        assert_ne!(manifest.get("/x.txt"), manifest.get("/z.txt"));
    }

    #[test]
    fn filter_excludes_and_prunes() {
        let tree = make_tree(&[
            ("keep.php", "k"),
            (".git/config", "g"),
            ("logs/a.log", "l"),
            ("logs/.htaccess", "h"),
        ]);
        let temp = tempfile::tempdir().unwrap();
        let filter = PathFilter::new(
            &[],
            &[".git/".to_string(), "logs/*".to_string(), "!.htaccess".to_string()],
        )
        .unwrap();
        let (manifest, _) =
            scan_and_hash(tree.path(), &filter, &plain_preprocessor(&temp)).unwrap();
        assert!(manifest.contains("/keep.php"));
        assert!(!manifest.contains("/.git/config"));
        assert!(!manifest.contains("/logs/a.log"));
        assert!(manifest.contains("/logs/.htaccess"));
    }

    #[test]
    fn preprocessed_hash_covers_wire_bytes() {
        let tree = make_tree(&[("app.js", "var a = 1; // comment\n")]);
        let temp = tempfile::tempdir().unwrap();
        let filter = PathFilter::new(&[], &[]).unwrap();
        let pp = Preprocessor::new(&["*.js".to_string()], temp.path()).unwrap();
        pp.reset().unwrap();

        let (manifest, files) = scan_and_hash(tree.path(), &filter, &pp).unwrap();
        let file = files.iter().find(|f| f.rel == "/app.js").unwrap();
        assert_ne!(file.upload_abs, file.abs);
        assert_eq!(
            manifest.get("/app.js").unwrap(),
            crate::hash::hash_file(&file.upload_abs).unwrap()
        );
        // and the wire bytes differ from the source bytes
        assert_ne!(
            crate::hash::hash_file(&file.abs).unwrap(),
            manifest.get("/app.js").unwrap()
        );
    }

    #[test]
    fn staging_suffix_files_are_skipped() {
        let tree = make_tree(&[("real.txt", "r"), ("real.txt.deploytmp", "stale")]);
        let temp = tempfile::tempdir().unwrap();
        let filter = PathFilter::new(&[], &[]).unwrap();
        let (manifest, _) =
            scan_and_hash(tree.path(), &filter, &plain_preprocessor(&temp)).unwrap();
        assert!(manifest.contains("/real.txt"));
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn missing_root_is_a_config_error() {
        let temp = tempfile::tempdir().unwrap();
        let filter = PathFilter::new(&[], &[]).unwrap();
        let err = scan_and_hash(
            Path::new("/nonexistent-root-for-berth-test"),
            &filter,
            &plain_preprocessor(&temp),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
