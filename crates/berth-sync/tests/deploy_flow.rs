//! End-to-end deployment runs against a local target directory.
//!
//! Exercises the full phase machine through the `file://` driver plus an
//! error-injecting wrapper for the rollback path: first deploy,
//! idempotent re-run, modify+delete, delete guard, redeploy, test mode,
//! concurrent-lock abort and upload-failure rollback.

use berth_core::config::SiteConfig;
use berth_core::error::{DeployError, DeployResult};
use berth_core::job::Job;
use berth_core::remote::RemoteUrl;
use berth_server::local::LocalServer;
use berth_server::{ConnectOptions, ProgressFn, Server};
use berth_sync::deploy::{DeployOptions, Deployer};
use berth_sync::manifest::Manifest;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const MANIFEST: &str = ".htdeployment";

fn site(local: &Path, remote: &Path, temp: &Path) -> SiteConfig {
    let url = RemoteUrl::parse(&format!("file://{}", remote.display())).unwrap();
    let mut cfg = SiteConfig::defaults("test", url, local.to_path_buf());
    cfg.temp_dir = temp.to_path_buf();
    cfg.preprocess_masks = Vec::new();
    cfg.workers = 2;
    cfg.retries = 1;
    cfg
}

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

fn remote_manifest(remote: &Path) -> Manifest {
    let bytes = std::fs::read(remote.join(MANIFEST)).expect("manifest must exist");
    Manifest::parse(&bytes).expect("manifest must parse")
}

fn deploy(cfg: &SiteConfig, opts: DeployOptions) -> DeployResult<berth_sync::Summary> {
    Deployer::new(cfg, opts).run()
}

// ── scenarios ──────────────────────────────────────────────────────────────

#[test]
fn first_deploy_uploads_and_writes_manifest() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("index.php", "A")]);

    let cfg = site(local.path(), remote.path(), temp.path());
    let summary = deploy(&cfg, DeployOptions::default()).unwrap();

    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.deleted, 0);
    assert_eq!(
        std::fs::read(remote.path().join("index.php")).unwrap(),
        b"A"
    );
    let manifest = remote_manifest(remote.path());
    assert!(manifest.contains("/index.php"));
    // no staging or lock files survive
    assert!(!remote.path().join("index.php.deploytmp").exists());
    assert!(!remote.path().join(format!("{MANIFEST}.running")).exists());
    assert!(!remote.path().join(format!("{MANIFEST}.deploytmp")).exists());
}

#[test]
fn unchanged_rerun_is_idempotent() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("a.txt", "X"), ("b.txt", "Y")]);

    let cfg = site(local.path(), remote.path(), temp.path());
    deploy(&cfg, DeployOptions::default()).unwrap();
    let manifest_before = remote_manifest(remote.path());

    let summary = deploy(&cfg, DeployOptions::default()).unwrap();
    assert_eq!(summary.uploaded, 0);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.skipped, manifest_before.len());
    assert_eq!(remote_manifest(remote.path()), manifest_before);
}

#[cfg(unix)]
#[test]
fn local_before_hook_runs_even_on_empty_diff() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("a.txt", "X")]);

    let mut cfg = site(local.path(), remote.path(), temp.path());
    deploy(&cfg, DeployOptions::default()).unwrap();

    cfg.before_jobs = vec![Job::parse("local: touch hook-ran.marker").unwrap()];
    deploy(&cfg, DeployOptions::default()).unwrap();
    assert!(local.path().join("hook-ran.marker").exists());
}

#[test]
fn modify_and_delete() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("a.txt", "X"), ("b.txt", "Y")]);

    let cfg = site(local.path(), remote.path(), temp.path());
    deploy(&cfg, DeployOptions::default()).unwrap();

    std::fs::write(local.path().join("a.txt"), "X2").unwrap();
    std::fs::remove_file(local.path().join("b.txt")).unwrap();

    let summary = deploy(&cfg, DeployOptions::default()).unwrap();
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(std::fs::read(remote.path().join("a.txt")).unwrap(), b"X2");
    assert!(!remote.path().join("b.txt").exists());

    let manifest = remote_manifest(remote.path());
    assert!(manifest.contains("/a.txt"));
    assert!(!manifest.contains("/b.txt"));
}

#[test]
fn delete_guard_keeps_remote_files() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("a.txt", "X"), ("b.txt", "Y")]);

    let mut cfg = site(local.path(), remote.path(), temp.path());
    deploy(&cfg, DeployOptions::default()).unwrap();

    std::fs::remove_file(local.path().join("b.txt")).unwrap();
    cfg.allow_delete = false;
    let summary = deploy(&cfg, DeployOptions::default()).unwrap();

    assert_eq!(summary.deleted, 0);
    assert!(remote.path().join("b.txt").exists());
    // manifest reflects the local tree, so a later allow_delete run
    // would still see /b.txt as obsolete via its absence locally
    assert!(!remote_manifest(remote.path()).contains("/b.txt"));
}

#[test]
fn redeploy_uploads_everything() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("a.txt", "X"), ("sub/b.txt", "Y")]);

    let cfg = site(local.path(), remote.path(), temp.path());
    deploy(&cfg, DeployOptions::default()).unwrap();

    let opts = DeployOptions {
        redeploy: true,
        ..Default::default()
    };
    let summary = deploy(&cfg, opts).unwrap();
    // both files re-uploaded even though nothing changed
    assert_eq!(summary.uploaded, 2);
    assert_eq!(summary.skipped, 0);
}

#[cfg(unix)]
#[test]
fn test_mode_performs_no_side_effects() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("new.txt", "N")]);

    let mut cfg = site(local.path(), remote.path(), temp.path());
    cfg.before_jobs = vec![Job::parse("local: touch test-hook.marker").unwrap()];
    let opts = DeployOptions {
        test_mode: true,
        ..Default::default()
    };
    let summary = deploy(&cfg, opts).unwrap();

    assert_eq!(summary.uploaded, 0);
    assert!(!remote.path().join("new.txt").exists());
    assert!(!remote.path().join(MANIFEST).exists());
    assert!(!remote.path().join(format!("{MANIFEST}.running")).exists());
    // local: before jobs still run in test mode
    assert!(local.path().join("test-hook.marker").exists());
}

#[test]
fn concurrent_lock_aborts_with_exit_3() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("a.txt", "X")]);
    std::fs::write(remote.path().join(format!("{MANIFEST}.running")), "123\n").unwrap();

    let cfg = site(local.path(), remote.path(), temp.path());
    let err = deploy(&cfg, DeployOptions::default()).unwrap_err();
    assert!(matches!(err, DeployError::ConcurrentDeployment));
    assert_eq!(err.exit_code(), 3);
    // nothing was deployed and the foreign lock is untouched
    assert!(!remote.path().join("a.txt").exists());
    assert!(remote.path().join(format!("{MANIFEST}.running")).exists());
}

#[test]
fn stale_lock_removed_with_unlock_flag() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("a.txt", "X")]);
    // a lock from long ago
    std::fs::write(remote.path().join(format!("{MANIFEST}.running")), "1000\n").unwrap();

    let cfg = site(local.path(), remote.path(), temp.path());
    let opts = DeployOptions {
        unlock_stale: true,
        ..Default::default()
    };
    let summary = deploy(&cfg, opts).unwrap();
    assert_eq!(summary.uploaded, 1);
    assert!(!remote.path().join(format!("{MANIFEST}.running")).exists());
}

#[test]
fn purge_empties_configured_directories() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("index.php", "A")]);
    write_tree(remote.path(), &[("cache/old.bin", "junk"), ("cache/deep/x", "junk")]);

    let mut cfg = site(local.path(), remote.path(), temp.path());
    cfg.purge_paths = vec!["cache".into()];
    let summary = deploy(&cfg, DeployOptions::default()).unwrap();

    assert_eq!(summary.purged, 1);
    assert!(remote.path().join("cache").exists());
    assert_eq!(
        std::fs::read_dir(remote.path().join("cache")).unwrap().count(),
        0
    );
}

#[test]
fn preprocessed_js_is_deployed_compacted() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("app.js", "var a = 1; // comment\n")]);

    let mut cfg = site(local.path(), remote.path(), temp.path());
    cfg.preprocess_masks = vec!["*.js".into()];
    deploy(&cfg, DeployOptions::default()).unwrap();

    let deployed = std::fs::read_to_string(remote.path().join("app.js")).unwrap();
    assert!(!deployed.contains("comment"));

    // hash agreement: the manifest hash covers the deployed bytes
    let manifest = remote_manifest(remote.path());
    assert_eq!(
        manifest.get("/app.js").unwrap(),
        berth_sync::hash::hash_bytes(deployed.as_bytes())
    );
}

#[test]
fn nested_dirs_are_created_and_deleted() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("a/b/c/file.txt", "deep")]);

    let cfg = site(local.path(), remote.path(), temp.path());
    deploy(&cfg, DeployOptions::default()).unwrap();
    assert_eq!(
        std::fs::read(remote.path().join("a/b/c/file.txt")).unwrap(),
        b"deep"
    );

    // drop the whole subtree locally; dirs are removed bottom-up
    std::fs::remove_dir_all(local.path().join("a")).unwrap();
    write_tree(local.path(), &[("keep.txt", "k")]);
    deploy(&cfg, DeployOptions::default()).unwrap();
    assert!(!remote.path().join("a").exists());
    assert!(remote.path().join("keep.txt").exists());
}

// ── rollback on injected failure ───────────────────────────────────────────

/// Wraps the local driver and fails every `write_file` whose target
/// matches the configured rel path.
struct FailingServer {
    inner: LocalServer,
    fail_rel: String,
    write_attempts: Arc<AtomicUsize>,
}

impl Server for FailingServer {
    fn read_file(&mut self, rel: &str, local_abs: &Path) -> DeployResult<()> {
        self.inner.read_file(rel, local_abs)
    }
    fn write_file(
        &mut self,
        local_abs: &Path,
        rel: &str,
        progress: Option<&ProgressFn>,
    ) -> DeployResult<()> {
        if rel.starts_with(&self.fail_rel) {
            self.write_attempts.fetch_add(1, Ordering::SeqCst);
            return Err(DeployError::Transport("injected upload failure".into()));
        }
        self.inner.write_file(local_abs, rel, progress)
    }
    fn rename_file(&mut self, old_rel: &str, new_rel: &str) -> DeployResult<()> {
        self.inner.rename_file(old_rel, new_rel)
    }
    fn remove_file(&mut self, rel: &str) -> DeployResult<()> {
        self.inner.remove_file(rel)
    }
    fn create_dir(&mut self, rel: &str) -> DeployResult<()> {
        self.inner.create_dir(rel)
    }
    fn remove_dir(&mut self, rel: &str) -> DeployResult<()> {
        self.inner.remove_dir(rel)
    }
    fn purge(&mut self, rel: &str, progress: Option<&ProgressFn>) -> DeployResult<()> {
        self.inner.purge(rel, progress)
    }
    fn chmod(&mut self, rel: &str, mode: u32) -> DeployResult<()> {
        self.inner.chmod(rel, mode)
    }
    fn base_dir(&self) -> &str {
        self.inner.base_dir()
    }
    fn execute(&mut self, cmd: &str) -> DeployResult<String> {
        self.inner.execute(cmd)
    }
}

#[test]
fn upload_failure_rolls_back_cleanly() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("a.txt", "A"), ("b.txt", "B"), ("c.txt", "C")]);

    // seed a live deployment so rollback has something to protect
    let cfg = site(local.path(), remote.path(), temp.path());
    deploy(&cfg, DeployOptions::default()).unwrap();
    let manifest_before = remote_manifest(remote.path());
    std::fs::write(local.path().join("a.txt"), "A2").unwrap();
    std::fs::write(local.path().join("b.txt"), "B2").unwrap();
    std::fs::write(local.path().join("c.txt"), "C2").unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in = attempts.clone();
    let connector = move |url: &RemoteUrl,
                          opts: &ConnectOptions|
          -> DeployResult<Box<dyn Server + Send>> {
        Ok(Box::new(FailingServer {
            inner: LocalServer::connect(url, opts)?,
            fail_rel: "/b.txt".into(),
            write_attempts: attempts_in.clone(),
        }))
    };

    let deployer = Deployer::new(&cfg, DeployOptions::default()).with_connector(&connector);
    let err = deployer.run().unwrap_err();
    assert_eq!(err.exit_code(), 1);
    assert!(attempts.load(Ordering::SeqCst) >= 1);

    // previous live state fully intact
    assert_eq!(std::fs::read(remote.path().join("a.txt")).unwrap(), b"A");
    assert_eq!(std::fs::read(remote.path().join("b.txt")).unwrap(), b"B");
    assert_eq!(std::fs::read(remote.path().join("c.txt")).unwrap(), b"C");
    assert_eq!(remote_manifest(remote.path()), manifest_before);

    // no staging leftovers, lock released
    for entry in std::fs::read_dir(remote.path()).unwrap() {
        let name = entry.unwrap().file_name().into_string().unwrap();
        assert!(!name.ends_with(".deploytmp"), "stray staging file {name}");
        assert!(!name.ends_with(".running"), "stray lock file {name}");
    }

    // the next run succeeds and converges
    let summary = deploy(&cfg, DeployOptions::default()).unwrap();
    assert_eq!(summary.uploaded, 3);
    assert_eq!(std::fs::read(remote.path().join("b.txt")).unwrap(), b"B2");
}

#[test]
fn before_hook_failure_aborts_without_changes() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("a.txt", "A")]);

    let mut cfg = site(local.path(), remote.path(), temp.path());
    cfg.before_jobs = vec![Job::parse("local: exit 7").unwrap()];
    let err = deploy(&cfg, DeployOptions::default()).unwrap_err();
    assert!(matches!(err, DeployError::Hook { .. }));
    assert!(!remote.path().join("a.txt").exists());
    assert!(!remote.path().join(MANIFEST).exists());
    assert!(!remote.path().join(format!("{MANIFEST}.running")).exists());
}

#[test]
fn stray_staging_files_are_cleared_before_upload() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("a.txt", "fresh")]);
    // a crashed predecessor left a staged temp behind
    std::fs::write(remote.path().join("a.txt.deploytmp"), "stale").unwrap();

    let cfg = site(local.path(), remote.path(), temp.path());
    deploy(&cfg, DeployOptions::default()).unwrap();
    assert_eq!(std::fs::read(remote.path().join("a.txt")).unwrap(), b"fresh");
    assert!(!remote.path().join("a.txt.deploytmp").exists());
}

#[test]
fn stray_staging_for_unchanged_file_is_swept() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("a.txt", "A"), ("sub/b.txt", "B")]);

    let cfg = site(local.path(), remote.path(), temp.path());
    deploy(&cfg, DeployOptions::default()).unwrap();

    // simulate a run that staged /a.txt and /.htdeployment but crashed
    // before the commit rename
    std::fs::write(remote.path().join("a.txt.deploytmp"), "half-uploaded").unwrap();
    std::fs::write(remote.path().join(format!("{MANIFEST}.deploytmp")), "x /y\n").unwrap();

    // only /sub/b.txt changes, so /a.txt is not in this run's diff
    std::fs::write(local.path().join("sub/b.txt"), "B2").unwrap();
    let summary = deploy(&cfg, DeployOptions::default()).unwrap();
    assert_eq!(summary.uploaded, 1);

    // the unchanged file's leftover is gone and its live copy untouched
    assert!(!remote.path().join("a.txt.deploytmp").exists());
    assert_eq!(std::fs::read(remote.path().join("a.txt")).unwrap(), b"A");
    assert_eq!(std::fs::read(remote.path().join("sub/b.txt")).unwrap(), b"B2");

    // no *.deploytmp anywhere under the base after success
    fn assert_no_temps(dir: &std::path::Path) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().into_string().unwrap();
            assert!(!name.ends_with(".deploytmp"), "stray staging file {name}");
            if entry.path().is_dir() {
                assert_no_temps(&entry.path());
            }
        }
    }
    assert_no_temps(remote.path());
}
