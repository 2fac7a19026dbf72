//! The deployer: drives a full run through its phases.
//!
//! Phases, each a barrier: connect and take the deployment lock; scan
//! and hash the local tree; read the remote manifest; diff; before
//! hooks; staged upload through a bounded worker pool; commit (rename
//! staged files, then the staged manifest — the linearization point —
//! then deletes, purges, after hooks, unlock). Any failure before the
//! manifest rename rolls back by deleting the staged temps and leaves
//! the previous live state intact. Failures after it are warnings: the
//! deployment already happened.

use crate::manifest::{Diff, Manifest};
use crate::preprocess::Preprocessor;
use crate::runner::run_job;
use crate::scan::{scan_and_hash, LocalFile, STAGING_SUFFIX};
use berth_core::config::SiteConfig;
use berth_core::error::{DeployError, DeployResult};
use berth_core::job::Job;
use berth_core::paths::normalize_rel;
use berth_core::remote::RemoteUrl;
use berth_filter::PathFilter;
use berth_server::{connect_with_retry, ConnectOptions, ProgressFn, Server};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Per-file progress callback: `(rel path, percent)`.
pub type FileProgress = Arc<dyn Fn(&str, u8) + Send + Sync>;

/// Credential prompt injected by the CLI for the `STDIN` password
/// sentinel; the argument is the prompt text.
pub type PasswordPrompt<'a> = &'a (dyn Fn(&str) -> DeployResult<String> + Sync);

/// Driver constructor. The default opens a real session for the URL's
/// scheme with connect retry; tests inject doubles through it.
pub type Connector<'a> =
    &'a (dyn Fn(&RemoteUrl, &ConnectOptions) -> DeployResult<Box<dyn Server + Send>> + Sync);

/// Run-level switches coming from the command line.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Compute and print the diff, then stop before any side effect.
    pub test_mode: bool,
    /// Force re-upload of every local path regardless of hash equality.
    pub redeploy: bool,
    /// Remove a stale deployment lock instead of aborting on it.
    pub unlock_stale: bool,
}

/// Final counts reported after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub uploaded: usize,
    pub deleted: usize,
    pub purged: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct RunState {
    /// Rel paths whose staged upload succeeded.
    staged: Vec<String>,
    /// The staged manifest itself was uploaded.
    manifest_staged: bool,
    /// The manifest rename happened; the new deployment is live.
    committed: bool,
}

pub struct Deployer<'a> {
    cfg: &'a SiteConfig,
    opts: DeployOptions,
    progress: Option<FileProgress>,
    prompt: Option<PasswordPrompt<'a>>,
    connector: Option<Connector<'a>>,
    cancel: Arc<AtomicBool>,
}

impl<'a> Deployer<'a> {
    pub fn new(cfg: &'a SiteConfig, opts: DeployOptions) -> Self {
        Deployer {
            cfg,
            opts,
            progress: None,
            prompt: None,
            connector: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_progress(mut self, progress: FileProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_password_prompt(mut self, prompt: PasswordPrompt<'a>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_connector(mut self, connector: Connector<'a>) -> Self {
        self.connector = Some(connector);
        self
    }

    fn open_session(
        &self,
        url: &RemoteUrl,
        opts: &ConnectOptions,
    ) -> DeployResult<Box<dyn Server + Send>> {
        match self.connector {
            Some(connector) => connector(url, opts),
            None => connect_with_retry(url, opts, self.cfg.retries),
        }
    }

    /// Flag shared with the caller; setting it makes the run fail at the
    /// next barrier (or between two file uploads) and roll back.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn ensure_active(&self) -> DeployResult<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(DeployError::Transport("deployment cancelled".into()))
        } else {
            Ok(())
        }
    }

    // ── phase 0: connect & lock ────────────────────────────────────────────

    fn resolve_url(&self) -> DeployResult<RemoteUrl> {
        let mut url = self.cfg.remote.clone();
        if url.wants_password_prompt() {
            let prompt = self.prompt.ok_or_else(|| {
                DeployError::Config(
                    "password is STDIN but no terminal prompt is available".into(),
                )
            })?;
            let text = format!(
                "Password for {}@{}: ",
                url.user.as_deref().unwrap_or(""),
                url.host
            );
            url.password = Some(prompt(&text)?);
        }
        Ok(url)
    }

    fn acquire_lock(&self, server: &mut dyn Server, lock_rel: &str) -> DeployResult<()> {
        let probe = tempfile::NamedTempFile::new()?;
        match server.read_file(lock_rel, probe.path()) {
            Ok(()) => {
                let content = std::fs::read_to_string(probe.path()).unwrap_or_default();
                if !self.opts.unlock_stale {
                    return Err(DeployError::ConcurrentDeployment);
                }
                let threshold = Duration::from_secs(self.cfg.stale_lock_minutes * 60);
                if lock_age(&content).map_or(true, |age| age > threshold) {
                    warn!(lock = lock_rel, "removing stale deployment lock");
                    server.remove_file(lock_rel)?;
                } else {
                    return Err(DeployError::ConcurrentDeployment);
                }
            }
            Err(DeployError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let sentinel = tempfile::NamedTempFile::new()?;
        std::fs::write(sentinel.path(), format!("{now}\n"))?;
        server.write_file(sentinel.path(), lock_rel, None)?;
        debug!(lock = lock_rel, "deployment lock taken");
        Ok(())
    }

    // ── run ────────────────────────────────────────────────────────────────

    pub fn run(&self) -> DeployResult<Summary> {
        let url = self.resolve_url()?;
        let connect_opts = ConnectOptions {
            passive_mode: self.cfg.passive_mode,
            file_permissions: self.cfg.file_permissions,
            dir_permissions: self.cfg.dir_permissions,
        };
        info!(site = %self.cfg.section, remote = %url.redacted(), "connecting");
        let mut server = self.open_session(&url, &connect_opts)?;

        let manifest_rel = normalize_rel(&self.cfg.manifest_name)?;
        let lock_rel = format!("{manifest_rel}.running");
        self.acquire_lock(server.as_mut(), &lock_rel)?;

        let preprocessor = Preprocessor::new(
            &self.cfg.preprocess_masks,
            &self.cfg.temp_dir.join(sanitize(&self.cfg.section)),
        )?;

        let mut state = RunState::default();
        let result = self.deploy_locked(
            server.as_mut(),
            &url,
            &connect_opts,
            &preprocessor,
            &manifest_rel,
            &lock_rel,
            &mut state,
        );
        preprocessor.cleanup();

        match result {
            Ok(summary) => Ok(summary),
            Err(err) if state.committed => {
                // Deployment is live; surface the post-commit problem.
                Err(err)
            }
            Err(err) => {
                warn!(site = %self.cfg.section, "deployment failed, rolling back: {err}");
                self.rollback(server.as_mut(), &state, &manifest_rel, &lock_rel)?;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deploy_locked(
        &self,
        server: &mut dyn Server,
        url: &RemoteUrl,
        connect_opts: &ConnectOptions,
        preprocessor: &Preprocessor,
        manifest_rel: &str,
        lock_rel: &str,
        state: &mut RunState,
    ) -> DeployResult<Summary> {
        // ── phase 1: scan & hash ───────────────────────────────────────────
        self.ensure_active()?;
        info!(root = %self.cfg.local_root.display(), "scanning local tree");
        let filter = PathFilter::new(&self.cfg.include_patterns, &self.cfg.ignore_patterns)?;
        preprocessor.reset()?;
        let (local_manifest, files) =
            scan_and_hash(&self.cfg.local_root, &filter, preprocessor)?;

        // ── phase 2: read remote manifest ──────────────────────────────────
        self.ensure_active()?;
        info!(manifest = manifest_rel, "reading remote manifest");
        let remote_manifest = self.read_remote_manifest(server, manifest_rel)?;

        // ── phase 3: diff ──────────────────────────────────────────────────
        let mut diff = Manifest::diff(&local_manifest, &remote_manifest, self.cfg.allow_delete);
        if self.opts.redeploy {
            diff.to_upload = local_manifest.paths().map(str::to_string).collect();
        }
        let summary_skeleton = Summary {
            uploaded: diff.to_upload.len(),
            deleted: diff.to_delete.len(),
            purged: self.cfg.purge_paths.len(),
            skipped: local_manifest.len() - diff.to_upload.len(),
        };
        info!(
            upload = diff.to_upload.len(),
            delete = diff.to_delete.len(),
            skip = summary_skeleton.skipped,
            "diff computed"
        );

        if self.opts.test_mode {
            self.run_jobs(server, &self.cfg.before_jobs, true)?;
            for rel in &diff.to_upload {
                info!(rel = %rel, "would upload");
            }
            for rel in &diff.to_delete {
                info!(rel = %rel, "would delete");
            }
            info!("test mode: stopping before any server change");
            server.remove_file(lock_rel)?;
            return Ok(Summary {
                uploaded: 0,
                deleted: 0,
                purged: 0,
                skipped: summary_skeleton.skipped,
            });
        }

        if diff.is_empty() {
            info!("nothing to deploy; running local hooks only");
            self.run_jobs(server, &self.cfg.before_jobs, true)?;
            self.run_jobs(server, &self.cfg.after_jobs, true)?;
            server.remove_file(lock_rel)?;
            return Ok(Summary {
                skipped: summary_skeleton.skipped,
                ..Summary::default()
            });
        }

        // ── phase 4: before hooks ──────────────────────────────────────────
        self.ensure_active()?;
        self.run_jobs(server, &self.cfg.before_jobs, false)?;

        // ── phase 5: staged upload ─────────────────────────────────────────
        self.ensure_active()?;
        self.clear_stray_staging(server, &local_manifest, &remote_manifest, manifest_rel)?;
        let upload_set: BTreeSet<&str> = diff.to_upload.iter().map(String::as_str).collect();
        let upload_files: Vec<&LocalFile> = files
            .iter()
            .filter(|f| !f.is_dir && upload_set.contains(f.rel.as_str()))
            .collect();
        self.create_upload_dirs(server, &diff, &local_manifest, &upload_files)?;
        info!(files = upload_files.len(), workers = self.cfg.workers, "uploading");
        self.upload_phase(server, url, connect_opts, &upload_files, state)?;

        // the new manifest goes up under a staging name too
        self.ensure_active()?;
        let staged_manifest = format!("{manifest_rel}{STAGING_SUFFIX}");
        let local_copy = tempfile::NamedTempFile::new()?;
        std::fs::write(local_copy.path(), local_manifest.serialize())?;
        server.write_file(local_copy.path(), &staged_manifest, None)?;
        state.manifest_staged = true;

        // ── phase 6: commit ────────────────────────────────────────────────
        self.ensure_active()?;
        self.run_jobs(server, &self.cfg.after_upload_jobs, false)?;

        // shortest path first, so a path that changed kind between runs
        // is resolved in a consistent order
        let mut rename_order = state.staged.clone();
        rename_order.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        for rel in &rename_order {
            server.rename_file(&format!("{rel}{STAGING_SUFFIX}"), rel)?;
        }

        info!(manifest = manifest_rel, "committing");
        server.rename_file(&staged_manifest, manifest_rel)?;
        state.committed = true;

        // Everything below is post-commit: failures are warnings.
        let mut summary = summary_skeleton;
        summary.uploaded = state.staged.len();
        summary.deleted = 0;
        summary.purged = 0;

        let (files_gone, dirs_gone): (Vec<_>, Vec<_>) = diff
            .to_delete
            .iter()
            .partition(|rel| !remote_manifest.is_dir(rel));
        for rel in files_gone {
            match server.remove_file(rel) {
                Ok(()) => summary.deleted += 1,
                Err(e) => warn!(rel = %rel, "delete failed: {e}"),
            }
        }
        let mut dirs_gone = dirs_gone;
        dirs_gone.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| b.cmp(a)));
        for rel in dirs_gone {
            match server.remove_dir(rel) {
                Ok(()) => summary.deleted += 1,
                Err(e) => warn!(rel = %rel, "rmdir failed: {e}"),
            }
        }

        for dir in &self.cfg.purge_paths {
            let rel = normalize_rel(dir)?;
            let cb = self.progress.as_ref().map(|p| {
                let p = p.clone();
                let rel = rel.clone();
                Box::new(move |pct| p(&rel, pct)) as ProgressFn
            });
            match server.purge(&rel, cb.as_ref()) {
                Ok(()) => summary.purged += 1,
                Err(e) => warn!(dir = %rel, "purge failed: {e}"),
            }
        }

        if let Err(e) = self.run_jobs(server, &self.cfg.after_jobs, false) {
            warn!("after hook failed (deployment is already live): {e}");
        }

        if let Err(e) = server.remove_file(lock_rel) {
            warn!(lock = lock_rel, "could not remove deployment lock: {e}");
        }

        info!(
            uploaded = summary.uploaded,
            deleted = summary.deleted,
            purged = summary.purged,
            skipped = summary.skipped,
            "deployment finished"
        );
        Ok(summary)
    }

    // ── phase helpers ──────────────────────────────────────────────────────

    fn read_remote_manifest(
        &self,
        server: &mut dyn Server,
        manifest_rel: &str,
    ) -> DeployResult<Manifest> {
        let tmp = tempfile::NamedTempFile::new()?;
        match server.read_file(manifest_rel, tmp.path()) {
            Ok(()) => Manifest::parse(&std::fs::read(tmp.path())?),
            Err(DeployError::NotFound(_)) => {
                info!("no remote manifest: first deployment");
                Ok(Manifest::new())
            }
            Err(e) => Err(e),
        }
    }

    fn run_jobs(
        &self,
        server: &mut dyn Server,
        jobs: &[Job],
        local_only: bool,
    ) -> DeployResult<()> {
        for job in jobs {
            if local_only && !job.is_local() {
                continue;
            }
            let output = run_job(job, &self.cfg.local_root, server)?;
            if !output.trim().is_empty() {
                debug!(job = %job.label(), output = %output.trim(), "hook output");
            }
        }
        Ok(())
    }

    /// Delete staging leftovers from a crashed earlier run before any
    /// new staged upload starts. The drivers expose no generic listing
    /// operation, so the sweep covers every rel path either manifest
    /// knows about — changed or not — plus the manifest's own staging
    /// name; `remove_file` is idempotent, so misses cost nothing.
    fn clear_stray_staging(
        &self,
        server: &mut dyn Server,
        local_manifest: &Manifest,
        remote_manifest: &Manifest,
        manifest_rel: &str,
    ) -> DeployResult<()> {
        let mut candidates: BTreeSet<&str> = BTreeSet::new();
        for (rel, _) in local_manifest
            .iter()
            .chain(remote_manifest.iter())
            .filter(|(_, hash)| *hash != crate::manifest::DIR_SENTINEL)
        {
            candidates.insert(rel);
        }
        candidates.insert(manifest_rel);
        for rel in candidates {
            server.remove_file(&format!("{rel}{STAGING_SUFFIX}"))?;
        }
        Ok(())
    }

    /// Create every directory the upload phase will write into, on the
    /// primary session, before workers start. Keeps `create_dir` races
    /// out of the pool and covers the manifest's dir-sentinel entries.
    fn create_upload_dirs(
        &self,
        server: &mut dyn Server,
        diff: &Diff,
        local_manifest: &Manifest,
        upload_files: &[&LocalFile],
    ) -> DeployResult<()> {
        let mut dirs = BTreeSet::new();
        for rel in &diff.to_upload {
            if local_manifest.is_dir(rel) {
                dirs.insert(rel.clone());
            }
        }
        for file in upload_files {
            let mut current = file.rel.as_str();
            while let Some(parent) = berth_core::paths::parent_rel(current) {
                if parent == "/" {
                    break;
                }
                dirs.insert(parent.to_string());
                current = parent;
            }
        }
        // BTreeSet order puts parents before children
        for dir in dirs {
            server.create_dir(&dir)?;
        }
        Ok(())
    }

    fn upload_phase(
        &self,
        server: &mut dyn Server,
        url: &RemoteUrl,
        connect_opts: &ConnectOptions,
        upload_files: &[&LocalFile],
        state: &mut RunState,
    ) -> DeployResult<()> {
        let workers = self.cfg.workers.min(upload_files.len());
        if workers <= 1 {
            for file in upload_files {
                self.ensure_active()?;
                upload_with_retry(server, file, self.cfg.retries, self.progress.as_ref())?;
                state.staged.push(file.rel.clone());
            }
            return Ok(());
        }

        // Bounded pool: each worker owns its own session for its task
        // lifetime; driver instances are not shared across threads.
        let (task_tx, task_rx) = crossbeam_channel::unbounded::<LocalFile>();
        for file in upload_files {
            task_tx
                .send((*file).clone())
                .expect("task channel open during fill");
        }
        drop(task_tx);
        let (result_tx, result_rx) =
            crossbeam_channel::unbounded::<(String, DeployResult<()>)>();

        let abort = AtomicBool::new(false);
        let mut first_err: Option<DeployError> = None;

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let progress = self.progress.clone();
                let cancel = self.cancel.clone();
                let abort = &abort;
                let retries = self.cfg.retries;
                let deployer = &*self;
                scope.spawn(move || {
                    let mut session = match deployer.open_session(url, connect_opts) {
                        Ok(s) => s,
                        Err(e) => {
                            // surface the connection failure through the
                            // first task this worker would have taken
                            if let Ok(task) = task_rx.recv() {
                                let _ = result_tx.send((task.rel, Err(e)));
                            }
                            return;
                        }
                    };
                    while let Ok(task) = task_rx.recv() {
                        if abort.load(Ordering::Relaxed) || cancel.load(Ordering::Relaxed) {
                            let _ = result_tx.send((
                                task.rel.clone(),
                                Err(DeployError::Transport("upload aborted".into())),
                            ));
                            continue;
                        }
                        let outcome = upload_with_retry(
                            session.as_mut(),
                            &task,
                            retries,
                            progress.as_ref(),
                        );
                        let _ = result_tx.send((task.rel.clone(), outcome));
                    }
                });
            }
            drop(result_tx);

            for (rel, outcome) in result_rx.iter() {
                match outcome {
                    Ok(()) => state.staged.push(rel),
                    Err(e) => {
                        if first_err.is_none() {
                            warn!(rel = %rel, "upload failed: {e}");
                            first_err = Some(e);
                            abort.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }
        });

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn rollback(
        &self,
        server: &mut dyn Server,
        state: &RunState,
        manifest_rel: &str,
        lock_rel: &str,
    ) -> DeployResult<()> {
        let mut failures = Vec::new();
        for rel in &state.staged {
            let staging = format!("{rel}{STAGING_SUFFIX}");
            if let Err(e) = server.remove_file(&staging) {
                failures.push(format!("{staging}: {e}"));
            }
        }
        if state.manifest_staged {
            let staging = format!("{manifest_rel}{STAGING_SUFFIX}");
            if let Err(e) = server.remove_file(&staging) {
                failures.push(format!("{staging}: {e}"));
            }
        }
        if let Err(e) = server.remove_file(lock_rel) {
            failures.push(format!("{lock_rel}: {e}"));
        }
        if failures.is_empty() {
            info!("rollback complete; previous live state untouched");
            Ok(())
        } else {
            Err(DeployError::FatalState(failures.join("; ")))
        }
    }
}

/// Upload one file to its staging name, retrying transient transport
/// failures. Stray staging files were swept before this phase started,
/// and every driver's `write_file` truncates, so no pre-delete is
/// needed here.
fn upload_with_retry(
    server: &mut dyn Server,
    file: &LocalFile,
    attempts: usize,
    progress: Option<&FileProgress>,
) -> DeployResult<()> {
    let staging = format!("{}{}", file.rel, STAGING_SUFFIX);
    let attempts = attempts.max(1);
    let mut delay = Duration::from_millis(500);
    for attempt in 1..=attempts {
        let cb = progress.map(|p| {
            let p = p.clone();
            let rel = file.rel.clone();
            Box::new(move |pct| p(&rel, pct)) as ProgressFn
        });
        match server.write_file(&file.upload_abs, &staging, cb.as_ref()) {
            Ok(()) => {
                debug!(rel = %file.rel, size = file.size, "staged");
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(rel = %file.rel, attempt, "upload attempt failed, retrying: {e}");
                std::thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_secs(10));
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop returns on last attempt")
}

fn lock_age(content: &str) -> Option<Duration> {
    let then = content.trim().parse::<u64>().ok()?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Some(Duration::from_secs(now.saturating_sub(then)))
}

fn sanitize(section: &str) -> String {
    section
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_age_parses_timestamp() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let age = lock_age(&format!("{}\n", now - 90)).unwrap();
        assert!(age >= Duration::from_secs(90));
        assert!(age < Duration::from_secs(150));
        assert!(lock_age("garbage").is_none());
    }

    #[test]
    fn sanitize_makes_a_path_component() {
        assert_eq!(sanitize("prod/eu-west"), "prod_eu_west");
        assert_eq!(sanitize("default"), "default");
    }
}
