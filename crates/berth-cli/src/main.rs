//! berth: incremental, crash-safe, atomic deployment of a local tree
//! onto a site reached over FTP, FTPS, SFTP or the local filesystem.
//!
//! One-shot batch tool: reads one or more deployment config files, runs
//! each configured site in order, and exits. Exit codes: 0 success
//! (including test mode), 1 generic failure, 2 configuration error,
//! 3 concurrent-deployment lock.

use berth_core::config::{self, SiteConfig};
use berth_core::error::{DeployError, DeployResult};
use berth_sync::deploy::{DeployOptions, Deployer, FileProgress};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "berth",
    version,
    about = "Deploy a local directory tree to an FTP/FTPS/SFTP/local site, atomically",
    long_about = "berth compares the local tree against the manifest stored on the \
                  server, uploads only changed files to staging names, and switches \
                  them live with an atomic rename dance. A failed run leaves the \
                  previous deployment untouched."
)]
struct Cli {
    /// Deployment config files (default: ./berth.ini)
    configs: Vec<PathBuf>,

    /// Compute and print the diff, change nothing on the server
    #[arg(short = 't', long)]
    test: bool,

    /// Re-upload every file regardless of the remote manifest
    #[arg(long)]
    full: bool,

    /// Disable progress bars
    #[arg(long)]
    no_progress: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Remove a stale deployment lock before starting
    #[arg(long)]
    unlock: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    std::process::exit(run(&cli));
}

fn run(cli: &Cli) -> i32 {
    let config_paths = if cli.configs.is_empty() {
        vec![PathBuf::from("berth.ini")]
    } else {
        cli.configs.clone()
    };

    for path in &config_paths {
        let sites = match config::parse_file(path) {
            Ok(sites) => sites,
            Err(err) => {
                report(&err);
                return err.exit_code();
            }
        };
        for mut site in sites {
            site.test_mode |= cli.test;
            println!("==> {} ({})", site.section, site.remote.redacted());
            if let Err(err) = deploy_site(&site, cli) {
                report(&err);
                return err.exit_code();
            }
        }
    }
    0
}

fn deploy_site(site: &SiteConfig, cli: &Cli) -> DeployResult<()> {
    let opts = DeployOptions {
        test_mode: site.test_mode,
        redeploy: cli.full,
        unlock_stale: cli.unlock,
    };
    let prompt = |text: &str| {
        rpassword::prompt_password(text)
            .map_err(|e| DeployError::Connection(format!("cannot read password: {e}")))
    };

    let mut deployer = Deployer::new(site, opts).with_password_prompt(&prompt);
    if !cli.no_progress {
        deployer = deployer.with_progress(progress_bars());
    }
    let summary = deployer.run()?;

    if site.test_mode {
        println!(
            "    test mode: {} unchanged, nothing deployed",
            summary.skipped
        );
    } else {
        println!(
            "    done: {} uploaded, {} deleted, {} purged, {} unchanged",
            summary.uploaded, summary.deleted, summary.purged, summary.skipped
        );
    }
    Ok(())
}

/// One transient bar per in-flight file, dropped as it completes.
fn progress_bars() -> FileProgress {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{msg:<40!} [{bar:28}] {pos:>3}%")
        .expect("static template")
        .progress_chars("=> ");
    let bars: Mutex<HashMap<String, ProgressBar>> = Mutex::new(HashMap::new());

    Arc::new(move |rel: &str, pct: u8| {
        let mut bars = bars.lock().expect("progress map lock");
        if pct >= 100 {
            if let Some(bar) = bars.remove(rel) {
                bar.finish_and_clear();
            }
            return;
        }
        let bar = bars.entry(rel.to_string()).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(100));
            bar.set_style(style.clone());
            bar.set_message(rel.to_string());
            bar
        });
        bar.set_position(u64::from(pct));
    })
}

fn report(err: &DeployError) {
    error!("{err}");
    eprintln!("error: {err}");
    eprintln!("  hint: {}", hint(err));
}

fn hint(err: &DeployError) -> &'static str {
    match err {
        DeployError::Config(_) => "check the deployment config file",
        DeployError::Filter { .. } => "fix the pattern in the ignore/include list",
        DeployError::Connection(_) => "verify host, port, credentials and network reachability",
        DeployError::Transport(_) | DeployError::Io(_) => {
            "transient server trouble; re-running is safe"
        }
        DeployError::NotFound(_) => "the server is missing an expected file",
        DeployError::ManifestParse { .. } => {
            "the remote manifest is damaged; remove it and redeploy with --full"
        }
        DeployError::Hook { .. } => "inspect the hook output above and fix the job",
        DeployError::ConcurrentDeployment => {
            "another deployment holds the lock; wait for it or use --unlock"
        }
        DeployError::Unsupported(_) => "this server type cannot perform the requested operation",
        DeployError::FatalState(_) => {
            "rollback failed; inspect the server and remove stray *.deploytmp files"
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
