//! CLI-only subcommand implementations: `check` and `status`.
//!
//! These commands do not start the daemon. `status` reads the ledger file
//! directly, so it works while a daemon is running.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;

use crate::config::{Config, LedgerBackend, ObjectBackend, RuntimeBackend};
use crate::ledger::FileLedger;
use crate::runtime::docker::DockerRuntime;

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `codepod check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub async fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let mut checks: Vec<Check> = Vec::new();

    checks.push(check_config(config));
    match config.runtime.backend {
        RuntimeBackend::Docker => checks.extend(check_docker(config).await),
        RuntimeBackend::Local => checks.push(check_shell(config)),
    }
    checks.push(check_writable_dir("Cache root", &config.sync.cache_root));
    if config.storage.object_backend == ObjectBackend::Fs {
        checks.push(check_writable_dir("Object store", &config.storage.object_root));
    }
    if config.storage.ledger_backend == LedgerBackend::File {
        checks.push(check_ledger(&config.storage.ledger_path).await);
    }
    if let Some(parent) = config.server.lock_file.parent() {
        checks.push(check_writable_dir("Lock directory", parent));
    }

    let all_pass = checks.iter().all(|c| c.ok);

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if !c.ok {
            if let Some(fix) = &c.fix {
                println!("    Fix: {}", fix);
            }
        }
    }

    println!();
    if all_pass {
        println!("All checks passed. Run: codepod serve --config config.toml");
        Ok(())
    } else {
        let failed = checks.iter().filter(|c| !c.ok).count();
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn check_config(config: &Config) -> Check {
    match config.validate() {
        Ok(()) => Check::pass(
            "Configuration",
            format!(
                "{} backend, capacity {}, {} eviction",
                config.runtime.backend, config.resources.max_instances, config.pool.eviction_policy
            ),
        ),
        Err(e) => Check::fail("Configuration", e.to_string(), "Fix the value in config.toml"),
    }
}

async fn check_docker(config: &Config) -> Vec<Check> {
    let docker = match DockerRuntime::connect().await {
        Ok(docker) => docker,
        Err(e) => {
            return vec![Check::fail(
                "Docker daemon",
                format!("{:#}", e),
                "Start docker (systemctl start docker) and make sure this user can reach its socket",
            )]
        }
    };

    let mut checks = Vec::new();
    match docker.server_version().await {
        Ok(version) => checks.push(Check::pass("Docker daemon", version)),
        Err(e) => checks.push(Check::fail(
            "Docker daemon",
            format!("{:#}", e),
            "Check the docker daemon logs",
        )),
    }

    let image = &config.runtime.image;
    match docker.image_present(image).await {
        Ok(true) => checks.push(Check::pass("Workspace image", image.as_str())),
        Ok(false) => checks.push(Check::fail(
            "Workspace image",
            format!("{} is not pulled", image),
            format!("docker pull {}", image),
        )),
        Err(e) => checks.push(Check::fail(
            "Workspace image",
            format!("{:#}", e),
            format!("docker pull {}", image),
        )),
    }
    checks
}

fn check_shell(config: &Config) -> Check {
    let Some(shell) = config.runtime.shell.first() else {
        return Check::fail("Shell", "runtime.shell is empty", "Set runtime.shell = [\"/bin/sh\"]");
    };
    if Path::new(shell).is_file() {
        Check::pass("Shell", shell.as_str())
    } else {
        Check::fail(
            "Shell",
            format!("{} not found", shell),
            "Set runtime.shell to an installed shell",
        )
    }
}

fn check_writable_dir(label: &'static str, dir: &Path) -> Check {
    if let Err(e) = std::fs::create_dir_all(dir) {
        return Check::fail(
            label,
            format!("{} does not exist and could not be created: {}", dir.display(), e),
            format!("mkdir -p {}", dir.display()),
        );
    }

    let probe = dir.join(".codepod-check");
    match std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            Check::pass(label, dir.display().to_string())
        }
        Err(e) => Check::fail(
            label,
            format!("{} is not writable: {}", dir.display(), e),
            format!("chmod u+w {} or run codepod as a user with write access", dir.display()),
        ),
    }
}

async fn check_ledger(path: &Path) -> Check {
    if let Some(parent) = path.parent() {
        let dir = check_writable_dir("Ledger", parent);
        if !dir.ok {
            return dir;
        }
    }
    match FileLedger::load(path).await {
        Ok(state) => Check::pass(
            "Ledger",
            format!("{} ({} projects)", path.display(), state.checkpoints.len()),
        ),
        Err(e) => Check::fail(
            "Ledger",
            format!("{:#}", e),
            format!("Move {} aside; the next full sync rebuilds it", path.display()),
        ),
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

/// Run `codepod status`. Always returns `Ok(())`, informational only.
pub async fn run_status(config: &Config) -> Result<()> {
    if config.storage.ledger_backend != LedgerBackend::File {
        println!("Ledger backend is in-memory; nothing persisted to report.");
        return Ok(());
    }

    let ledger_path = &config.storage.ledger_path;
    if !ledger_path.exists() {
        println!("No ledger file at {}", ledger_path.display());
        println!("Is codepod running? Try: codepod serve --config config.toml");
        return Ok(());
    }

    let state = match FileLedger::load(ledger_path).await {
        Ok(state) => state,
        Err(e) => {
            println!("Ledger: {}", ledger_path.display());
            println!("Error reading ledger: {:#}", e);
            return Ok(());
        }
    };

    println!("Ledger: {}\n", ledger_path.display());
    let count = state.checkpoints.len();
    println!("Projects: {}", count);

    let now = Utc::now();
    for (project_id, last_sync) in &state.checkpoints {
        let ago = (now - *last_sync).to_std().unwrap_or_default();
        let changes = state.changes.get(project_id).map(Vec::len).unwrap_or(0);
        let cached = config.sync.cache_root.join(project_id).is_dir();
        let stale = ago > config.sync.staleness();
        println!(
            "  {:<24}  synced {:<16}  {:>6} change{}  {}{}",
            project_id,
            format_duration(ago),
            changes,
            if changes == 1 { "" } else { "s" },
            if cached { "cached" } else { "not cached" },
            if stale { "  (stale, next sync is full)" } else { "" },
        );
    }

    Ok(())
}

/// Format a duration as a human-friendly relative string (e.g. "3 seconds ago", "2 minutes ago").
fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    let (n, unit) = if secs < 60 {
        (secs, "second")
    } else if secs < 3600 {
        (secs / 60, "minute")
    } else if secs < 86400 {
        (secs / 3600, "hour")
    } else {
        (secs / 86400, "day")
    };
    if n == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", n, unit)
    }
}

/// Load a config from an optional path, falling back to defaults.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}
