use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codepod::cli;
use codepod::config::Config;
use codepod::metrics::{start_metrics_server, MetricsRegistry};
use codepod::service::Codepod;
use codepod_protocol::SessionEvent;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codepod", about = "Per-project container workspaces with synchronized file caches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: idle reaper, metrics endpoint, graceful shutdown.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Port for Prometheus metrics and health endpoints (/metrics, /healthz).
        /// Overrides server.metrics_port; disabled if neither is set.
        #[arg(long)]
        metrics_port: Option<u16>,
    },
    /// Open an interactive shell in a project's workspace.
    Shell {
        /// Project to acquire.
        project_id: String,
        /// Owner recorded if a new instance is created.
        #[arg(long, default_value = "cli")]
        user: String,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Bring a project's cache directory up to date without starting an instance.
    Sync {
        project_id: String,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify all prerequisites before running 'serve'. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Show per-project sync state from the ledger file (no daemon needed).
    Status {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_check(&config).await?;
        }
        Commands::Status { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_status(&config).await?;
        }
        Commands::Sync { project_id, config: config_path } => {
            let config = cli::load_config(config_path)?;
            let _lock = acquire_instance_lock(&config)?;
            let codepod = Codepod::from_config(config, None).await?;
            let report = codepod.manager().sync().materialize(&project_id).await?;
            println!(
                "{} sync of {}: {} written, {} removed, {} ledger records replayed",
                report.mode,
                project_id,
                report.files_written,
                report.files_removed,
                report.applied_sequences.len()
            );
            println!("Cache: {}", codepod.manager().sync().cache_dir(&project_id).display());
        }
        Commands::Shell { project_id, user, config: config_path } => {
            let config = cli::load_config(config_path)?;
            let _lock = acquire_instance_lock(&config)?;
            let codepod = Codepod::from_config(config, None).await?;
            let result = run_shell(&codepod, &project_id, &user).await;
            codepod.shutdown().await;
            result?;
        }
        Commands::Serve { config: config_path, metrics_port } => {
            let config = cli::load_config(config_path)?;

            // Two daemons sharing a cache root and ledger would corrupt both.
            let _lock = acquire_instance_lock(&config)?;

            tracing::info!("codepod starting with config: {:?}", config);

            let metrics_port = metrics_port.or(config.server.metrics_port);
            let metrics = metrics_port.map(|_| MetricsRegistry::new());
            let reap_interval = config.pool.reap_interval();
            let codepod = Arc::new(Codepod::from_config(config, metrics.clone()).await?);

            if let (Some(port), Some(metrics)) = (metrics_port, metrics) {
                let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
                start_metrics_server(addr, metrics, Arc::clone(codepod.manager()));
            }

            // Periodic idle eviction
            {
                let codepod = Arc::clone(&codepod);
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(reap_interval);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        interval.tick().await;
                        let removed = codepod.evict_idle().await;
                        if removed > 0 {
                            tracing::info!(removed, "idle reaper evicted instances");
                        }
                    }
                });
            }

            tracing::info!("codepod ready");
            wait_for_shutdown_signal().await?;

            tracing::info!("shutting down workspaces");
            let removed = codepod.shutdown().await;
            tracing::info!(removed, "codepod shut down");
        }
    }

    Ok(())
}

/// Hold an exclusive flock on the configured lock file for the process lifetime.
fn acquire_instance_lock(config: &Config) -> Result<std::fs::File> {
    let lock_path = &config.server.lock_file;
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .context("failed to open instance lock file")?;
    use std::os::unix::io::AsRawFd;
    let fd = lock_file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        anyhow::bail!(
            "Another codepod process holds {}.\n\
             Two processes sharing one cache root and ledger would corrupt both. \
             Stop the other one first, or check: codepod status",
            lock_path.display()
        );
    }
    Ok(lock_file)
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to register SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, initiating shutdown");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
    Ok(())
}

/// Bridge the local terminal to a session until the remote shell exits.
async fn run_shell(codepod: &Codepod, project_id: &str, user: &str) -> Result<()> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let mut events = codepod.open_terminal(project_id, user, &session_id).await?;
    eprintln!("Connected to {} (session {}). Type `exit` to leave.", project_id, session_id);

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 4096];
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(SessionEvent::Output { data, .. }) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Some(SessionEvent::Error { message, .. }) => {
                    eprintln!("session error: {}", message);
                }
                Some(SessionEvent::Ended { .. }) | None => break,
            },
            read = stdin.read(&mut buf), if stdin_open => {
                let n = read.context("reading stdin")?;
                if n == 0 {
                    stdin_open = false;
                    codepod.close_session(&session_id).await?;
                    continue;
                }
                codepod.send_input(&session_id, &buf[..n]).await?;
            }
        }
    }
    Ok(())
}
