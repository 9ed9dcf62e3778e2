use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use murmur_server::{ServerConfig, Services};
use murmur_store::Database;
use murmur_telemetry::{LogFormat, TelemetryConfig};
use tokio::process::Command;

const RESPAWN_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// A single server process.
    Fork,
    /// A supervisor that runs one worker process per slot.
    Cluster,
}

/// Realtime presence and direct-messaging server.
#[derive(Parser, Debug, Clone)]
#[command(name = "murmur")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Port to listen on. Cluster worker `i` listens on `port + i`.
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, value_enum, env = "CLUSTER_MODE", default_value = "fork")]
    mode: Mode,

    /// Worker processes in cluster mode. Defaults to the available parallelism.
    #[arg(long)]
    workers: Option<usize>,

    /// Shared SQLite file for sessions, messages and delivery. Without it all
    /// state is held in memory and only one process can serve clients.
    #[arg(long, env = "MURMUR_DB")]
    database: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// `json` or `pretty`.
    #[arg(long, default_value = "json")]
    log_format: LogFormat,

    /// Also persist warn+ log events to this SQLite file.
    #[arg(long)]
    log_db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = murmur_telemetry::init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        format: cli.log_format,
        log_db_path: cli.log_db.clone(),
        ..Default::default()
    });
    if let Some(path) = telemetry.incident_db() {
        tracing::info!(path = %path.display(), "Persisting warnings and errors");
    }

    match cli.mode {
        Mode::Fork => serve(cli).await,
        Mode::Cluster => supervise(cli).await,
    }
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        ..Default::default()
    };

    let services = match &cli.database {
        Some(path) => {
            let db = Database::open(path)
                .with_context(|| format!("failed to open database {}", path.display()))?;
            tracing::info!(path = %path.display(), "Using shared database");
            Services::shared(db, &config)
        }
        None => {
            tracing::info!("Using in-memory state");
            Services::in_memory()
        }
    };

    let handle = murmur_server::start(config, services)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, pid = std::process::id(), "Murmur ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn supervise(cli: Cli) -> anyhow::Result<()> {
    let Some(database) = cli.database.clone() else {
        bail!("cluster mode requires --database so workers share state");
    };
    let workers = cli.workers.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });
    if workers == 0 {
        bail!("--workers must be at least 1");
    }
    let exe = std::env::current_exe().context("failed to locate own executable")?;

    tracing::info!(workers, pid = std::process::id(), "Primary running");

    let mut slots = Vec::with_capacity(workers);
    for slot in 0..workers {
        let port = worker_port(cli.port, slot)?;
        let args = worker_args(&cli, port, &database);
        slots.push(tokio::spawn(run_worker(exe.clone(), slot, args)));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Stopping workers");
    // Aborting drops each child handle, which kills the process.
    for slot in slots {
        slot.abort();
        let _ = slot.await;
    }
    Ok(())
}

/// Port for worker `slot`: `base + slot`, rejected if it leaves the u16 range.
fn worker_port(base: u16, slot: usize) -> anyhow::Result<u16> {
    let offset = u16::try_from(slot).context("too many workers")?;
    base.checked_add(offset).context("worker port out of range")
}

fn worker_args(cli: &Cli, port: u16, database: &std::path::Path) -> Vec<String> {
    let mut args = vec![
        "--mode".to_string(),
        "fork".to_string(),
        "--host".to_string(),
        cli.host.clone(),
        "--port".to_string(),
        port.to_string(),
        "--database".to_string(),
        database.display().to_string(),
        "--log-level".to_string(),
        cli.log_level.to_string().to_lowercase(),
        "--log-format".to_string(),
        match cli.log_format {
            LogFormat::Json => "json".to_string(),
            LogFormat::Pretty => "pretty".to_string(),
        },
    ];
    if let Some(log_db) = &cli.log_db {
        args.push("--log-db".to_string());
        args.push(log_db.display().to_string());
    }
    args
}

/// Keep one worker slot occupied, respawning whenever its process exits.
async fn run_worker(exe: PathBuf, slot: usize, args: Vec<String>) {
    loop {
        let spawned = Command::new(&exe)
            .args(&args)
            .env_remove("CLUSTER_MODE")
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(mut child) => {
                tracing::info!(slot, pid = child.id(), "Worker started");
                match child.wait().await {
                    Ok(status) => tracing::warn!(slot, %status, "Worker exited"),
                    Err(e) => tracing::error!(slot, error = %e, "Failed to wait on worker"),
                }
            }
            Err(e) => tracing::error!(slot, error = %e, "Failed to spawn worker"),
        }

        tokio::time::sleep(RESPAWN_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["murmur"]).unwrap();
        assert_eq!(cli.mode, Mode::Fork);
        assert_eq!(cli.host, "0.0.0.0");
        assert!(cli.database.is_none());
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn cluster_flags_parse() {
        let cli = Cli::try_parse_from([
            "murmur", "-m", "cluster", "-p", "9000", "--workers", "3", "--database", "/tmp/m.db",
        ])
        .unwrap();
        assert_eq!(cli.mode, Mode::Cluster);
        assert_eq!(cli.port, 9000);
        assert_eq!(cli.workers, Some(3));
    }

    #[test]
    fn worker_port_offsets_from_base() {
        assert_eq!(worker_port(8080, 0).unwrap(), 8080);
        assert_eq!(worker_port(8080, 3).unwrap(), 8083);
        assert_eq!(worker_port(1, 65534).unwrap(), 65535);
    }

    #[test]
    fn worker_port_never_wraps() {
        // 65536 would truncate to 0 and reuse the base port.
        assert!(worker_port(8080, 65536).is_err());
        assert!(worker_port(8080, 70000).is_err());
        assert!(worker_port(1, 65535).is_err());
    }

    #[test]
    fn worker_args_pin_fork_mode_and_port() {
        let cli = Cli::try_parse_from(["murmur", "--log-format", "pretty", "--log-db", "/tmp/logs.db"]).unwrap();
        let args = worker_args(&cli, 8082, std::path::Path::new("/tmp/m.db"));
        let joined = args.join(" ");
        assert!(joined.contains("--mode fork"));
        assert!(joined.contains("--port 8082"));
        assert!(joined.contains("--database /tmp/m.db"));
        assert!(joined.contains("--log-format pretty"));
        assert!(joined.contains("--log-db /tmp/logs.db"));

        // The worker must accept what the primary hands it.
        let mut argv = vec!["murmur".to_string()];
        argv.extend(args);
        let worker = Cli::try_parse_from(argv).unwrap();
        assert_eq!(worker.mode, Mode::Fork);
        assert_eq!(worker.port, 8082);
    }
}
