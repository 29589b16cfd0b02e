use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;

use plexus_plugins::{
    discover, Ledger, PidFileLedger, PluginManager, PluginRecord, PortAllocator, RpcTimeouts,
    Supervisor, SupervisorConfig,
};
use plexus_runtime::{CliConfig, CliRuntime};
use plexus_server::{EventHub, QueryOrchestrator, ServerConfig};
use plexus_settings::{
    load_settings, load_settings_from_path, plexus_home, resolve_path, settings_path, PlexusSettings,
};
use plexus_store::{Database, SessionStore};
use plexus_telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};

/// Local host for tool plugins and agent sessions.
#[derive(Parser)]
#[command(name = "plexus", version, about)]
struct Cli {
    /// Settings file (defaults to ~/.plexus/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and plugin host
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        plugins_dir: Option<PathBuf>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the discovered plugin roster
    Plugins {
        #[arg(long)]
        plugins_dir: Option<PathBuf>,
    },
    /// List stored sessions
    Sessions {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

/// Filesystem locations after settings and flags are combined.
struct Paths {
    plugins: PathBuf,
    data: PathBuf,
    ledger: PathBuf,
}

impl Paths {
    fn resolve(settings: &PlexusSettings, plugins_dir: Option<PathBuf>, data_dir: Option<PathBuf>) -> Self {
        let home = plexus_home();
        Self {
            plugins: plugins_dir.unwrap_or_else(|| resolve_path(&home, &settings.plugins.dir)),
            data: data_dir.unwrap_or_else(|| resolve_path(&home, &settings.storage.data_dir)),
            ledger: resolve_path(&home, &settings.plugins.ledger_dir),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => load_settings()
            .with_context(|| format!("loading settings from {}", settings_path().display()))?,
    };

    match cli.command {
        Command::Serve {
            port,
            plugins_dir,
            data_dir,
        } => {
            if let Some(port) = port {
                settings.server.port = port;
            }
            let paths = Paths::resolve(&settings, plugins_dir, data_dir);
            serve(settings, paths).await
        }
        Command::Plugins { plugins_dir } => {
            let paths = Paths::resolve(&settings, plugins_dir, None);
            print_roster(&paths.plugins);
            Ok(())
        }
        Command::Sessions { data_dir } => {
            let paths = Paths::resolve(&settings, None, data_dir);
            print_sessions(&paths.data)
        }
    }
}

fn telemetry(settings: &PlexusSettings, data_dir: &Path) -> TelemetryGuard {
    let log_level = settings.logging.level.parse().unwrap_or(tracing::Level::INFO);
    init_telemetry(TelemetryConfig {
        log_level,
        json: settings.logging.json,
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path: data_dir.join("logs.db"),
        ..Default::default()
    })
}

fn supervisor_config(settings: &PlexusSettings) -> SupervisorConfig {
    let p = &settings.plugins;
    SupervisorConfig {
        settle_window: p.settle_window(),
        max_attempts: p.max_spawn_attempts,
        timeouts: RpcTimeouts {
            handshake: p.handshake_timeout(),
            list_tools: p.list_tools_timeout(),
            call_tool: p.call_tool_timeout(),
        },
        stop_grace: p.stop_grace(),
        stderr_limit: p.stderr_limit_bytes,
        liveness_poll: p.liveness_poll(),
    }
}

async fn serve(settings: PlexusSettings, paths: Paths) -> Result<()> {
    std::fs::create_dir_all(&paths.data)
        .with_context(|| format!("creating data directory {}", paths.data.display()))?;
    let _telemetry = telemetry(&settings, &paths.data);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting plexus");

    let db_path = paths.data.join("plexus.db");
    let db = Database::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let ledger = Arc::new(PidFileLedger::new(&paths.ledger));
    let dropped = ledger.cleanup_all();
    if dropped > 0 {
        tracing::info!(dropped, "removed ledger entries for dead plugins");
    }

    let roster = discover(&paths.plugins);
    tracing::info!(dir = %paths.plugins.display(), plugins = roster.len(), "plugin roster discovered");

    let p = &settings.plugins;
    let ports = Arc::new(Mutex::new(PortAllocator::new(p.port_range_start..=p.port_range_end)));
    let supervisor = Arc::new(Supervisor::new(supervisor_config(&settings), ports));
    let plugins = PluginManager::new(roster, supervisor, ledger, p.call_tool_timeout());

    let report = plugins.initialize_roster().await;
    for (name, reason) in &report.failed {
        tracing::warn!(plugin = %name, reason = %reason, "standalone plugin failed to start");
    }

    let runtime = Arc::new(CliRuntime::new(CliConfig {
        binary: settings.runtime.binary.clone(),
        model: settings.runtime.model.clone(),
        extra_args: settings.runtime.extra_args.clone(),
        stderr_limit: p.stderr_limit_bytes,
    }));
    let orchestrator = Arc::new(
        QueryOrchestrator::new(
            SessionStore::new(db),
            plugins.clone(),
            runtime,
            Arc::new(EventHub::default()),
        )
        .with_working_directory(settings.runtime.working_directory.as_deref().map(PathBuf::from)),
    );

    let handle = plexus_server::start(
        ServerConfig {
            host: settings.server.host.clone(),
            port: settings.server.port,
        },
        orchestrator.clone(),
    )
    .await
    .context("starting http server")?;
    tracing::info!(port = handle.port, "plexus ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;

    tracing::info!("shutting down");
    let cancelled = orchestrator.stop_all();
    if !orchestrator.wait_idle(Duration::from_secs(10)).await {
        tracing::warn!(cancelled, "queries still running at shutdown");
    }
    plugins.shutdown().await;
    handle.stop().await;
    Ok(())
}

fn print_roster(dir: &Path) {
    let roster = discover(dir);
    if roster.is_empty() {
        println!("no plugins under {}", dir.display());
        return;
    }
    for record in &roster {
        println!("{}", describe(record));
    }
}

fn describe(record: &PluginRecord) -> String {
    match &record.manifest_error {
        Some(diagnostic) => format!("{:<24} invalid: {diagnostic}", record.name),
        None => {
            let caps: Vec<String> = record.capabilities.iter().map(|c| c.to_string()).collect();
            let mut line = format!(
                "{:<24} {:<8} [{}] {} {}",
                record.name,
                record.version.as_deref().unwrap_or("-"),
                caps.join(","),
                record.command,
                record.args.join(" ")
            );
            if record.standalone {
                line.push_str("  (standalone)");
            }
            line
        }
    }
}

fn print_sessions(data_dir: &Path) -> Result<()> {
    let db_path = data_dir.join("plexus.db");
    if !db_path.exists() {
        println!("no sessions yet");
        return Ok(());
    }
    let store = SessionStore::new(Database::open(&db_path)?);
    for meta in store.list_sessions()? {
        println!(
            "{:<40} {:<9} turns={:<4} plugins=[{}]",
            meta.id.as_str(),
            meta.status.as_str(),
            meta.turn_count,
            meta.plugins.join(",")
        );
    }
    Ok(())
}
