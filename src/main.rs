//! zonefw - zone firewall and QoS policy engine
//!
//! Compiles a policy file into nftables and tc directives and enforces them.
//!
//! # Usage
//!
//! ```bash
//! zonefw check                       # Validate the policy, report per-entity errors
//! zonefw compile --json              # Print compiled directives
//! zonefw export --output fw.nft      # Write the nft script (tc batch as comments)
//! zonefw apply                       # Full rebuild of the managed table and shapers
//! zonefw sync                        # Correct drift between policy and live state
//! zonefw diff                        # Desired listing vs. live managed table
//! zonefw status                      # Status of the running daemon
//! zonefw teardown                    # Remove everything zonefw enforced
//! zonefw run                         # Daemon: rebuild, periodic sync, SIGHUP reload
//! ```
//!
//! Commands run unprivileged and elevate only the nft and tc invocations.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use zonefw::audit::AuditLog;
use zonefw::config::{EngineConfig, load_config, write_atomic};
use zonefw::core::compiler::compile;
use zonefw::core::directive::{Invocation, render_listing};
use zonefw::core::engine::{ApplyReport, CommandRunner, Engine, RebuildTarget, SystemRunner};
use zonefw::core::error::{CommandErrorPattern, Error, Result};
use zonefw::core::model::PolicySource;
use zonefw::core::scheduler::{Job, JobState, Scheduler};
use zonefw::core::store::FilePolicyStore;
use zonefw::core::sync::{NftObserver, reconcile};
use zonefw::core::views::{CompilationView, StatusView, SyncReportView};
use zonefw::{export, utils};

const STATUS_FILE: &str = "status.json";
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "zonefw")]
#[command(about = "Zone firewall and QoS policy engine for nftables and tc", long_about = None)]
struct Cli {
    /// Engine configuration file (default: <config_dir>/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Policy file (overrides the configured path)
    #[arg(long, global = true, value_name = "PATH")]
    policy: Option<PathBuf>,
    /// Log to stderr at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the policy and report errors and warnings
    Check,
    /// Print the compiled directives
    Compile {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export the compiled policy as an nft script
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Rebuild the managed table and every shaper tree
    Apply,
    /// Reconcile live state with the policy once
    Sync,
    /// Show how the live managed table differs from the policy
    Diff,
    /// Show the status published by `zonefw run`
    Status,
    /// Delete the managed table and every shaper tree
    Teardown,
    /// Load a script written by `export` in place of the managed table
    Restore {
        /// Script to load
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Enforce the policy and keep it in sync until interrupted
    Run,
}

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            if e.is_apply_error() {
                print_hints(&e.detail());
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    if verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
        return;
    }
    if let Some(mut log_path) = utils::get_state_dir() {
        log_path.push("zonefw.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
}

fn print_hints(detail: &str) {
    let translation = CommandErrorPattern::match_error(detail);
    eprintln!("  {}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  • {suggestion}");
    }
}

async fn open_store(cli_policy: Option<&Path>, config: &EngineConfig) -> Result<Arc<FilePolicyStore>> {
    let path = cli_policy
        .map(Path::to_path_buf)
        .or_else(|| config.resolved_policy_path())
        .ok_or_else(|| Error::validation("policy", "no policy path and no data directory"))?;
    Ok(Arc::new(FilePolicyStore::open(path).await?))
}

fn new_engine(config: &EngineConfig) -> Arc<Engine<SystemRunner>> {
    let journal = match AuditLog::new() {
        Ok(log) => Some(log),
        Err(e) => {
            warn!("Directive log unavailable: {e}");
            None
        }
    };
    Arc::new(Engine::new(SystemRunner::new(config), config, journal))
}

fn status_path() -> Option<PathBuf> {
    utils::get_state_dir().map(|d| d.join(STATUS_FILE))
}

async fn handle_cli(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Status => return show_status().await,
        Commands::Teardown => {
            let engine = new_engine(&config);
            // the policy may be unreadable; the table goes regardless
            if let Ok(store) = open_store(cli.policy.as_deref(), &config).await
                && let Ok(snapshot) = store.snapshot()
            {
                engine
                    .claim_devices(snapshot.qos_configs.iter().flat_map(|c| {
                        std::iter::once(c.interface.clone()).chain(c.ingress_device.clone())
                    }))
                    .await;
            }
            let report = engine.teardown().await?;
            return Ok(print_report("Teardown", &report));
        }
        Commands::Restore { path } => {
            let engine = new_engine(&config);
            export::restore(&engine, &path).await?;
            println!("✓ Restored {}", path.display());
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let store = open_store(cli.policy.as_deref(), &config).await?;

    match cli.command {
        Commands::Check => check(&config, &store),
        Commands::Compile { json } => {
            let compilation = compile(&store.snapshot()?, config.priority_order);
            if json {
                let view = CompilationView::new(&config.table, &compilation);
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                for directive in &compilation.directives {
                    println!("{}\t{}", directive.owner, directive.invocation(&config.table));
                }
                for err in &compilation.errors {
                    eprintln!("✗ {}: {}", err.entity, err.error);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Export { output } => {
            let compilation = compile(&store.snapshot()?, config.priority_order);
            let script = export::render_script(&config.table, &compilation);
            match output {
                Some(path) => {
                    export::save_script(&path, &script)?;
                    println!("✓ Exported {} directives to {}", compilation.directives.len(), path.display());
                }
                None => print!("{script}"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Apply => {
            if !nix::unistd::getuid().is_root() {
                println!("Note: Not running as root. Will elevate nft and tc.");
            }
            let engine = new_engine(&config);
            let report = engine.rebuild(&*store, RebuildTarget::All).await?;
            Ok(print_report("Apply", &report))
        }
        Commands::Sync => {
            let engine = new_engine(&config);
            let observer = NftObserver::new(engine.runner(), &config)?;
            let report = reconcile(&*engine, &observer, &*store, config.unknown_mapping_policy).await?;
            println!("{}", serde_json::to_string_pretty(&SyncReportView::from(&report))?);
            Ok(if report.errors.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Diff => diff(&config, &store).await,
        Commands::Run => run(config, store).await,
        Commands::Status | Commands::Teardown | Commands::Restore { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn check(config: &EngineConfig, store: &FilePolicyStore) -> Result<ExitCode> {
    let snapshot = store.snapshot()?;
    let compilation = compile(&snapshot, config.priority_order);

    let present = utils::list_interfaces();
    if !present.is_empty() {
        let configured = snapshot
            .zones
            .iter()
            .filter(|z| z.enabled)
            .flat_map(|z| z.interfaces.iter())
            .chain(snapshot.qos_configs.iter().filter(|c| c.enabled).map(|c| &c.interface));
        for iface in configured {
            if !present.contains(iface) {
                println!("⚠ interface {iface} is not present on this host");
            }
        }
    }
    for warning in &compilation.warnings {
        println!("⚠ {warning}");
    }
    for err in &compilation.errors {
        println!("✗ {}: {}", err.entity, err.error);
    }
    println!(
        "{} directives, {} errors, {} warnings",
        compilation.directives.len(),
        compilation.errors.len(),
        compilation.warnings.len()
    );
    Ok(if compilation.errors.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(action: &str, report: &ApplyReport) -> ExitCode {
    for warning in &report.warnings {
        println!("⚠ {warning}");
    }
    for error in &report.errors {
        println!("✗ {error}");
    }
    for result in report.results.iter().filter(|r| r.error.is_some()) {
        let message = result.error.as_deref().unwrap_or_default();
        println!("✗ {} {}: {message}", result.operation, result.directive);
        print_hints(message);
    }
    println!(
        "{action}: {} directives applied, {} failed",
        report.succeeded(),
        report.failed()
    );
    if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn diff(config: &EngineConfig, store: &FilePolicyStore) -> Result<ExitCode> {
    let compilation = compile(&store.snapshot()?, config.priority_order);
    let desired = render_listing(&config.table, &compilation.directives);

    let runner = SystemRunner::new(config);
    let listing = Invocation::nft(["list", "table", "inet", config.table.as_str()]);
    let live = match runner.run(&listing, config.command_timeout()).await {
        Ok(output) => output.stdout,
        Err(e) if e.detail().contains("No such file") => String::new(),
        Err(e) => return Err(e),
    };

    match export::unified_diff(&export::managed_listing(&live), &desired) {
        Some(diff) => {
            print!("{diff}");
            Ok(ExitCode::FAILURE)
        }
        None => {
            println!("✓ Live table matches the policy");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn show_status() -> Result<ExitCode> {
    let Some(path) = status_path() else {
        return Err(Error::Internal("no state directory".into()));
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(json) => {
            println!("{json}");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("zonefw is not running (no {})", path.display());
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

async fn publish_status(engine: &Engine<SystemRunner>) {
    let Some(path) = status_path() else {
        return;
    };
    let view = StatusView::from(&engine.status().await);
    match serde_json::to_vec_pretty(&view) {
        Ok(json) => {
            if let Err(e) = write_atomic(&path, &json).await {
                warn!("Failed to write status file {}: {e}", path.display());
            }
        }
        Err(e) => warn!("Failed to serialize status: {e}"),
    }
}

async fn run(config: EngineConfig, store: Arc<FilePolicyStore>) -> Result<ExitCode> {
    use tokio::signal::unix::{SignalKind, signal};

    let engine = new_engine(&config);
    let observer = Arc::new(NftObserver::new(engine.runner(), &config)?);
    let scheduler = Scheduler::new(
        Arc::clone(&engine),
        observer,
        Arc::clone(&store),
        config.unknown_mapping_policy,
        config.max_concurrent_jobs,
    );

    let initial = scheduler.enqueue(Job::Rebuild {
        target: RebuildTarget::All,
    });
    if let Some(record) = scheduler.wait(initial).await {
        match record.state {
            JobState::Succeeded => info!("Initial rebuild complete"),
            _ => warn!(
                "Initial rebuild finished with errors: {}",
                record.error.as_deref().unwrap_or("unknown")
            ),
        }
    }
    publish_status(&engine).await;

    let sync_task = (config.sync_interval_secs > 0)
        .then(|| scheduler.spawn_periodic_sync(Duration::from_secs(config.sync_interval_secs)));

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    println!("zonefw running on table inet {} (Ctrl-C to stop)", config.table);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => {
                match store.reload().await {
                    Ok(()) => {
                        info!("Policy reloaded from {}", store.path().display());
                        scheduler.enqueue(Job::Rebuild { target: RebuildTarget::All });
                    }
                    Err(e) => error!("Policy reload failed, keeping current policy: {e}"),
                }
            }
            _ = ticker.tick() => publish_status(&engine).await,
        }
    }

    if let Some(task) = sync_task {
        task.abort();
    }
    publish_status(&engine).await;
    info!("zonefw stopped; enforced state left in place");
    println!("Stopped. Enforced rules remain active; use `zonefw teardown` to remove them.");
    Ok(ExitCode::SUCCESS)
}
