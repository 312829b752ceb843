//! `robohub` – plugin hub command line
//!
//! | Command | Effect |
//! |---|---|
//! | `robohub run [PLUGIN..]` | supervise plugins against the robot board until Ctrl-C |
//! | `robohub test PLUGIN` | run the compliance suite for one plugin |
//! | `robohub test-all` | run the suite for every plugin, write `results.json` |
//! | `robohub report` | print the last `results.json` |
//! | `robohub config init\|show` | write or print the configuration |
//!
//! Ctrl-C cancels the session token; workers get the configured grace
//! period to stop before they are killed.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use robohub_hal::{MemoryLink, SerialLink, SerialPortLink, TransportCodec};
use robohub_kernel::{
    DeathPolicy, DispatchSink, EventDispatcher, PluginManifest, ProcessSupervisor, StatusBoard,
};
use robohub_middleware::{CommandBus, ValueStore};
use robohub_runtime::checks::EndToEnd;
use robohub_runtime::fleet::{self, render_report, render_suite};
use robohub_runtime::{Scheduler, default_suite};
use robohub_types::{HubError, Identifier};

use config::Config;

#[derive(Parser)]
#[command(name = "robohub", version, about = "Supervise and validate robot plugins")]
struct Cli {
    /// Config file (default `~/.robohub/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run plugins against the robot until Ctrl-C.
    Run {
        /// Plugin ids (directory names); all plugins when empty.
        plugins: Vec<String>,
        /// Keep running when a plugin dies.
        #[arg(long)]
        lenient: bool,
        /// Serial device, overriding the config.
        #[arg(long)]
        serial_port: Option<String>,
        /// Use an in-memory link instead of the serial port.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the compliance suite for one plugin.
    Test { plugin: String },
    /// Run the compliance suite for every plugin.
    TestAll {
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Print the results of the last `test-all`.
    Report,
    /// Manage the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration.
    Show,
}

fn main() -> ExitCode {
    let _guard = robohub_runtime::init_tracing("robohub");
    let cli = Cli::parse();

    let cfg = match config::resolve(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red());
            return ExitCode::FAILURE;
        }
    };

    // ── Ctrl-C ────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "⚠  Ctrl-C received – stopping plugins …".yellow().bold());
        on_signal.cancel();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {e}", "Cannot start runtime".red());
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli, cfg, cancel)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e}", "✗".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli, cfg: Config, cancel: CancellationToken) -> Result<ExitCode, HubError> {
    match cli.command {
        Command::Run {
            plugins,
            lenient,
            serial_port,
            dry_run,
        } => {
            let policy = if lenient { DeathPolicy::Lenient } else { cfg.death_policy };
            let port = serial_port.or_else(|| cfg.serial_port.clone());
            run_hub(&cfg, &plugins, policy, port, dry_run, cancel).await
        }
        Command::Test { plugin } => test_one(&cfg, &plugin, cancel).await,
        Command::TestAll { concurrency } => {
            test_all(&cfg, concurrency.unwrap_or(cfg.test_concurrency), cancel).await
        }
        Command::Report => {
            let results = fleet::load_results(&cfg.logs_dir)?;
            print!("{}", render_report(&results));
            Ok(exit_for(results.failed() == 0))
        }
        Command::Config { action } => {
            let path = cli.config.unwrap_or_else(config::config_path);
            match action {
                ConfigAction::Init { force } => init_config(&path, force).map(exit_for),
                ConfigAction::Show => {
                    let raw = toml::to_string_pretty(&cfg)
                        .map_err(|e| HubError::Config(e.to_string()))?;
                    println!("# {}", path.display());
                    print!("{raw}");
                    Ok(ExitCode::SUCCESS)
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────────────────

/// Status board that also echoes plugin output to the terminal.
struct ConsoleSink {
    board: StatusBoard,
}

impl DispatchSink for ConsoleSink {
    fn on_state_change(&self, origin: &Identifier, state: &str) {
        println!("{} {} {}", "●".cyan(), origin.to_string().bold(), state);
        self.board.on_state_change(origin, state);
    }

    fn on_message(&self, origin: &Identifier, text: &str) {
        println!("{} {}: {}", "»".dimmed(), origin.to_string().bold(), text);
        self.board.on_message(origin, text);
    }

    fn on_event(&self, origin: &Identifier, name: &str, payload: &Value) {
        println!("{} {} {name} {payload}", "◆".magenta(), origin.to_string().bold());
        self.board.on_event(origin, name, payload);
    }
}

fn select_plugins(modules_dir: &Path, ids: &[String]) -> Result<Vec<PluginManifest>, HubError> {
    let all = PluginManifest::discover(modules_dir)?;
    if ids.is_empty() {
        return Ok(all);
    }
    ids.iter()
        .map(|id| {
            all.iter().find(|m| &m.module_id == id).cloned().ok_or_else(|| {
                HubError::Config(format!("plugin {id} not found in {}", modules_dir.display()))
            })
        })
        .collect()
}

fn open_link(
    port: Option<String>,
    baud: u32,
    dry_run: bool,
) -> Result<Option<Box<dyn SerialLink>>, HubError> {
    if dry_run {
        let link: Box<dyn SerialLink> = Box::new(MemoryLink::new());
        return Ok(Some(link));
    }
    match port {
        Some(path) => {
            let link: Box<dyn SerialLink> = Box::new(SerialPortLink::open(&path, baud)?);
            Ok(Some(link))
        }
        None => {
            warn!("no serial port configured; motor commands will not reach the board");
            Ok(None)
        }
    }
}

async fn run_hub(
    cfg: &Config,
    ids: &[String],
    policy: DeathPolicy,
    port: Option<String>,
    dry_run: bool,
    cancel: CancellationToken,
) -> Result<ExitCode, HubError> {
    let manifests = select_plugins(&cfg.modules_dir, ids)?;
    if manifests.is_empty() {
        return Err(HubError::Config(format!(
            "no plugins found in {}",
            cfg.modules_dir.display()
        )));
    }
    let link = open_link(port, cfg.baud_rate, dry_run)?;

    print_banner();
    println!(
        "  Starting {} plugin(s) from {}",
        manifests.len(),
        cfg.modules_dir.display().to_string().bold()
    );
    for m in &manifests {
        println!("    • {}", m.identifier().to_string().bold());
    }

    let (bus, commands) = CommandBus::new();
    let store = ValueStore::new();
    let mut supervisor = ProcessSupervisor::new(
        Arc::new(cfg.worker_launcher()),
        store.clone(),
        bus,
        policy,
    )
    .with_stderr_dir(cfg.logs_dir.join("workers"));
    supervisor.start(&manifests)?;
    let lifecycle = supervisor.lifecycle_table();

    let sink = Arc::new(ConsoleSink {
        board: StatusBoard::new(),
    });
    let mut dispatcher = EventDispatcher::new(supervisor, commands, store, sink.clone(), cancel)
        .with_tick(cfg.tick())
        .with_grace(cfg.grace())
        .with_codec(TransportCodec::new(cfg.light_transform))
        .with_channel_count(cfg.channel_count);
    if let Some(link) = link {
        dispatcher = dispatcher.with_link(link);
    }

    let result = dispatcher.run().await;

    println!();
    println!("{}", "  Final plugin states:".bold());
    for (module_id, state) in lifecycle.snapshot() {
        println!("    {module_id}: {state}");
    }
    for status in sink.board.statuses() {
        println!("    {} → {}", status.origin, status.state);
    }

    result.map(|_| ExitCode::SUCCESS)
}

// ─────────────────────────────────────────────────────────────────────────────
// test / test-all
// ─────────────────────────────────────────────────────────────────────────────

fn scheduler(cfg: &Config, cancel: &CancellationToken) -> Result<Scheduler, HubError> {
    let e2e = EndToEnd {
        launcher: Arc::new(cfg.worker_launcher()),
        tick: cfg.tick(),
        grace: cfg.grace(),
        timeout: cfg.e2e_timeout(),
    };
    let suite = default_suite(Arc::new(cfg.provisioner()), e2e)?;
    Ok(Scheduler::new(suite, &cfg.logs_dir)
        .with_default_timeout(cfg.check_timeout())
        .with_cancel(cancel.clone()))
}

async fn test_one(cfg: &Config, id: &str, cancel: CancellationToken) -> Result<ExitCode, HubError> {
    let manifest = PluginManifest::load(&cfg.modules_dir.join(id))?;
    let scheduler = scheduler(cfg, &cancel)?;
    // Checks see the cancel themselves and stop their workers gracefully.
    let report = scheduler.run(&manifest).await?;
    if cancel.is_cancelled() {
        return Ok(ExitCode::from(130));
    }
    print!("{}", render_suite(&report));
    Ok(exit_for(report.all_passed()))
}

async fn test_all(
    cfg: &Config,
    concurrency: usize,
    cancel: CancellationToken,
) -> Result<ExitCode, HubError> {
    let plugins = PluginManifest::discover(&cfg.modules_dir)?;
    println!(
        "  Testing {} plugin(s), {concurrency} at a time …",
        plugins.len()
    );
    let scheduler = scheduler(cfg, &cancel)?;
    let results = fleet::test_all(&scheduler, plugins, concurrency).await?;
    if cancel.is_cancelled() {
        return Ok(ExitCode::from(130));
    }
    print!("{}", render_report(&results));
    Ok(exit_for(results.failed() == 0))
}

// ─────────────────────────────────────────────────────────────────────────────
// config
// ─────────────────────────────────────────────────────────────────────────────

/// `false` when the file exists and `force` is not set.
fn init_config(path: &Path, force: bool) -> Result<bool, HubError> {
    if path.exists() && !force {
        println!(
            "  {} already exists; pass {} to overwrite.",
            path.display().to_string().bold(),
            "--force".bold()
        );
        return Ok(false);
    }
    config::save_to(&Config::default(), path)?;
    println!(
        "  {} Config saved to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(true)
}

fn print_banner() {
    println!();
    println!("{}", "  ╔══════════════════════════════╗".bold().cyan());
    println!("{}", "  ║        R O B O H U B         ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════╝".bold().cyan());
    println!("  Version {}", env!("CARGO_PKG_VERSION"));
    println!();
}

fn exit_for(passed: bool) -> ExitCode {
    if passed { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
