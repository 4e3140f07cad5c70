//! logfetch: retrieve vehicle logs from on-board log servers
//!
//! Commands:
//!   list [--files]                         - sync the listing and print folders
//!   files <folder>                         - print one folder's files
//!   status [<names>...]                    - print folder states and the summary
//!   download <folders>... [--file <name>]  - download with progress bars
//!   delete <folders>... [--file <name>]    - delete on the log servers
//!   config show                            - print the effective configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use logfetch_core::config::LogFetchConfig;
use logfetch_core::{SyncState, TransferState};
use logfetch_sync::{
    AlwaysConfirm, DeleteConfirmation, DownloadOrchestrator, DownloaderEvent, TransferTask,
};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "logfetch",
    version,
    about = "Vehicle log retrieval",
    long_about = "logfetch: list, download, and delete log folders on vehicle log servers"
)]
struct Cli {
    /// Path to logfetch.toml configuration file
    #[arg(long, short = 'c', env = "LOGFETCH_CONFIG", default_value = "logfetch.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOGFETCH_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "LOGFETCH_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Command-line overrides applied on top of the config file
#[derive(clap::Args, Debug, Default)]
struct Overrides {
    /// Host of the main log server
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port of every log server
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Vehicle label (local subdirectory)
    #[arg(long, global = true)]
    label: Option<String>,

    /// Base directory for downloaded logs
    #[arg(long, global = true)]
    dest: Option<PathBuf>,

    /// Also list the newest folder, which may still be written
    #[arg(long, global = true)]
    include_active: bool,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync the remote listing and print every folder
    List {
        /// Also print each folder's files
        #[arg(long)]
        files: bool,
    },

    /// Print the files of one folder
    Files { folder: String },

    /// Print folder states (all folders when none are named)
    Status {
        names: Vec<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Download folders, or selected files of one folder
    Download {
        #[arg(required = true)]
        folders: Vec<String>,

        /// Only these files (name or remote path); needs exactly one folder
        #[arg(long = "file")]
        files: Vec<String>,
    },

    /// Delete folders, or selected files of one folder, on the log servers
    Delete {
        #[arg(required = true)]
        folders: Vec<String>,

        #[arg(long = "file")]
        files: Vec<String>,

        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration (defaults + file + flags)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli.config).await?;
    apply_overrides(&mut config, &cli.overrides);

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);
    if !cli.config.exists() {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "logfetch starting"
    );

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
        Commands::List { files } => cmd_list(config, files).await,
        Commands::Files { folder } => cmd_files(config, &folder).await,
        Commands::Status { names, json } => cmd_status(config, &names, json).await,
        Commands::Download { folders, files } => cmd_download(config, &folders, &files).await,
        Commands::Delete {
            folders,
            files,
            yes,
        } => cmd_delete(config, &folders, &files, yes).await,
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

/// Defaults when `path` does not exist; read before logging is set up so the
/// file can choose the log level.
async fn load_config(path: &Path) -> Result<LogFetchConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(LogFetchConfig::default())
    }
}

fn apply_overrides(config: &mut LogFetchConfig, overrides: &Overrides) {
    if let Some(host) = &overrides.host {
        if let Some(main) = config.endpoints.first_mut() {
            main.host = Some(host.clone());
        }
    }
    if let Some(port) = overrides.port {
        for endpoint in &mut config.endpoints {
            endpoint.port = port;
        }
    }
    if let Some(label) = &overrides.label {
        config.storage.label = label.clone();
    }
    if let Some(dest) = &overrides.dest {
        config.storage.base_dir = dest.clone();
    }
    if overrides.include_active {
        config.listing.ignore_active_log = false;
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Progress helpers ──────────────────────────────────────────────────────────

fn make_transfer_bar(multi: &MultiProgress, total: u64, prefix: &str) -> ProgressBar {
    let pb = multi.add(ProgressBar::new(total));
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap()
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}").unwrap());
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Sync the listing with a spinner showing the current phase.
async fn synced(config: LogFetchConfig) -> Result<DownloadOrchestrator> {
    let orch = DownloadOrchestrator::new(config)?;
    let spinner = make_spinner("listing");
    let mut events = orch.subscribe();
    let phases = spinner.clone();
    let follower = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DownloaderEvent::Listing(phase) => phases.set_message(phase.to_string()),
                DownloaderEvent::DepthLimited { endpoint, path } => {
                    phases.println(format!("  skipped nested directory {path} on {endpoint}"))
                }
                DownloaderEvent::Message(msg) => phases.println(format!("  {msg}")),
                _ => {}
            }
        }
    });

    let report = orch.sync_listing().await;
    follower.abort();
    spinner.finish_and_clear();

    let report = report.context("listing")?;
    for key in &report.endpoints_failed {
        eprintln!("warning: log server {key} unreachable");
    }
    if let Some(active) = &report.active {
        eprintln!("note: skipping active log {active} (use --include-active to list it)");
    }
    Ok(orch)
}

fn state_label(state: SyncState) -> String {
    format!("{:<11}", state.to_string())
}

// ── `logfetch list` ───────────────────────────────────────────────────────────

async fn cmd_list(config: LogFetchConfig, with_files: bool) -> Result<()> {
    let orch = synced(config).await?;
    for name in orch.list_folders() {
        let Some(folder) = orch.folder(&name) else {
            continue;
        };
        let presence = folder.presence();
        println!(
            "{} {}  [{}]",
            state_label(folder.state),
            folder.name,
            if presence.is_empty() { "local" } else { presence.as_str() }
        );
        if with_files {
            for file in folder.files() {
                print_file(file);
            }
        }
    }
    if let Some(summary) = orch.summary() {
        println!("summary: {summary}");
    }
    Ok(())
}

fn print_file(file: &logfetch_sync::FileEntry) {
    let size = file
        .size
        .map(|s| HumanBytes(s).to_string())
        .unwrap_or_else(|| "?".into());
    let marker = if file.is_dir { "/" } else { "" };
    println!(
        "    {} {:>12}  {}{}",
        state_label(file.state),
        size,
        file.file_name(),
        marker
    );
}

// ── `logfetch files` ──────────────────────────────────────────────────────────

async fn cmd_files(config: LogFetchConfig, folder: &str) -> Result<()> {
    let orch = synced(config).await?;
    let Some(entry) = orch.folder(folder) else {
        bail!("unknown folder: {folder}");
    };
    println!("{} {}", state_label(entry.state), entry.name);
    for file in entry.files() {
        print_file(file);
    }
    Ok(())
}

// ── `logfetch status` ─────────────────────────────────────────────────────────

async fn cmd_status(config: LogFetchConfig, names: &[String], json: bool) -> Result<()> {
    let orch = synced(config).await?;
    let states = orch.folder_states(names);
    let summary = orch.summary();

    if json {
        let out = serde_json::json!({ "folders": states, "summary": summary });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for (name, state) in &states {
        println!("{} {name}", state_label(*state));
    }
    for missing in names.iter().filter(|n| {
        !states
            .keys()
            .any(|k| k.eq_ignore_ascii_case(n.as_str()))
    }) {
        println!("{:<11} {missing}", "missing");
    }
    match summary {
        Some(s) => println!("summary: {s}"),
        None => println!("summary: no folders"),
    }
    Ok(())
}

// ── `logfetch download` ───────────────────────────────────────────────────────

async fn cmd_download(config: LogFetchConfig, folders: &[String], files: &[String]) -> Result<()> {
    let orch = synced(config).await?;
    if let Some(space) = orch.store().disk_space() {
        eprintln!(
            "free space: {} of {}",
            HumanBytes(space.available),
            HumanBytes(space.total)
        );
    }

    let started = if files.is_empty() {
        orch.download(folders)
    } else {
        if folders.len() != 1 {
            bail!("--file needs exactly one folder");
        }
        orch.download_files(&folders[0], files)
    };
    if started == 0 {
        println!("nothing to download");
        return Ok(());
    }

    let tasks: Vec<TransferTask> = folders
        .iter()
        .filter_map(|f| orch.list_files(f))
        .flatten()
        .filter_map(|uri| orch.transfer(&uri))
        .collect();

    let outcome = tokio::select! {
        _ = follow_transfers(&tasks) => None,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted, stopping transfers");
            Some(orch.reset(true).await)
        }
    };

    let failed = tasks
        .iter()
        .filter(|t| t.state() != TransferState::Done)
        .count();
    for (name, state) in orch.folder_states(folders) {
        println!("{} {name}", state_label(state));
    }
    if let Some(settled) = outcome {
        if !settled {
            eprintln!("warning: some transfers did not stop in time");
        }
    }
    if failed > 0 {
        bail!("{failed} of {} transfer(s) did not complete", tasks.len());
    }
    Ok(())
}

/// Drive one progress bar per task until every task has settled.
async fn follow_transfers(tasks: &[TransferTask]) {
    let multi = MultiProgress::new();
    let mut bars: HashMap<String, ProgressBar> = tasks
        .iter()
        .map(|t| {
            let name = t.id().rsplit('/').next().unwrap_or(t.id());
            (
                t.id().to_string(),
                make_transfer_bar(&multi, t.source().size, name),
            )
        })
        .collect();

    let mut tick = tokio::time::interval(Duration::from_millis(150));
    loop {
        tick.tick().await;
        let mut pending = false;
        for task in tasks {
            let Some(pb) = bars.get(task.id()) else {
                continue;
            };
            let state = task.state();
            let progress = task.progress();
            pb.set_position(progress.downloaded);

            match state {
                TransferState::Done | TransferState::Error | TransferState::NotDone => {
                    pb.finish_with_message(state.to_string());
                    bars.remove(task.id());
                }
                TransferState::Working => {
                    pending = true;
                    let rate = progress
                        .rate_bps
                        .map(|r| format!("{}/s", HumanBytes(r as u64)))
                        .unwrap_or_default();
                    let eta = progress.eta.map(|e| e.to_string()).unwrap_or_default();
                    let files = if progress.total_files > 1 {
                        format!(" {}/{} files", progress.done_files, progress.total_files)
                    } else {
                        String::new()
                    };
                    pb.set_message(format!("{rate} {eta}{files}"));
                }
                TransferState::Idle | TransferState::Queued | TransferState::Timeout => {
                    pending = true;
                    pb.set_message(state.to_string());
                }
            }
        }
        if !pending {
            break;
        }
    }
}

// ── `logfetch delete` ─────────────────────────────────────────────────────────

/// Asks on the terminal before deleting anything remotely
struct PromptConfirm;

impl DeleteConfirmation for PromptConfirm {
    fn confirm_remote_delete(&self, targets: &[String]) -> bool {
        eprintln!("About to delete on the log servers:");
        for t in targets {
            eprintln!("  {t}");
        }
        eprint!("Proceed? [y/N] ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}

async fn cmd_delete(
    config: LogFetchConfig,
    folders: &[String],
    files: &[String],
    yes: bool,
) -> Result<()> {
    let orch = synced(config).await?;
    let confirm: &dyn DeleteConfirmation = if yes { &AlwaysConfirm } else { &PromptConfirm };

    let ok = if files.is_empty() {
        orch.delete_folders(folders, confirm).await
    } else {
        if folders.len() != 1 {
            bail!("--file needs exactly one folder");
        }
        orch.delete_files(&folders[0], files, confirm).await
    };
    if !ok {
        bail!("delete incomplete or declined");
    }
    println!("deleted");
    Ok(())
}

// ── `logfetch config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &LogFetchConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
