// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! modelpull - resumable model downloads from the command line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{fmt, EnvFilter};

use modelpull::config::{self, Config};
use modelpull::download::{
    DownloadRecord, DownloadStatus, ModelKind, ModelManager, ProgressReport, ProgressSink,
    SourceRouter,
};
use modelpull::error::DownloadError;
use modelpull::hub::HubSource;
use modelpull::utils::{format_bytes, format_eta, format_speed};

#[derive(Parser)]
#[command(name = "modelpull")]
#[command(version)]
#[command(about = "Resumable, concurrency-bounded model downloads that survive restarts.")]
#[command(long_about = "modelpull - resumable model downloads\n\n\
    Download a model:     modelpull pull hf:acme/model-x\n\
    One artifact only:    modelpull pull hf:acme/model-x-GGUF/model-x.Q4_K_M\n\
    See what's tracked:   modelpull list\n\
    Continue later:       modelpull resume hf:acme/model-x\n\n\
    Press Ctrl+C during a pull to pause it; progress is kept on disk.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory for state files and models (default: ~/.modelpull)
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Hub access token for gated or private models
    #[arg(long, global = true)]
    token: Option<String>,

    /// Maximum number of concurrent transfers
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    /// Verbose mode: debug logging to stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a model and wait for it to finish
    ///
    /// Examples:
    ///   modelpull pull hf:acme/model-x
    ///   modelpull pull hf:acme/model-x --timeout 3600
    Pull {
        /// Model id: registry:publisher/model[/artifact]
        model_id: String,
        /// Give up waiting after this many seconds (the download keeps its progress)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Resume a paused download and wait for it to finish
    Resume {
        model_id: String,
    },

    /// Cancel a download and discard its progress
    Cancel {
        model_id: String,
    },

    /// List tracked downloads, including ones recovered from disk
    #[command(alias = "ls")]
    List,

    /// Show the state of one download
    Status {
        model_id: String,
    },

    /// Show what a model id resolves to on its source
    Info {
        model_id: String,
    },

    /// Search the hub
    ///
    /// Examples:
    ///   modelpull search llama
    ///   modelpull search whisper --kind speech-to-text --limit 5
    Search {
        term: String,
        /// text-generation, embedding, speech-to-text, text-to-speech, image-generation, other
        #[arg(short, long)]
        kind: Option<ModelKind>,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Configure settings
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Store a hub access token
    ///
    /// Example:
    ///   modelpull config set-token hf_xxx
    SetToken {
        token: String,
    },

    /// Change how many downloads may transfer at once
    SetConcurrency {
        count: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "[✗]".red(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "modelpull=debug" } else { "modelpull=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = config::load_config()?;
    if let Some(dir) = cli.base_dir {
        config.base_dir = Some(dir);
    }
    if let Some(token) = cli.token {
        config.hub_token = Some(token);
    }
    if let Some(max) = cli.max_concurrent {
        config.max_concurrent_downloads = max;
    }

    match cli.command {
        Commands::Config { command } => handle_config(command.unwrap_or(ConfigCommands::Show), &config),
        Commands::Pull { model_id, timeout } => {
            if let Some(secs) = timeout {
                config.wait_timeout_secs = Some(secs);
            }
            let models = build_manager(&config)?;
            pull(&models, &model_id).await
        }
        Commands::Resume { model_id } => {
            let models = build_manager(&config)?;
            match models.get_status(&model_id) {
                Some(DownloadStatus::Paused) => pull(&models, &model_id).await,
                Some(status) => bail!("'{}' is {}, not paused", model_id, status),
                None => bail!("no download is tracked for '{}'", model_id),
            }
        }
        Commands::Cancel { model_id } => {
            let models = build_manager(&config)?;
            let record = models.cancel(&model_id).await?;
            println!(
                "{} Cancelled {} ({} discarded)",
                "[✓]".green(),
                record.model_id.bold(),
                format_bytes(record.bytes_downloaded)
            );
            Ok(())
        }
        Commands::List => {
            let models = build_manager(&config)?;
            print_downloads(&models.list_active_downloads());
            Ok(())
        }
        Commands::Status { model_id } => {
            let models = build_manager(&config)?;
            show_status(&models, &model_id)
        }
        Commands::Info { model_id } => {
            let models = build_manager(&config)?;
            let info = models.model_info(&model_id).await?;
            println!("{}", info.model_id.bold());
            println!("  Kind:     {}", info.kind);
            println!("  Artifact: {}", info.artifact_name);
            match info.size_bytes {
                Some(size) => println!("  Size:     {}", format_bytes(size)),
                None => println!("  Size:     unknown"),
            }
            println!("  Files:");
            for file in &info.files {
                let size = file.size.map(format_bytes).unwrap_or_else(|| "?".to_string());
                println!("    {:>10}  {}", size, file.name);
            }
            Ok(())
        }
        Commands::Search { term, kind, limit } => {
            let models = build_manager(&config)?;
            let found = models.search(kind, &term, limit).await?;
            if found.is_empty() {
                println!("{} No models match '{}'", "[!]".yellow(), term);
            }
            for repo in found {
                let gated = if repo.gated { " (gated)".yellow().to_string() } else { String::new() };
                println!(
                    "{:<50} {:<18} {:>10} downloads {:>6} likes{}",
                    repo.repo_id.bold(),
                    repo.kind.to_string(),
                    repo.downloads,
                    repo.likes,
                    gated
                );
            }
            Ok(())
        }
    }
}

fn build_manager(config: &Config) -> Result<ModelManager> {
    let hub = HubSource::new(&config.hub_endpoint, config.hub_token.clone(), &config.user_agent)?;
    let source = Arc::new(SourceRouter::new().with_source(Arc::new(hub)));
    let base_dir = config.base_dir()?;
    let models = ModelManager::new(source, &base_dir, config.max_concurrent(), config.wait_timeout())
        .with_context(|| format!("Failed to open download state in {:?}", base_dir))?;
    Ok(models)
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "  {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▓░");
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

async fn pull(models: &ModelManager, model_id: &str) -> Result<()> {
    println!("{} Pulling {}", "[↓]".yellow(), model_id.bold());

    let pb = progress_bar();
    let sink: ProgressSink = {
        let pb = pb.clone();
        Arc::new(move |report: &ProgressReport| {
            if let Some(total) = report.total_bytes {
                pb.set_length(total);
            }
            pb.set_position(report.bytes_downloaded);
            let mut message = report.file_name.clone();
            if let Some(speed) = report.bytes_per_second {
                message.push_str(&format!("  {}", format_speed(speed)));
            }
            if let Some(eta) = report.eta {
                message.push_str(&format!("  eta {}", format_eta(eta)));
            }
            pb.set_message(message);
        })
    };

    let download = models.download_and_wait(model_id, Some(sink));
    tokio::pin!(download);

    let result = tokio::select! {
        result = &mut download => result,
        _ = tokio::signal::ctrl_c() => {
            pb.suspend(|| eprintln!("{} Interrupted, pausing...", "[!]".yellow()));
            models.shutdown().await;
            download.await
        }
    };
    pb.finish_and_clear();

    match result {
        Ok(model) => {
            let location = model
                .local_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            println!("{} {} ready at {}", "[✓]".green(), model.model_id.bold(), location);
            Ok(())
        }
        Err(DownloadError::Interrupted { .. }) | Err(DownloadError::ShuttingDown { .. }) => {
            println!(
                "{} Download paused. Resume with: modelpull resume {}",
                "[!]".yellow(),
                model_id
            );
            Ok(())
        }
        Err(e @ DownloadError::Timeout { .. }) => {
            println!("{} {}", "[!]".yellow(), e);
            println!("    Progress is kept; run `modelpull resume {}` to continue.", model_id);
            models.shutdown().await;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn show_status(models: &ModelManager, model_id: &str) -> Result<()> {
    if let Some(record) = models.get_record(model_id) {
        print_downloads(std::slice::from_ref(&record));
        return Ok(());
    }
    match models.find_local(model_id)? {
        Some(model) => {
            let location = model
                .local_path
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            println!("{} {} is downloaded at {}", "[✓]".green(), model_id.bold(), location);
        }
        None => println!("{} No download is tracked for {}", "[!]".yellow(), model_id),
    }
    Ok(())
}

fn print_downloads(records: &[DownloadRecord]) {
    if records.is_empty() {
        println!("No downloads are tracked.");
        return;
    }
    for record in records {
        let status = match record.status {
            DownloadStatus::Completed => record.status.to_string().green(),
            DownloadStatus::Failed | DownloadStatus::Cancelled => record.status.to_string().red(),
            DownloadStatus::Paused => record.status.to_string().yellow(),
            _ => record.status.to_string().cyan(),
        };
        let progress = match (record.progress_percent(), record.total_bytes) {
            (Some(pct), Some(total)) => format!(
                "{:>5.1}% {} / {}",
                pct,
                format_bytes(record.bytes_downloaded),
                format_bytes(total)
            ),
            _ => format_bytes(record.bytes_downloaded),
        };
        println!("{:<12} {:<50} {}", status, record.model_id.bold(), progress);
        if let Some(message) = &record.message {
            println!("             {}", message.dimmed());
        }
    }
}

fn handle_config(command: ConfigCommands, effective: &Config) -> Result<()> {
    let path = config::config_path()?;
    match command {
        ConfigCommands::Show => {
            println!("Config file: {}", path.display());
            println!("Base dir:    {}", effective.base_dir()?.display());
            println!("{}", serde_json::to_string_pretty(&effective.masked())?);
        }
        ConfigCommands::SetToken { token } => {
            let mut stored = config::load_config_from(&path)?;
            stored.hub_token = Some(token.trim().to_string());
            config::save_config_to(&stored, &path)?;
            println!("{} Hub token saved", "[✓]".green());
        }
        ConfigCommands::SetConcurrency { count } => {
            if count == 0 {
                bail!("concurrency must be at least 1");
            }
            let mut stored = config::load_config_from(&path)?;
            stored.max_concurrent_downloads = count;
            config::save_config_to(&stored, &path)?;
            println!("{} Max concurrent downloads set to {}", "[✓]".green(), count);
        }
    }
    Ok(())
}
