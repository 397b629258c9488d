use anyhow::{bail, Context, Result};
use blobsync::config::ConfigFile;
use blobsync::replicate::Mode;
use blobsync::store::fs::DEFAULT_SHARD_LEN;
use blobsync::transport::{process, tcp, Duplex};
use blobsync::{FsBlobStore, Progress, Session, SyncReport};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Replicate a directory of blobs with a peer over one byte stream.
///
/// Both ends run the same command; each side sends what the other is missing.
#[derive(Debug, Parser)]
#[command(name = "blobsync", version, about)]
struct Cli {
    /// Directory holding the local blob store
    store: PathBuf,

    #[command(subcommand)]
    transport: Transport,

    /// Direction this side takes part in: sync, push or pull
    #[arg(long, env = "BLOBSYNC_MODE")]
    mode: Option<Mode>,

    /// Only advertise keys matching this glob
    #[arg(long)]
    filter: Option<String>,

    /// Only advertise keys matching this regex
    #[arg(long)]
    filter_regex: Option<String>,

    /// Characters of the file name used as shard directory (0 disables)
    #[arg(long)]
    shard_len: Option<usize>,

    /// Largest CHUNK payload in bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Config file (default: <config dir>/blobsync/config.toml)
    #[arg(long, env = "BLOBSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Only log warnings and errors; no progress bar
    #[arg(short, long)]
    quiet: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Transport {
    /// Accept one TCP connection on ADDR
    Listen { addr: String },
    /// Connect to a listening peer at ADDR
    Connect { addr: String },
    /// Use this process's stdin/stdout
    Stdio,
    /// Spawn PROGRAM and talk over its stdin/stdout
    Exec {
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(quiet: bool, verbose: u8) {
    let default = match (quiet, verbose) {
        (true, _) => "blobsync=warn",
        (false, 0) => "blobsync=info",
        (false, 1) => "blobsync=debug",
        (false, _) => "blobsync=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // stdout may be the replication channel
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    if cli.json && matches!(cli.transport, Transport::Stdio) {
        bail!("--json cannot be combined with the stdio transport");
    }

    let file = match &cli.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::load_default()?,
    };
    let file = apply_overrides(&cli, file);
    let capability = file.capability()?;
    let store = FsBlobStore::new(&cli.store)
        .with_shard_len(file.shard_len.unwrap_or(DEFAULT_SHARD_LEN));

    let duplex = open(&cli.transport).await?;
    tracing::info!("Replicating {} with {}", cli.store.display(), duplex.peer());
    let (reader, writer, child) = duplex.into_parts();

    let bar = if cli.quiet || cli.json {
        ProgressBar::hidden()
    } else {
        progress_bar()
    };
    let listener = bar.clone();
    let session = Session::new(store, capability)
        .with_config(file.session)
        .on_progress(move |p: Progress| {
            listener.set_length(p.total);
            listener.set_position(p.sofar);
        });

    let result = tokio::select! {
        result = session.run(reader, writer) => result.context("replication failed"),
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };
    bar.finish_and_clear();

    if let Some(mut child) = child {
        match child.wait().await {
            Ok(status) if !status.success() => tracing::warn!("Peer process exited with {}", status),
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to wait for peer process: {}", e),
        }
    }

    let report = result?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !cli.quiet {
        print_summary(&report);
    }
    Ok(())
}

fn apply_overrides(cli: &Cli, mut file: ConfigFile) -> ConfigFile {
    if let Some(mode) = cli.mode {
        file.mode = Some(mode);
    }
    if let Some(filter) = &cli.filter {
        file.filter = Some(filter.clone());
    }
    if let Some(filter) = &cli.filter_regex {
        file.filter_regex = Some(filter.clone());
    }
    if let Some(shard_len) = cli.shard_len {
        file.shard_len = Some(shard_len);
    }
    if let Some(chunk_size) = cli.chunk_size {
        file.session.chunk_size = chunk_size;
    }
    file
}

async fn open(transport: &Transport) -> Result<Duplex> {
    let duplex = match transport {
        Transport::Listen { addr } => tcp::listen(addr.as_str())
            .await
            .with_context(|| format!("Failed to accept a peer on {}", addr))?,
        Transport::Connect { addr } => tcp::connect(addr.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?,
        Transport::Stdio => Duplex::stdio(),
        Transport::Exec { program, args } => process::spawn(program, args)
            .with_context(|| format!("Failed to spawn {}", program))?,
    };
    Ok(duplex)
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} blobs",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    bar
}

fn print_summary(report: &SyncReport) {
    if report.total == 0 {
        eprintln!("{} already in sync ({} keys)", "✓".green(), report.local_keys);
        return;
    }
    eprintln!(
        "{} sent {} blobs ({}), received {} blobs ({})",
        "✓".green(),
        report.sent.blobs.to_string().bold(),
        HumanBytes(report.sent.bytes),
        report.received.blobs.to_string().bold(),
        HumanBytes(report.received.bytes)
    );
}
