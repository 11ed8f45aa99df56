//! foldervision - Concurrent folder inventory scanner.
//!
//! Usage:
//!   fv [PATHS]...                 Scan and print a summary tree
//!   fv --format json [PATHS]...   Print the full result as JSON
//!   fv --large /data              Use the large-folder profile
//!   fv --help                     Show help

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use color_eyre::eyre::{Context, Result};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use tokio::sync::broadcast;

use foldervision_scan::{
    ErrorKind, FolderNode, LaneState, ProgressSnapshot, ProgressTracker, ScanResult, ScanSettings,
    Severity, ThreadManager,
};

#[derive(Parser)]
#[command(
    name = "foldervision",
    version,
    about = "Concurrent folder inventory scanner",
    long_about = "foldervision walks one or more directory trees concurrently and \
                  reports folder structure, file counts and modification times.\n\n\
                  Each path is scanned in its own lane; press Ctrl-C to stop early \
                  and keep whatever was gathered so far."
)]
struct Cli {
    /// Paths to scan (defaults to current directory)
    #[arg(default_value = ".")]
    paths: Vec<PathBuf>,

    /// Start from the large-folder profile (8 threads, depth 100, 1024 MB)
    #[arg(long)]
    large: bool,

    /// Simultaneous directory visits per path
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Paths scanned at the same time
    #[arg(short, long)]
    lanes: Option<usize>,

    /// Maximum depth below each path
    #[arg(short = 'd', long)]
    max_depth: Option<u32>,

    /// Memory ceiling in megabytes
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Disable the memory guard
    #[arg(long)]
    no_memory_guard: bool,

    /// Global timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Per-directory timeout in seconds
    #[arg(long)]
    dir_timeout: Option<u64>,

    /// Per-directory timeout on network volumes, in seconds
    #[arg(long)]
    network_timeout: Option<u64>,

    /// Include hidden folders and files
    #[arg(short = 'H', long)]
    hidden: bool,

    /// Include folders carrying the system attribute
    #[arg(long)]
    system: bool,

    /// Do not batch very wide directories
    #[arg(long)]
    no_batching: bool,

    /// Sibling directories per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Skip directories matching this glob (repeatable)
    #[arg(short = 'x', long = "exclude")]
    exclude: Vec<String>,

    /// Output format
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Write output to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Depth of the printed tree
    #[arg(long, default_value = "2")]
    tree_depth: u32,

    /// Do not show progress
    #[arg(short, long)]
    quiet: bool,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl Cli {
    /// Map flags onto the settings builder.
    fn settings(&self) -> Result<ScanSettings> {
        let base = if self.large {
            ScanSettings::for_large_folders()
        } else {
            ScanSettings::default()
        };

        let mut builder = ScanSettings::builder();
        builder
            .max_threads(self.threads.unwrap_or(base.max_threads))
            .max_lanes(self.lanes.unwrap_or(base.max_lanes))
            .max_depth(self.max_depth.unwrap_or(base.max_depth))
            .max_memory_mb(self.memory_mb.unwrap_or(base.max_memory_mb))
            .enable_memory_optimization(!self.no_memory_guard)
            .global_timeout(seconds_or(self.timeout, base.global_timeout))
            .directory_timeout(seconds_or(self.dir_timeout, base.directory_timeout))
            .network_timeout(seconds_or(self.network_timeout, base.network_timeout))
            .skip_hidden(!self.hidden)
            .skip_system(!self.system)
            .adaptive_batching(!self.no_batching)
            .batch_size(self.batch_size.unwrap_or(base.batch_size))
            .exclude_patterns(self.exclude.clone());

        builder.build().context("Invalid settings")
    }
}

fn seconds_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let settings = cli.settings()?;
    tracing::debug!(?settings, "resolved settings");
    let paths: Vec<PathBuf> = cli
        .paths
        .iter()
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
        .collect();

    let manager = ThreadManager::new(settings).context("Invalid settings")?;
    let tracker = Arc::new(ProgressTracker::new());

    let cancel = manager.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling, finishing in-flight directories...");
            cancel.cancel();
        }
    });

    let progress = (!cli.quiet).then(|| tokio::spawn(show_progress(tracker.subscribe())));

    for path in &paths {
        eprintln!("Scanning {}...", path.display());
    }
    let result = manager.scan_all(&paths, tracker).await;

    if let Some(progress) = progress {
        progress.abort();
        eprintln!();
    }
    let result = result.context("Scan failed")?;

    let rendered = match cli.format {
        OutputFormat::Text => render_text(&result, cli.tree_depth),
        OutputFormat::Json => serde_json::to_string_pretty(&result)?,
    };

    match &cli.output {
        Some(output_path) => {
            std::fs::write(output_path, rendered)?;
            eprintln!("Written to {}", output_path.display());
        }
        None => println!("{rendered}"),
    }

    Ok(())
}

fn setup_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .init();
}

/// Redraw one status line from throttled progress snapshots.
async fn show_progress(rx: broadcast::Receiver<ProgressSnapshot>) {
    let stream = BroadcastStream::new(rx)
        .filter_map(|res| res.ok())
        .throttle(Duration::from_millis(200));
    tokio::pin!(stream);

    while let Some(snapshot) = stream.next().await {
        let eta = snapshot
            .estimated_remaining
            .map(|d| format!("{:.0}s left", d.as_secs_f64()))
            .unwrap_or_else(|| "estimating".to_string());
        let current = snapshot
            .lanes
            .iter()
            .find(|l| l.state == LaneState::Running)
            .map(|l| l.current_path.display().to_string())
            .unwrap_or_default();

        eprint!(
            "\r\x1b[2K {:5.1}%  {} active, {} done, {} failed  {:.1}s, {}  {}",
            snapshot.overall_percent,
            snapshot.active_lanes,
            snapshot.completed_lanes,
            snapshot.failed_lanes,
            snapshot.elapsed.as_secs_f64(),
            eta,
            truncate(&current, 50)
        );
        let _ = io::stderr().flush();
    }
}

fn render_text(result: &ScanResult, tree_depth: u32) -> String {
    let mut out = String::new();
    let rule = "─".repeat(60);

    out.push_str(&format!("{rule}\n {result}\n"));
    for path in &result.scanned_paths {
        out.push_str(&format!(" {}\n", path.display()));
    }
    out.push_str(&format!("{rule}\n\n"));

    for root in &result.roots {
        render_node(&mut out, root, 0, tree_depth);
        out.push('\n');
    }

    let records = result.error_records();
    if !records.is_empty() {
        out.push_str(&format!(
            "{} error(s), {} warning(s) during scan\n",
            result.errors.count_by_severity(Severity::Error),
            result.errors.count_by_severity(Severity::Warning)
        ));
        for kind in [
            ErrorKind::Access,
            ErrorKind::NotFound,
            ErrorKind::PathInvalid,
            ErrorKind::Timeout,
            ErrorKind::Resource,
            ErrorKind::Unexpected,
        ] {
            let count = records.iter().filter(|r| r.kind == kind).count();
            if count > 0 {
                out.push_str(&format!("   {kind:?}: {count}\n"));
            }
        }
        for record in records.iter().take(10) {
            out.push_str(&format!("   {}\n", record.message));
        }
    }

    out
}

/// Append a node and its children, down to `max_depth` levels.
fn render_node(out: &mut String, node: &FolderNode, depth: u32, max_depth: u32) {
    let indent = "  ".repeat(depth as usize);
    let name = if depth == 0 {
        node.path.display().to_string()
    } else {
        format!("{}/", node.name)
    };
    let marker = if node.truncated { " …" } else { "" };

    out.push_str(&format!(
        "{}{}{:<40} {:>7} folders {:>9} files{}\n",
        indent,
        if node.children.is_empty() { "  " } else { "▼ " },
        truncate(&name, 40),
        node.total_subfolder_count(),
        node.total_file_count(),
        marker
    ));

    if depth < max_depth {
        for child in &node.children {
            render_node(out, child, depth + 1, max_depth);
        }
    } else if !node.children.is_empty() {
        out.push_str(&format!("{indent}    ... {} more folders\n", node.children.len()));
    }
}

/// Truncate a string to fit within a given width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let keep: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{keep}…")
    }
}
