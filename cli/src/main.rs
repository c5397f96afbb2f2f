//! Anchor CLI - load files into the analyzer and wait for it to catch up.
//!
//! ```text
//! anchor [--wait SECS] FILE...
//! ```
//!
//! Each file is read into a [`TextBuffer`], monitored by the orchestrator
//! and synced. The command waits (bounded by `--wait`) for the analyzer to
//! acknowledge every file, then prints the parse and analysis versions it
//! reported for each one.
//!
//! The analyzer command comes from `~/.anchor/config.toml`, or from the
//! `ANCHOR_ANALYZER` environment variable when that is set.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{
    env,
    fs::{self, OpenOptions},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use anchor_analyzer::{
    AckKind, AnalysisOrchestrator, AnalyzerConfig, BufferBinding, BufferOptions, DocumentPath,
};
use anchor_config::AnchorConfig;
use anchor_types::TextBuffer;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_anchor_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries the report; without a log file, log to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_anchor_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in anchor_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn anchor_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.anchor/logs/anchor.log
    if let Some(config_path) = AnchorConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("anchor.log"));
    }

    // Fallback: ./.anchor/logs/anchor.log
    candidates.push(PathBuf::from(".anchor").join("logs").join("anchor.log"));

    candidates
}

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "anchor")]
#[command(about = "Load files into the analyzer and report what it acknowledged")]
struct Args {
    /// Seconds to wait for analysis to finish
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    wait: u64,

    /// Files to analyze
    #[arg(required = true, value_name = "FILE")]
    files: Vec<PathBuf>,
}

impl Args {
    fn wait(&self) -> Duration {
        Duration::from_secs(self.wait)
    }
}

fn analyzer_config(config: &AnchorConfig) -> Result<AnalyzerConfig> {
    if let Ok(command) = env::var("ANCHOR_ANALYZER")
        && !command.trim().is_empty()
    {
        return Ok(AnalyzerConfig::new(command.trim()));
    }
    config.analyzer.clone().with_context(|| {
        let path = AnchorConfig::path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.anchor/config.toml".to_string());
        format!("no analyzer configured; add an [analyzer] section to {path}")
    })
}

async fn open(
    orchestrator: &AnalysisOrchestrator,
    path: PathBuf,
) -> Result<(Arc<TextBuffer>, BufferBinding)> {
    let text = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let buffer = TextBuffer::new(&text);
    let absolute = fs::canonicalize(&path).unwrap_or(path);
    let binding = orchestrator
        .monitor(
            &buffer,
            DocumentPath::File(absolute.clone()),
            BufferOptions::default(),
        )
        .await
        .with_context(|| format!("analyzer refused {}", absolute.display()))?;
    Ok((buffer, binding))
}

fn format_version(version: Option<i32>) -> String {
    version.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let wait = args.wait();
    let config = AnchorConfig::load();
    let analyzer = analyzer_config(&config)?;
    let orchestrator = AnalysisOrchestrator::start(&analyzer, config.orchestrator).await?;

    let mut opened = Vec::new();
    for path in args.files {
        match open(&orchestrator, path.clone()).await {
            Ok(entry) => opened.push((path, entry)),
            Err(e) => eprintln!("Error: {e:#}"),
        }
    }

    for (_, (_, binding)) in &opened {
        orchestrator.ensure_synced(binding, false).await;
    }
    let complete = orchestrator.wait_for_complete_analysis(wait).await;
    if !complete {
        eprintln!("Analysis did not finish within {}s", args.wait);
    }

    for (path, (buffer, binding)) in &opened {
        let document = binding.document();
        let parsed = document.acknowledged_version(binding.buffer_id(), AckKind::Parse);
        let analyzed = document.acknowledged_version(binding.buffer_id(), AckKind::Analysis);
        println!(
            "{}\tfile {}\tversion {}\tparsed {}\tanalyzed {}",
            path.display(),
            binding.file_id(),
            buffer.current().version(),
            format_version(parsed),
            format_version(analyzed),
        );
    }

    for (_, (_, binding)) in opened {
        orchestrator.unmonitor(binding).await;
    }
    orchestrator.release().await;

    if complete { Ok(()) } else { bail!("analysis incomplete") }
}
