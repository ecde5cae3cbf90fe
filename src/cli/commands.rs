//! CLI command definitions for swhid-conformance.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::candidate::CandidateRegistry;
use crate::config::{HarnessConfig, DEFAULT_CONFIG_PATH};
use crate::metrics::{export_metrics, init_metrics};
use crate::report::{ReportFormat, RunReport};
use crate::sandbox::worker::serve_stdio;

/// Conformance harness for software heritage identifier implementations.
#[derive(Parser)]
#[command(name = "swhid-conformance")]
#[command(about = "Run identifier implementations side by side and compare their answers")]
#[command(version)]
#[command(
    long_about = "swhid-conformance feeds a corpus of payloads to every configured implementation,\nisolates each execution, and reports whether the implementations agree.\n\nExample usage:\n  swhid-conformance run --config config.yaml --impl git-cmd,py --format ndjson"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    /// True when this process serves a single hosted execution.
    pub fn is_worker(&self) -> bool {
        matches!(self.command, Commands::Worker(_))
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the corpus against the selected implementations.
    Run(RunArgs),

    /// List registered implementations and whether they are usable here.
    #[command(name = "list-impls")]
    ListImpls(ConfigArgs),

    /// List configured payloads.
    #[command(name = "list-payloads")]
    ListPayloads(ConfigArgs),

    /// Serve one protocol exchange for a built-in implementation.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments for `run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "SWHID_CONFIG")]
    pub config: PathBuf,

    /// Comma-separated implementations to run (default: all).
    #[arg(long = "impl", value_delimiter = ',')]
    pub implementations: Vec<String>,

    /// Comma-separated payload categories to run (default: all).
    #[arg(long, value_delimiter = ',')]
    pub category: Vec<String>,

    /// Report format, overriding the configuration.
    #[arg(long, value_enum)]
    pub format: Option<ReportFormat>,

    /// Report file (default: `<results_dir>/<run_id>.<format>`).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print only the summary to stdout.
    #[arg(long)]
    pub summary_only: bool,

    /// Write Prometheus metrics in text format to this file.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

/// Arguments for commands that only read the configuration.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "SWHID_CONFIG")]
    pub config: PathBuf,
}

#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Built-in implementation to run.
    #[arg(long)]
    pub candidate: String,
}

/// Parses command line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments and runs the command.
pub async fn run() -> anyhow::Result<i32> {
    run_with_cli(parse_cli()).await
}

/// Runs the parsed command and returns the process exit status.
///
/// `run` returns 0 when every payload agrees and 1 otherwise. Errors are
/// left to the caller, which maps them to status 2.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::ListImpls(args) => list_impls_command(args).await.map(|_| 0),
        Commands::ListPayloads(args) => list_payloads_command(args).map(|_| 0),
        Commands::Worker(args) => serve_stdio(&CandidateRegistry::with_builtins(), &args.candidate).await,
    }
}

fn optional(list: &[String]) -> Option<&[String]> {
    (!list.is_empty()).then_some(list)
}

async fn run_command(args: RunArgs) -> anyhow::Result<i32> {
    init_metrics().context("Failed to initialize metrics")?;

    let config = HarnessConfig::load(&args.config)?;
    let orchestrator = config.build_orchestrator()?;

    let payloads = config.payloads.ordered(optional(&args.category));
    if payloads.is_empty() {
        anyhow::bail!("No payloads match categories {:?}", args.category);
    }

    let outcome = orchestrator
        .run(&payloads, optional(&args.implementations))
        .await?;
    let report = RunReport::from_run(&outcome);

    let format = args.format.unwrap_or(config.output.format);
    let rendered = report.render(format)?;
    let path = args.output.clone().unwrap_or_else(|| {
        config
            .base_dir
            .join(&config.output.results_dir)
            .join(format!("{}.{}", report.run_id, format.extension()))
    });
    write_file(&path, &rendered)?;
    info!(
        run_id = %report.run_id,
        agree = report.summary.agree,
        disagree = report.summary.disagree,
        "Report written to {}",
        path.display()
    );

    if args.summary_only {
        println!("{}", serde_json::to_string_pretty(&report.summary)?);
    } else {
        print!("{}", rendered);
        if format == ReportFormat::Json {
            println!();
        }
    }

    if let Some(metrics_path) = &args.metrics_out {
        write_file(metrics_path, &export_metrics())?;
    }

    Ok(report.exit_code())
}

async fn list_impls_command(args: ConfigArgs) -> anyhow::Result<()> {
    let registry = if args.config.exists() {
        HarnessConfig::load(&args.config)?.build_registry()?
    } else {
        warn!(
            "Config {} not found, listing built-in implementations only",
            args.config.display()
        );
        CandidateRegistry::with_builtins()
    };

    for candidate in registry.iter() {
        let info = candidate.info();
        let status = if candidate.is_available().await {
            "available"
        } else {
            "unavailable"
        };
        println!(
            "{:<20} {:<10} {:<12} {}",
            info.name, info.version, info.language, status
        );
    }
    Ok(())
}

fn list_payloads_command(args: ConfigArgs) -> anyhow::Result<()> {
    let config = HarnessConfig::load(&args.config)?;
    for payload in config.payloads.ordered(None) {
        let mut line = format!(
            "{:<20} {:<30} {}",
            payload.category,
            payload.name,
            payload.path.display()
        );
        if payload.is_negative_test() {
            line.push_str("  (negative)");
        }
        println!("{}", line);
    }
    Ok(())
}

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}
