use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use incur_core::{IngestionMode, PullWindow, RunId, RunStatus};
use incur_normalize::JsonPageDirSource;
use incur_sync::{CurationConfig, CurationPipeline, RunReport};

const ENV_LOG: &str = "INCUR_LOG";

#[derive(Debug, Parser)]
#[command(name = "incur")]
#[command(about = "Incident curation engine command-line interface")]
struct Cli {
    /// Workspace holding `config/` (overrides INCUR_WORKSPACE_ROOT).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    /// Data directory for snapshots, versions and reports (overrides INCUR_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Persist one run's raw pages from a directory of exported page files.
    Ingest {
        #[arg(long)]
        pages: PathBuf,
        #[arg(long, default_value = "incremental_open")]
        mode: IngestionMode,
    },
    /// Normalize and merge a sealed raw run (latest by default).
    Curate {
        #[arg(long)]
        run: Option<RunId>,
    },
    /// Rebuild feature views from the current canonical version.
    Features {
        #[arg(long)]
        task: Option<String>,
    },
    /// Ingest and curate in one go.
    Run {
        #[arg(long)]
        pages: PathBuf,
        #[arg(long, default_value = "incremental_open")]
        mode: IngestionMode,
    },
    Status,
    /// Remove old canonical versions.
    Prune {
        #[arg(long)]
        keep: Option<usize>,
    },
}

fn init_logging() {
    let filter = std::env::var(ENV_LOG)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_report(report: &RunReport) {
    let merge = report.merge.as_ref();
    println!(
        "{}: status={} pulled={} violations={} inserted={} updated={} rejected={} unchanged={} version={}",
        report.run_id,
        report.status,
        report.records_pulled,
        report.violations.len(),
        merge.map_or(0, |m| m.inserted),
        merge.map_or(0, |m| m.updated),
        merge.map_or(0, |m| m.rejected),
        merge.map_or(0, |m| m.unchanged),
        report.canonical_version,
    );
    for feature in &report.features {
        match &feature.error {
            Some(error) => println!("  feature {}: failed: {error}", feature.task),
            None => println!("  feature {}: {} rows", feature.task, feature.rows.unwrap_or(0)),
        }
    }
    match (&report.error, report.status) {
        (Some(error), RunStatus::Failed) => eprintln!("run failed: {error}"),
        (Some(error), _) => eprintln!("run finished with an error: {error}"),
        (None, _) => {}
    }
}

fn exit_code(report: &RunReport) -> ExitCode {
    if report.status == RunStatus::Failed || report.error.is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = CurationConfig::from_env();
    if let Some(workspace) = cli.workspace {
        config.workspace_root = workspace;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    let pipeline = CurationPipeline::new(config).context("starting curation pipeline")?;
    let source_id = pipeline.settings().source_id.clone();

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Ingest { pages, mode } => {
            let source = JsonPageDirSource::new(source_id, pages);
            let run = pipeline.ingest(&source, mode, PullWindow::default()).await?;
            println!("ingested {}: {} records", run.run_id, run.records_pulled);
        }
        Commands::Curate { run } => {
            let report = pipeline.curate(run).await?;
            print_report(&report);
            return Ok(exit_code(&report));
        }
        Commands::Features { task } => {
            let outcomes = pipeline.build_features(task.as_deref()).await?;
            let mut failed = false;
            for outcome in &outcomes {
                match (&outcome.error, &outcome.path) {
                    (Some(error), _) => {
                        failed = true;
                        eprintln!("{}: failed: {error}", outcome.task);
                    }
                    (None, path) => println!(
                        "{}: {} rows at v{:06} -> {}",
                        outcome.task,
                        outcome.rows.unwrap_or(0),
                        outcome.canonical_version,
                        path.as_deref().unwrap_or("-")
                    ),
                }
            }
            if failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Run { pages, mode } => {
            let source = JsonPageDirSource::new(source_id, pages);
            let report = pipeline.run_once(&source, mode, PullWindow::default()).await?;
            print_report(&report);
            return Ok(exit_code(&report));
        }
        Commands::Status => {
            let status = pipeline.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Prune { keep } => {
            let removed = pipeline.prune(keep)?;
            println!("pruned {} canonical version(s): {removed:?}", removed.len());
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
