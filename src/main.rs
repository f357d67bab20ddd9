//! `laser-snap` command-line front end.

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use laser_snap::config::{Settings, DEFAULT_CONFIG_FILE};
use laser_snap::cube::{CombineMode, CubeAggregator};
use laser_snap::gateway::{DeviceGateway, HardwareGateway, MockGateway};
use laser_snap::harvest::{self, SavedImagesSnapshot};
use laser_snap::ledger::{self, AcquisitionStep};
use laser_snap::resume::ResumeEngine;
use laser_snap::sequencer::{AlwaysContinue, OperatorPrompt};
use laser_snap::{
    spawn_run, AcquisitionPlan, ProgressEvent, RunContext, RunReport, RunRequest, Sequencer,
};

const SNAPSHOT_FILE: &str = "saved_images_snapshot.json";

#[derive(Parser)]
#[command(name = "laser-snap", version, about = "Wavelength-sweep hyperspectral acquisition")]
struct Cli {
    /// Configuration file (missing file means defaults)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an acquisition plan
    Run {
        #[arg(long)]
        project: String,
        /// Folder for the ledger
        #[arg(long)]
        output: PathBuf,
        /// Folder the camera writes raw files into
        #[arg(long)]
        raw_folder: PathBuf,
        /// Seconds to wait for each raw file
        #[arg(long)]
        timeout: Option<u64>,
        /// TOML plan file with [[rows]] tables
        #[arg(long, conflicts_with = "rows")]
        plan: Option<PathBuf>,
        /// Plan row as WAVELENGTH:COUNT, repeatable
        #[arg(long = "row", value_name = "W:N")]
        rows: Vec<String>,
        /// Use the simulated gateway
        #[arg(long)]
        simulate: bool,
        /// Continue after timeouts without asking
        #[arg(long)]
        yes: bool,
    },

    /// Re-acquire the incomplete steps of the newest ledger in a folder
    Resume {
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        raw_folder: PathBuf,
        /// Overrides the project name recovered from the ledger file name
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        simulate: bool,
        #[arg(long)]
        yes: bool,
    },

    /// Summarize a ledger file, or the newest ledger in a folder
    Status { path: PathBuf },

    /// Sum or average shot folders into one cube with an RGB preview
    Combine {
        #[arg(long, value_enum, default_value_t = CombineMode::Sum)]
        mode: CombineMode,
        #[arg(long)]
        out: PathBuf,
        #[arg(required = true)]
        folders: Vec<PathBuf>,
    },

    /// Copy new camera folders into the project and combine them per wavelength
    Harvest {
        #[arg(long)]
        project: String,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, conflicts_with = "rows")]
        plan: Option<PathBuf>,
        #[arg(long = "row", value_name = "W:N")]
        rows: Vec<String>,
        /// Snapshot written before the run
        #[arg(long)]
        snapshot: PathBuf,
        /// Date tag for folder names (defaults to today, MM-DD)
        #[arg(long)]
        date: Option<String>,
    },

    /// Record the saved-images listing before a run
    Snapshot {
        #[arg(long)]
        out: PathBuf,
        /// Saved-images folder (defaults to processing.saved_images_dir)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.cmd {
        Command::Run {
            project,
            output,
            raw_folder,
            timeout,
            plan,
            rows,
            simulate,
            yes,
        } => {
            let plan = load_plan(plan.as_deref(), &rows)?;
            let context = RunContext::new(
                project,
                &output,
                &raw_folder,
                file_timeout(timeout, &settings),
            )?;

            if let Some(saved) = &settings.processing.saved_images_dir {
                let snapshot = SavedImagesSnapshot::take(saved)?;
                snapshot.save(&output.join(SNAPSHOT_FILE))?;
            }

            let sequencer = build_sequencer(context, &settings, simulate, yes).await?;
            let report = drive(sequencer, RunRequest::Fresh(plan)).await?;
            print_report(&report);
        }
        Command::Resume {
            output,
            raw_folder,
            project,
            timeout,
            simulate,
            yes,
        } => {
            let report = ResumeEngine::inspect(&output)?;
            println!(
                "{}: {} steps, {} completed, {} incomplete",
                report.ledger_path.display(),
                report.summary.total,
                report.summary.completed,
                report.summary.incomplete
            );
            if report.nothing_to_resume() {
                println!("Nothing to resume.");
                return Ok(());
            }
            for (wavelength, count) in report.incomplete.groups() {
                println!("  {wavelength}: {count} to re-acquire");
            }
            if !yes && !ask("Resume these steps?").await {
                return Ok(());
            }

            let project = project
                .or_else(|| report.project_name.clone())
                .context("Could not recover the project name; pass --project")?;
            let context = RunContext::new(
                project,
                &output,
                &raw_folder,
                file_timeout(timeout, &settings),
            )?;
            let sequencer = build_sequencer(context, &settings, simulate, yes).await?;
            let run = drive(sequencer, RunRequest::Resume(report.ledger_path)).await?;
            print_report(&run);
        }
        Command::Status { path } => {
            let ledger_path = if path.is_dir() {
                ledger::find_latest_ledger(&path)?
                    .with_context(|| format!("No ledger in {}", path.display()))?
            } else {
                path
            };
            let summary = ledger::summarize(&ledger_path)?;
            let incomplete = ledger::load_incomplete(&ledger_path)?;
            println!("{}", ledger_path.display());
            println!(
                "  total {}, completed {}, incomplete {}",
                summary.total, summary.completed, summary.incomplete
            );
            for (wavelength, count) in incomplete.groups() {
                println!("  {wavelength}: {count} incomplete");
            }
        }
        Command::Combine { mode, out, folders } => {
            let aggregator = CubeAggregator::from_config(&settings.processing);
            let cubes = aggregator.load_folders(&folders)?;
            let stem = match mode {
                CombineMode::Sum => "summed",
                CombineMode::Average => "averaged",
            };
            std::fs::create_dir_all(&out)?;
            let (cube, preview) = aggregator.combine_with_preview(
                &cubes,
                mode,
                &out.join(format!("{stem}_rgb_image.png")),
            )?;
            let header = out.join(format!("{stem}_cube.hdr"));
            cube.save(&header, &out.join(format!("{stem}_cube.img")))?;
            println!("Combined {} cubes into {}", cubes.len(), header.display());
            println!("Preview: {}", preview.display());
        }
        Command::Harvest {
            project,
            output,
            plan,
            rows,
            snapshot,
            date,
        } => {
            let plan = load_plan(plan.as_deref(), &rows)?;
            let snapshot = SavedImagesSnapshot::load(&snapshot)?;
            let date = date.unwrap_or_else(harvest::date_tag);

            let artifacts = harvest::harvest(&snapshot, &plan, &project, &output, &date)?;
            println!("Copied {} shot folders into {}", artifacts.len(), output.display());

            let products = CubeAggregator::from_config(&settings.processing)
                .combine_by_wavelength(&artifacts, &output, &project, &date)?;
            for product in products {
                println!(
                    "  {}: {} shots -> {}",
                    product.wavelength,
                    product.cube_count,
                    product.header_path.display()
                );
            }
        }
        Command::Snapshot { out, dir } => {
            let dir = dir
                .or_else(|| settings.processing.saved_images_dir.clone())
                .context("No saved-images folder; pass --dir or set processing.saved_images_dir")?;
            let snapshot = SavedImagesSnapshot::take(&dir)?;
            snapshot.save(&out)?;
            println!("Recorded {} entries of {}", snapshot.entries.len(), dir.display());
        }
    }
    Ok(())
}

fn load_plan(file: Option<&Path>, rows: &[String]) -> anyhow::Result<AcquisitionPlan> {
    if let Some(file) = file {
        return Ok(AcquisitionPlan::load(file)?);
    }
    if rows.is_empty() {
        bail!("Provide a plan with --plan FILE or one or more --row W:N");
    }
    let rows = rows
        .iter()
        .map(|r| AcquisitionPlan::parse_row(r))
        .collect::<Result<Vec<_>, _>>()?;
    let plan = AcquisitionPlan { rows };
    plan.validate()?;
    Ok(plan)
}

fn file_timeout(override_secs: Option<u64>, settings: &Settings) -> Duration {
    override_secs.map_or_else(|| settings.acquisition.file_timeout(), Duration::from_secs)
}

async fn build_sequencer(
    context: RunContext,
    settings: &Settings,
    simulate: bool,
    yes: bool,
) -> anyhow::Result<Sequencer> {
    let gateway: Arc<dyn DeviceGateway> = if simulate {
        Arc::new(MockGateway::new().with_camera(&context.raw_data_folder))
    } else {
        Arc::new(
            HardwareGateway::connect(&settings.devices)
                .await
                .context("Failed to connect devices")?,
        )
    };
    let prompt: Arc<dyn OperatorPrompt> = if yes {
        Arc::new(AlwaysContinue)
    } else {
        Arc::new(StdinPrompt)
    };
    Ok(Sequencer::new(context, gateway, prompt)
        .with_watcher(settings.acquisition.watcher())
        .with_settling_delay(settings.acquisition.settling_delay()))
}

/// Run on a background task, printing progress until it finishes.
async fn drive(sequencer: Sequencer, request: RunRequest) -> anyhow::Result<RunReport> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = spawn_run(sequencer.with_progress(tx), request);

    let cancel = handle.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let printer = tokio::spawn(print_progress(rx));
    let report = handle.join().await?;
    printer.await?;
    Ok(report)
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::StepStarted {
                wavelength,
                picture_number,
                position,
                total,
                ..
            } => println!("[{position}/{total}] Acquiring {wavelength} nm, picture {picture_number}"),
            ProgressEvent::StepCompleted {
                raw_filename,
                file_size_bytes,
                ..
            } => println!("    captured {raw_filename} ({file_size_bytes} bytes)"),
            ProgressEvent::StepTimedOut {
                wavelength,
                picture_number,
                ..
            } => println!("    no file for {wavelength} nm, picture {picture_number}"),
            ProgressEvent::RunHalted {
                reason,
                cancelled_steps,
            } => println!("Run halted ({reason:?}); {cancelled_steps} steps cancelled"),
            ProgressEvent::RunFailed { error } => println!("Run aborted: {error}"),
            ProgressEvent::RunFinished(_) => {}
        }
    }
}

fn print_report(report: &RunReport) {
    let outcome = &report.outcome;
    println!(
        "Acquisition finished: {} completed, {} timed out, {} cancelled",
        outcome.completed, outcome.timed_out, outcome.cancelled
    );
    println!("Ledger: {}", report.ledger_path.display());
}

/// Asks on the terminal; stdin is read on a blocking thread.
struct StdinPrompt;

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn continue_after_timeout(&self, step: &AcquisitionStep) -> bool {
        ask(&format!(
            "No file detected for wavelength {} picture {}. Continue?",
            step.wavelength, step.picture_number
        ))
        .await
    }
}

async fn ask(question: &str) -> bool {
    let question = question.to_string();
    tokio::task::spawn_blocking(move || {
        print!("{question} [y/N] ");
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    })
    .await
    .unwrap_or(false)
}
