use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use dualcomp::cli::{
    EventPrinter, InterruptAction, InterruptEscalation, OutputFormat, render_presets,
};
use dualcomp::config::AppConfig;
use dualcomp::core::{JobConfig, JobController, JobEvent, Preset, RunState};
use dualcomp::logging::{self, LogConfig};
use serde::Serialize;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dualcomp")]
#[command(about = "Run and supervise the dual-output image compressor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug-level logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Logs and events as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress every image in a directory
    Run(RunArgs),
    /// List the quick size presets
    Presets,
    /// Print the effective configuration
    Config(RunArgs),
}

#[derive(Args, Serialize)]
struct RunArgs {
    /// Directory with the source images
    #[serde(skip)]
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// Directory for the compressed output
    #[serde(rename = "output_directory", skip_serializing_if = "Option::is_none")]
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Target size per image, e.g. 300KB or 2MB
    #[serde(rename = "target_size", skip_serializing_if = "Option::is_none")]
    #[arg(long, short, conflicts_with = "preset")]
    size: Option<String>,

    /// Use a quick preset instead of --size
    #[serde(skip)]
    #[arg(long, short, value_enum)]
    preset: Option<Preset>,

    /// Parallel compression jobs (1-32)
    #[serde(rename = "parallel_jobs", skip_serializing_if = "Option::is_none")]
    #[arg(long, short)]
    jobs: Option<u32>,

    /// Compressor executable
    #[serde(rename = "tool_path", skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    tool: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Presets => {
            render_presets(std::io::stdout().lock())?;
            Ok(())
        }
        Commands::Config(args) => {
            let config = AppConfig::new(Some(args))?;
            let rendered = toml::to_string_pretty(&config).context("Failed to serialize config")?;
            print!("{rendered}");
            Ok(())
        }
        Commands::Run(args) => {
            let mut config = AppConfig::new(Some(args))?;
            config.verbose |= cli.verbose;
            config.log_json |= cli.json;

            logging::init(LogConfig {
                json: config.log_json,
                verbose: config.verbose,
            });

            run_compression(&config, args, cli.json)
                .await
                .context("Compression run did not succeed")
        }
    }
}

async fn run_compression(config: &AppConfig, args: &RunArgs, json: bool) -> Result<()> {
    let input = args
        .input
        .clone()
        .context("--input is required for a compression run")?;

    let target_size = match args.preset {
        Some(preset) => {
            info!(preset = preset.label(), size = %preset.target_size(), "Using preset");
            preset.target_size()
        }
        None => config.default_target_size()?,
    };

    let job = JobConfig::new(input, &config.output_directory)
        .with_target_size(target_size)
        .with_parallelism(config.parallel_jobs);

    // First Ctrl-C asks the compressor to stop; output keeps flowing until it
    // exits. A second one gives up waiting: the runtime shuts down and drops
    // the process handle, which kills the compressor group.
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to install Ctrl-C handler")?;
    let mut interrupts = InterruptEscalation::new();

    let (controller, mut events) = JobController::new(config.tool_settings());
    let run = controller.start(job).await?;

    let format = if json {
        OutputFormat::Json
    } else {
        OutputFormat::Pretty
    };
    let mut printer = EventPrinter::new(std::io::stdout().lock(), format);

    let mut final_state = None;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                printer.print(&event)?;
                if let JobEvent::Lifecycle(t) = &event {
                    if t.run_id == run.id() && t.to.is_terminal() {
                        final_state = Some((t.to, t.reason.clone()));
                        break;
                    }
                }
            }
            _ = sigint.recv() => match interrupts.press() {
                InterruptAction::Cancel => {
                    if let Err(e) = controller.cancel(&run).await {
                        warn!(error = %e, "Cancel ignored");
                    }
                }
                InterruptAction::Abort => bail!("Interrupted again, killing the compressor"),
            },
        }
    }

    if let Some(snapshot) = controller.snapshot().await {
        printer.summary(&snapshot)?;
    }

    match final_state {
        Some((RunState::Succeeded, _)) => Ok(()),
        Some((RunState::Cancelled, _)) => bail!("Compression cancelled"),
        Some((_, reason)) => bail!(reason.unwrap_or_else(|| "Compression failed".to_string())),
        None => bail!("Event stream closed before the run finished"),
    }
}
