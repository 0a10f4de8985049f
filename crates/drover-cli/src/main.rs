//! Drover command-line driver.
//!
//! Thin wrapper around the engine: reads a payload, submits it through the
//! detected batch system (or runs it locally), streams output lines as they
//! appear, and wires Ctrl-C to the out-of-band kill handle.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

use drover_hpc::{BackendJob, Job};

/// Drover - run shell payloads locally or through LSF, Slurm or Cobalt
#[derive(Parser)]
#[command(name = "drover")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a payload and wait for its output
    Run {
        /// Script file containing the payload
        #[arg(short, long, conflicts_with = "command")]
        script: Option<PathBuf>,

        /// Inline payload, alternative to --script
        #[arg(short, long)]
        command: Option<String>,

        /// Directory for script and output artifacts
        #[arg(short, long, default_value = "/tmp/drover")]
        work_dir: PathBuf,

        /// Target uid the payload runs as (defaults to the current user)
        #[arg(long)]
        uid: Option<u32>,

        /// Target gid the payload runs as (defaults to the current group)
        #[arg(long)]
        gid: Option<u32>,

        /// Accounting/bank identifier
        #[arg(short, long)]
        bank: Option<String>,

        /// Scheduler-native argument, repeatable
        #[arg(long = "spec")]
        specs: Vec<String>,

        /// Run locally instead of submitting to a batch system
        #[arg(long)]
        local: bool,

        /// Keep temporary output files for debugging
        #[arg(long)]
        keep_artifacts: bool,

        /// Print the normalized result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Report which batch system would be selected
    Detect,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            script,
            command,
            work_dir,
            uid,
            gid,
            bank,
            specs,
            local,
            keep_artifacts,
            json,
        } => {
            run(
                script,
                command,
                work_dir,
                uid,
                gid,
                bank,
                specs,
                local,
                keep_artifacts,
                json,
            )
            .await
        }
        Commands::Detect => detect(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    script: Option<PathBuf>,
    command: Option<String>,
    work_dir: PathBuf,
    uid: Option<u32>,
    gid: Option<u32>,
    bank: Option<String>,
    specs: Vec<String>,
    local: bool,
    keep_artifacts: bool,
    json: bool,
) -> Result<()> {
    let payload = match (script, command) {
        (Some(path), None) => std::fs::read_to_string(&path)
            .with_context(|| format!("could not read script {}", path.display()))?,
        (None, Some(inline)) => inline,
        _ => anyhow::bail!("exactly one of --script or --command is required"),
    };

    let mut job = Job::new(
        payload,
        work_dir,
        uid.unwrap_or_else(|| nix::unistd::getuid().as_raw()),
        gid.unwrap_or_else(|| nix::unistd::getgid().as_raw()),
    )
    .with_native_specs(specs)
    .with_print_callback(Arc::new(|line| println!("{line}")));

    if let Some(bank) = bank {
        job = job.with_bank(bank);
    }
    if local {
        job = job.local();
    }
    if keep_artifacts {
        job = job.keep_artifacts();
    }

    let mut backend = BackendJob::prepare(Arc::new(job))
        .await
        .context("could not prepare the job")?;
    tracing::info!(backend = backend.backend_name(), "job prepared");
    eprintln!(
        "{} Submitting via {}",
        style("→").cyan().bold(),
        style(backend.backend_name()).bold()
    );

    // Ctrl-C cancels through the scheduler once an id is known.
    let handle = backend.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            match handle.kill().await {
                Ok(()) => eprintln!("{} Kill request sent", style("✗").red().bold()),
                Err(e) => eprintln!("{} Kill failed: {e}", style("✗").red().bold()),
            }
        }
    });

    let report = backend.run_report().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if let Some(id) = report.job_id {
            eprintln!(
                "{} Job {} finished",
                style("✓").green().bold(),
                style(id).bold()
            );
        }
        // Local runs already streamed every line through the callback; the
        // schedulers' consolidated reports have not been shown in full.
        if report.backend != "local" {
            print!("{}", report.output);
        }
    }
    Ok(())
}

fn detect() -> Result<()> {
    match drover_hpc::detect() {
        Ok(system) => {
            println!("{system}");
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {e}", style("✗").red().bold());
            std::process::exit(1);
        }
    }
}
