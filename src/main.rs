use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use neurobatch::batch::{discover_units, BatchExecutor, BatchJob, BatchReport, DiscoverySpec};
use neurobatch::config::{ReconLayout, Settings};
use neurobatch::logging::{init_tracing, BatchLog};
use neurobatch::metrics::gather_metrics;
use neurobatch::pipeline::ProcessRunner;
use neurobatch::recipes::{
    ensure_template_link, AtlasRecipe, DtifitRecipe, Recipe, ReconRecipe, RegistrationRecipe,
};
use neurobatch::stats::{run_stats, table_jobs, SUBJECTS_FILE};

#[derive(Parser, Debug)]
#[command(name = "neurobatch")]
#[command(version)]
#[command(
    about = "Idempotent parallel batch runner for FreeSurfer and FSL pipelines",
    long_about = "Finds the subjects under a data directory, skips the ones whose outputs \
                  are already complete and runs the selected pipeline on the rest with a \
                  bounded number of concurrent workers. Re-running a batch retries only \
                  what failed."
)]
struct Cli {
    /// TOML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory containing one folder per subject
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Maximum number of units processed at once
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Append-only batch log
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Write the JSON batch report here
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    /// Write Prometheus metrics (text format) here on exit
    #[arg(long, global = true)]
    metrics_file: Option<PathBuf>,

    /// Print the commands pending units would run, without running them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Debug-level console output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cortical reconstruction with recon-all
    Recon {
        /// One unit per sub_*/ses-* directory
        #[arg(long)]
        sessions: bool,
    },

    /// Atlas parcellation and regional statistics
    Atlas,

    /// Diffusion tensor fitting
    Dtifit,

    /// Register FA to standard space and warp MD along
    Register {
        /// Copy FA instead of eroding and cropping it
        #[arg(long)]
        no_erode: bool,
    },

    /// Group tables, summary CSV and per-parcellation workbooks
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(dir) = &cli.data_dir {
        settings.batch.data_dir = dir.clone();
    }
    settings.batch.data_dir = absolute(&settings.batch.data_dir)?;
    settings.stats.output_dir = absolute(&settings.stats.output_dir)?;
    if cli.log_file.is_some() {
        settings.batch.log_file = cli.log_file.clone();
    }
    if cli.report.is_some() {
        settings.batch.report_file = cli.report.clone();
    }

    let log = settings
        .batch
        .log_file
        .as_ref()
        .map(BatchLog::new)
        .unwrap_or_else(BatchLog::disabled);
    let exclude = settings.batch.exclude.clone();
    let data_dir = settings.batch.data_dir.clone();

    let failed = match &cli.command {
        Commands::Recon { sessions } => {
            let mut recon = settings.recon.clone();
            if *sessions {
                recon.layout = ReconLayout::Sessions;
            }
            let recipe = ReconRecipe::from_settings(&recon).with_exclusions(exclude);
            let executor = executor(&cli, &settings, settings.recon.max_concurrency, log);
            run_recipe(&cli, &settings, &data_dir, &recipe, &executor).await?
        }
        Commands::Atlas => {
            prepare_template(&settings, &data_dir, cli.dry_run)?;
            let recipe = AtlasRecipe::from_settings(&data_dir, &settings.atlas).with_exclusions(exclude);
            let executor = executor(&cli, &settings, settings.atlas.max_concurrency, log);
            run_recipe(&cli, &settings, &data_dir, &recipe, &executor).await?
        }
        Commands::Dtifit => {
            let recipe = DtifitRecipe::new().with_exclusions(exclude);
            let executor = executor(&cli, &settings, settings.dti.max_concurrency, log);
            run_recipe(&cli, &settings, &data_dir, &recipe, &executor).await?
        }
        Commands::Register { no_erode } => {
            let mut dti = settings.dti.clone();
            if *no_erode {
                dti.erode = false;
            }
            let recipe = RegistrationRecipe::from_settings(&dti)?.with_exclusions(exclude);
            let executor = executor(&cli, &settings, settings.dti.max_concurrency, log);
            run_recipe(&cli, &settings, &data_dir, &recipe, &executor).await?
        }
        Commands::Stats => {
            let units = discover_units(&data_dir, &DiscoverySpec::subjects().with_exclusions(exclude))?;
            if cli.dry_run {
                let subjects_file = settings.stats.output_dir.join(SUBJECTS_FILE);
                print_plan(&table_jobs(&settings.stats, &subjects_file))?;
                false
            } else {
                let executor = executor(&cli, &settings, settings.stats.max_concurrency, log);
                let report = run_stats(&units, &settings.stats, &executor).await?;
                if let Some(path) = &settings.batch.report_file {
                    write_file(path, &serde_json::to_string_pretty(&report)?)?;
                }
                report.has_failures()
            }
        }
    };

    if let Some(path) = &cli.metrics_file {
        write_file(path, &gather_metrics()?)?;
    }

    if failed {
        warn!("Batch finished with failures");
        std::process::exit(1);
    }
    Ok(())
}

fn executor(cli: &Cli, settings: &Settings, stage: Option<usize>, log: BatchLog) -> BatchExecutor {
    let limit = cli.jobs.unwrap_or_else(|| settings.concurrency_for(stage));
    BatchExecutor::new(Arc::new(ProcessRunner::new()))
        .with_concurrency_limit(limit)
        .with_log(log)
}

/// Discover, then either print the plan or run the batch. Returns whether
/// any unit failed.
async fn run_recipe<R: Recipe>(
    cli: &Cli,
    settings: &Settings,
    data_dir: &Path,
    recipe: &R,
    executor: &BatchExecutor,
) -> anyhow::Result<bool> {
    let units = discover_units(data_dir, &recipe.discovery())?;
    info!(recipe = recipe.name(), units = units.len(), data_dir = %data_dir.display(), "Discovered units");

    if cli.dry_run {
        print_plan(&recipe.jobs(units)?)?;
        return Ok(false);
    }

    let report = executor.run_units(units, recipe).await?;
    write_report(settings, &report)?;
    Ok(!report.is_success())
}

/// Link the configured template subject into the data directory; a dry run
/// only reports the link it would create
fn prepare_template(settings: &Settings, data_dir: &Path, dry_run: bool) -> anyhow::Result<()> {
    let Some(template) = &settings.atlas.fsaverage else {
        return Ok(());
    };
    let template = absolute(template)?;

    if dry_run {
        if !data_dir.join("fsaverage").exists() {
            println!("# link {} -> {}", data_dir.join("fsaverage").display(), template.display());
        }
        return Ok(());
    }

    ensure_template_link(data_dir, &template)
        .with_context(|| format!("failed to link template subject {}", template.display()))?;
    Ok(())
}

fn print_plan(jobs: &[BatchJob]) -> anyhow::Result<()> {
    for job in jobs {
        if job.is_complete() {
            println!("# {}: complete, skipped", job.unit.id);
            continue;
        }
        println!("# {}", job.unit.id);
        for step in job.pipeline.render_steps(&job.unit)? {
            println!("{}", step.command_line());
        }
    }
    Ok(())
}

fn write_report(settings: &Settings, report: &BatchReport) -> anyhow::Result<()> {
    if let Some(path) = &settings.batch.report_file {
        write_file(path, &report.to_json()?)?;
        info!(path = %path.display(), "Wrote batch report");
    }
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
