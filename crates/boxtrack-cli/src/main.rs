use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use boxtrack_sync::{maybe_build_scheduler, report_recent_runs_markdown, SyncConfig, SyncPipeline};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "boxtrack")]
#[command(about = "Incrementally track box-office metrics for recently released movies")]
struct Cli {
    /// Dotenv file consulted for variables missing from the environment.
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and merge the results into the dataset.
    Sync,
    /// Run the pipeline on the configured cron schedule until interrupted.
    Watch,
    /// Summarise the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Args)]
struct ConfigOverrides {
    /// Start of the discovery window, in days before today.
    #[arg(long, global = true)]
    window_start_days: Option<u32>,
    /// End of the discovery window, in days before today.
    #[arg(long, global = true)]
    window_end_days: Option<u32>,
    #[arg(long, global = true)]
    dataset: Option<PathBuf>,
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    fn apply(self, mut config: SyncConfig) -> SyncConfig {
        if let Some(days) = self.window_start_days {
            config.window_start_days = days;
        }
        if let Some(days) = self.window_end_days {
            config.window_end_days = days;
        }
        if let Some(path) = self.dataset {
            config.dataset_path = path;
        }
        if let Some(dir) = self.reports_dir {
            config.reports_dir = dir;
        }
        config
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli
        .overrides
        .apply(SyncConfig::from_env_and_dotenv(&cli.env_file)?);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config)?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} discovered={} enriched={} detail_failures={} kept={} dropped={} total_unique={}",
                summary.run_id,
                summary.discovered,
                summary.enriched,
                summary.detail_failures,
                summary.filter.output,
                summary.filter.dropped,
                summary.total_rows
            );
            if let Some(dir) = &summary.reports_dir {
                println!("report: {dir}");
            }
        }
        Commands::Watch => {
            let pipeline = Arc::new(SyncPipeline::from_config(config)?);
            let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
                bail!("scheduler disabled; set BOXTRACK_SCHEDULER_ENABLED=1 to use `watch`");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}
