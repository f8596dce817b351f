use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Timelike;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zfcg_storage::AnnouncementStore;
use zfcg_sync::{CrawlPipeline, DigestFileNotifier, Orchestrator, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "zfcg-cli")]
#[command(about = "Government procurement announcement monitor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted.
    Serve,
    /// Run one keyword sweep and exit.
    Sweep,
    /// Crawl the web page of one monitor configuration.
    Crawl {
        #[arg(long)]
        config_id: i64,
    },
    /// Send today's digest to the subscribers of an hour (default: now).
    Notify {
        #[arg(long)]
        hour: Option<u32>,
    },
    /// Create missing tables.
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,zfcg=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Sweep => {
            let pipeline = CrawlPipeline::from_config(config).await?;
            let summaries = pipeline.execute_sweep().await?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        Commands::Crawl { config_id } => {
            let pipeline = CrawlPipeline::from_config(config).await?;
            let summary = pipeline.run_monitor_task_by_id(config_id).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Notify { hour } => {
            let hour = hour.unwrap_or_else(|| chrono::Local::now().hour());
            let notifier = DigestFileNotifier::new(&config.reports_dir);
            let pipeline = CrawlPipeline::from_config(config).await?;
            let sent = pipeline.notify_subscribers(hour, &notifier).await?;
            println!("notify complete: hour={hour} delivered={sent}");
        }
        Commands::Migrate => {
            let mut store = AnnouncementStore::connect(&config.database_url).await?;
            store.bootstrap_schema().await?;
            let columns = store.columns();
            println!(
                "schema ready: database={} announcements={} content={} publisher={} web_page_id={}",
                config.database_url,
                store.count_announcements().await?,
                columns.content,
                columns.publisher,
                columns.web_page_id
            );
        }
    }

    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let startup_delay = Duration::from_secs(config.startup_sweep_delay_secs);
    let notifier = Arc::new(DigestFileNotifier::new(&config.reports_dir));
    let pipeline = Arc::new(CrawlPipeline::from_config(config).await?);
    let orchestrator = Orchestrator::new(Arc::clone(&pipeline), notifier);

    orchestrator.start().await?;
    match orchestrator.reload_tasks().await {
        Ok(jobs) => {
            for job in &jobs {
                info!(cron = %job.cron, kind = ?job.kind, "job registered");
            }
        }
        Err(err) => warn!(error = ?err, "initial schedule load failed, running the sweep only"),
    }

    let sweeper = Arc::clone(&pipeline);
    tokio::spawn(async move {
        tokio::time::sleep(startup_delay).await;
        match sweeper.execute_sweep().await {
            Ok(runs) => info!(runs = runs.len(), "startup sweep finished"),
            Err(err) => warn!(error = ?err, "startup sweep failed"),
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    orchestrator.shutdown().await
}
