use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use libra_adapters::{CatalogSearch, FcmDelivery, GoogleBooksConfig, GoogleBooksSearch};
use libra_jobs::{JobRun, JobRunner, LibraConfig};
use libra_storage::{DocumentStore, HttpClientConfig, HttpFetcher, PgDocumentStore};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "libra-cli")]
#[command(about = "LibraEase catalog import and due-date notification jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import catalog records from Google Books.
    Import {
        /// Search term; repeat to import several. Defaults to LIBRA_IMPORT_QUERIES.
        #[arg(long = "query")]
        queries: Vec<String>,
        /// Run even when the schedule flag is off.
        #[arg(long)]
        force: bool,
    },
    /// Send due-date reminders and overdue notices.
    Notify {
        #[arg(long)]
        force: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Run both jobs on their cron schedules until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let (config, account) = match cli.command {
        Commands::Notify { .. } | Commands::Schedule => {
            let (config, account) = LibraConfig::from_env_with_push()?;
            (config, Some(account))
        }
        Commands::Import { .. } | Commands::Migrate => (LibraConfig::from_env()?, None),
    };

    let pg = PgDocumentStore::connect(&config.database_url).await?;
    let store: Arc<dyn DocumentStore> = Arc::new(pg.clone());

    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    })?);
    let search: Arc<dyn CatalogSearch> = Arc::new(GoogleBooksSearch::new(
        http.clone(),
        GoogleBooksConfig {
            base_url: config.google_books_base_url.clone(),
            api_key: config.google_books_api_key.clone(),
            page_size: config.import_page_size,
        },
    ));
    let mut runner = JobRunner::new(config, store, search);
    if let Some(account) = account {
        runner = runner.with_delivery(Arc::new(FcmDelivery::new(http, account)));
    }

    match cli.command {
        Commands::Import { queries, force } => {
            let queries = if queries.is_empty() {
                runner.config().import_queries.clone()
            } else {
                queries
            };
            match runner.run_import(&queries, force).await? {
                JobRun::Skipped { reason, .. } => println!("import skipped: {reason}"),
                JobRun::Completed {
                    run_id,
                    log_path,
                    summary,
                    ..
                } => {
                    println!(
                        "import complete: run_id={} added={} queries={} failed={} log={}",
                        run_id,
                        summary.added,
                        summary.queries.len(),
                        summary.failed_queries(),
                        log_path.display()
                    );
                    for outcome in summary.queries.iter().filter(|q| q.error.is_some()) {
                        eprintln!(
                            "  query {:?} failed: {}",
                            outcome.query,
                            outcome.error.as_deref().unwrap_or_default()
                        );
                    }
                    if summary.all_failed() {
                        bail!("every import query failed");
                    }
                }
            }
        }
        Commands::Notify { force } => match runner.run_notifications(Utc::now(), force).await? {
            JobRun::Skipped { reason, .. } => println!("notifications skipped: {reason}"),
            JobRun::Completed {
                run_id,
                log_path,
                summary,
                ..
            } => println!(
                "notifications complete: run_id={} scanned={} malformed={} attempted={} delivered={} log={}",
                run_id,
                summary.scanned,
                summary.malformed,
                summary.attempted,
                summary.delivered,
                log_path.display()
            ),
        },
        Commands::Schedule => {
            libra_jobs::run_scheduler_until_shutdown(Arc::new(runner)).await?;
        }
        Commands::Migrate => {
            pg.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
