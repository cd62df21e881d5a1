mod config;
mod error;
mod loader;
mod models;
mod pipeline;
mod scraper;
mod state;
mod storage;
mod ticker;
mod utils;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::AppConfig;
use crate::pipeline::Pipeline;
use crate::scraper::parsers::Site;
use crate::state::IncrementalStateStore;
use crate::storage::Repository;

#[derive(Parser)]
#[command(
    name = "forum-ingest",
    about = "Incremental crawler for Nordic stock forums and exchange announcements",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run one incremental cycle per source (all sources when none given)
    Run {
        /// hegnar, placera, nordnet, oslobors, nasdaq
        sources: Vec<String>,
    },

    /// Re-fetch the last N days of one source, ignoring the watermark
    Backfill {
        source: String,

        #[arg(short, long, default_value_t = 7)]
        days: i64,
    },

    /// Forget the fetch watermark of one source (all sources when none given)
    Reset { source: Option<String> },

    /// Show stored counts, watermarks and recent runs
    Status,

    /// Apply schema migrations and seed forum reference data
    Migrate,
}

fn parse_site(name: &str) -> Result<Site> {
    Site::from_name(name).with_context(|| {
        let known: Vec<&str> = Site::ALL.iter().map(|s| s.name()).collect();
        format!("unknown source {:?} (expected one of {})", name, known.join(", "))
    })
}

fn open_repo(config: &AppConfig) -> Result<Arc<Repository>> {
    let repo = Repository::open(&config.storage.db_path)?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    repo.seed_forums(&config.sources.forums)?;
    Ok(Arc::new(repo))
}

/// Ctrl-C stops every cycle at its next page boundary.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing current pages");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "forum_ingest=info,warn",
        1 => "forum_ingest=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Run { sources } => {
            let sites = if sources.is_empty() {
                Site::ALL.to_vec()
            } else {
                sources.iter().map(|s| parse_site(s)).collect::<Result<Vec<_>>>()?
            };
            let _t = utils::Timer::start("Ingest cycle");
            let repo = open_repo(&config)?;
            let pipeline = Arc::new(Pipeline::new(config, repo, cancel_on_ctrl_c())?);

            let mut failed = 0usize;
            for (site, result) in pipeline.run_all(sites).await {
                match result {
                    Ok(stats) => info!(
                        "{:<9} {} found, {} new",
                        site.name(),
                        stats.records_found,
                        stats.records_stored
                    ),
                    Err(_) => failed += 1,
                }
            }
            if failed > 0 {
                anyhow::bail!("{} source(s) failed", failed);
            }
        }

        Command::Backfill { source, days } => {
            let site = parse_site(&source)?;
            let _t = utils::Timer::start(format!("Backfill {} ({} days)", site.name(), days));
            let repo = open_repo(&config)?;
            let pipeline = Pipeline::new(config, repo, cancel_on_ctrl_c())?;
            let stats = pipeline.backfill(site, days).await?;
            info!(
                "Done: {} found, {} new",
                stats.records_found, stats.records_stored
            );
        }

        Command::Reset { source } => {
            let state = IncrementalStateStore::new(open_repo(&config)?);
            match source {
                Some(name) => {
                    let site = parse_site(&name)?;
                    if state.reset(site.name())? {
                        println!("Watermark cleared for {}.", site.name());
                    } else {
                        println!("{} had no watermark.", site.name());
                    }
                }
                None => {
                    let sources: Vec<String> =
                        state.states()?.into_iter().map(|s| s.source).collect();
                    let n = state.reset_all()?;
                    println!("Watermarks cleared for {} sources: {}", n, sources.join(", "));
                }
            }
        }

        Command::Status => {
            let repo = open_repo(&config)?;
            let stats = repo.stats()?;
            let watermarks = IncrementalStateStore::new(repo);
            let now = Utc::now();
            println!("─────────────────────────────────────────────");
            println!("  forum-ingest status");
            println!("─────────────────────────────────────────────");
            println!("  Posts         : {}", utils::fmt_number(stats.total_posts()));
            for (forum, n) in &stats.posts_per_forum {
                println!("    {:<12}: {}", forum, utils::fmt_number(*n));
            }
            println!(
                "  Announcements : {}",
                utils::fmt_number(stats.total_announcements())
            );
            for (source, n) in &stats.announcements_per_source {
                println!("    {:<12}: {}", source, utils::fmt_number(*n));
            }
            println!("  Watermarks");
            for site in Site::ALL {
                let state = watermarks.state(site.name())?;
                let last = state
                    .last_fetch_ts
                    .map(|ts| utils::fmt_age(ts, now))
                    .unwrap_or_else(|| "never".into());
                let backfill = state
                    .last_backfill_ts
                    .map(|ts| format!(", full window {}", utils::fmt_age(ts, now)))
                    .unwrap_or_default();
                println!(
                    "    {:<12}: {} ({} cycles{})",
                    site.name(),
                    last,
                    state.total_fetch_count,
                    backfill
                );
            }
            if !stats.recent_runs.is_empty() {
                println!("  Recent runs");
                for run in &stats.recent_runs {
                    println!(
                        "    #{:<4} {:<9} {:<8} {} found, {} new{}",
                        run.id,
                        run.source,
                        run.status,
                        run.records_found,
                        run.records_stored,
                        run.error_msg
                            .as_deref()
                            .map(|e| format!(" ({})", e))
                            .unwrap_or_default()
                    );
                }
            }
            println!("─────────────────────────────────────────────");
        }

        Command::Migrate => {
            open_repo(&config)?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}
