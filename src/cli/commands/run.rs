//! Run command: one pass over today's list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use console::style;
use tracing::{info, warn};

use pricewatch::config::Config;
use pricewatch::identifiers::load_identifiers;
use pricewatch::repository::migrations::run_migrations;
use pricewatch::repository::util::is_postgres_url;
use pricewatch::repository::DbContext;
use pricewatch::scrapers::{
    shutdown, ChallengeResolver, ChromeSessionProvider, ItemScraper, Orchestrator,
    ProductPageExtractor, RunOutcome, Shutdown, TwoCaptchaOracle,
};

/// Scrape once now and return the run's exit code.
pub async fn cmd_run(
    config: &Config,
    from_idx: Option<usize>,
    input: Option<PathBuf>,
) -> anyhow::Result<i32> {
    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            trigger.trigger();
        }
    });

    let ctx = open_database(config).await?;
    let outcome = run_once(
        config,
        &ctx,
        input.as_deref(),
        from_idx.unwrap_or(0),
        shutdown,
    )
    .await?;
    Ok(outcome.exit_code())
}

/// Open the configured database, creating the data directory and applying
/// pending migrations first.
pub async fn open_database(config: &Config) -> anyhow::Result<DbContext> {
    let url = config.database_url();
    if !is_postgres_url(&url) {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    }

    let applied = run_migrations(&url)
        .await
        .context("Failed to apply database migrations")?;
    for name in &applied {
        info!("Applied migration {}", name);
    }

    config
        .create_db_context()
        .context("Failed to open database")
}

/// Load the identifier list and walk it for today's date.
pub async fn run_once(
    config: &Config,
    ctx: &DbContext,
    input: Option<&Path>,
    start_index: usize,
    shutdown: Shutdown,
) -> anyhow::Result<RunOutcome> {
    // Pinned here so a run that crosses midnight stays in one day.
    let scan_date: NaiveDate = Local::now().date_naive();

    let input = config.input_path(input);
    let identifiers = load_identifiers(&input, &config.scrape.column).await?;
    if identifiers.is_empty() {
        anyhow::bail!("No identifiers found in {}", input.display());
    }

    let orchestrator = build_orchestrator(config, ctx, &shutdown)?.with_shutdown(shutdown);
    info!(
        "Starting run for {} ({} identifiers, from position {})",
        scan_date,
        identifiers.len(),
        start_index
    );
    let outcome = orchestrator.run(&identifiers, start_index, scan_date).await;
    print_outcome(scan_date, &outcome);
    Ok(outcome)
}

fn build_orchestrator(
    config: &Config,
    ctx: &DbContext,
    shutdown: &Shutdown,
) -> anyhow::Result<Orchestrator> {
    let settings = config.run_settings();
    let settle = settings.pacing.settle;

    let api_key = config.oracle.api_key().unwrap_or_default();
    let oracle = TwoCaptchaOracle::new(
        config.oracle.endpoint.clone(),
        api_key,
        config.oracle.poll_interval(),
        config.oracle.timeout(),
    )
    .context("Challenge oracle unavailable; set APIKEY_2CAPTCHA or oracle.api_key")?;

    let resolver = ChallengeResolver::new(Arc::new(oracle), config.challenge_retry(), settle);
    let scraper = ItemScraper::new(
        resolver,
        Arc::new(ProductPageExtractor),
        config.item_retry(),
        config.scrape.product_url.clone(),
        settings.max_challenge_failures,
        settle,
    );
    let provider =
        ChromeSessionProvider::new(config.browser.clone(), settle).with_shutdown(shutdown.clone());

    Ok(Orchestrator::new(
        Arc::new(provider),
        scraper,
        Arc::new(ctx.checkpoints()),
        Arc::new(ctx.snapshots()),
        settings,
    ))
}

fn print_outcome(scan_date: NaiveDate, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::AlreadyCompleted => {
            println!(
                "{} Run for {} already completed",
                style("✓").green(),
                scan_date
            );
            return;
        }
        RunOutcome::Completed(_) => {
            println!("{} Completed run for {}", style("✓").green(), scan_date);
        }
        RunOutcome::Aborted(report) => {
            println!(
                "{} Aborted run for {} after {} restarts",
                style("✗").red(),
                scan_date,
                report.restarts.len()
            );
        }
        RunOutcome::Interrupted(_) => {
            println!("{} Interrupted run for {}", style("!").yellow(), scan_date);
        }
    }

    if let Some(report) = outcome.report() {
        println!(
            "  attempted {}, {} ok, {} failed, {} skipped, {} restarts",
            report.attempted,
            style(report.succeeded).green(),
            style(report.failed).red(),
            report.skipped,
            report.restarts.len()
        );
    }
}
