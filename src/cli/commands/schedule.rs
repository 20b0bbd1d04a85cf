//! Schedule command: run every day at a fixed local time.

use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime};
use console::style;
use tracing::{error, info, warn};

use pricewatch::config::{parse_time, Config};
use pricewatch::scrapers::{shutdown, RunOutcome};

use super::run::{open_database, run_once};

/// Loop forever, starting a run at `at` (or `schedule.at`) every day.
pub async fn cmd_schedule(config: &Config, at: Option<String>, now: bool) -> anyhow::Result<i32> {
    let at = match at {
        Some(at) => parse_time(&at)?,
        None => config.schedule.time()?,
    };

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping scheduler");
            trigger.trigger();
        }
    });

    let ctx = open_database(config).await?;
    println!(
        "{} Scheduled daily run at {}",
        style("✓").green(),
        at.format("%H:%M")
    );

    let mut run_now = now;
    loop {
        if !run_now {
            let current = Local::now().naive_local();
            let next = next_occurrence(current, at);
            info!("Next run at {}", next);
            let wait = (next - current).to_std().unwrap_or_default();
            if !shutdown.sleep(wait).await {
                return Ok(130);
            }
        }
        run_now = false;

        match run_once(config, &ctx, None, 0, shutdown.clone()).await {
            Ok(RunOutcome::Interrupted(_)) => return Ok(130),
            Ok(RunOutcome::Aborted(report)) => {
                error!(
                    "Run aborted after {} restarts; will retry at the next slot",
                    report.restarts.len()
                );
            }
            Ok(_) => {}
            Err(e) => error!("Scheduled run failed: {:#}", e),
        }

        if shutdown.is_triggered() {
            return Ok(130);
        }
    }
}

/// First instant at or after `now` whose time of day is `at`, excluding
/// `now` itself.
fn next_occurrence(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}
