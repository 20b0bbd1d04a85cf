//! Status command: checkpoint and stored rows for one day.

use chrono::{Local, NaiveDate};
use console::style;

use pricewatch::config::Config;

/// Show the checkpoint and row counts for `date` (default: today).
pub async fn cmd_status(config: &Config, date: Option<NaiveDate>) -> anyhow::Result<()> {
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    let ctx = config.create_db_context()?;

    let checkpoint = ctx.checkpoints().get(date).await?;
    let counts = ctx.snapshots().count_for_date(date).await?;

    println!("{}", style(format!("Status for {}", date)).bold());
    match checkpoint {
        Some(cp) if cp.completed => println!(
            "  {} Completed ({} positions, last {})",
            style("✓").green(),
            cp.last_index,
            cp.last_identifier.as_deref().unwrap_or("-")
        ),
        Some(cp) => println!(
            "  {} In progress: resumes at position {} (last {})",
            style("!").yellow(),
            cp.last_index,
            cp.last_identifier.as_deref().unwrap_or("-")
        ),
        None => println!("  {} No run recorded", style("-").dim()),
    }
    println!(
        "  {} ok, {} failed",
        style(counts.ok).green(),
        style(counts.error).red()
    );

    Ok(())
}
