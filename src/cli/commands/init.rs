//! Initialize command.

use console::style;

use pricewatch::config::Config;

use super::run::open_database;

/// Create the data directory and bring the database schema up to date.
pub async fn cmd_init(config: &Config) -> anyhow::Result<()> {
    let ctx = open_database(config).await?;
    ctx.test_connection().await?;

    if let Some(path) = &config.source_path {
        println!("  {} Using config {}", style("✓").green(), path.display());
    }
    println!(
        "{} Initialized pricewatch database at {}",
        style("✓").green(),
        config.database_url()
    );

    Ok(())
}
