use cetane::prelude::*;

pub fn migration() -> Migration {
    Migration::new("0001_initial")
        .operation(
            RunSql::portable()
                .for_backend(
                    "sqlite",
                    r#"CREATE TABLE scrape_checkpoints (
    scan_date TEXT PRIMARY KEY NOT NULL,
    last_identifier TEXT,
    last_index INTEGER NOT NULL DEFAULT 0,
    completed INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
)"#,
                )
                .for_backend(
                    "postgres",
                    r#"CREATE TABLE IF NOT EXISTS scrape_checkpoints (
    scan_date TEXT PRIMARY KEY NOT NULL,
    last_identifier TEXT,
    last_index INTEGER NOT NULL DEFAULT 0,
    completed BOOLEAN NOT NULL DEFAULT FALSE,
    updated_at TEXT NOT NULL
)"#,
                ),
        )
        // One snapshot per (identifier, scan_date); re-scrapes overwrite in place.
        .operation(
            RunSql::portable()
                .for_backend(
                    "sqlite",
                    r#"CREATE TABLE product_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identifier TEXT NOT NULL,
    scan_date TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'ok',
    title TEXT,
    price TEXT,
    minimum_price TEXT,
    offer_count INTEGER,
    best_seller_rank TEXT,
    error TEXT,
    scraped_at TEXT NOT NULL,
    UNIQUE (identifier, scan_date)
)"#,
                )
                .for_backend(
                    "postgres",
                    r#"CREATE TABLE IF NOT EXISTS product_snapshots (
    id SERIAL PRIMARY KEY,
    identifier TEXT NOT NULL,
    scan_date TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'ok',
    title TEXT,
    price TEXT,
    minimum_price TEXT,
    offer_count INTEGER,
    best_seller_rank TEXT,
    error TEXT,
    scraped_at TEXT NOT NULL,
    UNIQUE (identifier, scan_date)
)"#,
                ),
        )
}
