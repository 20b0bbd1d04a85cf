//! Database migrations using cetane.
//!
//! cetane's migrator is synchronous, so SQLite migrations run on a blocking
//! task through rusqlite.

use cetane::migrator::MigrationStateStore;
use tracing::info;

use super::pool::DieselError;
use super::util::{is_postgres_url, to_diesel_error};

/// Apply pending migrations to the database at `database_url`.
pub async fn run_migrations(database_url: &str) -> Result<Vec<String>, DieselError> {
    if is_postgres_url(database_url) {
        #[cfg(feature = "postgres")]
        return run_postgres_migrations(database_url).await;

        #[cfg(not(feature = "postgres"))]
        return Err(to_diesel_error(
            "PostgreSQL support not compiled. Use --features postgres",
        ));
    }

    run_sqlite_migrations(database_url).await
}

async fn run_sqlite_migrations(database_url: &str) -> Result<Vec<String>, DieselError> {
    use cetane::backend::Sqlite;
    use cetane::migrator::Migrator;

    let path = database_url
        .strip_prefix("sqlite:")
        .unwrap_or(database_url)
        .to_string();

    tokio::task::spawn_blocking(move || {
        let conn = rusqlite::Connection::open(&path).map_err(to_diesel_error)?;
        let registry = crate::migrations::registry();
        let state = SqliteState::new(&conn)?;

        let backend = Sqlite;
        let mut migrator = Migrator::new(&registry, &backend, state);
        let applied: Vec<String> = migrator
            .migrate_forward(|sql| conn.execute_batch(sql).map_err(|e| e.to_string()))
            .map_err(to_diesel_error)?
            .into_iter()
            .map(|name| name.to_string())
            .collect();

        log_applied(&applied);
        Ok(applied)
    })
    .await
    .map_err(to_diesel_error)?
}

#[cfg(feature = "postgres")]
async fn run_postgres_migrations(database_url: &str) -> Result<Vec<String>, DieselError> {
    use cetane::backend::Postgres;
    use cetane::migrator::Migrator;

    let (client, connection) = tokio_postgres::connect(database_url, tokio_postgres::NoTls)
        .await
        .map_err(to_diesel_error)?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    let state = PostgresState::new(&client).await?;
    let registry = crate::migrations::registry();
    let backend = Postgres;
    let mut migrator = Migrator::new(&registry, &backend, state);
    let applied: Vec<String> = migrator
        .migrate_forward(|sql| block_on_client(|| client.batch_execute(sql)))
        .map_err(to_diesel_error)?
        .into_iter()
        .map(|name| name.to_string())
        .collect();

    log_applied(&applied);
    Ok(applied)
}

/// Drive a tokio-postgres future from cetane's synchronous callbacks.
#[cfg(feature = "postgres")]
fn block_on_client<F, Fut>(f: F) -> Result<(), String>
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<(), tokio_postgres::Error>>,
{
    let rt = tokio::runtime::Handle::current();
    std::thread::scope(|s| {
        s.spawn(|| rt.block_on(f()).map_err(|e| e.to_string()))
            .join()
            .map_err(|_| "migration thread panicked".to_string())?
    })
}

fn log_applied(applied: &[String]) {
    if applied.is_empty() {
        info!("No pending migrations");
    }
    for name in applied {
        info!("Applied migration: {}", name);
    }
}

struct SqliteState<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> SqliteState<'a> {
    fn new(conn: &'a rusqlite::Connection) -> Result<Self, DieselError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS __cetane_migrations (
                name TEXT PRIMARY KEY NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .map_err(to_diesel_error)?;

        Ok(Self { conn })
    }
}

impl MigrationStateStore for SqliteState<'_> {
    fn applied_migrations(&mut self) -> Result<Vec<String>, String> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM __cetane_migrations ORDER BY name")
            .map_err(|e| e.to_string())?;

        let names = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| e.to_string())?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| e.to_string())?;

        Ok(names)
    }

    fn mark_applied(&mut self, name: &str) -> Result<(), String> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO __cetane_migrations (name) VALUES (?1)",
                [name],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn mark_unapplied(&mut self, name: &str) -> Result<(), String> {
        self.conn
            .execute("DELETE FROM __cetane_migrations WHERE name = ?1", [name])
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(feature = "postgres")]
struct PostgresState<'a> {
    client: &'a tokio_postgres::Client,
    applied: Vec<String>,
}

#[cfg(feature = "postgres")]
impl<'a> PostgresState<'a> {
    async fn new(client: &'a tokio_postgres::Client) -> Result<Self, DieselError> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS __cetane_migrations (
                    name TEXT PRIMARY KEY NOT NULL,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
            )
            .await
            .map_err(to_diesel_error)?;

        let applied = client
            .query("SELECT name FROM __cetane_migrations ORDER BY name", &[])
            .await
            .map_err(to_diesel_error)?
            .iter()
            .map(|row| row.get::<_, String>(0))
            .collect();

        Ok(Self { client, applied })
    }
}

#[cfg(feature = "postgres")]
impl MigrationStateStore for PostgresState<'_> {
    fn applied_migrations(&mut self) -> Result<Vec<String>, String> {
        Ok(self.applied.clone())
    }

    fn mark_applied(&mut self, name: &str) -> Result<(), String> {
        let client = self.client;
        block_on_client(|| async move {
            client
                .execute(
                    "INSERT INTO __cetane_migrations (name) VALUES ($1) ON CONFLICT DO NOTHING",
                    &[&name],
                )
                .await
                .map(|_| ())
        })?;

        if !self.applied.iter().any(|n| n == name) {
            self.applied.push(name.to_string());
        }
        Ok(())
    }

    fn mark_unapplied(&mut self, name: &str) -> Result<(), String> {
        let client = self.client;
        block_on_client(|| async move {
            client
                .execute("DELETE FROM __cetane_migrations WHERE name = $1", &[&name])
                .await
                .map(|_| ())
        })?;

        self.applied.retain(|n| n != name);
        Ok(())
    }
}
