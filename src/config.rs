//! Configuration management for pricewatch using the prefer crate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::repository::DbContext;
use crate::repository::DieselError;
use crate::scrapers::{BrowserSettings, DelayRange, Pacing, RetryPolicy, RunSettings};

/// Default database filename inside the data directory.
pub const DEFAULT_DATABASE_FILENAME: &str = "pricewatch.db";

const DATA_DIR_ENV: &str = "PRICEWATCH_DATA";
const DATABASE_URL_ENV: &str = "DATABASE_URL";
const API_KEY_ENVS: [&str; 2] = ["APIKEY_2CAPTCHA", "TWOCAPTCHA_API_KEY"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {format} config {path}: {reason}")]
    Parse {
        path: PathBuf,
        format: &'static str,
        reason: String,
    },

    #[error("invalid schedule time '{0}', expected HH:MM")]
    InvalidTime(String),
}

/// `[scrape]` section: what to walk and how hard to try.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    /// CSV/TSV or spreadsheet (.xlsx, .ods, ...) holding the identifier list.
    pub input: String,
    /// Header of the identifier column.
    pub column: String,
    /// Site root opened during session setup.
    pub base_url: String,
    /// Product page URL; `{id}` is replaced by the identifier.
    pub product_url: String,
    pub batch_size: usize,
    pub checkpoint_every: usize,
    pub max_consecutive_errors: u32,
    pub max_challenge_failures: u32,
    pub restart_budget: u32,
    pub flush_retries: u32,
    pub item_retry: RetryPolicy,
    pub challenge_retry: RetryPolicy,
    pub setup_retry: RetryPolicy,
    pub pacing: Pacing,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        let run = RunSettings::default();
        Self {
            input: "asins.csv".to_string(),
            column: "ASIN".to_string(),
            base_url: run.home_url,
            product_url: "https://www.amazon.com/dp/{id}".to_string(),
            batch_size: run.batch_size,
            checkpoint_every: run.checkpoint_every,
            max_consecutive_errors: run.max_consecutive_errors,
            max_challenge_failures: run.max_challenge_failures,
            restart_budget: run.restart_budget,
            flush_retries: run.flush_retries,
            item_retry: RetryPolicy::new(3, DelayRange::secs(1.0, 2.5)).with_growth(2.0),
            challenge_retry: RetryPolicy::new(3, DelayRange::secs(2.0, 4.0)),
            setup_retry: run.setup_retry,
            pacing: run.pacing,
        }
    }
}

/// `[oracle]` section: the 2Captcha service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub endpoint: String,
    /// Falls back to `APIKEY_2CAPTCHA` / `TWOCAPTCHA_API_KEY`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: crate::scrapers::two_captcha::DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            poll_interval_secs: 5,
            timeout_secs: 120,
        }
    }
}

impl OracleConfig {
    /// API key from the config file, else from the environment.
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                API_KEY_ENVS
                    .iter()
                    .find_map(|name| std::env::var(name).ok().filter(|k| !k.trim().is_empty()))
            })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[schedule]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Daily start time, local, `HH:MM`.
    pub at: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            at: "00:00".to_string(),
        }
    }
}

impl ScheduleConfig {
    pub fn time(&self) -> Result<NaiveTime, ConfigError> {
        parse_time(&self.at)
    }
}

/// Parse an `HH:MM` time of day.
pub fn parse_time(s: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| ConfigError::InvalidTime(s.to_string()))
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path (database and default input live here).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Database URL; overrides the SQLite file in the data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub scrape: ScrapeConfig,
    pub browser: BrowserSettings,
    pub oracle: OracleConfig,
    pub schedule: ScheduleConfig,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Discover and load the config file, falling back to defaults.
    pub async fn load() -> Self {
        match prefer::load("pricewatch").await {
            Ok(found) => match found.source_path() {
                Some(path) => match Self::load_from_path(path).await {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!("{}; using defaults", e);
                        Self::default()
                    }
                },
                None => Self::default(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file, choosing the parser by
    /// extension (JSON when unknown).
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let parse_err = |format: &'static str, reason: String| ConfigError::Parse {
            path: path.to_path_buf(),
            format,
            reason,
        };

        let mut config: Config = match ext {
            "toml" => toml::from_str(&contents).map_err(|e| parse_err("TOML", e.to_string()))?,
            "yaml" | "yml" => {
                serde_yaml::from_str(&contents).map_err(|e| parse_err("YAML", e.to_string()))?
            }
            _ => serde_json::from_str(&contents).map_err(|e| parse_err("JSON", e.to_string()))?,
        };

        config.source_path = Some(path.to_path_buf());
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Directory that relative paths in the config are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Expand `~` and environment variables, then anchor relative paths.
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::full(path_str)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| path_str.to_string());
        let path = PathBuf::from(expanded);

        if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir_with(std::env::var(DATA_DIR_ENV).ok())
    }

    fn data_dir_with(&self, env_dir: Option<String>) -> PathBuf {
        let base = self.base_dir();
        if let Some(dir) = env_dir.filter(|s| !s.is_empty()) {
            return self.resolve_path(&dir, &base);
        }
        if let Some(dir) = &self.data_dir {
            return self.resolve_path(dir, &base);
        }
        dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pricewatch")
    }

    pub fn database_url(&self) -> String {
        self.database_url_with(std::env::var(DATABASE_URL_ENV).ok(), &self.data_dir())
    }

    fn database_url_with(&self, env_url: Option<String>, data_dir: &Path) -> String {
        env_url
            .filter(|s| !s.is_empty())
            .or_else(|| self.database_url.clone())
            .unwrap_or_else(|| {
                format!(
                    "sqlite:{}",
                    data_dir.join(DEFAULT_DATABASE_FILENAME).display()
                )
            })
    }

    /// Identifier file, honouring an explicit override.
    pub fn input_path(&self, explicit: Option<&Path>) -> PathBuf {
        match explicit {
            Some(path) => path.to_path_buf(),
            None => self.resolve_path(&self.scrape.input, &self.base_dir()),
        }
    }

    /// Orchestrator knobs from the `[scrape]` section.
    pub fn run_settings(&self) -> RunSettings {
        let scrape = &self.scrape;
        RunSettings {
            home_url: scrape.base_url.clone(),
            batch_size: scrape.batch_size.max(1),
            checkpoint_every: scrape.checkpoint_every.max(1),
            max_consecutive_errors: scrape.max_consecutive_errors.max(1),
            max_challenge_failures: scrape.max_challenge_failures.max(1),
            restart_budget: scrape.restart_budget,
            flush_retries: scrape.flush_retries,
            setup_retry: scrape.setup_retry.at_least_once(),
            pacing: scrape.pacing,
        }
    }

    /// Per-item retry policy; never less than one attempt.
    pub fn item_retry(&self) -> RetryPolicy {
        self.scrape.item_retry.at_least_once()
    }

    /// Challenge sub-attempt policy; never less than one attempt.
    pub fn challenge_retry(&self) -> RetryPolicy {
        self.scrape.challenge_retry.at_least_once()
    }

    pub fn create_db_context(&self) -> Result<DbContext, DieselError> {
        DbContext::from_url(&self.database_url())
    }
}

/// Load from `--config` when given, otherwise discover.
pub async fn load_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    match explicit {
        Some(path) => Config::load_from_path(path).await,
        None => Ok(Config::load().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pricewatch.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "state"

[scrape]
batch_size = 25
input = "lists/asins.tsv"

[scrape.item_retry]
max_attempts = 5
backoff = { min_secs = 1.0, max_secs = 2.0 }

[browser]
headless = false

[schedule]
at = "06:30"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).await.unwrap();
        assert_eq!(config.scrape.batch_size, 25);
        assert_eq!(config.scrape.checkpoint_every, 5);
        assert_eq!(config.scrape.column, "ASIN");
        assert_eq!(config.scrape.item_retry.max_attempts, 5);
        assert_eq!(config.scrape.item_retry.growth, 1.0);
        assert!(!config.browser.headless);
        assert_eq!(
            config.schedule.time().unwrap(),
            NaiveTime::from_hms_opt(6, 30, 0).unwrap()
        );
        assert_eq!(config.data_dir_with(None), dir.path().join("state"));
        assert_eq!(config.input_path(None), dir.path().join("lists/asins.tsv"));
    }

    #[tokio::test]
    async fn test_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("pricewatch.yaml");
        std::fs::write(&yaml, "scrape:\n  restart_budget: 4\n").unwrap();
        let config = Config::load_from_path(&yaml).await.unwrap();
        assert_eq!(config.scrape.restart_budget, 4);

        let json = dir.path().join("pricewatch.json");
        std::fs::write(&json, r#"{"oracle": {"timeout_secs": 60}}"#).unwrap();
        let config = Config::load_from_path(&json).await.unwrap();
        assert_eq!(config.oracle.timeout(), Duration::from_secs(60));
        assert_eq!(config.oracle.poll_interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_parse_error_names_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[scrape\n").unwrap();

        let err = Config::load_from_path(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { format: "TOML", .. }));
    }

    #[test]
    fn test_database_url_precedence() {
        let data_dir = PathBuf::from("/var/lib/pricewatch");
        let mut config = Config::default();
        assert_eq!(
            config.database_url_with(None, &data_dir),
            "sqlite:/var/lib/pricewatch/pricewatch.db"
        );

        config.database_url = Some("sqlite:/tmp/other.db".to_string());
        assert_eq!(config.database_url_with(None, &data_dir), "sqlite:/tmp/other.db");
        assert_eq!(
            config.database_url_with(Some("postgres://db/pw".to_string()), &data_dir),
            "postgres://db/pw"
        );
    }

    #[test]
    fn test_run_settings_clamps_zero_intervals() {
        let mut config = Config::default();
        config.scrape.batch_size = 0;
        config.scrape.checkpoint_every = 0;
        let run = config.run_settings();
        assert_eq!(run.batch_size, 1);
        assert_eq!(run.checkpoint_every, 1);
        assert_eq!(run.restart_budget, 10);
    }

    #[test]
    fn test_zero_attempt_policies_clamped() {
        let mut config = Config::default();
        config.scrape.item_retry.max_attempts = 0;
        config.scrape.challenge_retry.max_attempts = 0;
        config.scrape.setup_retry.max_attempts = 0;

        assert_eq!(config.item_retry().max_attempts, 1);
        assert_eq!(config.challenge_retry().max_attempts, 1);
        assert_eq!(config.run_settings().setup_retry.max_attempts, 1);
        assert_eq!(config.item_retry().growth, 2.0);
    }

    #[test]
    fn test_parse_time() {
        assert!(parse_time("00:00").is_ok());
        assert!(parse_time("23:59").is_ok());
        assert!(matches!(parse_time("25:00"), Err(ConfigError::InvalidTime(_))));
        assert!(parse_time("noon").is_err());
    }
}
