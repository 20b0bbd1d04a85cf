//! 2Captcha image oracle.
//!
//! Uploads the challenge image as base64 to `in.php`, then polls `res.php`
//! until the task is solved, rejected, or the timeout passes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::challenge::{ChallengeOracle, OracleError};

pub const DEFAULT_ENDPOINT: &str = "https://2captcha.com";

/// Both 2Captcha endpoints answer `{"status": 0|1, "request": "..."}`.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: i32,
    request: String,
}

pub struct TwoCaptchaOracle {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl TwoCaptchaOracle {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Self, OracleError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(OracleError::NotConfigured);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            endpoint: Self::base_url(&endpoint.into())?,
            api_key,
            poll_interval,
            timeout,
        })
    }

    /// Parse the service root so `in.php` and `res.php` join beneath it.
    fn base_url(endpoint: &str) -> Result<Url, OracleError> {
        let root = format!("{}/", endpoint.trim_end_matches('/'));
        Ok(Url::parse(&root)?)
    }

    async fn submit(&self, artifact: &[u8]) -> Result<String, OracleError> {
        let body = base64::engine::general_purpose::STANDARD.encode(artifact);
        let response: ApiResponse = self
            .client
            .post(self.endpoint.join("in.php")?)
            .form(&[
                ("key", self.api_key.as_str()),
                ("method", "base64"),
                ("body", body.as_str()),
                ("json", "1"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.status == 1 {
            Ok(response.request)
        } else {
            Err(OracleError::Rejected(response.request))
        }
    }

    async fn poll(&self, task_id: &str) -> Result<Option<String>, OracleError> {
        let response: ApiResponse = self
            .client
            .get(self.endpoint.join("res.php")?)
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "get"),
                ("id", task_id),
                ("json", "1"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        interpret_poll(response)
    }
}

fn interpret_poll(response: ApiResponse) -> Result<Option<String>, OracleError> {
    match (response.status, response.request.as_str()) {
        (1, _) => Ok(Some(response.request)),
        (_, "CAPCHA_NOT_READY") => Ok(None),
        (_, "ERROR_CAPTCHA_UNSOLVABLE") => Err(OracleError::Unsolvable),
        _ => Err(OracleError::Rejected(response.request)),
    }
}

#[async_trait]
impl ChallengeOracle for TwoCaptchaOracle {
    async fn solve(&self, artifact: &[u8]) -> Result<String, OracleError> {
        let task_id = self.submit(artifact).await?;
        debug!("Submitted challenge to 2Captcha as task {}", task_id);

        let started = Instant::now();
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if let Some(answer) = self.poll(&task_id).await? {
                return Ok(answer);
            }
            if started.elapsed() >= self.timeout {
                return Err(OracleError::Timeout(self.timeout));
            }
        }
    }
}
