//! Interactive challenge clearance.
//!
//! The resolver only knows how to try: capture the challenge, ask the oracle,
//! submit the answer, look again. Deciding what a failure means for the item
//! or the session is left to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::retry::{DelayRange, RetryPolicy};
use super::session::{BrowserSession, PageSnapshot, SessionError};
use super::shutdown::Shutdown;

/// Text shown on the image challenge page.
pub const CHALLENGE_TEXT: &str = "Type the characters you see in this image";

/// Form the challenge is submitted through.
pub const CHALLENGE_FORM_ACTION: &str = "/errors/validateCaptcha";

/// Whether a page is the image challenge rather than real content.
pub fn looks_like_challenge(page: &PageSnapshot) -> bool {
    page.contains(CHALLENGE_TEXT) || page.contains(CHALLENGE_FORM_ACTION)
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("oracle rejected the request: {0}")]
    Rejected(String),

    #[error("oracle could not solve the challenge")]
    Unsolvable,

    #[error("oracle gave no answer within {0:?}")]
    Timeout(Duration),

    #[error("no oracle API key configured")]
    NotConfigured,

    #[error("invalid oracle endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}

/// Remote service that turns a challenge image into text.
#[async_trait]
pub trait ChallengeOracle: Send + Sync {
    async fn solve(&self, artifact: &[u8]) -> Result<String, OracleError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    #[error("challenge still present after {attempts} attempts")]
    Unresolved { attempts: u32 },

    #[error("interrupted while solving challenge")]
    Interrupted,
}

/// Page reached once no challenge is showing.
#[derive(Debug, Clone)]
pub struct Clearance {
    pub page: PageSnapshot,
    /// Sub-attempts spent; zero when no challenge was showing.
    pub attempts: u32,
}

impl Clearance {
    pub fn solved_challenge(&self) -> bool {
        self.attempts > 0
    }
}

pub struct ChallengeResolver {
    oracle: Arc<dyn ChallengeOracle>,
    policy: RetryPolicy,
    settle: DelayRange,
}

impl ChallengeResolver {
    pub fn new(oracle: Arc<dyn ChallengeOracle>, policy: RetryPolicy, settle: DelayRange) -> Self {
        Self {
            oracle,
            policy,
            settle,
        }
    }

    /// Clear any challenge on `page`.
    pub async fn resolve(
        &self,
        session: &mut dyn BrowserSession,
        page: PageSnapshot,
        shutdown: &Shutdown,
    ) -> Result<Clearance, ChallengeError> {
        if !session.is_challenge_present(&page) {
            return Ok(Clearance { page, attempts: 0 });
        }

        info!("Challenge detected at {}", page.url);
        let mut retrier = self.policy.start();
        while let Some(attempt) = retrier.next_attempt(shutdown).await {
            match self.attempt(session, shutdown).await {
                Ok(Some(page)) => {
                    info!("Challenge cleared on attempt {}", attempt);
                    return Ok(Clearance {
                        page,
                        attempts: attempt,
                    });
                }
                Ok(None) => warn!("Challenge still present after attempt {}", attempt),
                Err(SubAttemptError::Session(e)) => {
                    warn!("Challenge attempt {} failed: {}", attempt, e)
                }
                Err(SubAttemptError::Oracle(e)) => {
                    warn!("Challenge oracle failed on attempt {}: {}", attempt, e)
                }
                Err(SubAttemptError::Interrupted) => return Err(ChallengeError::Interrupted),
            }
        }

        if shutdown.is_triggered() {
            return Err(ChallengeError::Interrupted);
        }
        Err(ChallengeError::Unresolved {
            attempts: retrier.attempts(),
        })
    }

    /// One capture/solve/submit round. `Ok(None)` means the challenge is
    /// still showing afterwards.
    async fn attempt(
        &self,
        session: &mut dyn BrowserSession,
        shutdown: &Shutdown,
    ) -> Result<Option<PageSnapshot>, SubAttemptError> {
        let artifact = session.capture_challenge().await?;
        debug!("Captured challenge image ({} bytes)", artifact.len());

        // Oracles can sit on a task for minutes; don't hold up an interrupt.
        let answer = tokio::select! {
            answer = self.oracle.solve(&artifact) => answer?,
            _ = shutdown.wait() => return Err(SubAttemptError::Interrupted),
        };
        debug!("Oracle answered challenge");

        let page = session.submit_challenge_answer(answer.trim()).await?;
        shutdown.sleep(self.settle.sample()).await;

        if session.is_challenge_present(&page) {
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SubAttemptError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("interrupted")]
    Interrupted,
}
