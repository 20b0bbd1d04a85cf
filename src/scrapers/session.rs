//! Browser session boundary.
//!
//! The orchestrator only ever holds one session at a time and always tears
//! it down before acquiring the next one.

use std::time::Duration;

use async_trait::async_trait;

/// Rendered page as seen right after a navigation or form submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
    pub url: String,
    pub html: String,
}

impl PageSnapshot {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.html.contains(needle)
    }
}

/// Errors raised by a browser session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to start browser: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("element not found: {0}")]
    ElementMissing(String),

    #[error("browser connection lost: {0}")]
    Disconnected(String),

    #[error("browser support not compiled. Rebuild with: cargo build --features browser")]
    Unsupported,

    #[error("browser protocol error: {0}")]
    Protocol(String),

    #[error("interrupted")]
    Interrupted,
}

/// One exclusively owned browsing identity.
#[async_trait]
pub trait BrowserSession: Send {
    /// Load `url` and return the rendered page.
    async fn navigate(&mut self, url: &str) -> Result<PageSnapshot, SessionError>;

    /// Whether `page` is an interactive challenge instead of real content.
    fn is_challenge_present(&self, page: &PageSnapshot) -> bool;

    /// Capture the challenge image currently on screen.
    async fn capture_challenge(&mut self) -> Result<Vec<u8>, SessionError>;

    /// Type `answer` into the challenge form, submit it and return the page
    /// that follows.
    async fn submit_challenge_answer(&mut self, answer: &str)
        -> Result<PageSnapshot, SessionError>;

    /// Drop all cookies so the session starts from a clean identity.
    async fn clear_cookies(&mut self) -> Result<(), SessionError>;

    /// Site-specific normalisation (delivery location, consent banners) run
    /// once after the landing page is clear of challenges.
    async fn normalize(&mut self) -> Result<(), SessionError>;

    /// Open any lazily loaded listing panels on the current product page
    /// and return the page with them expanded. Failures fall back to `page`.
    async fn reveal_offers(&mut self, page: PageSnapshot) -> PageSnapshot {
        page
    }

    /// False once the underlying browser is known to be gone.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Close the session. Errors are reported but the session is consumed
    /// either way.
    async fn teardown(self: Box<Self>) -> Result<(), SessionError>;
}

/// Produces fresh sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn BrowserSession>, SessionError>;
}
