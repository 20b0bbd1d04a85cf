//! Scrape orchestration: browser sessions, challenge handling, per-item
//! attempts and the run loop that ties them to durable storage.

pub mod attempt;
pub mod browser;
pub mod challenge;
pub mod extract;
pub mod orchestrator;
pub mod retry;
pub mod session;
pub mod shutdown;
pub mod stores;
pub mod two_captcha;

pub use attempt::{ItemOutcome, ItemScraper, SessionState};
pub use browser::{BrowserSettings, ChromeSessionProvider};
pub use challenge::{
    looks_like_challenge, ChallengeError, ChallengeOracle, ChallengeResolver, Clearance,
    OracleError,
};
pub use extract::{ExtractError, FieldExtractor, ProductPageExtractor};
pub use orchestrator::{Orchestrator, Pacing, RunOutcome, RunReport, RunSettings};
pub use retry::{DelayRange, Retrier, RetryPolicy};
pub use session::{BrowserSession, PageSnapshot, SessionError, SessionProvider};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use stores::{CheckpointStore, ResultSink, StoreError};
pub use two_captcha::TwoCaptchaOracle;
