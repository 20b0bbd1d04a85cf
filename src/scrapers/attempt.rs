//! One identifier's scrape against the current session.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, warn};

use super::challenge::{ChallengeError, ChallengeResolver};
use super::extract::FieldExtractor;
use super::retry::{DelayRange, RetryPolicy};
use super::session::BrowserSession;
use super::shutdown::Shutdown;
use crate::models::ScrapeResult;

/// Health counters for the current session. A fresh session starts at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Items in a row that ended in terminal failure.
    pub consecutive_errors: u32,
    /// Challenge resolutions in a row that ended unresolved.
    pub challenge_failures: u32,
}

/// How an item attempt ended.
#[derive(Debug)]
pub enum ItemOutcome {
    Success(ScrapeResult),
    /// Retries exhausted. Carries a sentinel record so the position still
    /// counts as processed.
    FailedTerminal(ScrapeResult),
    /// Challenge failures crossed the session threshold mid-item. Nothing is
    /// recorded for the item; it is retried on the next session.
    SessionDegraded(String),
    Interrupted,
}

pub struct ItemScraper {
    resolver: ChallengeResolver,
    extractor: Arc<dyn FieldExtractor>,
    policy: RetryPolicy,
    url_template: String,
    challenge_threshold: u32,
    settle: DelayRange,
}

impl ItemScraper {
    pub fn new(
        resolver: ChallengeResolver,
        extractor: Arc<dyn FieldExtractor>,
        policy: RetryPolicy,
        url_template: impl Into<String>,
        challenge_threshold: u32,
        settle: DelayRange,
    ) -> Self {
        Self {
            resolver,
            extractor,
            policy,
            url_template: url_template.into(),
            challenge_threshold,
            settle,
        }
    }

    pub fn resolver(&self) -> &ChallengeResolver {
        &self.resolver
    }

    /// Canonical product URL; `{id}` in the template is replaced by the
    /// percent-encoded identifier.
    pub fn product_url(&self, identifier: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(identifier.as_bytes()).collect();
        // byte_serialize writes spaces as '+'; a literal '+' is already %2B
        self.url_template.replace("{id}", &encoded.replace('+', "%20"))
    }

    pub async fn scrape(
        &self,
        session: &mut dyn BrowserSession,
        state: &mut SessionState,
        identifier: &str,
        index: usize,
        scan_date: NaiveDate,
        shutdown: &Shutdown,
    ) -> ItemOutcome {
        let url = self.product_url(identifier);
        let mut last_error = String::from("no attempt made");

        let mut retrier = self.policy.start();
        while let Some(attempt) = retrier.next_attempt(shutdown).await {
            debug!("[{}] {} attempt {}: {}", index, identifier, attempt, url);

            let page = match session.navigate(&url).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(
                        "[{}] {} attempt {}/{}: navigation failed: {}",
                        index, identifier, attempt, self.policy.max_attempts, e
                    );
                    last_error = e.to_string();
                    continue;
                }
            };

            if !shutdown.sleep(self.settle.sample()).await {
                return ItemOutcome::Interrupted;
            }

            let page = match self.resolver.resolve(session, page, shutdown).await {
                Ok(clearance) => {
                    if clearance.solved_challenge() {
                        state.challenge_failures = 0;
                    }
                    session.reveal_offers(clearance.page).await
                }
                Err(ChallengeError::Interrupted) => return ItemOutcome::Interrupted,
                Err(e) => {
                    state.challenge_failures += 1;
                    warn!(
                        "[{}] {} attempt {}/{}: {} ({} consecutive challenge failures)",
                        index,
                        identifier,
                        attempt,
                        self.policy.max_attempts,
                        e,
                        state.challenge_failures
                    );
                    if state.challenge_failures >= self.challenge_threshold {
                        return ItemOutcome::SessionDegraded(format!(
                            "{} consecutive unresolved challenges",
                            state.challenge_failures
                        ));
                    }
                    last_error = e.to_string();
                    continue;
                }
            };

            match self.extractor.extract(&page) {
                Ok(fields) => {
                    state.consecutive_errors = 0;
                    return ItemOutcome::Success(ScrapeResult::success(identifier, scan_date, fields));
                }
                Err(e) => {
                    warn!(
                        "[{}] {} attempt {}/{}: extraction failed: {}",
                        index, identifier, attempt, self.policy.max_attempts, e
                    );
                    last_error = e.to_string();
                }
            }
        }

        if shutdown.is_triggered() {
            return ItemOutcome::Interrupted;
        }

        state.consecutive_errors += 1;
        warn!(
            "[{}] {} failed after {} attempts ({} consecutive): {}",
            index,
            identifier,
            retrier.attempts(),
            state.consecutive_errors,
            last_error
        );
        ItemOutcome::FailedTerminal(ScrapeResult::failure(identifier, scan_date, last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProductFields;
    use crate::scrapers::challenge::{looks_like_challenge, ChallengeOracle, OracleError};
    use crate::scrapers::extract::{ExtractError, ProductPageExtractor};
    use crate::scrapers::session::{PageSnapshot, SessionError};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Replays one scripted response per navigation.
    struct ReplaySession {
        pages: VecDeque<Result<String, SessionError>>,
        visited: Vec<String>,
    }

    impl ReplaySession {
        fn new(pages: Vec<Result<String, SessionError>>) -> Self {
            Self {
                pages: pages.into(),
                visited: vec![],
            }
        }
    }

    #[async_trait]
    impl BrowserSession for ReplaySession {
        async fn navigate(&mut self, url: &str) -> Result<PageSnapshot, SessionError> {
            self.visited.push(url.to_string());
            let html = self
                .pages
                .pop_front()
                .unwrap_or_else(|| Err(SessionError::Disconnected("script exhausted".into())))?;
            Ok(PageSnapshot::new(url, html))
        }

        fn is_challenge_present(&self, page: &PageSnapshot) -> bool {
            looks_like_challenge(page)
        }

        async fn capture_challenge(&mut self) -> Result<Vec<u8>, SessionError> {
            Ok(vec![1, 2, 3])
        }

        async fn submit_challenge_answer(&mut self, _: &str) -> Result<PageSnapshot, SessionError> {
            Ok(PageSnapshot::new("https://shop.test/errors/validateCaptcha", CHALLENGE))
        }

        async fn clear_cookies(&mut self) -> Result<(), SessionError> {
            Ok(())
        }

        async fn normalize(&mut self) -> Result<(), SessionError> {
            Ok(())
        }

        async fn teardown(self: Box<Self>) -> Result<(), SessionError> {
            Ok(())
        }
    }

    struct NoOracle;

    #[async_trait]
    impl ChallengeOracle for NoOracle {
        async fn solve(&self, _: &[u8]) -> Result<String, OracleError> {
            Err(OracleError::Unsolvable)
        }
    }

    /// Price absent, rank present.
    struct RankOnly;

    impl FieldExtractor for RankOnly {
        fn extract(&self, _: &PageSnapshot) -> Result<ProductFields, ExtractError> {
            Ok(ProductFields {
                best_seller_rank: Some("42".into()),
                ..Default::default()
            })
        }
    }

    const PRODUCT: &str = r#"<div id="dp"><span id="productTitle">Kettle</span></div>"#;
    const CHALLENGE: &str = "<p>Type the characters you see in this image</p>";

    fn scraper(extractor: Arc<dyn FieldExtractor>, attempts: u32) -> ItemScraper {
        let resolver = ChallengeResolver::new(
            Arc::new(NoOracle),
            RetryPolicy::new(1, DelayRange::ZERO),
            DelayRange::ZERO,
        );
        ItemScraper::new(
            resolver,
            extractor,
            RetryPolicy::new(attempts, DelayRange::ZERO),
            "https://shop.test/dp/{id}",
            3,
            DelayRange::ZERO,
        )
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 12).unwrap()
    }

    #[tokio::test]
    async fn test_partial_fields_are_success() {
        let mut session = ReplaySession::new(vec![Ok(PRODUCT.into())]);
        let mut state = SessionState {
            consecutive_errors: 2,
            challenge_failures: 0,
        };

        let outcome = scraper(Arc::new(RankOnly), 3)
            .scrape(&mut session, &mut state, "B1", 0, day(), &Shutdown::never())
            .await;

        match outcome {
            ItemOutcome::Success(result) => {
                assert!(result.is_success());
                assert_eq!(result.fields.price, None);
                assert_eq!(result.fields.best_seller_rank.as_deref(), Some("42"));
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(state.consecutive_errors, 0);
        assert_eq!(session.visited, vec!["https://shop.test/dp/B1"]);
    }

    #[test]
    fn test_product_url_encodes_identifier() {
        let scraper = scraper(Arc::new(ProductPageExtractor), 1);
        assert_eq!(scraper.product_url("B000TEST01"), "https://shop.test/dp/B000TEST01");
        assert_eq!(scraper.product_url("a b/c+d"), "https://shop.test/dp/a%20b%2Fc%2Bd");
    }

    #[tokio::test]
    async fn test_transient_navigation_error_is_retried() {
        let mut session = ReplaySession::new(vec![
            Err(SessionError::Timeout(std::time::Duration::from_secs(30))),
            Ok(PRODUCT.into()),
        ]);
        let mut state = SessionState::default();

        let outcome = scraper(Arc::new(ProductPageExtractor), 3)
            .scrape(&mut session, &mut state, "B2", 4, day(), &Shutdown::never())
            .await;

        assert!(matches!(outcome, ItemOutcome::Success(_)));
        assert_eq!(session.visited.len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_yield_sentinel() {
        let mut session = ReplaySession::new(vec![
            Ok("<h1>Not a product</h1>".into()),
            Ok("<h1>Not a product</h1>".into()),
        ]);
        let mut state = SessionState::default();

        let outcome = scraper(Arc::new(ProductPageExtractor), 2)
            .scrape(&mut session, &mut state, "B3", 9, day(), &Shutdown::never())
            .await;

        match outcome {
            ItemOutcome::FailedTerminal(result) => {
                assert!(!result.is_success());
                assert!(result.fields.is_empty());
                assert!(result.error.unwrap().contains("not a product page"));
            }
            other => panic!("expected terminal failure, got {:?}", other),
        }
        assert_eq!(state.consecutive_errors, 1);
    }

    #[tokio::test]
    async fn test_challenge_threshold_degrades_session() {
        let mut session = ReplaySession::new(vec![
            Ok(CHALLENGE.into()),
            Ok(CHALLENGE.into()),
            Ok(CHALLENGE.into()),
        ]);
        let mut state = SessionState {
            consecutive_errors: 0,
            challenge_failures: 1,
        };

        let outcome = scraper(Arc::new(ProductPageExtractor), 3)
            .scrape(&mut session, &mut state, "B4", 0, day(), &Shutdown::never())
            .await;

        assert!(matches!(outcome, ItemOutcome::SessionDegraded(_)));
        assert_eq!(state.challenge_failures, 3);
        assert_eq!(session.visited.len(), 2);
        assert_eq!(state.consecutive_errors, 0);
    }
}
