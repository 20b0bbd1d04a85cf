//! Recovery-loop behaviour against scripted sessions and in-memory stores.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;

use pricewatch::models::{Checkpoint, ProductFields, ResultStatus, ScrapeResult};
use pricewatch::repository::migrations::run_migrations;
use pricewatch::repository::DbContext;
use pricewatch::scrapers::challenge::{CHALLENGE_FORM_ACTION, CHALLENGE_TEXT};
use pricewatch::scrapers::{
    looks_like_challenge, shutdown, BrowserSession, ChallengeOracle, ChallengeResolver,
    CheckpointStore, DelayRange, ExtractError, FieldExtractor, ItemScraper, OracleError,
    Orchestrator, Pacing, PageSnapshot, ResultSink, RetryPolicy, RunOutcome, RunSettings,
    SessionError, SessionProvider, StoreError,
};

const HOME: &str = "https://shop.test/";
const PRODUCT_PREFIX: &str = "https://shop.test/dp/";

/// What a scripted session shows for a URL.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Product,
    NavError,
    Challenge,
}

/// `(session number starting at 1, identifier or "" for the home page)`.
type Script = dyn Fn(usize, &str) -> Step + Send + Sync;

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn challenge_page(url: &str) -> PageSnapshot {
    PageSnapshot::new(
        url,
        format!(
            "<form action=\"{}\"><p>{}</p></form>",
            CHALLENGE_FORM_ACTION, CHALLENGE_TEXT
        ),
    )
}

/// Session behaviour outside of what pages look like.
#[derive(Debug, Clone, Copy, Default)]
struct Quirks {
    /// The first session reports itself unhealthy after this many navigations.
    unhealthy_after: Option<usize>,
    /// Every teardown reports an error (after being counted).
    teardown_fails: bool,
}

struct FakeProvider {
    script: Arc<Script>,
    quirks: Quirks,
    acquisitions: AtomicUsize,
    teardowns: Arc<AtomicUsize>,
    navigations: Arc<Mutex<Vec<String>>>,
}

impl FakeProvider {
    fn new(script: impl Fn(usize, &str) -> Step + Send + Sync + 'static) -> Arc<Self> {
        Self::with_quirks(script, Quirks::default())
    }

    fn with_quirks(
        script: impl Fn(usize, &str) -> Step + Send + Sync + 'static,
        quirks: Quirks,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(script),
            quirks,
            acquisitions: AtomicUsize::new(0),
            teardowns: Arc::new(AtomicUsize::new(0)),
            navigations: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn healthy() -> Arc<Self> {
        Self::new(|_, _| Step::Product)
    }

    fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    fn visits(&self, identifier: &str) -> usize {
        let url = format!("{}{}", PRODUCT_PREFIX, identifier);
        self.navigations
            .lock()
            .unwrap()
            .iter()
            .filter(|u| **u == url)
            .count()
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    async fn acquire(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let number = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(FakeSession {
            number,
            script: self.script.clone(),
            unhealthy_after: self.quirks.unhealthy_after.filter(|_| number == 1),
            teardown_fails: self.quirks.teardown_fails,
            navigated: 0,
            teardowns: self.teardowns.clone(),
            navigations: self.navigations.clone(),
        }))
    }
}

struct FakeSession {
    number: usize,
    script: Arc<Script>,
    unhealthy_after: Option<usize>,
    teardown_fails: bool,
    navigated: usize,
    teardowns: Arc<AtomicUsize>,
    navigations: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&mut self, url: &str) -> Result<PageSnapshot, SessionError> {
        self.navigated += 1;
        self.navigations.lock().unwrap().push(url.to_string());
        let identifier = url.strip_prefix(PRODUCT_PREFIX).unwrap_or("");

        match (self.script)(self.number, identifier) {
            Step::Product => Ok(PageSnapshot::new(url, format!("product:{}", identifier))),
            Step::NavError => Err(SessionError::Navigation {
                url: url.to_string(),
                reason: "connection reset".to_string(),
            }),
            Step::Challenge => Ok(challenge_page(url)),
        }
    }

    fn is_challenge_present(&self, page: &PageSnapshot) -> bool {
        looks_like_challenge(page)
    }

    async fn capture_challenge(&mut self) -> Result<Vec<u8>, SessionError> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn submit_challenge_answer(
        &mut self,
        _answer: &str,
    ) -> Result<PageSnapshot, SessionError> {
        Ok(challenge_page("https://shop.test/errors/validateCaptcha"))
    }

    async fn clear_cookies(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn normalize(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.unhealthy_after.is_none_or(|limit| self.navigated < limit)
    }

    async fn teardown(self: Box<Self>) -> Result<(), SessionError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        if self.teardown_fails {
            return Err(SessionError::Disconnected("target closed".to_string()));
        }
        Ok(())
    }
}

struct UnsolvableOracle;

#[async_trait]
impl ChallengeOracle for UnsolvableOracle {
    async fn solve(&self, _artifact: &[u8]) -> Result<String, OracleError> {
        Err(OracleError::Unsolvable)
    }
}

/// Reads `product:<id>` pages; offers and rank are never present.
struct StaticExtractor;

impl FieldExtractor for StaticExtractor {
    fn extract(&self, page: &PageSnapshot) -> Result<ProductFields, ExtractError> {
        let title = page
            .html
            .strip_prefix("product:")
            .ok_or_else(|| ExtractError::NotProductPage(page.url.clone()))?;
        Ok(ProductFields {
            title: Some(title.to_string()),
            price: Some("19.99".to_string()),
            minimum_price: Some("19.99".to_string()),
            ..Default::default()
        })
    }
}

#[derive(Default)]
struct MemoryStore {
    checkpoints: Mutex<HashMap<NaiveDate, Checkpoint>>,
    checkpoint_log: Mutex<Vec<(usize, bool)>>,
    rows: Mutex<HashMap<(String, NaiveDate), ScrapeResult>>,
    failing_flushes: AtomicU32,
    flush_calls: AtomicU32,
}

impl MemoryStore {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fail_next_flushes(&self, n: u32) {
        self.failing_flushes.store(n, Ordering::SeqCst);
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoints.lock().unwrap().get(&date()).cloned()
    }

    fn log(&self) -> Vec<(usize, bool)> {
        self.checkpoint_log.lock().unwrap().clone()
    }

    fn row(&self, identifier: &str) -> Option<ScrapeResult> {
        self.rows
            .lock()
            .unwrap()
            .get(&(identifier.to_string(), date()))
            .cloned()
    }

    fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn get(&self, scan_date: NaiveDate) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.checkpoints.lock().unwrap().get(&scan_date).cloned())
    }

    async fn save(
        &self,
        scan_date: NaiveDate,
        last_identifier: Option<&str>,
        last_index: usize,
        completed: bool,
    ) -> Result<(), StoreError> {
        self.checkpoint_log
            .lock()
            .unwrap()
            .push((last_index, completed));

        let mut checkpoints = self.checkpoints.lock().unwrap();
        let entry = checkpoints
            .entry(scan_date)
            .or_insert_with(|| Checkpoint::new(scan_date));
        if last_index >= entry.last_index {
            entry.last_index = last_index;
            entry.last_identifier = last_identifier.map(str::to_string);
        }
        entry.completed |= completed;
        Ok(())
    }
}

#[async_trait]
impl ResultSink for MemoryStore {
    async fn save_batch(&self, results: &[ScrapeResult]) -> Result<(), StoreError> {
        self.flush_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_flushes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_flushes.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Other("disk full".to_string()));
        }

        let mut rows = self.rows.lock().unwrap();
        for result in results {
            rows.insert(
                (result.identifier.clone(), result.scan_date),
                result.clone(),
            );
        }
        Ok(())
    }

    async fn recorded_identifiers(
        &self,
        scan_date: NaiveDate,
    ) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .keys()
            .filter(|(_, d)| *d == scan_date)
            .map(|(id, _)| id.clone())
            .collect())
    }
}

/// Checkpoint backend that is down for the whole run.
#[derive(Default)]
struct FailingCheckpoints {
    reads: AtomicU32,
    writes: AtomicU32,
}

#[async_trait]
impl CheckpointStore for FailingCheckpoints {
    async fn get(&self, _scan_date: NaiveDate) -> Result<Option<Checkpoint>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Other("checkpoint table locked".to_string()))
    }

    async fn save(
        &self,
        _scan_date: NaiveDate,
        _last_identifier: Option<&str>,
        _last_index: usize,
        _completed: bool,
    ) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Other("checkpoint table locked".to_string()))
    }
}

fn settings() -> RunSettings {
    RunSettings {
        home_url: HOME.to_string(),
        batch_size: 2,
        checkpoint_every: 1,
        max_consecutive_errors: 3,
        max_challenge_failures: 2,
        restart_budget: 5,
        flush_retries: 1,
        setup_retry: RetryPolicy::new(2, DelayRange::ZERO),
        pacing: Pacing::NONE,
    }
}

fn orchestrator<C, R>(
    provider: Arc<FakeProvider>,
    checkpoints: Arc<C>,
    results: Arc<R>,
    settings: RunSettings,
) -> Orchestrator
where
    C: CheckpointStore + 'static,
    R: ResultSink + 'static,
{
    let resolver = ChallengeResolver::new(
        Arc::new(UnsolvableOracle),
        RetryPolicy::once(),
        DelayRange::ZERO,
    );
    let scraper = ItemScraper::new(
        resolver,
        Arc::new(StaticExtractor),
        RetryPolicy::new(2, DelayRange::ZERO),
        format!("{}{{id}}", PRODUCT_PREFIX),
        settings.max_challenge_failures,
        DelayRange::ZERO,
    );
    Orchestrator::new(provider, scraper, checkpoints, results, settings)
}

fn assert_monotonic(log: &[(usize, bool)]) {
    for pair in log.windows(2) {
        assert!(
            pair[0].0 <= pair[1].0,
            "checkpoint moved backwards: {:?}",
            log
        );
    }
}

#[tokio::test]
async fn test_completed_day_is_not_walked_again() {
    let store = MemoryStore::new();
    let list = ids(&["A", "B", "C", "D", "E"]);

    let provider = FakeProvider::healthy();
    let outcome = orchestrator(provider.clone(), store.clone(), store.clone(), settings())
        .run(&list, 0, date())
        .await;

    let report = match &outcome {
        RunOutcome::Completed(report) => report.clone(),
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(report.attempted, 5);
    assert_eq!(report.succeeded, 5);
    assert!(report.restarts.is_empty());
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(provider.acquisitions(), 1);
    assert_eq!(store.row_count(), 5);

    let checkpoint = store.checkpoint().unwrap();
    assert!(checkpoint.completed);
    assert_eq!(checkpoint.last_index, 5);
    assert_eq!(checkpoint.last_identifier.as_deref(), Some("E"));

    let second = FakeProvider::healthy();
    let outcome = orchestrator(second.clone(), store.clone(), store.clone(), settings())
        .run(&list, 0, date())
        .await;
    assert_eq!(outcome, RunOutcome::AlreadyCompleted);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(second.acquisitions(), 0);
    assert!(second.navigations.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_partial_fields_count_as_success() {
    let store = MemoryStore::new();
    let outcome = orchestrator(FakeProvider::healthy(), store.clone(), store.clone(), settings())
        .run(&ids(&["A"]), 0, date())
        .await;
    assert!(matches!(outcome, RunOutcome::Completed(_)));

    let row = store.row("A").unwrap();
    assert_eq!(row.status, ResultStatus::Ok);
    assert_eq!(row.fields.title.as_deref(), Some("A"));
    assert_eq!(row.fields.offers, None);
    assert_eq!(row.fields.best_seller_rank, None);
}

#[tokio::test]
async fn test_recorded_identifiers_and_start_index_are_skipped() {
    let store = MemoryStore::new();
    store
        .save_batch(&[ScrapeResult::success("C", date(), ProductFields::default())])
        .await
        .unwrap();

    let provider = FakeProvider::healthy();
    let outcome = orchestrator(provider.clone(), store.clone(), store.clone(), settings())
        .run(&ids(&["A", "B", "C", "D"]), 1, date())
        .await;

    let report = outcome.report().unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(provider.visits("A"), 0);
    assert_eq!(provider.visits("C"), 0);
    assert_eq!(provider.visits("B"), 1);
    assert_eq!(provider.visits("D"), 1);
    // The pre-existing row is left alone.
    assert_eq!(store.row("C").unwrap().fields.title, None);
}

#[tokio::test]
async fn test_setup_failures_exhaust_restart_budget() {
    let store = MemoryStore::new();
    let provider = FakeProvider::new(|_, id| {
        if id.is_empty() {
            Step::NavError
        } else {
            Step::Product
        }
    });
    let settings = RunSettings {
        restart_budget: 4,
        ..settings()
    };

    let outcome = orchestrator(provider.clone(), store.clone(), store.clone(), settings)
        .run(&ids(&["A", "B"]), 0, date())
        .await;

    let report = match &outcome {
        RunOutcome::Aborted(report) => report,
        other => panic!("expected abort, got {:?}", other),
    };
    assert_eq!(report.restarts, vec![0, 0, 0, 0]);
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(provider.acquisitions(), 4);
    assert_eq!(provider.teardowns.load(Ordering::SeqCst), 4);
    assert_eq!(provider.visits("A"), 0);
    assert_eq!(store.row_count(), 0);
    assert!(store.checkpoint().is_none());
}

#[tokio::test]
async fn test_consecutive_failures_escalate_once() {
    let store = MemoryStore::new();
    let provider = FakeProvider::new(|session, id| match (session, id) {
        (1, "A" | "B" | "C") => Step::NavError,
        _ => Step::Product,
    });

    let outcome = orchestrator(provider.clone(), store.clone(), store.clone(), settings())
        .run(&ids(&["A", "B", "C", "D", "E"]), 0, date())
        .await;

    let report = match &outcome {
        RunOutcome::Completed(report) => report,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(report.restarts, vec![3]);
    assert_eq!(report.failed, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(provider.acquisitions(), 2);
    assert_eq!(provider.visits("A"), 2);
    assert_eq!(provider.visits("D"), 1);

    for id in ["A", "B", "C"] {
        let row = store.row(id).unwrap();
        assert_eq!(row.status, ResultStatus::Error);
        assert!(row.error.unwrap().contains("connection reset"));
    }
    assert_eq!(store.row("E").unwrap().status, ResultStatus::Ok);

    let log = store.log();
    assert_monotonic(&log);
    assert!(log.contains(&(3, false)));
    assert_eq!(log.last(), Some(&(5, true)));
}

#[tokio::test]
async fn test_unresolved_challenges_retry_item_on_new_session() {
    let store = MemoryStore::new();
    let provider = FakeProvider::new(|session, id| match (session, id) {
        (1, "B") => Step::Challenge,
        _ => Step::Product,
    });

    let outcome = orchestrator(provider.clone(), store.clone(), store.clone(), settings())
        .run(&ids(&["A", "B", "C"]), 0, date())
        .await;

    let report = outcome.report().unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert_eq!(report.restarts, vec![1]);
    assert_eq!(report.failed, 0);
    assert_eq!(provider.visits("B"), 3);
    assert_eq!(store.row("B").unwrap().status, ResultStatus::Ok);
    assert_eq!(store.row_count(), 3);
}

#[tokio::test]
async fn test_flush_is_retried_before_escalating() {
    let store = MemoryStore::new();
    store.fail_next_flushes(1);

    let outcome = orchestrator(FakeProvider::healthy(), store.clone(), store.clone(), settings())
        .run(&ids(&["A", "B", "C"]), 0, date())
        .await;

    assert!(outcome.report().unwrap().restarts.is_empty());
    assert_eq!(store.row_count(), 3);
}

#[tokio::test]
async fn test_dropped_batch_is_scraped_again() {
    let store = MemoryStore::new();
    store.fail_next_flushes(2);

    let provider = FakeProvider::healthy();
    let outcome = orchestrator(provider.clone(), store.clone(), store.clone(), settings())
        .run(&ids(&["A", "B", "C"]), 0, date())
        .await;

    let report = outcome.report().unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert_eq!(report.restarts, vec![0]);
    assert_eq!(provider.visits("A"), 2);
    assert_eq!(provider.visits("C"), 1);
    assert_eq!(store.row_count(), 3);
    assert_monotonic(&store.log());
}

#[tokio::test]
async fn test_interrupt_stops_without_further_writes() {
    let store = MemoryStore::new();
    let (trigger, signal) = shutdown::channel();
    let trigger = Arc::new(trigger);

    let on_c = trigger.clone();
    let provider = FakeProvider::new(move |_, id| {
        if id == "C" {
            on_c.trigger();
        }
        Step::Product
    });
    let settings = RunSettings {
        batch_size: 10,
        ..settings()
    };

    let outcome = orchestrator(provider.clone(), store.clone(), store.clone(), settings.clone())
        .with_shutdown(signal)
        .run(&ids(&["A", "B", "C", "D"]), 0, date())
        .await;

    assert!(matches!(outcome, RunOutcome::Interrupted(_)));
    assert_eq!(outcome.exit_code(), 130);
    assert_eq!(provider.visits("D"), 0);
    assert_eq!(provider.teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(store.row_count(), 0);
    let checkpoint = store.checkpoint().unwrap();
    assert!(!checkpoint.completed);
    assert_eq!(checkpoint.last_index, 0);

    let outcome = orchestrator(FakeProvider::healthy(), store.clone(), store.clone(), settings)
        .run(&ids(&["A", "B", "C", "D"]), 0, date())
        .await;
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert_eq!(store.row_count(), 4);
}

#[tokio::test]
async fn test_unhealthy_session_is_replaced() {
    let store = MemoryStore::new();
    // Home, A and B load; the browser is gone before C.
    let provider = FakeProvider::with_quirks(
        |_, _| Step::Product,
        Quirks {
            unhealthy_after: Some(3),
            ..Quirks::default()
        },
    );

    let outcome = orchestrator(provider.clone(), store.clone(), store.clone(), settings())
        .run(&ids(&["A", "B", "C", "D", "E"]), 0, date())
        .await;

    let report = match &outcome {
        RunOutcome::Completed(report) => report,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(report.restarts, vec![2]);
    assert_eq!(report.succeeded, 5);
    assert_eq!(provider.acquisitions(), 2);
    assert_eq!(provider.teardowns.load(Ordering::SeqCst), 2);
    assert_eq!(provider.visits("B"), 1);
    assert_eq!(provider.visits("C"), 1);
    assert_eq!(store.row_count(), 5);

    let log = store.log();
    assert_monotonic(&log);
    assert!(log.contains(&(2, false)));
}

#[tokio::test]
async fn test_checkpoint_outage_is_not_fatal() {
    let store = MemoryStore::new();
    let checkpoints = Arc::new(FailingCheckpoints::default());
    let list = ids(&["A", "B", "C", "D", "E"]);

    let provider = FakeProvider::healthy();
    let outcome = orchestrator(provider.clone(), checkpoints.clone(), store.clone(), settings())
        .run(&list, 0, date())
        .await;

    let report = match &outcome {
        RunOutcome::Completed(report) => report,
        other => panic!("expected completion, got {:?}", other),
    };
    assert!(report.restarts.is_empty());
    assert_eq!(report.succeeded, 5);
    assert_eq!(store.row_count(), 5);
    assert_eq!(checkpoints.reads.load(Ordering::SeqCst), 1);
    assert!(checkpoints.writes.load(Ordering::SeqCst) > 0);

    // With no checkpoint to go on, stored rows still keep the rerun idle.
    let rerun = FakeProvider::healthy();
    let outcome = orchestrator(rerun.clone(), checkpoints, store.clone(), settings())
        .run(&list, 0, date())
        .await;
    let report = outcome.report().unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert_eq!(report.skipped, 5);
    assert_eq!(report.attempted, 0);
    assert_eq!(rerun.visits("A"), 0);
}

#[tokio::test]
async fn test_teardown_errors_are_not_retried() {
    let store = MemoryStore::new();
    let provider = FakeProvider::with_quirks(
        |session, id| match (session, id) {
            (1, "A" | "B" | "C") => Step::NavError,
            _ => Step::Product,
        },
        Quirks {
            teardown_fails: true,
            ..Quirks::default()
        },
    );

    let outcome = orchestrator(provider.clone(), store.clone(), store.clone(), settings())
        .run(&ids(&["A", "B", "C", "D"]), 0, date())
        .await;

    let report = match &outcome {
        RunOutcome::Completed(report) => report,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(report.restarts, vec![3]);
    assert_eq!(provider.acquisitions(), 2);
    // One teardown per session, failed or not.
    assert_eq!(provider.teardowns.load(Ordering::SeqCst), 2);
    assert_eq!(store.row_count(), 4);
    assert!(store.checkpoint().unwrap().completed);
}

#[tokio::test]
async fn test_run_against_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("pricewatch.db").display());
    run_migrations(&url).await.unwrap();
    let ctx = DbContext::from_url(&url).unwrap();

    let provider = FakeProvider::new(|session, id| match (session, id) {
        (1, "B") => Step::Challenge,
        (_, "C") => Step::NavError,
        _ => Step::Product,
    });
    let checkpoints = Arc::new(ctx.checkpoints());
    let snapshots = Arc::new(ctx.snapshots());
    let list = ids(&["A", "B", "C", "D"]);

    let outcome = orchestrator(provider.clone(), checkpoints.clone(), snapshots.clone(), settings())
        .run(&list, 0, date())
        .await;
    let report = outcome.report().unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert_eq!(report.restarts, vec![1]);

    let rows = ctx.snapshots().for_date(date()).await.unwrap();
    assert_eq!(rows.len(), 4);
    let counts = ctx.snapshots().count_for_date(date()).await.unwrap();
    assert_eq!((counts.ok, counts.error), (3, 1));
    let c = ctx.snapshots().get("C", date()).await.unwrap().unwrap();
    assert_eq!(c.status, ResultStatus::Error);

    let checkpoint = ctx.checkpoints().get(date()).await.unwrap().unwrap();
    assert!(checkpoint.completed);
    assert_eq!(checkpoint.last_index, 4);

    let again = orchestrator(FakeProvider::healthy(), checkpoints, snapshots, settings())
        .run(&list, 0, date())
        .await;
    assert_eq!(again, RunOutcome::AlreadyCompleted);
}
