//! Recovery loop around a single browser session.
//!
//! Walks the identifier list from the resume position, batches results,
//! checkpoints progress, and replaces the session when it degrades. A
//! checkpoint is only ever advanced past positions whose results are stored.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::attempt::{ItemOutcome, ItemScraper, SessionState};
use super::challenge::ChallengeError;
use super::retry::{DelayRange, RetryPolicy};
use super::session::{BrowserSession, SessionProvider};
use super::shutdown::Shutdown;
use super::stores::{CheckpointStore, ResultSink, StoreError};
use crate::models::ScrapeResult;

/// Deliberate pauses between steps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pacing {
    /// After a navigation or challenge submit, before reading the page.
    pub settle: DelayRange,
    pub between_items: DelayRange,
    /// Before reacquiring a session that was dropped for degrading.
    pub after_restart: DelayRange,
    /// Before reacquiring after setup, launch or storage failures.
    pub after_error: DelayRange,
}

impl Pacing {
    pub const NONE: Pacing = Pacing {
        settle: DelayRange::ZERO,
        between_items: DelayRange::ZERO,
        after_restart: DelayRange::ZERO,
        after_error: DelayRange::ZERO,
    };
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            settle: DelayRange::secs(1.0, 2.0),
            between_items: DelayRange::secs(1.5, 3.0),
            after_restart: DelayRange::secs(5.0, 10.0),
            after_error: DelayRange::secs(10.0, 15.0),
        }
    }
}

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Landing page opened during session setup.
    pub home_url: String,
    pub batch_size: usize,
    /// Positions walked (attempted or skipped) between periodic checkpoint
    /// writes. A periodic write records the durable mark, which only moves
    /// on a batch flush or past already-recorded identifiers. With
    /// `checkpoint_every < batch_size` it therefore advances only during
    /// runs of skipped identifiers; flushes always checkpoint on their own.
    pub checkpoint_every: usize,
    pub max_consecutive_errors: u32,
    pub max_challenge_failures: u32,
    /// Restart requests allowed before the run is aborted.
    pub restart_budget: u32,
    /// Extra attempts for a failed batch write.
    pub flush_retries: u32,
    pub setup_retry: RetryPolicy,
    pub pacing: Pacing,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            home_url: "https://www.amazon.com".to_string(),
            batch_size: 10,
            checkpoint_every: 5,
            max_consecutive_errors: 5,
            max_challenge_failures: 3,
            restart_budget: 10,
            flush_retries: 1,
            setup_retry: RetryPolicy::new(3, DelayRange::secs(3.0, 6.0)),
            pacing: Pacing::default(),
        }
    }
}

/// Counters for a finished (or abandoned) run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Resume position of every restart request, in order.
    pub restarts: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunReport),
    /// Today's checkpoint was already closed; nothing was attempted.
    AlreadyCompleted,
    /// Restart budget exhausted.
    Aborted(RunReport),
    Interrupted(RunReport),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(_) | RunOutcome::AlreadyCompleted => 0,
            RunOutcome::Aborted(_) => 2,
            RunOutcome::Interrupted(_) => 130,
        }
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunOutcome::Completed(r) | RunOutcome::Aborted(r) | RunOutcome::Interrupted(r) => {
                Some(r)
            }
            RunOutcome::AlreadyCompleted => None,
        }
    }
}

#[derive(Debug)]
enum RestartReason {
    Acquire(String),
    Setup(String),
    Degraded(String),
    Persistence(StoreError),
}

impl RestartReason {
    fn pause(&self, pacing: &Pacing) -> DelayRange {
        match self {
            RestartReason::Degraded(_) => pacing.after_restart,
            _ => pacing.after_error,
        }
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::Acquire(e) => write!(f, "could not start session: {}", e),
            RestartReason::Setup(e) => write!(f, "session setup failed: {}", e),
            RestartReason::Degraded(e) => write!(f, "session degraded: {}", e),
            RestartReason::Persistence(e) => write!(f, "batch write failed: {}", e),
        }
    }
}

enum PassOutcome {
    Completed,
    RestartNeeded {
        resume_index: usize,
        reason: RestartReason,
    },
    Interrupted,
}

enum SetupFailure {
    Failed(String),
    Interrupted,
}

/// Progress bookkeeping that outlives individual sessions.
struct RunProgress<'a> {
    identifiers: &'a [String],
    scan_date: NaiveDate,
    /// Last index written to the checkpoint store by this run.
    saved_index: Option<usize>,
    report: RunReport,
}

/// Position bookkeeping for one session.
struct Cursor {
    /// Next position to walk.
    next: usize,
    /// Every position below this one is durably stored.
    durable: usize,
}

pub struct Orchestrator {
    provider: Arc<dyn SessionProvider>,
    scraper: ItemScraper,
    checkpoints: Arc<dyn CheckpointStore>,
    results: Arc<dyn ResultSink>,
    settings: RunSettings,
    shutdown: Shutdown,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        scraper: ItemScraper,
        checkpoints: Arc<dyn CheckpointStore>,
        results: Arc<dyn ResultSink>,
        settings: RunSettings,
    ) -> Self {
        Self {
            provider,
            scraper,
            checkpoints,
            results,
            settings,
            shutdown: Shutdown::never(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Walk `identifiers` for `scan_date`, starting no earlier than
    /// `start_index`.
    pub async fn run(
        &self,
        identifiers: &[String],
        start_index: usize,
        scan_date: NaiveDate,
    ) -> RunOutcome {
        let existing = match self.checkpoints.get(scan_date).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("Could not read checkpoint for {}: {}", scan_date, e);
                None
            }
        };

        if existing.as_ref().is_some_and(|c| c.completed) {
            info!("Run for {} already completed", scan_date);
            return RunOutcome::AlreadyCompleted;
        }

        let mut resume_index = existing
            .as_ref()
            .map_or(start_index, |c| c.resume_index(start_index))
            .min(identifiers.len());

        let mut run = RunProgress {
            identifiers,
            scan_date,
            saved_index: existing.map(|c| c.last_index),
            report: RunReport::default(),
        };

        info!(
            "Starting run for {} at index {} of {}",
            scan_date,
            resume_index,
            identifiers.len()
        );

        loop {
            let pass = if resume_index >= identifiers.len() {
                self.complete(&mut run).await
            } else {
                self.run_session(&mut run, resume_index).await
            };

            match pass {
                PassOutcome::Completed => {
                    let report = run.report;
                    info!(
                        "Run for {} completed: {} ok, {} failed, {} skipped, {} restarts",
                        scan_date,
                        report.succeeded,
                        report.failed,
                        report.skipped,
                        report.restarts.len()
                    );
                    return RunOutcome::Completed(report);
                }
                PassOutcome::Interrupted => {
                    warn!("Run for {} interrupted", scan_date);
                    return RunOutcome::Interrupted(run.report);
                }
                PassOutcome::RestartNeeded {
                    resume_index: next,
                    reason,
                } => {
                    run.report.restarts.push(next);
                    resume_index = next;

                    let restarts = run.report.restarts.len();
                    if restarts >= self.settings.restart_budget as usize {
                        error!(
                            "Aborting run for {} after {} restarts; last error: {}",
                            scan_date, restarts, reason
                        );
                        return RunOutcome::Aborted(run.report);
                    }

                    warn!(
                        "Restarting session ({}/{}) from index {}: {}",
                        restarts, self.settings.restart_budget, next, reason
                    );
                    let pause = reason.pause(&self.settings.pacing).sample();
                    if !self.shutdown.sleep(pause).await {
                        return RunOutcome::Interrupted(run.report);
                    }
                }
            }
        }
    }

    /// Acquire, set up, walk, and always tear down one session.
    async fn run_session(&self, run: &mut RunProgress<'_>, resume_index: usize) -> PassOutcome {
        let mut session = match self.provider.acquire().await {
            Ok(session) => session,
            Err(e) => {
                return PassOutcome::RestartNeeded {
                    resume_index,
                    reason: RestartReason::Acquire(e.to_string()),
                }
            }
        };

        let outcome = match self.setup(session.as_mut()).await {
            Ok(()) => self.walk(session.as_mut(), run, resume_index).await,
            Err(SetupFailure::Interrupted) => PassOutcome::Interrupted,
            Err(SetupFailure::Failed(reason)) => PassOutcome::RestartNeeded {
                resume_index,
                reason: RestartReason::Setup(reason),
            },
        };

        if let Err(e) = session.teardown().await {
            warn!("Session teardown failed: {}", e);
        }
        outcome
    }

    async fn setup(&self, session: &mut dyn BrowserSession) -> Result<(), SetupFailure> {
        let policy = self.settings.setup_retry;
        let mut last_error = String::from("no setup attempt made");

        let mut retrier = policy.start();
        while let Some(attempt) = retrier.next_attempt(&self.shutdown).await {
            match self.setup_once(session).await {
                Ok(()) => {
                    info!("Session ready after {} setup attempt(s)", attempt);
                    return Ok(());
                }
                Err(SetupFailure::Interrupted) => return Err(SetupFailure::Interrupted),
                Err(SetupFailure::Failed(reason)) => {
                    warn!(
                        "Session setup attempt {}/{} failed: {}",
                        attempt, policy.max_attempts, reason
                    );
                    last_error = reason;
                }
            }
        }

        if self.shutdown.is_triggered() {
            return Err(SetupFailure::Interrupted);
        }
        Err(SetupFailure::Failed(last_error))
    }

    async fn setup_once(&self, session: &mut dyn BrowserSession) -> Result<(), SetupFailure> {
        let failed = |e: &dyn fmt::Display| SetupFailure::Failed(e.to_string());

        session.clear_cookies().await.map_err(|e| failed(&e))?;
        let page = session
            .navigate(&self.settings.home_url)
            .await
            .map_err(|e| failed(&e))?;

        match self.scraper.resolver().resolve(session, page, &self.shutdown).await {
            Ok(_) => {}
            Err(ChallengeError::Interrupted) => return Err(SetupFailure::Interrupted),
            Err(e) => return Err(failed(&e)),
        }

        session.normalize().await.map_err(|e| failed(&e))
    }

    async fn walk(
        &self,
        session: &mut dyn BrowserSession,
        run: &mut RunProgress<'_>,
        resume_index: usize,
    ) -> PassOutcome {
        let recorded = match self.results.recorded_identifiers(run.scan_date).await {
            Ok(recorded) => recorded,
            Err(e) => {
                warn!("Could not load today's recorded identifiers: {}", e);
                HashSet::new()
            }
        };

        let settings = &self.settings;
        let identifiers = run.identifiers;
        let total = identifiers.len();
        let mut state = SessionState::default();
        let mut batch: Vec<ScrapeResult> = Vec::with_capacity(settings.batch_size);
        let mut cursor = Cursor {
            next: resume_index,
            durable: resume_index,
        };
        let mut since_checkpoint = 0usize;

        for index in resume_index..total {
            if self.shutdown.is_triggered() {
                return PassOutcome::Interrupted;
            }
            if !session.is_healthy() {
                let reason = RestartReason::Degraded("browser session lost".to_string());
                return self.escalate(run, &mut batch, &mut cursor, reason).await;
            }

            let identifier = identifiers[index].as_str();
            if recorded.contains(identifier) {
                debug!("[{}] {} already recorded for {}", index, identifier, run.scan_date);
                run.report.skipped += 1;
                cursor.next = index + 1;
                since_checkpoint += 1;
                if batch.is_empty() {
                    cursor.durable = cursor.next;
                }
                if since_checkpoint >= settings.checkpoint_every {
                    self.save_checkpoint(run, cursor.durable, false).await;
                    since_checkpoint = 0;
                }
                continue;
            }

            let outcome = self
                .scraper
                .scrape(session, &mut state, identifier, index, run.scan_date, &self.shutdown)
                .await;

            match outcome {
                ItemOutcome::Success(result) => {
                    run.report.succeeded += 1;
                    batch.push(result);
                }
                ItemOutcome::FailedTerminal(result) => {
                    run.report.failed += 1;
                    batch.push(result);
                }
                ItemOutcome::SessionDegraded(reason) => {
                    let reason = RestartReason::Degraded(reason);
                    return self.escalate(run, &mut batch, &mut cursor, reason).await;
                }
                ItemOutcome::Interrupted => return PassOutcome::Interrupted,
            }
            run.report.attempted += 1;
            cursor.next = index + 1;
            since_checkpoint += 1;

            if batch.len() >= settings.batch_size {
                if let Err(e) = self.flush(&mut batch).await {
                    return PassOutcome::RestartNeeded {
                        resume_index: cursor.durable,
                        reason: RestartReason::Persistence(e),
                    };
                }
                cursor.durable = cursor.next;
                info!("Progress for {}: {}/{}", run.scan_date, cursor.durable, total);
                self.save_checkpoint(run, cursor.durable, false).await;
                since_checkpoint = 0;
            } else if since_checkpoint >= settings.checkpoint_every {
                self.save_checkpoint(run, cursor.durable, false).await;
                since_checkpoint = 0;
            }

            if state.consecutive_errors >= settings.max_consecutive_errors {
                let reason = RestartReason::Degraded(format!(
                    "{} consecutive item failures",
                    state.consecutive_errors
                ));
                return self.escalate(run, &mut batch, &mut cursor, reason).await;
            }
            if state.challenge_failures >= settings.max_challenge_failures {
                let reason = RestartReason::Degraded(format!(
                    "{} consecutive unresolved challenges",
                    state.challenge_failures
                ));
                return self.escalate(run, &mut batch, &mut cursor, reason).await;
            }

            if index + 1 < total
                && !self
                    .shutdown
                    .sleep(settings.pacing.between_items.sample())
                    .await
            {
                return PassOutcome::Interrupted;
            }
        }

        if let Err(e) = self.flush(&mut batch).await {
            return PassOutcome::RestartNeeded {
                resume_index: cursor.durable,
                reason: RestartReason::Persistence(e),
            };
        }
        self.complete(run).await
    }

    /// Store what is pending, checkpoint, and ask for a new session.
    async fn escalate(
        &self,
        run: &mut RunProgress<'_>,
        batch: &mut Vec<ScrapeResult>,
        cursor: &mut Cursor,
        reason: RestartReason,
    ) -> PassOutcome {
        if let Err(e) = self.flush(batch).await {
            return PassOutcome::RestartNeeded {
                resume_index: cursor.durable,
                reason: RestartReason::Persistence(e),
            };
        }
        cursor.durable = cursor.next;
        self.save_checkpoint(run, cursor.durable, false).await;

        PassOutcome::RestartNeeded {
            resume_index: cursor.durable,
            reason,
        }
    }

    async fn complete(&self, run: &mut RunProgress<'_>) -> PassOutcome {
        self.save_checkpoint(run, run.identifiers.len(), true).await;
        PassOutcome::Completed
    }

    /// Write `batch`, retrying up to `flush_retries` times. The batch is
    /// cleared either way; on failure its positions stay behind the durable
    /// mark and are scraped again.
    async fn flush(&self, batch: &mut Vec<ScrapeResult>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut retries = 0;
        loop {
            match self.results.save_batch(batch).await {
                Ok(()) => {
                    debug!("Stored batch of {} results", batch.len());
                    batch.clear();
                    return Ok(());
                }
                Err(e) if retries < self.settings.flush_retries => {
                    retries += 1;
                    warn!(
                        "Storing batch of {} results failed (retry {}/{}): {}",
                        batch.len(),
                        retries,
                        self.settings.flush_retries,
                        e
                    );
                }
                Err(e) => {
                    error!(
                        "Dropping batch of {} results after {} attempts: {}",
                        batch.len(),
                        retries + 1,
                        e
                    );
                    batch.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Best-effort checkpoint write. Never moves the saved index backwards.
    async fn save_checkpoint(&self, run: &mut RunProgress<'_>, index: usize, completed: bool) {
        if !completed && run.saved_index.is_some_and(|saved| index <= saved) {
            return;
        }

        let identifier = index
            .checked_sub(1)
            .and_then(|i| run.identifiers.get(i))
            .map(String::as_str);

        match self
            .checkpoints
            .save(run.scan_date, identifier, index, completed)
            .await
        {
            Ok(()) => {
                debug!("Checkpoint for {} at index {}", run.scan_date, index);
                run.saved_index = Some(index);
            }
            Err(e) => warn!(
                "Failed to save checkpoint for {} at index {}: {}",
                run.scan_date, index, e
            ),
        }
    }
}
