//! Concurrent song-page metadata fetching over the URL registry.
//!
//! Rows are pulled from the registry in batches and fanned out to a bounded
//! pool of scoped worker threads. Every registry access goes through one
//! mutex, so row updates never interleave at the statement level.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, error, info, warn};

use crate::config::MetadataConfig;
use crate::discovery::SearchSite;
use crate::error::Result;
use crate::fetch::{PageFetcher, Politeness};
use crate::registry::{RegistryRow, SongRegistry};
use crate::shutdown::ShutdownFlag;

const LIMITER_POLL: Duration = Duration::from_millis(25);

type RequestLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Terminal result of one row visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Fetched,
    /// Processed; the page had neither a title nor lyrics.
    NoContent,
    /// Retries exhausted; the row stays unprocessed.
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub no_content: usize,
    pub failed: usize,
    pub errors: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Fetched => self.fetched += 1,
            RowOutcome::NoContent => self.no_content += 1,
            RowOutcome::Failed => self.failed += 1,
        }
    }

    fn merge(&mut self, other: &BatchReport) {
        self.fetched += other.fetched;
        self.no_content += other.no_content;
        self.failed += other.failed;
        self.errors += other.errors;
    }

    /// Rows that reached `processed = 1` in this batch.
    pub fn completed(&self) -> usize {
        self.fetched + self.no_content
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataReport {
    pub totals: BatchReport,
    pub batches: usize,
    pub remaining: usize,
    /// A batch finished without moving any row to processed.
    pub stalled: bool,
    pub cancelled: bool,
}

pub struct MetadataWorker<'a> {
    fetcher: &'a dyn PageFetcher,
    site: &'a dyn SearchSite,
    registry: &'a Mutex<SongRegistry>,
    limiter: RequestLimiter,
    concurrency: usize,
    batch_size: usize,
    max_attempts: u32,
    politeness: Politeness,
    shutdown: ShutdownFlag,
}

impl<'a> MetadataWorker<'a> {
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        site: &'a dyn SearchSite,
        registry: &'a Mutex<SongRegistry>,
        config: &MetadataConfig,
    ) -> Self {
        let per_second =
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let concurrency = config.concurrency.max(1);
        Self {
            fetcher,
            site,
            registry,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            concurrency,
            batch_size: concurrency.saturating_mul(config.batch_multiplier.max(1)),
            max_attempts: config.max_attempts.max(1),
            politeness: Politeness::from_millis(config.delay_ms, config.jitter_ms),
            shutdown: ShutdownFlag::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn registry(&self) -> MutexGuard<'_, SongRegistry> {
        // Each registry call is a single statement, so a panicked holder
        // cannot leave a half-written row behind.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_for_request_slot(&self) {
        while self.limiter.check().is_err() {
            thread::sleep(LIMITER_POLL);
        }
    }

    /// Fetches one row's page and moves the row to its terminal state.
    pub fn process(&self, row: &RegistryRow) -> Result<RowOutcome> {
        for attempt in 1..=self.max_attempts {
            self.wait_for_request_slot();
            let fetched = self.fetcher.fetch(&row.url, &[]);
            self.politeness.pause();
            let Some(page) = fetched else {
                debug!("Metadata[{}]: attempt {attempt} got no response", row.url);
                continue;
            };

            let metadata = self.site.extract_metadata(&page.body);
            let registry = self.registry();
            if metadata.is_empty() {
                if !registry.mark_no_content(&row.url)? {
                    debug!("Metadata[{}]: already settled, left as is", row.url);
                }
                return Ok(RowOutcome::NoContent);
            }
            if !registry.mark_fetched(&row.url, &metadata)? {
                debug!("Metadata[{}]: already settled, left as is", row.url);
            }
            return Ok(RowOutcome::Fetched);
        }

        warn!(
            "Metadata[{}]: giving up after {} attempt(s)",
            row.url, self.max_attempts
        );
        self.registry().mark_failed_retries(&row.url)?;
        Ok(RowOutcome::Failed)
    }

    /// Runs `rows` on the worker pool. A row error is recorded on that row
    /// and never stops the rest of the batch.
    pub fn run_batch(&self, rows: Vec<RegistryRow>) -> BatchReport {
        let queue = Mutex::new(VecDeque::from(rows));
        let workers = self.concurrency.min(queue_len(&queue)).max(1);

        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| scope.spawn(|| self.drain(&queue)))
                .collect();

            let mut report = BatchReport::default();
            for handle in handles {
                match handle.join() {
                    Ok(partial) => report.merge(&partial),
                    Err(_) => {
                        error!("Metadata worker thread panicked");
                        report.errors += 1;
                    }
                }
            }
            report
        })
    }

    fn drain(&self, queue: &Mutex<VecDeque<RegistryRow>>) -> BatchReport {
        let mut report = BatchReport::default();
        loop {
            if self.shutdown.is_requested() {
                break;
            }
            let next = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(row) = next else {
                break;
            };
            match self.process(&row) {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    error!("Metadata[{}]: {err}", row.url);
                    report.errors += 1;
                    if let Err(record_err) = self.registry().record_error(&row.url, &err.to_string())
                    {
                        error!("Metadata[{}]: could not record error: {record_err}", row.url);
                    }
                }
            }
        }
        report
    }

    /// Processes batches until nothing is left, a batch makes no progress,
    /// or shutdown is requested (checked before each batch).
    pub fn run_batches(&self) -> Result<MetadataReport> {
        let mut report = MetadataReport::default();
        loop {
            if self.shutdown.is_requested() {
                report.cancelled = true;
                break;
            }
            let rows = self.registry().unprocessed(self.batch_size)?;
            if rows.is_empty() {
                break;
            }
            info!(
                "Metadata: batch of {} row(s) on {} worker(s)",
                rows.len(),
                self.concurrency
            );

            let batch = self.run_batch(rows);
            report.totals.merge(&batch);
            report.batches += 1;
            report.remaining = self.registry().count_unprocessed()?;
            info!(
                "Metadata: batch done ({} fetched, {} empty, {} failed), {} remaining",
                batch.fetched, batch.no_content, batch.failed, report.remaining
            );

            if report.remaining == 0 {
                break;
            }
            if batch.completed() == 0 {
                warn!("Metadata: batch made no progress, stopping this phase");
                report.stalled = true;
                break;
            }
        }
        report.remaining = self.registry().count_unprocessed()?;
        Ok(report)
    }
}

fn queue_len(queue: &Mutex<VecDeque<RegistryRow>>) -> usize {
    queue.lock().unwrap_or_else(PoisonError::into_inner).len()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::{MetadataWorker, RowOutcome};
    use crate::config::{MetadataConfig, SearchConfig};
    use crate::discovery::fixtures::song_page;
    use crate::discovery::TkaraokeSite;
    use crate::fetch::test_support::ScriptedFetcher;
    use crate::registry::{SongRegistry, FAILED_RETRIES, NO_CONTENT};
    use crate::shutdown::ShutdownFlag;

    const SONG: &str = "https://t.test/1/song.html";
    const EMPTY: &str = "https://t.test/2/x.html";
    const DOWN: &str = "https://t.test/3/x.html";

    fn site() -> TkaraokeSite {
        TkaraokeSite::new(&SearchConfig {
            base_url: "https://t.test".to_string(),
            ..SearchConfig::default()
        })
        .expect("site should build")
    }

    fn config() -> MetadataConfig {
        MetadataConfig {
            concurrency: 2,
            batch_multiplier: 5,
            max_attempts: 2,
            requests_per_second: 1_000,
            delay_ms: 0,
            jitter_ms: 0,
            ..MetadataConfig::default()
        }
    }

    fn seeded_registry() -> Mutex<SongRegistry> {
        let registry = SongRegistry::new_in_memory().expect("registry should open");
        for url in [SONG, EMPTY, DOWN] {
            registry
                .insert_if_absent(url, "search:a")
                .expect("insert should succeed");
        }
        Mutex::new(registry)
    }

    fn site_pages() -> ScriptedFetcher {
        ScriptedFetcher::new()
            .page(SONG, &song_page("Mưa", "Ca sĩ", &["câu một"], ""))
            .page(EMPTY, "<html><body><p>404</p></body></html>")
    }

    #[test]
    fn test_rows_reach_expected_terminal_states() {
        let fetcher = site_pages();
        let site = site();
        let registry = seeded_registry();

        let report = MetadataWorker::new(&fetcher, &site, &registry, &config())
            .run_batches()
            .expect("metadata phase should succeed");

        assert_eq!(report.totals.fetched, 1);
        assert_eq!(report.totals.no_content, 1);
        assert_eq!(report.totals.failed, 2);
        assert_eq!(report.batches, 2);
        assert!(report.stalled);
        assert_eq!(report.remaining, 1);
        assert_eq!(fetcher.call_count(DOWN), 4);

        let registry = registry.lock().expect("registry lock");
        let song = registry.row(SONG).expect("lookup").expect("row exists");
        assert!(song.processed);
        assert_eq!(song.title.as_deref(), Some("Mưa"));
        let empty = registry.row(EMPTY).expect("lookup").expect("row exists");
        assert!(empty.processed);
        assert_eq!(empty.last_error.as_deref(), Some(NO_CONTENT));
        let down = registry.row(DOWN).expect("lookup").expect("row exists");
        assert!(!down.processed);
        assert_eq!(down.last_error.as_deref(), Some(FAILED_RETRIES));
    }

    #[test]
    fn test_no_content_row_is_not_retried_by_next_run() {
        let site = site();
        let registry = seeded_registry();
        MetadataWorker::new(&site_pages(), &site, &registry, &config())
            .run_batches()
            .expect("first run should succeed");

        let fetcher = site_pages();
        MetadataWorker::new(&fetcher, &site, &registry, &config())
            .run_batches()
            .expect("second run should succeed");

        assert_eq!(fetcher.call_count(EMPTY), 0);
        assert_eq!(fetcher.call_count(SONG), 0);
        assert_eq!(fetcher.call_count(DOWN), 2);
    }

    #[test]
    fn test_process_single_row_outcome() {
        let fetcher = site_pages();
        let site = site();
        let registry = seeded_registry();
        let row = registry
            .lock()
            .expect("registry lock")
            .row(SONG)
            .expect("lookup")
            .expect("row exists");

        let outcome = MetadataWorker::new(&fetcher, &site, &registry, &config())
            .process(&row)
            .expect("row should process");
        assert_eq!(outcome, RowOutcome::Fetched);
    }

    #[test]
    fn test_shutdown_before_first_batch_touches_nothing() {
        let fetcher = site_pages();
        let site = site();
        let registry = seeded_registry();
        let shutdown = ShutdownFlag::new();
        shutdown.request();

        let report = MetadataWorker::new(&fetcher, &site, &registry, &config())
            .with_shutdown(shutdown)
            .run_batches()
            .expect("metadata phase should succeed");

        assert!(report.cancelled);
        assert_eq!(report.remaining, 3);
        assert!(fetcher.calls().is_empty());
    }
}
