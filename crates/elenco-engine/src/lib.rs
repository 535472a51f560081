//! Parallel scraping engine: worker state machine + dispatcher.
//!
//! A fixed set of workers consumes disjoint segments of a shared link list.
//! Each worker binds one proxy at a time from the shared [`ProxyPool`],
//! fetches through the opaque [`FetchClient`], extracts a best-effort record
//! and upserts it into the shared [`ResultStore`]. Consecutive transient
//! failures on one proxy trigger rotation; the current URL is never lost.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use elenco_core::BusinessRecord;
use elenco_extract::RecordExtractor;
use elenco_net::{FetchClient, FetchError, PoolStatus, ProxyDescriptor, ProxyPool};
use elenco_store::ResultStore;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "elenco-engine";

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub workers: usize,
    /// Consecutive transient failures on one proxy before rotation.
    pub failure_threshold: u32,
    /// Pause between consecutive fetch attempts by the same worker.
    pub request_delay: Duration,
    pub proxy_cooldown: Duration,
    /// Wait between proxy-acquisition retries while the pool is exhausted.
    pub acquire_retry_delay: Duration,
    /// Acquisition retries before the worker declares a stall and stops.
    pub acquire_retry_limit: u32,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            failure_threshold: 3,
            request_delay: Duration::from_millis(300),
            proxy_cooldown: Duration::from_secs(300),
            acquire_retry_delay: Duration::from_secs(30),
            acquire_retry_limit: 10,
        }
    }
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_parse("ELENCO_WORKERS").unwrap_or(defaults.workers),
            failure_threshold: env_parse("ELENCO_FAILURE_THRESHOLD")
                .unwrap_or(defaults.failure_threshold),
            request_delay: env_parse("ELENCO_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_delay),
            proxy_cooldown: env_parse("ELENCO_COOLDOWN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.proxy_cooldown),
            acquire_retry_delay: env_parse("ELENCO_ACQUIRE_RETRY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_retry_delay),
            acquire_retry_limit: env_parse("ELENCO_ACQUIRE_RETRY_LIMIT")
                .unwrap_or(defaults.acquire_retry_limit),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LinkFile {
    Bare(Vec<String>),
    Wrapped { links: Vec<String> },
}

/// Load the precomputed link list produced by the pagination pass. Accepts
/// both a bare JSON array and the `{"links": [...]}` progress-file shape.
pub fn load_links(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading link file {}", path.display()))?;
    let parsed: LinkFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing link file {}", path.display()))?;
    let links = match parsed {
        LinkFile::Bare(links) | LinkFile::Wrapped { links } => links,
    };
    Ok(dedup_links(links))
}

/// Order-preserving dedup of the work set.
pub fn dedup_links(links: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    links
        .into_iter()
        .filter(|link| seen.insert(link.clone()))
        .collect()
}

/// Split links into `workers` contiguous segments; the remainder is spread
/// one extra link each across the first segments. No link is dropped or
/// duplicated.
pub fn partition_links(links: Vec<String>, workers: usize) -> Vec<Vec<String>> {
    let workers = workers.max(1);
    let chunk = links.len() / workers;
    let remainder = links.len() % workers;

    let mut segments = Vec::with_capacity(workers);
    let mut rest = links;
    for i in 0..workers {
        let take = chunk + usize::from(i < remainder);
        let tail = rest.split_off(take.min(rest.len()));
        segments.push(rest);
        rest = tail;
    }
    segments
}

/// Run-wide counters shared by all workers. Aggregates only; never consulted
/// for control flow.
#[derive(Debug, Default)]
pub struct RunCounters {
    inserted: AtomicU64,
    skipped: AtomicU64,
    transient_failures: AtomicU64,
    permanent_failures: AtomicU64,
    extraction_failures: AtomicU64,
    store_failures: AtomicU64,
    proxy_rotations: AtomicU64,
}

impl RunCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            inserted: self.inserted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            extraction_failures: self.extraction_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            proxy_rotations: self.proxy_rotations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub inserted: u64,
    pub skipped: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    pub extraction_failures: u64,
    pub store_failures: u64,
    pub proxy_rotations: u64,
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub fetch: Arc<dyn FetchClient>,
    pub extractor: Arc<dyn RecordExtractor>,
    pub store: ResultStore,
    pub pool: Arc<ProxyPool>,
    pub counters: Arc<RunCounters>,
    pub config: ScrapeConfig,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub assigned: usize,
    pub processed: usize,
    pub inserted: u64,
    pub skipped: u64,
    pub rotations: u64,
    /// Proxy acquisition retry budget exhausted while the pool was
    /// provisioned; the segment stopped early.
    pub stalled: bool,
    /// The worker task itself died (panic/join error).
    pub failed: bool,
}

impl WorkerReport {
    fn task_failure(worker_id: usize, assigned: usize) -> Self {
        Self {
            worker_id,
            assigned,
            processed: 0,
            inserted: 0,
            skipped: 0,
            rotations: 0,
            stalled: false,
            failed: true,
        }
    }

    pub fn completed(&self) -> bool {
        !self.failed && !self.stalled && self.processed == self.assigned
    }

    pub fn remaining(&self) -> usize {
        self.assigned.saturating_sub(self.processed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerPhase {
    Idle,
    Bound,
    Fetching,
    Backoff,
    Done,
}

/// One unit of concurrent execution owning a link segment. The loop is the
/// explicit state machine Idle -> Bound -> Fetching -> (Bound | Backoff),
/// terminating in Done.
struct Worker {
    id: usize,
    urls: Vec<String>,
    ctx: WorkerContext,
    cursor: usize,
    consecutive_failures: u32,
    proxy: Option<ProxyDescriptor>,
    inserted: u64,
    skipped: u64,
    rotations: u64,
    stalled: bool,
}

impl Worker {
    fn new(id: usize, urls: Vec<String>, ctx: WorkerContext) -> Self {
        Self {
            id,
            urls,
            ctx,
            cursor: 0,
            consecutive_failures: 0,
            proxy: None,
            inserted: 0,
            skipped: 0,
            rotations: 0,
            stalled: false,
        }
    }

    async fn run(mut self) -> WorkerReport {
        let mut phase = WorkerPhase::Idle;
        while phase != WorkerPhase::Done {
            phase = match phase {
                WorkerPhase::Idle => self.enter_idle().await,
                WorkerPhase::Bound => self.check_bound(),
                WorkerPhase::Fetching => self.fetch_current().await,
                WorkerPhase::Backoff => self.backoff().await,
                WorkerPhase::Done => WorkerPhase::Done,
            };
        }
        self.finish().await
    }

    /// Bind a proxy for the current URL, or confirm direct mode. Bounded
    /// wait-and-retry while a provisioned pool is exhausted; sustained
    /// exhaustion is a stall, never a silent fall-back to direct fetching.
    async fn enter_idle(&mut self) -> WorkerPhase {
        if self.ctx.cancel.is_cancelled() || self.cursor >= self.urls.len() {
            return WorkerPhase::Done;
        }
        if !self.ctx.pool.is_provisioned() {
            return WorkerPhase::Bound;
        }

        for _ in 0..=self.ctx.config.acquire_retry_limit {
            if let Some(proxy) = self.ctx.pool.acquire().await {
                info!(worker = self.id, proxy = %proxy, "worker bound to proxy");
                self.proxy = Some(proxy);
                return WorkerPhase::Bound;
            }
            info!(worker = self.id, "no cold proxy available, waiting");
            if !self.pause(self.ctx.config.acquire_retry_delay).await {
                return WorkerPhase::Done;
            }
        }

        warn!(
            worker = self.id,
            remaining = self.urls.len() - self.cursor,
            "proxy pool exhausted beyond retry budget, stopping segment"
        );
        self.stalled = true;
        WorkerPhase::Done
    }

    fn check_bound(&mut self) -> WorkerPhase {
        if self.ctx.cancel.is_cancelled() || self.cursor >= self.urls.len() {
            WorkerPhase::Done
        } else {
            WorkerPhase::Fetching
        }
    }

    async fn fetch_current(&mut self) -> WorkerPhase {
        let url = self.urls[self.cursor].clone();

        match self.ctx.fetch.fetch(&url, self.proxy.as_ref()).await {
            Ok(page) => {
                let record = match self.ctx.extractor.extract(&page) {
                    Ok(fields) => BusinessRecord::from_extracted(&url, fields, Utc::now()),
                    Err(err) => {
                        // content problem, not a proxy problem: store the
                        // empty partial and move on
                        RunCounters::bump(&self.ctx.counters.extraction_failures);
                        warn!(worker = self.id, url = %url, "extraction failed, storing empty record: {err}");
                        BusinessRecord::empty(&url, Utc::now())
                    }
                };
                self.persist(record).await;
                self.consecutive_failures = 0;
                self.advance();
                self.finish_attempt().await
            }
            Err(err) if err.is_transient() => {
                self.consecutive_failures += 1;
                RunCounters::bump(&self.ctx.counters.transient_failures);
                warn!(
                    worker = self.id,
                    url = %url,
                    failures = self.consecutive_failures,
                    threshold = self.ctx.config.failure_threshold,
                    "transient fetch failure: {err}"
                );
                WorkerPhase::Backoff
            }
            Err(err) => {
                RunCounters::bump(&self.ctx.counters.permanent_failures);
                warn!(worker = self.id, url = %url, "permanent fetch failure, skipping: {err}");
                self.advance();
                self.finish_attempt().await
            }
        }
    }

    /// Inter-request pause, then retry or rotate. The bound proxy is only
    /// implicated once the consecutive-failure threshold is reached; the
    /// current URL is retried either way.
    async fn backoff(&mut self) -> WorkerPhase {
        if !self.pause(self.ctx.config.request_delay).await {
            return WorkerPhase::Done;
        }
        if self.consecutive_failures < self.ctx.config.failure_threshold {
            return WorkerPhase::Bound;
        }

        self.consecutive_failures = 0;
        match self.proxy.take() {
            Some(proxy) => {
                self.ctx.pool.report_failure(&proxy).await;
                self.rotations += 1;
                RunCounters::bump(&self.ctx.counters.proxy_rotations);
                info!(worker = self.id, proxy = %proxy, "rotating away from failing proxy");
                WorkerPhase::Idle
            }
            None => {
                // direct mode has nothing to rotate; give the URL up
                warn!(
                    worker = self.id,
                    url = %self.urls[self.cursor],
                    "retry budget exhausted without a proxy to rotate, skipping"
                );
                RunCounters::bump(&self.ctx.counters.permanent_failures);
                self.advance();
                WorkerPhase::Bound
            }
        }
    }

    async fn persist(&mut self, record: BusinessRecord) {
        match self.ctx.store.upsert_if_absent(&record).await {
            Ok(true) => {
                self.inserted += 1;
                RunCounters::bump(&self.ctx.counters.inserted);
                info!(
                    worker = self.id,
                    progress = format!("{}/{}", self.cursor + 1, self.urls.len()),
                    name = record.name.as_deref().unwrap_or("-"),
                    "record inserted"
                );
            }
            Ok(false) => {
                self.skipped += 1;
                RunCounters::bump(&self.ctx.counters.skipped);
            }
            Err(err) => {
                // fatal for this record only; the URL stays in the store's
                // error log for manual reconciliation
                RunCounters::bump(&self.ctx.counters.store_failures);
                error!(worker = self.id, url = %record.source_url, "store write failed: {err}");
            }
        }
    }

    fn advance(&mut self) {
        self.cursor += 1;
    }

    /// Apply the inter-request delay after a completed attempt (success or
    /// skip) and hand control back to Bound.
    async fn finish_attempt(&mut self) -> WorkerPhase {
        if self.cursor >= self.urls.len() {
            return WorkerPhase::Done;
        }
        if self.pause(self.ctx.config.request_delay).await {
            WorkerPhase::Bound
        } else {
            WorkerPhase::Done
        }
    }

    /// Cancellation-aware sleep. Returns false when the run was cancelled.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn finish(mut self) -> WorkerReport {
        if let Some(proxy) = self.proxy.take() {
            // graceful return, not a failure report
            self.ctx.pool.release(&proxy).await;
        }
        info!(
            worker = self.id,
            processed = self.cursor,
            inserted = self.inserted,
            skipped = self.skipped,
            rotations = self.rotations,
            stalled = self.stalled,
            "worker done"
        );
        WorkerReport {
            worker_id: self.id,
            assigned: self.urls.len(),
            processed: self.cursor,
            inserted: self.inserted,
            skipped: self.skipped,
            rotations: self.rotations,
            stalled: self.stalled,
            failed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub total_links: usize,
    pub counters: CounterSnapshot,
    pub workers: Vec<WorkerReport>,
    pub pool: PoolStatus,
}

impl RunSummary {
    pub fn any_progress(&self) -> bool {
        self.counters.inserted + self.counters.skipped > 0
    }

    pub fn stalled(&self) -> bool {
        self.workers.iter().any(|w| w.stalled)
    }

    pub fn incomplete_segments(&self) -> Vec<usize> {
        self.workers
            .iter()
            .filter(|w| !w.completed())
            .map(|w| w.worker_id)
            .collect()
    }
}

/// Partitions the work set, runs N workers to completion and aggregates the
/// run summary. Individual worker failures are isolated; siblings run on.
pub struct Dispatcher {
    config: ScrapeConfig,
    fetch: Arc<dyn FetchClient>,
    extractor: Arc<dyn RecordExtractor>,
    store: ResultStore,
    pool: Arc<ProxyPool>,
}

impl Dispatcher {
    pub fn new(
        config: ScrapeConfig,
        fetch: Arc<dyn FetchClient>,
        extractor: Arc<dyn RecordExtractor>,
        store: ResultStore,
        pool: Arc<ProxyPool>,
    ) -> Self {
        Self {
            config,
            fetch,
            extractor,
            store,
            pool,
        }
    }

    pub async fn run(&self, links: Vec<String>, cancel: CancellationToken) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        let links = dedup_links(links);
        let total_links = links.len();
        let segments = partition_links(links, self.config.workers);
        let counters = Arc::new(RunCounters::default());

        info!(
            %run_id,
            total_links,
            workers = segments.len(),
            proxied = self.pool.is_provisioned(),
            "dispatching scrape run"
        );

        let mut handles = Vec::with_capacity(segments.len());
        for (id, segment) in segments.into_iter().enumerate() {
            let ctx = WorkerContext {
                fetch: self.fetch.clone(),
                extractor: self.extractor.clone(),
                store: self.store.clone(),
                pool: self.pool.clone(),
                counters: counters.clone(),
                config: self.config.clone(),
                cancel: cancel.clone(),
            };
            let assigned = segment.len();
            let handle = tokio::spawn(Worker::new(id, segment, ctx).run());
            handles.push((id, assigned, handle));
        }

        let mut workers = Vec::with_capacity(handles.len());
        for (id, assigned, handle) in handles {
            match handle.await {
                Ok(report) => workers.push(report),
                Err(err) => {
                    error!(worker = id, "worker task failed: {err}");
                    workers.push(WorkerReport::task_failure(id, assigned));
                }
            }
        }

        let finished_at = Utc::now();
        RunSummary {
            run_id,
            started_at,
            finished_at,
            elapsed_secs: clock.elapsed().as_secs_f64(),
            total_links,
            counters: counters.snapshot(),
            workers,
            pool: self.pool.status().await,
        }
    }
}
