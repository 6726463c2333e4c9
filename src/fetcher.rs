use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{ApiToken, RiotApi};
use crate::error::ApiError;
use crate::metrics::{FetchMetrics, FetchMode, MetricsRecorder, Phase};
use crate::retry::{CancelToken, RetryPolicy};

pub const DEFAULT_CONCURRENCY: usize = 8;
pub const MAX_CONCURRENCY: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub match_id: String,
    pub outcome: Result<Value, ApiError>,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn document(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ApiError> {
        self.outcome.as_ref().err()
    }

    fn cancelled(match_id: &str) -> Self {
        Self {
            match_id: match_id.to_string(),
            outcome: Err(ApiError::Cancelled),
        }
    }
}

/// Results of one batch, in the order the ids were requested.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub results: Vec<FetchResult>,
    pub metrics: FetchMetrics,
}

impl FetchReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.succeeded() == 0
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub include_timeline: bool,
    pub retry: RetryPolicy,
    /// Deadline for a whole batch; completed results survive it.
    pub timeout: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            include_timeline: false,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }
}

/// Fetches match documents for a batch of ids. Implementations differ only
/// in scheduling; the per-id outcome for the same provider is identical.
pub trait Fetcher: Send + Sync {
    fn mode(&self) -> FetchMode;

    fn width(&self) -> usize;

    fn fetch_many(&self, ids: &[String], token: &ApiToken) -> FetchReport;

    /// Stops the batch in progress (and any later one) early.
    fn cancel_token(&self) -> &CancelToken;
}

pub fn build_fetcher(
    mode: FetchMode,
    api: Arc<RiotApi>,
    options: FetchOptions,
    concurrency: usize,
) -> Box<dyn Fetcher> {
    match mode {
        FetchMode::Concurrent => Box::new(ConcurrentFetcher::new(api, options, concurrency)),
        FetchMode::Sequential => Box::new(SequentialFetcher::new(api, options)),
    }
}

/// One unit of work, shared by both modes: the match document with retry,
/// then the timeline as a best-effort extra.
pub fn fetch_one(
    api: &RiotApi,
    options: &FetchOptions,
    match_id: &str,
    token: &ApiToken,
    cancel: &CancelToken,
    recorder: &MetricsRecorder,
) -> FetchResult {
    let started = Instant::now();
    let outcome = options
        .retry
        .run(cancel, Some(recorder), || api.match_document(match_id, token));
    recorder.record_request(Phase::MatchDetails, started.elapsed());

    let outcome = match outcome {
        Ok(mut doc) => {
            if options.include_timeline {
                attach_timeline(api, options, match_id, token, cancel, recorder, &mut doc);
            }
            Ok(doc)
        }
        Err(err) => {
            warn!(match_id, %err, "match fetch failed");
            Err(err)
        }
    };
    recorder.record_outcome(outcome.is_ok());
    FetchResult {
        match_id: match_id.to_string(),
        outcome,
    }
}

/// [`fetch_one`] with a panic turned into a failed result, so one bad unit
/// of work never takes its siblings down.
fn fetch_isolated(
    api: &RiotApi,
    options: &FetchOptions,
    match_id: &str,
    token: &ApiToken,
    cancel: &CancelToken,
    recorder: &MetricsRecorder,
) -> FetchResult {
    panic::catch_unwind(AssertUnwindSafe(|| {
        fetch_one(api, options, match_id, token, cancel, recorder)
    }))
    .unwrap_or_else(|_| {
        recorder.record_outcome(false);
        FetchResult {
            match_id: match_id.to_string(),
            outcome: Err(ApiError::Worker(format!("worker panicked on {match_id}"))),
        }
    })
}

fn attach_timeline(
    api: &RiotApi,
    options: &FetchOptions,
    match_id: &str,
    token: &ApiToken,
    cancel: &CancelToken,
    recorder: &MetricsRecorder,
    doc: &mut Value,
) {
    let started = Instant::now();
    let timeline = options
        .retry
        .run(cancel, Some(recorder), || api.timeline(match_id, token));
    recorder.record_request(Phase::Timeline, started.elapsed());
    match timeline {
        Ok(Some(timeline)) => {
            if let Some(obj) = doc.as_object_mut() {
                obj.insert("timeline".to_string(), timeline);
                debug!(match_id, "timeline attached");
            }
        }
        Ok(None) => debug!(match_id, "no timeline published"),
        Err(err) => warn!(match_id, %err, "timeline unavailable; keeping match without it"),
    }
}

pub struct SequentialFetcher {
    api: Arc<RiotApi>,
    options: FetchOptions,
    cancel: CancelToken,
}

impl SequentialFetcher {
    pub fn new(api: Arc<RiotApi>, options: FetchOptions) -> Self {
        Self {
            api,
            options,
            cancel: CancelToken::new(),
        }
    }
}

impl Fetcher for SequentialFetcher {
    fn mode(&self) -> FetchMode {
        FetchMode::Sequential
    }

    fn width(&self) -> usize {
        1
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn fetch_many(&self, ids: &[String], token: &ApiToken) -> FetchReport {
        let recorder = MetricsRecorder::new(FetchMode::Sequential, 1);
        let cancel = self.cancel.child(self.options.timeout);
        let mut results = Vec::with_capacity(ids.len());
        for (idx, id) in ids.iter().enumerate() {
            if cancel.is_cancelled() {
                results.push(FetchResult::cancelled(id));
                continue;
            }
            debug!(idx = idx + 1, total = ids.len(), match_id = %id, "fetching match");
            let _slot = recorder.enter();
            results.push(fetch_isolated(&self.api, &self.options, id, token, &cancel, &recorder));
        }
        finish(results, &recorder)
    }
}

/// Fixed-width rayon pool; results are streamed back over a channel and
/// reassembled in request order.
pub struct ConcurrentFetcher {
    api: Arc<RiotApi>,
    options: FetchOptions,
    width: usize,
    cancel: CancelToken,
}

impl ConcurrentFetcher {
    pub fn new(api: Arc<RiotApi>, options: FetchOptions, concurrency: usize) -> Self {
        Self {
            api,
            options,
            width: concurrency.clamp(1, MAX_CONCURRENCY),
            cancel: CancelToken::new(),
        }
    }
}

impl Fetcher for ConcurrentFetcher {
    fn mode(&self) -> FetchMode {
        FetchMode::Concurrent
    }

    fn width(&self) -> usize {
        self.width
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn fetch_many(&self, ids: &[String], token: &ApiToken) -> FetchReport {
        let recorder = Arc::new(MetricsRecorder::new(FetchMode::Concurrent, self.width));
        if ids.is_empty() {
            return finish(Vec::new(), &recorder);
        }
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.width)
            .thread_name(|idx| format!("match-fetch-{idx}"))
            .build()
        {
            Ok(pool) => pool,
            Err(err) => {
                warn!(%err, "fetch pool unavailable; falling back to sequential mode");
                let fallback = SequentialFetcher {
                    api: Arc::clone(&self.api),
                    options: self.options.clone(),
                    cancel: self.cancel.clone(),
                };
                return fallback.fetch_many(ids, token);
            }
        };

        let cancel = self.cancel.child(self.options.timeout);
        let (tx, rx) = mpsc::channel::<(usize, FetchResult)>();
        for (idx, id) in ids.iter().enumerate() {
            let tx = tx.clone();
            let api = Arc::clone(&self.api);
            let options = self.options.clone();
            let token = token.clone();
            let cancel = cancel.clone();
            let recorder = Arc::clone(&recorder);
            let id = id.clone();
            pool.spawn(move || {
                if cancel.is_cancelled() {
                    let _ = tx.send((idx, FetchResult::cancelled(&id)));
                    return;
                }
                let _slot = recorder.enter();
                let result = fetch_isolated(&api, &options, &id, &token, &cancel, &recorder);
                // Receiver is gone once the batch deadline passed.
                let _ = tx.send((idx, result));
            });
        }
        drop(tx);

        let mut slots: Vec<Option<FetchResult>> = vec![None; ids.len()];
        let mut received = 0;
        while received < ids.len() {
            let next = match cancel.remaining() {
                Some(left) => rx.recv_timeout(left),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match next {
                Ok((idx, result)) => {
                    slots[idx] = Some(result);
                    received += 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        completed = received,
                        total = ids.len(),
                        "fetch deadline reached; abandoning in-flight requests"
                    );
                    cancel.cancel();
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let results = slots
            .into_iter()
            .zip(ids)
            .map(|(slot, id)| slot.unwrap_or_else(|| FetchResult::cancelled(id)))
            .collect();
        finish(results, &recorder)
    }
}

fn finish(results: Vec<FetchResult>, recorder: &MetricsRecorder) -> FetchReport {
    let metrics = recorder.snapshot();
    let report = FetchReport { results, metrics };
    info!(
        mode = report.metrics.mode.map(FetchMode::as_str).unwrap_or("n/a"),
        attempted = report.results.len(),
        succeeded = report.succeeded(),
        failed = report.failed(),
        peak = report.metrics.peak_parallelism,
        elapsed_ms = report.metrics.duration.unwrap_or_default().as_millis() as u64,
        "fetch batch finished"
    );
    report
}
