use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Concurrent,
    Sequential,
}

impl FetchMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "concurrent" | "async" | "parallel" => Some(FetchMode::Concurrent),
            "sequential" | "sync" => Some(FetchMode::Sequential),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FetchMode::Concurrent => "concurrent",
            FetchMode::Sequential => "sequential",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    MatchIds,
    MatchDetails,
    Timeline,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchMetrics {
    pub mode: Option<FetchMode>,
    pub concurrency: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retries: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub request_latencies: Vec<Duration>,
    pub match_ids_requests: usize,
    pub match_details_requests: usize,
    pub timeline_requests: usize,
    pub peak_parallelism: usize,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseBreakdown {
    pub match_ids_requests: usize,
    pub match_details_requests: usize,
    pub timeline_requests: usize,
}

/// Serialized form handed to external tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub mode: Option<FetchMode>,
    pub concurrency: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_requests: usize,
    pub retry_count: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub max_latency_ms: f64,
    pub effective_parallelism: usize,
    pub phase_breakdown: PhaseBreakdown,
    pub total_duration_s: Option<f64>,
}

impl FetchMetrics {
    pub fn total_requests(&self) -> usize {
        self.request_latencies.len()
    }

    pub fn avg_latency(&self) -> Duration {
        if self.request_latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.request_latencies.iter().sum();
        total / self.request_latencies.len() as u32
    }

    pub fn max_latency(&self) -> Duration {
        self.request_latencies
            .iter()
            .copied()
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub fn p95_latency(&self) -> Duration {
        if self.request_latencies.is_empty() {
            return Duration::ZERO;
        }
        let mut ordered = self.request_latencies.clone();
        ordered.sort_unstable();
        let idx = ((ordered.len() as f64 * 0.95) as usize)
            .saturating_sub(1)
            .min(ordered.len() - 1);
        ordered[idx]
    }

    /// Folds another run into this one (e.g. the listing phase into the batch).
    pub fn merge(&mut self, other: &FetchMetrics) {
        self.mode = self.mode.or(other.mode);
        self.concurrency = self.concurrency.max(other.concurrency);
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.retries += other.retries;
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.request_latencies
            .extend(other.request_latencies.iter().copied());
        self.match_ids_requests += other.match_ids_requests;
        self.match_details_requests += other.match_details_requests;
        self.timeline_requests += other.timeline_requests;
        self.peak_parallelism = self.peak_parallelism.max(other.peak_parallelism);
        self.duration = match (self.duration, other.duration) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            mode: self.mode,
            concurrency: self.concurrency,
            attempted: self.attempted,
            succeeded: self.succeeded,
            failed: self.failed,
            total_requests: self.total_requests(),
            retry_count: self.retries,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            avg_latency_ms: round2(self.avg_latency().as_secs_f64() * 1000.0),
            p95_latency_ms: round2(self.p95_latency().as_secs_f64() * 1000.0),
            max_latency_ms: round2(self.max_latency().as_secs_f64() * 1000.0),
            effective_parallelism: self.peak_parallelism,
            phase_breakdown: PhaseBreakdown {
                match_ids_requests: self.match_ids_requests,
                match_details_requests: self.match_details_requests,
                timeline_requests: self.timeline_requests,
            },
            total_duration_s: self.duration.map(|d| round2(d.as_secs_f64())),
        }
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let s = self.summary();
        let mode = s.mode.map(FetchMode::as_str).unwrap_or("n/a");
        let duration = s
            .total_duration_s
            .map(|d| format!("{d:.2}"))
            .unwrap_or_else(|| "n/a".to_string());
        vec![
            "=== Fetch Metrics Summary ===".to_string(),
            format!("Mode: {mode} (width {})", s.concurrency),
            format!(
                "Matches: attempted {} / succeeded {} / failed {}",
                s.attempted, s.succeeded, s.failed
            ),
            format!("Total requests: {}", s.total_requests),
            format!("Cache hits: {}", s.cache_hits),
            format!("Cache misses: {}", s.cache_misses),
            format!("Retry count: {}", s.retry_count),
            format!("Avg latency ms: {}", s.avg_latency_ms),
            format!("P95 latency ms: {}", s.p95_latency_ms),
            format!("Max latency ms: {}", s.max_latency_ms),
            format!("Effective parallelism: {}", s.effective_parallelism),
            "Phase breakdown:".to_string(),
            format!("  match_ids_requests: {}", s.phase_breakdown.match_ids_requests),
            format!(
                "  match_details_requests: {}",
                s.phase_breakdown.match_details_requests
            ),
            format!("  timeline_requests: {}", s.phase_breakdown.timeline_requests),
            format!("Total duration s: {duration}"),
        ]
    }

    pub fn export_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).context("create metrics dir")?;
        }
        let json = serde_json::to_string_pretty(&self.summary()).context("serialize metrics")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).context("write metrics")?;
        fs::rename(&tmp, path).context("swap metrics")?;
        Ok(())
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Thread-safe collector shared by the workers of one fetch run.
#[derive(Debug)]
pub struct MetricsRecorder {
    inner: Mutex<FetchMetrics>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    started: Instant,
}

impl MetricsRecorder {
    pub fn new(mode: FetchMode, concurrency: usize) -> Self {
        Self {
            inner: Mutex::new(FetchMetrics {
                mode: Some(mode),
                concurrency,
                ..FetchMetrics::default()
            }),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut FetchMetrics) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn record_request(&self, phase: Phase, latency: Duration) {
        self.with(|m| {
            m.request_latencies.push(latency);
            match phase {
                Phase::MatchIds => m.match_ids_requests += 1,
                Phase::MatchDetails => m.match_details_requests += 1,
                Phase::Timeline => m.timeline_requests += 1,
            }
        });
    }

    pub fn record_retry(&self) {
        self.with(|m| m.retries += 1);
    }

    pub fn record_cache_hit(&self) {
        self.with(|m| m.cache_hits += 1);
    }

    pub fn record_cache_miss(&self) {
        self.with(|m| m.cache_misses += 1);
    }

    pub fn record_outcome(&self, success: bool) {
        self.with(|m| {
            m.attempted += 1;
            if success {
                m.succeeded += 1;
            } else {
                m.failed += 1;
            }
        });
    }

    /// Marks one unit of work as running until the guard drops.
    pub fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight { recorder: self }
    }

    pub fn snapshot(&self) -> FetchMetrics {
        let mut out = self.with(|m| m.clone());
        out.peak_parallelism = self.peak.load(Ordering::SeqCst);
        out.duration = Some(self.started.elapsed());
        out
    }
}

pub struct InFlight<'a> {
    recorder: &'a MetricsRecorder,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
