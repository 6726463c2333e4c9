use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::api::{ApiToken, RiotApi};
use crate::cache::{self, CacheStore, WriteOutcome};
use crate::error::{AcquireError, ApiError, CacheError};
use crate::fetcher::{FetchReport, Fetcher};
use crate::filter::FilterSpec;
use crate::metrics::{FetchMetrics, MetricsRecorder};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub player_id: String,
    pub min_matches: usize,
    pub fetch_count: usize,
    /// Decides which cached records count toward `min_matches`.
    pub filter: FilterSpec,
    /// Ignore what is cached: always list, and fetch every listed id again.
    pub refresh: bool,
}

/// Human-readable notes surfaced to the caller; none of them is fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum Advisory {
    MissingCredential,
    ListingFailed(ApiError),
    NoNewMatches,
    AllFetchesFailed { attempted: usize },
    BelowMinimum { have: usize, want: usize },
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::MissingCredential => {
                write!(f, "RIOT_API_TOKEN is not set; using cached matches only")
            }
            Advisory::ListingFailed(err) => {
                write!(f, "could not list recent matches ({err}); using cached matches only")
            }
            Advisory::NoNewMatches => write!(f, "no new matches were obtained"),
            Advisory::AllFetchesFailed { attempted } => {
                write!(f, "all {attempted} match fetches failed")
            }
            Advisory::BelowMinimum { have, want } => {
                write!(f, "only {have} matching matches cached, wanted {want}")
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcquireOutcome {
    pub before: usize,
    pub after: usize,
    /// Ids returned by the provider after dedupe.
    pub listed: usize,
    /// Listed ids already on disk and readable.
    pub already_cached: usize,
    pub written: usize,
    pub unchanged: usize,
    pub report: Option<FetchReport>,
    /// Listing and batch metrics combined.
    pub metrics: FetchMetrics,
    pub advisories: Vec<Advisory>,
}

impl AcquireOutcome {
    fn settled(before: usize) -> Self {
        Self {
            before,
            after: before,
            ..Self::default()
        }
    }

    pub fn fetched_anything(&self) -> bool {
        self.written > 0
    }

    fn push_shortfall(&mut self, want: usize) {
        if self.after < want {
            self.advisories.push(Advisory::BelowMinimum {
                have: self.after,
                want,
            });
        }
    }
}

/// Runs acquisition cycles: count, decide, list, diff, fetch, persist,
/// recount. The cache directory is rescanned on every cycle.
pub struct Acquirer {
    api: Arc<RiotApi>,
    fetcher: Box<dyn Fetcher>,
    retry: RetryPolicy,
}

impl Acquirer {
    pub fn new(api: Arc<RiotApi>, fetcher: Box<dyn Fetcher>, retry: RetryPolicy) -> Self {
        Self {
            api,
            fetcher,
            retry,
        }
    }

    pub fn fetcher(&self) -> &dyn Fetcher {
        self.fetcher.as_ref()
    }

    pub fn ensure(
        &self,
        req: &AcquireRequest,
        token: Option<&ApiToken>,
        cache: &CacheStore,
    ) -> Result<AcquireOutcome, AcquireError> {
        let started = Instant::now();
        let player_id = req.player_id.trim();
        if player_id.is_empty() {
            return Err(AcquireError::InvalidPlayer);
        }

        let before = cache.count_for_player(player_id, &req.filter)?;
        info!(before, min = req.min_matches, dir = %cache.dir().display(), "counted cached matches");
        if before >= req.min_matches && !req.refresh {
            info!("enough matches cached; skipping fetch");
            return Ok(AcquireOutcome::settled(before));
        }

        let Some(token) = token else {
            warn!("no credential; cannot fetch more matches");
            let mut outcome = AcquireOutcome::settled(before);
            outcome.advisories.push(Advisory::MissingCredential);
            outcome.push_shortfall(req.min_matches);
            return Ok(outcome);
        };

        cache.ensure_dir()?;
        let listing = MetricsRecorder::new(self.fetcher.mode(), self.fetcher.width());
        let cancel = self.fetcher.cancel_token().child(None);
        let ids = match self.api.match_history(
            player_id,
            req.fetch_count,
            token,
            &self.retry,
            &cancel,
            Some(&listing),
        ) {
            Ok(ids) => ids,
            Err(err) if err.is_auth() => return Err(AcquireError::Auth(err)),
            Err(err) => {
                warn!(%err, "match listing failed");
                let mut outcome = AcquireOutcome::settled(before);
                outcome.metrics = listing.snapshot();
                outcome.metrics.duration = Some(started.elapsed());
                outcome.advisories.push(Advisory::ListingFailed(err));
                outcome.push_shortfall(req.min_matches);
                return Ok(outcome);
            }
        };

        let mut seen = HashSet::new();
        let listed: Vec<String> = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();
        let mut work = Vec::new();
        for id in &listed {
            if !req.refresh && is_cached(cache, id) {
                listing.record_cache_hit();
            } else {
                listing.record_cache_miss();
                work.push(id.clone());
            }
        }
        info!(
            listed = listed.len(),
            cached = listed.len() - work.len(),
            to_fetch = work.len(),
            "planned fetch"
        );

        let mut outcome = AcquireOutcome::settled(before);
        outcome.listed = listed.len();
        outcome.already_cached = listed.len() - work.len();
        if work.is_empty() {
            outcome.metrics = listing.snapshot();
            outcome.metrics.duration = Some(started.elapsed());
            outcome.advisories.push(Advisory::NoNewMatches);
            outcome.push_shortfall(req.min_matches);
            return Ok(outcome);
        }

        let mut metrics = listing.snapshot();
        let report = self.fetcher.fetch_many(&work, token);
        self.persist(&report, cache, &mut outcome);
        metrics.merge(&report.metrics);
        outcome.metrics = metrics;
        if report.all_failed() {
            outcome.advisories.push(Advisory::AllFetchesFailed {
                attempted: report.results.len(),
            });
        }
        outcome.report = Some(report);

        outcome.after = cache.count_for_player(player_id, &req.filter)?;
        if outcome.written == 0 {
            outcome.advisories.push(Advisory::NoNewMatches);
        }
        outcome.push_shortfall(req.min_matches);
        outcome.metrics.duration = Some(started.elapsed());
        for advisory in &outcome.advisories {
            warn!(%advisory, "acquisition advisory");
        }
        info!(before = outcome.before, after = outcome.after, written = outcome.written, "acquisition finished");
        Ok(outcome)
    }

    fn persist(&self, report: &FetchReport, cache: &CacheStore, outcome: &mut AcquireOutcome) {
        for result in &report.results {
            let Some(doc) = result.document() else {
                if let Some(err) = result.error() {
                    warn!(match_id = %result.match_id, %err, "skipping failed match");
                }
                continue;
            };
            if let Err(reason) = cache::validate_match_document(doc) {
                warn!(match_id = %result.match_id, %reason, "provider returned malformed match; not caching");
                continue;
            }
            match cache.write(&result.match_id, doc) {
                Ok(WriteOutcome::Written) => outcome.written += 1,
                Ok(WriteOutcome::Unchanged) => outcome.unchanged += 1,
                Err(err) => error!(match_id = %result.match_id, %err, "failed to cache match"),
            }
        }
    }
}

/// A listed id counts as cached only when its record reads back cleanly;
/// corrupt or unreadable files are fetched again and replaced.
fn is_cached(cache: &CacheStore, match_id: &str) -> bool {
    match cache.read(match_id) {
        Ok(_) => true,
        Err(CacheError::NotFound(_)) => false,
        Err(CacheError::Corrupt { reason, .. }) => {
            warn!(match_id, %reason, "cached match is corrupt; fetching again");
            false
        }
        Err(err) => {
            warn!(match_id, %err, "cached match unreadable; fetching again");
            false
        }
    }
}
