use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Outcome of a single provider call that did not produce a usable payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("credential rejected by provider (http {status})")]
    Auth { status: u16 },
    #[error("RIOT_API_TOKEN is not set")]
    MissingCredential,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("network error: {0}")]
    Network(String),
    #[error("http {status} from {url}")]
    Status { status: u16, url: String },
    #[error("unexpected payload: {0}")]
    Decode(String),
    #[error("cancelled before completion")]
    Cancelled,
    #[error("worker failed: {0}")]
    Worker(String),
}

impl ApiError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth { .. } | ApiError::MissingCredential)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("match {0} is not cached")]
    NotFound(String),
    #[error("cached match {match_id} is corrupt: {reason}")]
    Corrupt { match_id: String, reason: String },
    #[error("invalid match id {0:?}")]
    InvalidId(String),
    #[error("cache io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("handle and tag line must both be non-empty")]
    InvalidHandle,
    #[error("credential rejected while resolving {handle}#{tag_line}")]
    Auth {
        handle: String,
        tag_line: String,
        #[source]
        source: ApiError,
    },
    #[error("no account found for {handle}#{tag_line} (case-insensitive attempts exhausted)")]
    NotFound { handle: String, tag_line: String },
    #[error("could not resolve {handle}#{tag_line}: {source}")]
    Unavailable {
        handle: String,
        tag_line: String,
        #[source]
        source: ApiError,
    },
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("player id must be non-empty")]
    InvalidPlayer,
    #[error("credential rejected: {0}")]
    Auth(#[source] ApiError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}
