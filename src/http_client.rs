use std::time::Duration;

use once_cell::sync::OnceCell;
use reqwest::blocking::Client;
use reqwest::header::{RETRY_AFTER, USER_AGENT};

use crate::error::ApiError;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

static CLIENT: OnceCell<Client> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One GET against the provider. Implementations must be callable from
/// many worker threads at once.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<RawResponse, ApiError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Transport over the process-wide client with the default timeout.
    pub fn shared() -> Result<Self, ApiError> {
        let client = CLIENT
            .get_or_try_init(|| build_client(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)))?
            .clone();
        Ok(Self { client })
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ApiError> {
        if timeout == Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS) {
            return Self::shared();
        }
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<RawResponse, ApiError> {
        let mut req = self
            .client
            .get(url)
            .header(USER_AGENT, concat!("lol_match_cache/", env!("CARGO_PKG_VERSION")));
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let resp = req
            .send()
            .map_err(|err| ApiError::Network(err.to_string()))?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = resp
            .text()
            .map_err(|err| ApiError::Network(format!("failed reading body: {err}")))?;
        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}

fn build_client(timeout: Duration) -> Result<Client, ApiError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| ApiError::Network(format!("failed to build http client: {err}")))
}

/// Only the delta-seconds form is honored; HTTP dates fall back to the
/// caller's default delay.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}
