use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ApiError;
use crate::http_client::{RawResponse, Transport};
use crate::metrics::{MetricsRecorder, Phase};
use crate::retry::{CancelToken, RetryPolicy};

pub const TOKEN_HEADER: &str = "X-Riot-Token";
pub const DEFAULT_REGIONAL_BASE: &str = "https://europe.api.riotgames.com";
pub const DEFAULT_ACCOUNT_BASE: &str = "https://americas.api.riotgames.com";
/// Largest page the match-id endpoint accepts.
pub const MATCH_IDS_PAGE_LIMIT: usize = 100;

#[derive(Clone, PartialEq, Eq)]
pub struct ApiToken(String);

impl ApiToken {
    pub fn new(raw: impl Into<String>) -> Result<Self, ApiError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ApiError::MissingCredential);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiToken(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub regional_base: String,
    pub account_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            regional_base: DEFAULT_REGIONAL_BASE.to_string(),
            account_base: DEFAULT_ACCOUNT_BASE.to_string(),
        }
    }
}

impl Endpoints {
    /// Same base for both endpoint families; handy for mocks.
    pub fn single(base: &str) -> Self {
        Self {
            regional_base: base.to_string(),
            account_base: base.to_string(),
        }
    }

    pub fn account_url(&self, game_name: &str, tag_line: &str) -> String {
        join_segments(
            &self.account_base,
            &["riot", "account", "v1", "accounts", "by-riot-id", game_name, tag_line],
            &[],
        )
    }

    pub fn match_ids_url(&self, puuid: &str, start: usize, count: usize) -> String {
        join_segments(
            &self.regional_base,
            &["lol", "match", "v5", "matches", "by-puuid", puuid, "ids"],
            &[("start", start.to_string()), ("count", count.to_string())],
        )
    }

    pub fn match_url(&self, match_id: &str) -> String {
        join_segments(
            &self.regional_base,
            &["lol", "match", "v5", "matches", match_id],
            &[],
        )
    }

    pub fn timeline_url(&self, match_id: &str) -> String {
        join_segments(
            &self.regional_base,
            &["lol", "match", "v5", "matches", match_id, "timeline"],
            &[],
        )
    }
}

fn join_segments(base: &str, segments: &[&str], query: &[(&str, String)]) -> String {
    let fallback = || {
        let mut out = format!("{}/{}", base.trim_end_matches('/'), segments.join("/"));
        for (idx, (key, value)) in query.iter().enumerate() {
            out.push(if idx == 0 { '?' } else { '&' });
            out.push_str(&format!("{key}={value}"));
        }
        out
    };
    let Ok(mut url) = Url::parse(base) else {
        return fallback();
    };
    {
        let Ok(mut path) = url.path_segments_mut() else {
            return fallback();
        };
        path.pop_if_empty().extend(segments);
    }
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    url.to_string()
}

/// Account payload; casing is the provider's canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub puuid: String,
    pub game_name: String,
    pub tag_line: String,
}

#[derive(Debug, Deserialize)]
struct AccountDto {
    #[serde(default)]
    puuid: String,
    #[serde(rename = "gameName")]
    game_name: Option<String>,
    #[serde(rename = "tagLine")]
    tag_line: Option<String>,
}

pub struct RiotApi {
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
}

impl RiotApi {
    pub fn new(transport: Arc<dyn Transport>, endpoints: Endpoints) -> Self {
        Self {
            transport,
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn get_json(&self, url: &str, token: &ApiToken, subject: &str) -> Result<Value, ApiError> {
        debug!(url, "GET");
        let resp = self.transport.get(url, &[(TOKEN_HEADER, token.as_str())])?;
        classify_response(url, subject, resp)
    }

    pub fn account_by_riot_id(
        &self,
        game_name: &str,
        tag_line: &str,
        token: &ApiToken,
    ) -> Result<Account, ApiError> {
        let url = self.endpoints.account_url(game_name, tag_line);
        let subject = format!("account {game_name}#{tag_line}");
        let raw = self.get_json(&url, token, &subject)?;
        let dto: AccountDto = serde_json::from_value(raw)
            .map_err(|err| ApiError::Decode(format!("{subject}: {err}")))?;
        if dto.puuid.trim().is_empty() {
            return Err(ApiError::Decode(format!("{subject}: missing puuid")));
        }
        Ok(Account {
            puuid: dto.puuid,
            game_name: dto.game_name.unwrap_or_else(|| game_name.to_string()),
            tag_line: dto.tag_line.unwrap_or_else(|| tag_line.to_string()),
        })
    }

    pub fn match_ids_page(
        &self,
        puuid: &str,
        start: usize,
        count: usize,
        token: &ApiToken,
    ) -> Result<Vec<String>, ApiError> {
        let url = self
            .endpoints
            .match_ids_url(puuid, start, count.min(MATCH_IDS_PAGE_LIMIT));
        let raw = self.get_json(&url, token, "match id list")?;
        serde_json::from_value::<Vec<String>>(raw)
            .map_err(|err| ApiError::Decode(format!("match id list was not a list of ids: {err}")))
    }

    /// Most-recent-first ids, paged at the provider limit. Each page is
    /// retried on its own; a short page ends the listing early.
    pub fn match_history(
        &self,
        puuid: &str,
        count: usize,
        token: &ApiToken,
        retry: &RetryPolicy,
        cancel: &CancelToken,
        recorder: Option<&MetricsRecorder>,
    ) -> Result<Vec<String>, ApiError> {
        let mut ids = Vec::with_capacity(count);
        let mut start = 0;
        while ids.len() < count {
            let want = (count - ids.len()).min(MATCH_IDS_PAGE_LIMIT);
            let started = Instant::now();
            let page = retry.run(cancel, recorder, || {
                self.match_ids_page(puuid, start, want, token)
            });
            if let Some(recorder) = recorder {
                recorder.record_request(Phase::MatchIds, started.elapsed());
            }
            let page = page?;
            let got = page.len();
            ids.extend(page);
            debug!(start, requested = want, received = got, "match id page");
            if got < want {
                break;
            }
            start += got;
        }
        ids.truncate(count);
        Ok(ids)
    }

    pub fn match_document(&self, match_id: &str, token: &ApiToken) -> Result<Value, ApiError> {
        let url = self.endpoints.match_url(match_id);
        let raw = self.get_json(&url, token, &format!("match {match_id}"))?;
        if !raw.is_object() {
            return Err(ApiError::Decode(format!(
                "match {match_id} response was not a JSON object"
            )));
        }
        Ok(raw)
    }

    /// Timelines are optional: a 404 means "none published", not a failure.
    pub fn timeline(&self, match_id: &str, token: &ApiToken) -> Result<Option<Value>, ApiError> {
        let url = self.endpoints.timeline_url(match_id);
        match self.get_json(&url, token, &format!("timeline {match_id}")) {
            Ok(raw) if raw.is_object() => Ok(Some(raw)),
            Ok(_) => Ok(None),
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

pub fn classify_response(url: &str, subject: &str, resp: RawResponse) -> Result<Value, ApiError> {
    match resp.status {
        200..=299 => serde_json::from_str(&resp.body)
            .map_err(|err| ApiError::Decode(format!("{subject}: {err}"))),
        401 | 403 => Err(ApiError::Auth {
            status: resp.status,
        }),
        404 => Err(ApiError::NotFound(subject.to_string())),
        429 => Err(ApiError::RateLimited {
            retry_after: resp.retry_after,
        }),
        status => Err(ApiError::Status {
            status,
            url: url.to_string(),
        }),
    }
}
