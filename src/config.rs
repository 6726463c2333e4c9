use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::api::{ApiToken, DEFAULT_ACCOUNT_BASE, DEFAULT_REGIONAL_BASE, Endpoints};
use crate::cache::DEFAULT_MATCHES_DIR;
use crate::fetcher::{DEFAULT_CONCURRENCY, FetchOptions, MAX_CONCURRENCY};
use crate::http_client::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::metrics::FetchMode;
use crate::resolver::{LegacyPrecedence, ResolverConfig};
use crate::retry::RetryPolicy;

pub const TOKEN_ENV: &str = "RIOT_API_TOKEN";
const LEGACY_PREFIX: &str = "PUUID_";
const ENV_FILES: &[&str] = &["config.env", ".env.local", ".env"];

/// Everything the resolver, fetchers and orchestrator need, read once at
/// startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub token: Option<ApiToken>,
    pub matches_dir: PathBuf,
    pub endpoints: Endpoints,
    pub fetch_mode: FetchMode,
    pub concurrency: usize,
    pub batch_timeout: Option<Duration>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub include_timeline: bool,
    pub min_matches: usize,
    pub fetch_count: usize,
    pub legacy_players: BTreeMap<String, String>,
    pub legacy_precedence: LegacyPrecedence,
    pub metrics_json: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// Loads dotenv files into the process env; earlier files win per key.
pub fn load_env_files() {
    for file in ENV_FILES {
        let _ = dotenvy::from_filename(file);
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let vars: BTreeMap<String, String> = env::vars().collect();
        let mut config = Self::from_lookup(|key| vars.get(key).cloned());
        config.legacy_players = legacy_players_from(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        config
    }

    /// Builds the config from any key lookup. The legacy player table is
    /// only filled by [`AppConfig::from_env`] or [`legacy_players_from`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let num = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };
        let flag = |key: &str, default: bool| {
            get(key)
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(default)
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            rate_limit_attempts: num("RETRY_RATE_LIMIT_ATTEMPTS", defaults.rate_limit_attempts as u64)
                .clamp(1, 10) as u32,
            network_attempts: num("RETRY_NETWORK_ATTEMPTS", defaults.network_attempts as u64)
                .clamp(1, 10) as u32,
            default_delay: Duration::from_millis(
                num("RETRY_DEFAULT_DELAY_MS", defaults.default_delay.as_millis() as u64)
                    .min(60_000),
            ),
            max_delay: Duration::from_millis(
                num("RETRY_MAX_DELAY_MS", defaults.max_delay.as_millis() as u64).min(300_000),
            ),
            jitter: flag("RETRY_JITTER", true),
        };

        Self {
            token: get(TOKEN_ENV).and_then(|t| ApiToken::new(t).ok()),
            matches_dir: get("MATCHES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MATCHES_DIR)),
            endpoints: Endpoints {
                regional_base: get("REGIONAL_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_REGIONAL_BASE.to_string()),
                account_base: get("ACCOUNT_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_ACCOUNT_BASE.to_string()),
            },
            fetch_mode: get("FETCH_MODE")
                .and_then(|v| FetchMode::parse(&v))
                .unwrap_or(FetchMode::Concurrent),
            concurrency: num("FETCH_PARALLELISM", DEFAULT_CONCURRENCY as u64)
                .clamp(1, MAX_CONCURRENCY as u64) as usize,
            batch_timeout: get("FETCH_TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            request_timeout: Duration::from_secs(
                num("REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS).clamp(1, 300),
            ),
            retry,
            include_timeline: flag("INCLUDE_TIMELINE", false),
            min_matches: num("MIN_MATCHES", 5).min(10_000) as usize,
            fetch_count: num("FETCH_COUNT", 10).clamp(1, 1_000) as usize,
            legacy_players: BTreeMap::new(),
            legacy_precedence: get("LEGACY_PRECEDENCE")
                .and_then(|v| LegacyPrecedence::parse(&v))
                .unwrap_or_default(),
            metrics_json: get("METRICS_JSON").map(PathBuf::from),
        }
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            include_timeline: self.include_timeline,
            retry: self.retry.clone(),
            timeout: self.batch_timeout,
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            legacy_players: self.legacy_players.clone(),
            precedence: self.legacy_precedence,
            retry: self.retry.clone(),
        }
    }
}

/// `PUUID_<NAME>=<id>` pairs; all-caps names become `Capitalized`.
pub fn legacy_players_from<'a>(
    vars: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in vars {
        let Some(raw) = key.strip_prefix(LEGACY_PREFIX) else {
            continue;
        };
        let value = value.trim();
        if raw.is_empty() || value.is_empty() {
            continue;
        }
        out.insert(normalize_legacy_name(raw), value.to_string());
    }
    out
}

fn normalize_legacy_name(raw: &str) -> String {
    let has_lower = raw.chars().any(char::is_lowercase);
    if has_lower {
        return raw.to_string();
    }
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
