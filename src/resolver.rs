use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::api::{ApiToken, RiotApi};
use crate::error::{ApiError, ResolveError};
use crate::retry::{CancelToken, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentitySource {
    Remote,
    Legacy,
}

/// Resolved player. `stable_id` never changes; handle and tag carry the
/// provider's canonical casing when resolved remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerIdentity {
    pub handle: String,
    pub tag_line: String,
    pub stable_id: String,
    pub source: IdentitySource,
}

impl PlayerIdentity {
    pub fn label(&self) -> String {
        format!("{}#{}", self.handle, self.tag_line)
    }
}

/// How the static name → id table relates to remote lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LegacyPrecedence {
    /// Remote lookup first; the table is consulted only when every variant
    /// ended in not-found or a transient failure.
    #[default]
    RemoteFirst,
    /// A table hit wins without any network call.
    LegacyFirst,
    /// Ignore the table.
    RemoteOnly,
}

impl LegacyPrecedence {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "remote-first" | "remote" => Some(Self::RemoteFirst),
            "legacy-first" | "legacy" => Some(Self::LegacyFirst),
            "remote-only" | "none" => Some(Self::RemoteOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    /// Display name → stable id, matched case-insensitively.
    pub legacy_players: BTreeMap<String, String>,
    pub precedence: LegacyPrecedence,
    pub retry: RetryPolicy,
}

impl ResolverConfig {
    pub fn legacy_lookup(&self, handle: &str) -> Option<(&str, &str)> {
        let wanted = handle.trim().to_lowercase();
        self.legacy_players
            .iter()
            .find(|(name, id)| name.to_lowercase() == wanted && !id.trim().is_empty())
            .map(|(name, id)| (name.as_str(), id.as_str()))
    }
}

pub struct IdentityResolver {
    api: Arc<RiotApi>,
    config: ResolverConfig,
}

impl IdentityResolver {
    pub fn new(api: Arc<RiotApi>, config: ResolverConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolution without a credential: only the legacy table can answer.
    pub fn resolve_offline(&self, handle: &str, tag_line: &str) -> Option<PlayerIdentity> {
        if self.config.precedence == LegacyPrecedence::RemoteOnly {
            return None;
        }
        self.from_legacy(handle, tag_line)
    }

    pub fn resolve(
        &self,
        handle: &str,
        tag_line: &str,
        token: &ApiToken,
    ) -> Result<PlayerIdentity, ResolveError> {
        let (handle, tag_line) = (handle.trim(), tag_line.trim());
        if handle.is_empty() || tag_line.is_empty() {
            return Err(ResolveError::InvalidHandle);
        }
        if self.config.precedence == LegacyPrecedence::LegacyFirst
            && let Some(identity) = self.from_legacy(handle, tag_line)
        {
            info!(player = %identity.label(), "resolved from legacy player table");
            return Ok(identity);
        }

        let err = match self.resolve_remote(handle, tag_line, token) {
            Ok(identity) => return Ok(identity),
            Err(err @ ResolveError::Auth { .. }) => return Err(err),
            Err(err) => err,
        };
        if self.config.precedence == LegacyPrecedence::RemoteFirst
            && let Some(identity) = self.from_legacy(handle, tag_line)
        {
            warn!(%err, player = %identity.label(), "remote lookup failed; using legacy player table");
            return Ok(identity);
        }
        Err(err)
    }

    fn resolve_remote(
        &self,
        handle: &str,
        tag_line: &str,
        token: &ApiToken,
    ) -> Result<PlayerIdentity, ResolveError> {
        let cancel = CancelToken::new();
        let mut last_failure: Option<ApiError> = None;
        for (name, tag) in casing_variants(handle, tag_line) {
            debug!(variant = %format!("{name}#{tag}"), "trying account lookup");
            let attempt = self.config.retry.run(&cancel, None, || {
                self.api.account_by_riot_id(&name, &tag, token)
            });
            match attempt {
                Ok(account) => {
                    info!(
                        requested = %format!("{handle}#{tag_line}"),
                        resolved = %format!("{}#{}", account.game_name, account.tag_line),
                        puuid_tail = %tail(&account.puuid),
                        "resolved riot id"
                    );
                    return Ok(PlayerIdentity {
                        handle: account.game_name,
                        tag_line: account.tag_line,
                        stable_id: account.puuid,
                        source: IdentitySource::Remote,
                    });
                }
                Err(err) if err.is_auth() => {
                    return Err(ResolveError::Auth {
                        handle: handle.to_string(),
                        tag_line: tag_line.to_string(),
                        source: err,
                    });
                }
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    debug!(%err, "variant lookup failed");
                    last_failure = Some(err);
                }
            }
        }
        Err(match last_failure {
            Some(source) => ResolveError::Unavailable {
                handle: handle.to_string(),
                tag_line: tag_line.to_string(),
                source,
            },
            None => ResolveError::NotFound {
                handle: handle.to_string(),
                tag_line: tag_line.to_string(),
            },
        })
    }

    fn from_legacy(&self, handle: &str, tag_line: &str) -> Option<PlayerIdentity> {
        let (name, id) = self.config.legacy_lookup(handle)?;
        Some(PlayerIdentity {
            handle: name.to_string(),
            tag_line: tag_line.trim().to_string(),
            stable_id: id.to_string(),
            source: IdentitySource::Legacy,
        })
    }
}

fn tail(id: &str) -> &str {
    let start = id
        .char_indices()
        .rev()
        .nth(5)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    &id[start..]
}

/// As-given, lowercase, uppercase, title case.
pub fn case_forms(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(4);
    for form in [
        raw.to_string(),
        raw.to_lowercase(),
        raw.to_uppercase(),
        title_case(raw),
    ] {
        if !out.contains(&form) {
            out.push(form);
        }
    }
    out
}

/// Every (handle, tag) casing pair, as-given first, without duplicates.
pub fn casing_variants(handle: &str, tag_line: &str) -> Vec<(String, String)> {
    let tags = case_forms(tag_line);
    case_forms(handle)
        .into_iter()
        .flat_map(|name| tags.iter().map(move |tag| (name.clone(), tag.clone())))
        .collect()
}

/// Uppercases the first letter of each alphabetic run, lowercases the rest.
pub fn title_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_alpha = false;
    for ch in raw.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}
