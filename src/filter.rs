use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RANKED_SOLO_QUEUE: i64 = 420;
pub const RANKED_FLEX_QUEUE: i64 = 440;
pub const ARAM_QUEUE: i64 = 450;
pub const ARAM_MODE: &str = "ARAM";

/// Declarative match filter. An absent or empty whitelist means no
/// restriction on that dimension; active dimensions are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub include_aram: bool,
    pub queue_whitelist: Option<BTreeSet<i64>>,
    pub mode_whitelist: Option<BTreeSet<String>>,
}

impl FilterSpec {
    pub fn ranked_only() -> Self {
        Self::default().with_queues([RANKED_SOLO_QUEUE, RANKED_FLEX_QUEUE])
    }

    pub fn with_aram(mut self, include: bool) -> Self {
        self.include_aram = include;
        self
    }

    pub fn with_queues(mut self, queues: impl IntoIterator<Item = i64>) -> Self {
        self.queue_whitelist = Some(queues.into_iter().collect());
        self
    }

    pub fn with_modes<S: Into<String>>(mut self, modes: impl IntoIterator<Item = S>) -> Self {
        self.mode_whitelist = Some(modes.into_iter().map(Into::into).collect());
        self
    }

    /// Builds a spec from CLI-style flags. An explicit queue list wins over
    /// the ranked-only shortcut.
    pub fn from_flags(
        include_aram: bool,
        ranked_only: bool,
        queues: Option<&str>,
        modes: Option<&str>,
    ) -> Self {
        let mut spec = FilterSpec::default().with_aram(include_aram);
        let queues = queues.map(parse_queue_ids).filter(|q| !q.is_empty());
        if let Some(queues) = queues {
            spec = spec.with_queues(queues);
        } else if ranked_only {
            spec = spec.with_queues([RANKED_SOLO_QUEUE, RANKED_FLEX_QUEUE]);
        }
        if let Some(modes) = modes.map(parse_modes).filter(|m| !m.is_empty()) {
            spec = spec.with_modes(modes);
        }
        spec
    }

    pub fn is_unrestricted(&self) -> bool {
        self.include_aram
            && active(&self.queue_whitelist).is_none()
            && active(&self.mode_whitelist).is_none()
    }
}

fn active<T>(set: &Option<BTreeSet<T>>) -> Option<&BTreeSet<T>> {
    set.as_ref().filter(|s| !s.is_empty())
}

pub fn queue_id(record: &Value) -> Option<i64> {
    record.get("info")?.get("queueId")?.as_i64()
}

pub fn game_mode(record: &Value) -> Option<&str> {
    record.get("info")?.get("gameMode")?.as_str()
}

pub fn is_aram(record: &Value) -> bool {
    queue_id(record) == Some(ARAM_QUEUE) || game_mode(record) == Some(ARAM_MODE)
}

/// Total over any JSON value: a missing field fails only the dimension that
/// needs it.
pub fn matches(record: &Value, spec: &FilterSpec) -> bool {
    if !record.get("info").is_some_and(Value::is_object) {
        return false;
    }
    if !spec.include_aram && is_aram(record) {
        return false;
    }
    if let Some(queues) = active(&spec.queue_whitelist)
        && !queue_id(record).is_some_and(|q| queues.contains(&q))
    {
        return false;
    }
    if let Some(modes) = active(&spec.mode_whitelist)
        && !game_mode(record).is_some_and(|m| modes.contains(m))
    {
        return false;
    }
    true
}

/// Keeps the matching subset in input order.
pub fn filter_records<'a, T, F>(records: &'a [T], spec: &FilterSpec, doc: F) -> Vec<&'a T>
where
    F: Fn(&T) -> &Value,
{
    records.iter().filter(|r| matches(doc(r), spec)).collect()
}

pub fn parse_queue_ids(raw: &str) -> BTreeSet<i64> {
    raw.split([',', ';', ' '])
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .collect()
}

pub fn parse_modes(raw: &str) -> BTreeSet<String> {
    raw.split([',', ';', ' '])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}
