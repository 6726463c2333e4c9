use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::filter::{self, FilterSpec};

pub const DEFAULT_MATCHES_DIR: &str = "matches";
const RECORD_EXT: &str = ".json";
const TEMP_EXT: &str = ".tmp";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub match_id: String,
    pub raw: Value,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

#[derive(Debug, Default)]
pub struct LoadedMatches {
    pub records: Vec<MatchRecord>,
    pub corrupt: Vec<(String, String)>,
    /// Listed but not readable (permissions, a directory behind a link).
    pub unreadable: Vec<(String, String)>,
}

/// One file per match under `dir`. The directory itself is the index: every
/// query rescans it, so files added or removed by other processes are seen.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).map_err(|err| CacheError::io(&self.dir, err))
    }

    pub fn record_path(&self, match_id: &str) -> Result<PathBuf, CacheError> {
        validate_match_id(match_id)?;
        Ok(self.dir.join(format!("{match_id}{RECORD_EXT}")))
    }

    pub fn list_cached(&self) -> Result<BTreeSet<String>, CacheError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(CacheError::io(&self.dir, err)),
        };
        let mut ids = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|err| CacheError::io(&self.dir, err))?;
            if !entry.file_type().is_ok_and(|t| t.is_file() || t.is_symlink()) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = match_id_from_file_name(name) {
                ids.insert(id.to_string());
            }
        }
        Ok(ids)
    }

    pub fn has(&self, match_id: &str) -> bool {
        self.record_path(match_id).is_ok_and(|p| p.is_file())
    }

    /// Writes to a private temp file and renames it into place, so readers
    /// see either the previous state or the complete record.
    pub fn write(&self, match_id: &str, document: &Value) -> Result<WriteOutcome, CacheError> {
        let path = self.record_path(match_id)?;
        let body = serde_json::to_vec_pretty(document).map_err(|err| CacheError::Corrupt {
            match_id: match_id.to_string(),
            reason: format!("unserializable document: {err}"),
        })?;
        if fs::read(&path).is_ok_and(|existing| existing == body) {
            debug!(match_id, "identical record already cached");
            return Ok(WriteOutcome::Unchanged);
        }
        self.ensure_dir()?;
        let tmp = self.temp_path(match_id);
        let staged = File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(&body)?;
                f.sync_all()
            })
            .and_then(|()| fs::rename(&tmp, &path));
        if let Err(err) = staged {
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::io(&path, err));
        }
        Ok(WriteOutcome::Written)
    }

    /// Temp names are unique per writer so concurrent writers of the same
    /// match never share a staging file.
    pub fn temp_path(&self, match_id: &str) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            ".{match_id}{RECORD_EXT}.{}-{seq}{TEMP_EXT}",
            std::process::id()
        ))
    }

    pub fn read(&self, match_id: &str) -> Result<MatchRecord, CacheError> {
        let path = self.record_path(match_id)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CacheError::NotFound(match_id.to_string()));
            }
            Err(err) => return Err(CacheError::io(&path, err)),
        };
        let corrupt = |reason: String| CacheError::Corrupt {
            match_id: match_id.to_string(),
            reason,
        };
        let doc: Value = serde_json::from_slice(&raw).map_err(|err| corrupt(err.to_string()))?;
        validate_match_document(&doc).map_err(corrupt)?;
        let fetched_at = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(MatchRecord {
            match_id: match_id.to_string(),
            raw: doc,
            fetched_at,
        })
    }

    /// Every readable record; corrupt and unreadable files are reported and
    /// skipped so one bad file never hides the rest of the cache.
    pub fn load_all(&self) -> Result<LoadedMatches, CacheError> {
        let mut out = LoadedMatches::default();
        for id in self.list_cached()? {
            match self.read(&id) {
                Ok(record) => out.records.push(record),
                Err(CacheError::Corrupt { match_id, reason }) => {
                    warn!(%match_id, %reason, "skipping corrupt cached match");
                    out.corrupt.push((match_id, reason));
                }
                // Removed by another process between scan and read.
                Err(CacheError::NotFound(_)) => continue,
                Err(err) => {
                    warn!(match_id = %id, %err, "skipping unreadable cached match");
                    out.unreadable.push((id.clone(), err.to_string()));
                }
            }
        }
        debug!(
            loaded = out.records.len(),
            corrupt = out.corrupt.len(),
            unreadable = out.unreadable.len(),
            dir = %self.dir.display(),
            "loaded cached matches"
        );
        Ok(out)
    }

    pub fn count_for_player(&self, puuid: &str, spec: &FilterSpec) -> Result<usize, CacheError> {
        let loaded = self.load_all()?;
        Ok(loaded
            .records
            .iter()
            .filter(|r| record_belongs_to(&r.raw, puuid) && filter::matches(&r.raw, spec))
            .count())
    }

    /// Removes staging files older than `max_age`; younger ones may belong
    /// to a writer that is still running.
    pub fn sweep_stale_temp(&self, max_age: Duration) -> Result<usize, CacheError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(CacheError::io(&self.dir, err)),
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !(name.starts_with('.') && name.ends_with(TEMP_EXT)) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(CacheError::io(entry.path(), err)),
            }
        }
        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "swept stale temp files");
        }
        Ok(removed)
    }
}

fn match_id_from_file_name(name: &str) -> Option<&str> {
    if name.starts_with('.') {
        return None;
    }
    let id = name.strip_suffix(RECORD_EXT)?;
    (!id.is_empty()).then_some(id)
}

pub fn validate_match_id(match_id: &str) -> Result<(), CacheError> {
    let bad = match_id.is_empty()
        || match_id.starts_with('.')
        || match_id.contains(['/', '\\', '\0'])
        || match_id.contains("..");
    if bad {
        return Err(CacheError::InvalidId(match_id.to_string()));
    }
    Ok(())
}

/// Structural check for a stored match: `metadata.matchId` and
/// `info.gameId` must be present.
pub fn validate_match_document(doc: &Value) -> Result<(), String> {
    let Some(obj) = doc.as_object() else {
        return Err("document is not a JSON object".to_string());
    };
    let Some(metadata) = obj.get("metadata").and_then(Value::as_object) else {
        return Err("missing metadata object".to_string());
    };
    let Some(info) = obj.get("info").and_then(Value::as_object) else {
        return Err("missing info object".to_string());
    };
    if !metadata.contains_key("matchId") {
        return Err("metadata.matchId missing".to_string());
    }
    if !info.contains_key("gameId") {
        return Err("info.gameId missing".to_string());
    }
    Ok(())
}

pub fn record_belongs_to(doc: &Value, puuid: &str) -> bool {
    let in_metadata = doc
        .get("metadata")
        .and_then(|m| m.get("participants"))
        .and_then(Value::as_array)
        .is_some_and(|ids| ids.iter().any(|id| id.as_str() == Some(puuid)));
    if in_metadata {
        return true;
    }
    doc.get("info")
        .and_then(|i| i.get("participants"))
        .and_then(Value::as_array)
        .is_some_and(|ps| {
            ps.iter()
                .any(|p| p.get("puuid").and_then(Value::as_str) == Some(puuid))
        })
}
