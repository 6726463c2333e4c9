use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use lol_match_cache::cache::{self, CacheStore, DEFAULT_MATCHES_DIR};
use lol_match_cache::config;
use lol_match_cache::filter::{self, FilterSpec};
use lol_match_cache::logging;

const STALE_TEMP_AGE: Duration = Duration::from_secs(10 * 60);

fn main() -> Result<()> {
    config::load_env_files();
    logging::init_tracing("warn");

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let dir = flag_value(&args, "--matches-dir")
        .or_else(|| std::env::var("MATCHES_DIR").ok().filter(|v| !v.trim().is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MATCHES_DIR));
    let player = flag_value(&args, "--player");
    let spec = FilterSpec::from_flags(
        has_flag(&args, "--include-aram"),
        has_flag(&args, "--ranked-only"),
        flag_value(&args, "--queue").as_deref(),
        flag_value(&args, "--modes").as_deref(),
    );

    let store = CacheStore::new(&dir);
    if has_flag(&args, "--sweep-temp") {
        let removed = store
            .sweep_stale_temp(STALE_TEMP_AGE)
            .context("sweep temp files")?;
        println!("Swept temp files: {removed}");
    }

    let loaded = store
        .load_all()
        .with_context(|| format!("scan {}", dir.display()))?;
    println!("Cache: {}", dir.display());
    println!("Records: {}", loaded.records.len());
    println!("Corrupt: {}", loaded.corrupt.len());
    for (match_id, reason) in loaded.corrupt.iter().take(10) {
        println!("  - {match_id}: {reason}");
    }
    println!("Unreadable: {}", loaded.unreadable.len());
    for (match_id, reason) in loaded.unreadable.iter().take(10) {
        println!("  - {match_id}: {reason}");
    }

    let mut modes: BTreeMap<String, usize> = BTreeMap::new();
    for record in &loaded.records {
        let mode = filter::game_mode(&record.raw).unwrap_or("unknown");
        *modes.entry(mode.to_string()).or_default() += 1;
    }
    println!("Game modes:");
    for (mode, count) in &modes {
        println!("  {mode}: {count}");
    }

    let kept = filter::filter_records(&loaded.records, &spec, |r| &r.raw);
    println!("Matching filter: {}", kept.len());

    if let Some(puuid) = player {
        let owned = kept
            .iter()
            .filter(|r| cache::record_belongs_to(&r.raw, &puuid))
            .collect::<Vec<_>>();
        println!("Matching filter for player: {}", owned.len());
        if let Some(latest) = owned.iter().map(|r| r.fetched_at).max() {
            println!("Latest fetch: {}", latest.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    } else if has_flag(&args, "--player") {
        return Err(anyhow!("--player needs a value"));
    }
    Ok(())
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter()
        .any(|arg| arg == name || arg.starts_with(&format!("{name}=")))
}

fn flag_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == name {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() && !next.starts_with("--") {
                return Some(next.trim().to_string());
            }
        }
    }
    None
}
