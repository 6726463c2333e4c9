use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::warn;

use lol_match_cache::acquire::{AcquireRequest, Acquirer};
use lol_match_cache::api::RiotApi;
use lol_match_cache::cache::CacheStore;
use lol_match_cache::config::{self, AppConfig};
use lol_match_cache::error::ResolveError;
use lol_match_cache::fetcher::build_fetcher;
use lol_match_cache::filter::FilterSpec;
use lol_match_cache::http_client::HttpTransport;
use lol_match_cache::logging;
use lol_match_cache::metrics::FetchMode;
use lol_match_cache::resolver::{IdentityResolver, PlayerIdentity};

const USAGE: &str = "usage: lol_match_cache <game_name> <tag_line> [--count N] [--min-matches N] \
[--matches-dir DIR] [--no-cache] [--sync] [--include-timeline] [--show-metrics] [--metrics-json PATH] \
[--include-aram] [--ranked-only] [--queue IDS] [--modes MODES]";

const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Default)]
struct CliArgs {
    game_name: String,
    tag_line: String,
    count: Option<usize>,
    min_matches: Option<usize>,
    matches_dir: Option<PathBuf>,
    no_cache: bool,
    sync: bool,
    include_timeline: bool,
    show_metrics: bool,
    metrics_json: Option<PathBuf>,
    include_aram: bool,
    ranked_only: bool,
    queues: Option<String>,
    modes: Option<String>,
}

fn main() -> Result<()> {
    config::load_env_files();
    logging::init_tracing("info");

    let args = parse_args(std::env::args().skip(1).collect())?;
    let mut config = AppConfig::from_env();
    if let Some(count) = args.count {
        config.fetch_count = count.max(1);
    }
    if let Some(min) = args.min_matches {
        config.min_matches = min;
    }
    if let Some(dir) = &args.matches_dir {
        config.matches_dir = dir.clone();
    }
    if args.sync {
        config.fetch_mode = FetchMode::Sequential;
    }
    if args.include_timeline {
        config.include_timeline = true;
    }
    if args.metrics_json.is_some() {
        config.metrics_json = args.metrics_json.clone();
    }
    let filter = FilterSpec::from_flags(
        args.include_aram,
        args.ranked_only,
        args.queues.as_deref(),
        args.modes.as_deref(),
    );

    let transport =
        HttpTransport::with_timeout(config.request_timeout).context("build http client")?;
    let api = Arc::new(RiotApi::new(Arc::new(transport), config.endpoints.clone()));
    let resolver = IdentityResolver::new(Arc::clone(&api), config.resolver_config());
    let identity = resolve_player(&resolver, &config, &args)?;
    println!(
        "Player: {} ({:?}, id …{})",
        identity.label(),
        identity.source,
        short_id(&identity.stable_id)
    );

    let cache = CacheStore::new(&config.matches_dir);
    if let Err(err) = cache.sweep_stale_temp(STALE_TEMP_AGE) {
        warn!(%err, "could not sweep stale temp files");
    }
    let fetcher = build_fetcher(
        config.fetch_mode,
        Arc::clone(&api),
        config.fetch_options(),
        config.concurrency,
    );
    let acquirer = Acquirer::new(api, fetcher, config.retry.clone());
    let request = AcquireRequest {
        player_id: identity.stable_id.clone(),
        min_matches: config.min_matches,
        fetch_count: config.fetch_count,
        filter,
        refresh: args.no_cache,
    };
    let outcome = acquirer
        .ensure(&request, config.token.as_ref(), &cache)
        .context("acquisition failed")?;

    println!("Cache: {}", cache.dir().display());
    println!(
        "Mode: {} (width {})",
        acquirer.fetcher().mode().as_str(),
        acquirer.fetcher().width()
    );
    println!("Matches before: {}", outcome.before);
    println!("Matches after: {}", outcome.after);
    if outcome.listed > 0 {
        println!(
            "Listed: {} (already cached {}, written {}, unchanged {})",
            outcome.listed, outcome.already_cached, outcome.written, outcome.unchanged
        );
    }
    if let Some(report) = &outcome.report {
        println!(
            "Fetched: {}/{} succeeded",
            report.succeeded(),
            report.results.len()
        );
    }
    for advisory in &outcome.advisories {
        println!("! {advisory}");
    }

    if args.show_metrics {
        for line in outcome.metrics.summary_lines() {
            println!("{line}");
        }
    }
    if let Some(path) = &config.metrics_json {
        outcome
            .metrics
            .export_json(path)
            .with_context(|| format!("export metrics to {}", path.display()))?;
        println!("Metrics written to {}", path.display());
    }
    Ok(())
}

fn resolve_player(
    resolver: &IdentityResolver,
    config: &AppConfig,
    args: &CliArgs,
) -> Result<PlayerIdentity> {
    let Some(token) = &config.token else {
        return resolver
            .resolve_offline(&args.game_name, &args.tag_line)
            .ok_or_else(|| {
                anyhow!(
                    "{} is not set and {} has no legacy mapping",
                    config::TOKEN_ENV,
                    args.game_name
                )
            });
    };
    match resolver.resolve(&args.game_name, &args.tag_line, token) {
        Ok(identity) => Ok(identity),
        Err(err @ ResolveError::Auth { .. }) => {
            Err(anyhow!(err).context(format!("check {}", config::TOKEN_ENV)))
        }
        Err(err) => Err(anyhow!(err)),
    }
}

fn short_id(id: &str) -> &str {
    let start = id.char_indices().rev().nth(7).map(|(i, _)| i).unwrap_or(0);
    &id[start..]
}

fn parse_args(args: Vec<String>) -> Result<CliArgs> {
    let mut out = CliArgs::default();
    let mut positional = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        let (name, inline) = match arg.split_once('=') {
            Some((name, value)) if name.starts_with("--") => (name.to_string(), Some(value.to_string())),
            _ => (arg.clone(), None),
        };
        let mut value = |flag: &str| -> Result<String> {
            inline
                .clone()
                .or_else(|| iter.next())
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow!("{flag} needs a value\n{USAGE}"))
        };
        let switch = |flag: &str| -> Result<bool> {
            match &inline {
                Some(_) => bail!("{flag} takes no value\n{USAGE}"),
                None => Ok(true),
            }
        };
        match name.as_str() {
            "--count" => out.count = Some(parse_number(&value("--count")?, "--count")?),
            "--min-matches" => {
                out.min_matches = Some(parse_number(&value("--min-matches")?, "--min-matches")?)
            }
            "--matches-dir" => out.matches_dir = Some(PathBuf::from(value("--matches-dir")?)),
            "--metrics-json" => out.metrics_json = Some(PathBuf::from(value("--metrics-json")?)),
            "--queue" => out.queues = Some(value("--queue")?),
            "--modes" => out.modes = Some(value("--modes")?),
            "--no-cache" => out.no_cache = switch("--no-cache")?,
            "--sync" => out.sync = switch("--sync")?,
            "--include-timeline" => out.include_timeline = switch("--include-timeline")?,
            "--show-metrics" => out.show_metrics = switch("--show-metrics")?,
            "--include-aram" => out.include_aram = switch("--include-aram")?,
            "--ranked-only" => out.ranked_only = switch("--ranked-only")?,
            "-h" | "--help" => bail!("{USAGE}"),
            flag if flag.starts_with("--") => bail!("unknown flag {flag}\n{USAGE}"),
            _ => positional.push(arg),
        }
    }
    let [game_name, tag_line] = <[String; 2]>::try_from(positional)
        .map_err(|_| anyhow!("expected <game_name> <tag_line>\n{USAGE}"))?;
    out.game_name = game_name;
    out.tag_line = tag_line;
    Ok(out)
}

fn parse_number(raw: &str, flag: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .with_context(|| format!("{flag} expects a number, got {raw:?}"))
}
