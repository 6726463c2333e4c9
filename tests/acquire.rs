mod common;

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use lol_match_cache::acquire::{AcquireRequest, Acquirer, Advisory};
use lol_match_cache::api::ApiToken;
use lol_match_cache::cache::CacheStore;
use lol_match_cache::error::AcquireError;
use lol_match_cache::fetcher::build_fetcher;
use lol_match_cache::filter::FilterSpec;
use lol_match_cache::metrics::FetchMode;
use lol_match_cache::retry::RetryPolicy;

use common::{
    MockTransport, PLAYER, api, aram_doc, ids_url, match_url, network_down, ok, quick_options,
    ranked_doc, seed, status, token,
};

fn acquirer(mock: &Arc<MockTransport>, mode: FetchMode) -> Acquirer {
    let api = api(mock);
    let fetcher = build_fetcher(mode, Arc::clone(&api), quick_options(), 4);
    Acquirer::new(api, fetcher, RetryPolicy::immediate())
}

fn request(min_matches: usize, fetch_count: usize) -> AcquireRequest {
    AcquireRequest {
        player_id: PLAYER.to_string(),
        min_matches,
        fetch_count,
        filter: FilterSpec::default(),
        refresh: false,
    }
}

fn listing(ids: &[&str]) -> serde_json::Value {
    json!(ids)
}

fn file_count(store: &CacheStore) -> usize {
    fs::read_dir(store.dir()).expect("read cache dir").count()
}

/// Cache: three ranked and two ARAM games. Provider lists ten ids; five are
/// new, of which four fetch and one fails.
fn scenario(store: &CacheStore) -> Arc<MockTransport> {
    seed(
        store,
        &[
            ranked_doc("EUW1_1", PLAYER),
            ranked_doc("EUW1_2", PLAYER),
            ranked_doc("EUW1_3", PLAYER),
            aram_doc("EUW1_4", PLAYER),
            aram_doc("EUW1_5", PLAYER),
        ],
    );
    let ids: Vec<String> = (1..=10).map(|n| format!("EUW1_{n}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let mock = Arc::new(MockTransport::new());
    mock.on(ids_url(PLAYER, 0, 10), ok(&listing(&id_refs)));
    for id in ["EUW1_6", "EUW1_7", "EUW1_8", "EUW1_9"] {
        mock.on(match_url(id), ok(&ranked_doc(id, PLAYER)));
    }
    mock.on(match_url("EUW1_10"), status(500));
    mock
}

#[test]
fn fetches_new_matches_until_recount() {
    for mode in [FetchMode::Concurrent, FetchMode::Sequential] {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());
        let mock = scenario(&store);

        let outcome = acquirer(&mock, mode)
            .ensure(&request(5, 10), Some(&token()), &store)
            .expect("acquire");
        assert_eq!((outcome.before, outcome.after), (3, 7), "{mode:?}");
        assert_eq!(outcome.listed, 10);
        assert_eq!(outcome.already_cached, 5);
        assert_eq!(outcome.written, 4);
        assert!(outcome.advisories.is_empty(), "{:?}", outcome.advisories);

        let report = outcome.report.expect("fetch report");
        assert_eq!(report.succeeded(), 4);
        assert_eq!(report.failed(), 1);
        assert_eq!(outcome.metrics.cache_hits, 5);
        assert_eq!(outcome.metrics.cache_misses, 5);
        assert_eq!(outcome.metrics.match_ids_requests, 1);
        assert_eq!(outcome.metrics.match_details_requests, 5);
        assert!(!store.has("EUW1_10"));
    }
}

#[test]
fn enough_cached_matches_skip_the_network() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    let docs: Vec<_> = (1..=6)
        .map(|n| ranked_doc(&format!("EUW1_{n}"), PLAYER))
        .collect();
    seed(&store, &docs);
    let mock = Arc::new(MockTransport::new());

    let outcome = acquirer(&mock, FetchMode::Concurrent)
        .ensure(&request(5, 10), Some(&token()), &store)
        .expect("acquire");
    assert_eq!((outcome.before, outcome.after), (6, 6));
    assert!(mock.calls().is_empty());
    assert!(outcome.report.is_none());
}

#[test]
fn second_run_converges_without_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    let mock = scenario(&store);
    let acquirer = acquirer(&mock, FetchMode::Concurrent);

    let first = acquirer
        .ensure(&request(20, 10), Some(&token()), &store)
        .expect("first run");
    let files = file_count(&store);
    let second = acquirer
        .ensure(&request(20, 10), Some(&token()), &store)
        .expect("second run");

    assert_eq!(second.before, first.after);
    assert_eq!(second.after, second.before);
    assert_eq!(second.written, 0);
    assert_eq!(file_count(&store), files);
    assert!(second.advisories.contains(&Advisory::NoNewMatches));
}

#[test]
fn cached_ids_are_never_requested() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    let mock = scenario(&store);
    acquirer(&mock, FetchMode::Sequential)
        .ensure(&request(5, 10), Some(&token()), &store)
        .expect("acquire");
    for n in 1..=5 {
        assert_eq!(mock.calls_to(&match_url(&format!("EUW1_{n}"))), 0);
    }
}

#[test]
fn duplicate_listing_entries_are_fetched_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    let mock = Arc::new(MockTransport::new());
    mock.on(
        ids_url(PLAYER, 0, 5),
        ok(&listing(&["EUW1_6", "EUW1_6", "EUW1_7"])),
    );
    mock.on(match_url("EUW1_6"), ok(&ranked_doc("EUW1_6", PLAYER)));
    mock.on(match_url("EUW1_7"), ok(&ranked_doc("EUW1_7", PLAYER)));

    let outcome = acquirer(&mock, FetchMode::Concurrent)
        .ensure(&request(5, 5), Some(&token()), &store)
        .expect("acquire");
    assert_eq!(outcome.listed, 2);
    assert_eq!(outcome.after, 2);
    assert_eq!(mock.calls_to(&match_url("EUW1_6")), 1);
    assert!(outcome.advisories.contains(&Advisory::BelowMinimum { have: 2, want: 5 }));
}

#[test]
fn network_outage_degrades_to_cached_data() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    seed(&store, &[ranked_doc("EUW1_1", PLAYER)]);
    let mock = Arc::new(MockTransport::new());
    mock.on(ids_url(PLAYER, 0, 10), network_down());

    let outcome = acquirer(&mock, FetchMode::Concurrent)
        .ensure(&request(5, 10), Some(&token()), &store)
        .expect("outage is not fatal");
    assert_eq!((outcome.before, outcome.after), (1, 1));
    assert!(matches!(outcome.advisories[0], Advisory::ListingFailed(_)));
    assert_eq!(mock.calls_to(&ids_url(PLAYER, 0, 10)), 2);
}

#[test]
fn every_fetch_failing_is_surfaced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    let mock = Arc::new(MockTransport::new());
    mock.on(ids_url(PLAYER, 0, 3), ok(&listing(&["EUW1_1", "EUW1_2", "EUW1_3"])));
    for id in ["EUW1_1", "EUW1_2", "EUW1_3"] {
        mock.on(match_url(id), network_down());
    }

    let outcome = acquirer(&mock, FetchMode::Concurrent)
        .ensure(&request(5, 3), Some(&token()), &store)
        .expect("acquire");
    assert_eq!((outcome.before, outcome.after), (0, 0));
    assert!(outcome.advisories.contains(&Advisory::AllFetchesFailed { attempted: 3 }));
    assert!(outcome.advisories.contains(&Advisory::NoNewMatches));
    assert!(store.list_cached().expect("list").is_empty());
}

#[test]
fn missing_credential_counts_offline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    seed(&store, &[ranked_doc("EUW1_1", PLAYER), ranked_doc("EUW1_2", PLAYER)]);
    let mock = Arc::new(MockTransport::new());

    let outcome = acquirer(&mock, FetchMode::Sequential)
        .ensure(&request(5, 10), None, &store)
        .expect("acquire");
    assert_eq!((outcome.before, outcome.after), (2, 2));
    assert_eq!(outcome.advisories[0], Advisory::MissingCredential);
    assert!(mock.calls().is_empty());
}

#[test]
fn rejected_credential_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    let mock = Arc::new(MockTransport::new());
    mock.on(ids_url(PLAYER, 0, 10), status(401));

    let err = acquirer(&mock, FetchMode::Concurrent)
        .ensure(&request(5, 10), Some(&ApiToken::new("RGAPI-expired").expect("token")), &store)
        .expect_err("auth failure");
    assert!(matches!(err, AcquireError::Auth(_)), "{err}");
    assert_eq!(mock.calls().len(), 1);
}

#[test]
fn blank_player_id_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    let mock = Arc::new(MockTransport::new());
    let mut req = request(5, 10);
    req.player_id = "   ".to_string();
    let err = acquirer(&mock, FetchMode::Sequential)
        .ensure(&req, Some(&token()), &store)
        .expect_err("invalid player");
    assert!(matches!(err, AcquireError::InvalidPlayer));
}

#[test]
fn listing_pages_and_stops_on_a_short_page() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    let first: Vec<String> = (0..100).map(|n| format!("EUW1_{}", 1000 + n)).collect();
    let second: Vec<String> = (0..20).map(|n| format!("EUW1_{}", 2000 + n)).collect();
    let mock = Arc::new(MockTransport::new());
    mock.on(ids_url(PLAYER, 0, 100), ok(&json!(first)));
    mock.on(ids_url(PLAYER, 100, 100), ok(&json!(second)));

    let outcome = acquirer(&mock, FetchMode::Concurrent)
        .ensure(&request(5, 250), Some(&token()), &store)
        .expect("acquire");
    assert_eq!(outcome.listed, 120);
    assert_eq!(mock.calls_to(&ids_url(PLAYER, 0, 100)), 1);
    assert_eq!(mock.calls_to(&ids_url(PLAYER, 100, 100)), 1);
    assert_eq!(mock.calls_to(&ids_url(PLAYER, 200, 50)), 0);
    assert_eq!(outcome.metrics.match_ids_requests, 2);
}

#[test]
fn filter_decides_what_counts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    seed(
        &store,
        &[
            aram_doc("EUW1_1", PLAYER),
            aram_doc("EUW1_2", PLAYER),
            ranked_doc("EUW1_3", PLAYER),
        ],
    );
    let mock = Arc::new(MockTransport::new());
    let mut req = request(3, 10);
    req.filter = FilterSpec::default().with_aram(true);

    let outcome = acquirer(&mock, FetchMode::Concurrent)
        .ensure(&req, Some(&token()), &store)
        .expect("acquire");
    assert_eq!((outcome.before, outcome.after), (3, 3));
    assert!(mock.calls().is_empty());
}

#[test]
fn corrupt_cached_record_is_fetched_again() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    fs::write(dir.path().join("EUW1_1.json"), "{truncated").expect("write garbage");
    let mock = Arc::new(MockTransport::new());
    mock.on(ids_url(PLAYER, 0, 1), ok(&listing(&["EUW1_1"])));
    mock.on(match_url("EUW1_1"), ok(&ranked_doc("EUW1_1", PLAYER)));
    let acquirer = acquirer(&mock, FetchMode::Sequential);

    let first = acquirer
        .ensure(&request(1, 1), Some(&token()), &store)
        .expect("first run");
    assert_eq!((first.before, first.after), (0, 1));
    assert_eq!(first.already_cached, 0);
    assert_eq!(first.written, 1);
    assert_eq!(mock.calls_to(&match_url("EUW1_1")), 1);
    assert!(store.read("EUW1_1").is_ok());

    let second = acquirer
        .ensure(&request(1, 1), Some(&token()), &store)
        .expect("second run");
    assert_eq!((second.before, second.after), (1, 1));
    assert_eq!(mock.calls_to(&match_url("EUW1_1")), 1);
}

#[test]
fn refresh_fetches_cached_ids_again() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    seed(&store, &[ranked_doc("EUW1_1", PLAYER), ranked_doc("EUW1_2", PLAYER)]);
    let mock = Arc::new(MockTransport::new());
    mock.on(ids_url(PLAYER, 0, 2), ok(&listing(&["EUW1_1", "EUW1_2"])));
    mock.on(match_url("EUW1_1"), ok(&ranked_doc("EUW1_1", PLAYER)));
    let mut updated = ranked_doc("EUW1_2", PLAYER);
    updated["info"]["gameDuration"] = json!(1800);
    mock.on(match_url("EUW1_2"), ok(&updated));
    let acquirer = acquirer(&mock, FetchMode::Concurrent);

    let cached = acquirer
        .ensure(&request(1, 2), Some(&token()), &store)
        .expect("cached run");
    assert_eq!((cached.before, cached.after), (2, 2));
    assert!(mock.calls().is_empty());

    let mut req = request(1, 2);
    req.refresh = true;
    let refreshed = acquirer
        .ensure(&req, Some(&token()), &store)
        .expect("refresh run");
    assert_eq!((refreshed.before, refreshed.after), (2, 2));
    assert_eq!(refreshed.already_cached, 0);
    assert_eq!(mock.calls_to(&match_url("EUW1_1")), 1);
    assert_eq!(mock.calls_to(&match_url("EUW1_2")), 1);
    assert_eq!(refreshed.unchanged, 1);
    assert_eq!(refreshed.written, 1);
    let stored = store.read("EUW1_2").expect("read refreshed");
    assert_eq!(stored.raw["info"]["gameDuration"], 1800);
}

#[test]
fn reported_duration_matches_wall_clock() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::new(dir.path());
    let mock = Arc::new(MockTransport::with_delay(Duration::from_millis(100)));
    let ids = ["EUW1_1", "EUW1_2", "EUW1_3", "EUW1_4"];
    mock.on(ids_url(PLAYER, 0, 4), ok(&listing(&ids)));
    for id in ids {
        mock.on(match_url(id), ok(&ranked_doc(id, PLAYER)));
    }

    let started = Instant::now();
    let outcome = acquirer(&mock, FetchMode::Sequential)
        .ensure(&request(5, 4), Some(&token()), &store)
        .expect("acquire");
    let wall = started.elapsed();

    let reported = outcome.metrics.duration.expect("duration recorded");
    assert!(reported <= wall, "reported {reported:?} > wall {wall:?}");
    assert!(reported >= Duration::from_millis(450), "reported {reported:?}");
    assert_eq!(outcome.metrics.match_ids_requests, 1);
    assert_eq!(outcome.metrics.match_details_requests, 4);
}
