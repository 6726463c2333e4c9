#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

use lol_match_cache::api::{ApiToken, Endpoints, RiotApi, TOKEN_HEADER};
use lol_match_cache::cache::CacheStore;
use lol_match_cache::error::ApiError;
use lol_match_cache::fetcher::FetchOptions;
use lol_match_cache::http_client::{RawResponse, Transport};
use lol_match_cache::retry::RetryPolicy;

pub const BASE: &str = "http://mock.local";
pub const PLAYER: &str = "puuid-frowtch";

pub type Reply = Result<RawResponse, ApiError>;

/// Scripted provider. Each URL has a queue of replies; the last reply is
/// sticky. Unknown URLs answer 404.
#[derive(Default)]
pub struct MockTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn on(&self, url: impl Into<String>, reply: Reply) -> &Self {
        self.replies
            .lock()
            .expect("replies lock")
            .entry(url.into())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == url).count()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<RawResponse, ApiError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().expect("calls lock").push(url.to_string());
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let reply = if !headers.iter().any(|(name, _)| *name == TOKEN_HEADER) {
            status(401)
        } else {
            let mut replies = self.replies.lock().expect("replies lock");
            match replies.get_mut(url) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| status(404)),
                Some(queue) => queue.front().cloned().unwrap_or_else(|| status(404)),
                None => status(404),
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

pub fn ok(body: &Value) -> Reply {
    Ok(RawResponse {
        status: 200,
        retry_after: None,
        body: body.to_string(),
    })
}

pub fn status(code: u16) -> Reply {
    Ok(RawResponse {
        status: code,
        retry_after: None,
        body: String::new(),
    })
}

pub fn throttled(retry_after_secs: u64) -> Reply {
    Ok(RawResponse {
        status: 429,
        retry_after: Some(Duration::from_secs(retry_after_secs)),
        body: String::new(),
    })
}

pub fn network_down() -> Reply {
    Err(ApiError::Network("connection refused".to_string()))
}

pub fn endpoints() -> Endpoints {
    Endpoints::single(BASE)
}

pub fn api(mock: &Arc<MockTransport>) -> Arc<RiotApi> {
    let transport: Arc<dyn Transport> = mock.clone();
    Arc::new(RiotApi::new(transport, endpoints()))
}

pub fn token() -> ApiToken {
    ApiToken::new("RGAPI-test").expect("test token")
}

pub fn quick_options() -> FetchOptions {
    FetchOptions {
        retry: RetryPolicy::immediate(),
        ..FetchOptions::default()
    }
}

pub fn match_doc(match_id: &str, puuid: &str, queue_id: i64, mode: &str) -> Value {
    json!({
        "metadata": {
            "matchId": match_id,
            "participants": [puuid, "puuid-other"],
        },
        "info": {
            "gameId": match_id.rsplit('_').next().and_then(|n| n.parse::<i64>().ok()).unwrap_or(1),
            "queueId": queue_id,
            "gameMode": mode,
            "participants": [
                {"puuid": puuid, "championName": "Ahri", "win": true},
                {"puuid": "puuid-other", "championName": "Zed", "win": false},
            ],
        },
    })
}

pub fn ranked_doc(match_id: &str, puuid: &str) -> Value {
    match_doc(match_id, puuid, 420, "CLASSIC")
}

pub fn aram_doc(match_id: &str, puuid: &str) -> Value {
    match_doc(match_id, puuid, 450, "ARAM")
}

pub fn ids_url(puuid: &str, start: usize, count: usize) -> String {
    endpoints().match_ids_url(puuid, start, count)
}

pub fn match_url(match_id: &str) -> String {
    endpoints().match_url(match_id)
}

pub fn timeline_url(match_id: &str) -> String {
    endpoints().timeline_url(match_id)
}

pub fn account_url(name: &str, tag: &str) -> String {
    endpoints().account_url(name, tag)
}

pub fn seed(store: &CacheStore, docs: &[Value]) {
    for doc in docs {
        let id = doc["metadata"]["matchId"].as_str().expect("doc has matchId");
        store.write(id, doc).expect("seed cache");
    }
}

pub fn fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}
