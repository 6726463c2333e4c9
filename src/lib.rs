pub mod acquire;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod http_client;
pub mod logging;
pub mod metrics;
pub mod resolver;
pub mod retry;
