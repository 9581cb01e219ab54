//! A concurrent discovery engine for security-oriented web application
//! crawling: frontier, dedup, scope, rate limiting, an HTTP fetcher with
//! a headless-browser fallback, passive API discovery, HTML/JS
//! extraction, and the worker scheduler that drives them, all owned by
//! a single [`crawler::CrawlEngine`].

pub mod browser;
pub mod config;
pub mod crawler;
pub mod dedup;
pub mod extract;
pub mod models;
pub mod normalize;
pub mod ratelimit;
pub mod scope;
pub mod sink;
pub mod state;
pub mod worker;

pub use config::Config;
pub use crawler::{CrawlEngine, EngineError};
pub use models::{CrawlResult, CrawlerState};
pub use sink::{JsonLinesSink, Sink, SinkError};
