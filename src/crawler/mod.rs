//! The Engine/Supervisor: owns every subsystem instance for the
//! duration of one crawl, drives worker lifecycle, and coordinates
//! shutdown (spec §4 final row, §5).

pub mod fetcher;
pub mod frontier;
pub mod passive;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::pool::{BrowserPool, BrowserPoolConfig, PoolError};
use crate::browser::renderer::PageRenderer;
use crate::config::Config;
use crate::crawler::fetcher::{FetcherConfig, HttpFetcher};
use crate::crawler::frontier::Frontier;
use crate::crawler::passive::PassiveDiscovery;
use crate::dedup::Deduplicator;
use crate::models::{
    now_millis, CrawlResult, CrawlStats, CrawlStatsSnapshot, CrawlerState, Form, QueueItem,
    WebSocketEndpoint,
};
use crate::ratelimit::{AdaptiveConfig, RateLimiter, RateLimiterConfig};
use crate::scope::{ScopeChecker, ScopeConfig, ScopeError};
use crate::sink::{AccumulatingSink, Sink};
use crate::state::{self, StateError};
use crate::worker::{self, SharedContext, WorkerConfig};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid scope configuration: {0}")]
    Scope(#[from] ScopeError),
    #[error("failed to launch browser pool: {0}")]
    Browser(#[from] PoolError),
    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// Owns every crawl subsystem instance for the duration of a crawl
/// (spec §3 Ownership). Generic over the sink implementation so callers
/// can supply a JSON-lines writer, a channel-backed sink, or a test
/// double without the engine depending on any one of them concretely.
pub struct CrawlEngine<S: Sink + 'static> {
    config: Config,
    frontier: Arc<Frontier>,
    dedup: Arc<Deduplicator>,
    scope: Arc<ScopeChecker>,
    rate_limiter: Arc<RateLimiter>,
    fetcher: HttpFetcher,
    browser_pool: Option<Arc<BrowserPool>>,
    renderer: Arc<PageRenderer>,
    passive: Arc<PassiveDiscovery>,
    sink: Arc<AccumulatingSink<S>>,
    stats: Arc<Mutex<CrawlStats>>,
    cancel: CancellationToken,
    started_at: u64,
}

impl<S: Sink + 'static> CrawlEngine<S> {
    /// Builds every subsystem from `config` without launching a
    /// browser. Browser support is opt-in via `with_browser` since
    /// launching a real headless process is expensive and many crawls
    /// (or tests) never need it.
    pub async fn new(config: Config, sink: S) -> Result<Self, EngineError> {
        let scope = Arc::new(ScopeChecker::new(
            &config.target,
            ScopeConfig {
                allowed_domains: config.scope.allowed_domains.clone(),
                include_patterns: config.scope.include_patterns.clone(),
                exclude_patterns: config.scope.exclude_patterns.clone(),
                max_depth: config.max_depth,
                follow_external: config.scope.follow_external,
            },
        )?);

        let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            rps: config.rate_limit.rps,
            burst: config.rate_limit.burst,
            per_domain_delay: config.rate_limit.per_domain_delay,
            adaptive: if config.rate_limit.adaptive {
                Some(AdaptiveConfig {
                    window: config.rate_limit.adaptive_window,
                    min_rate: config.rate_limit.adaptive_min_rate,
                    max_rate: config.rate_limit.adaptive_max_rate,
                })
            } else {
                None
            },
        }));

        let fetcher = HttpFetcher::new(FetcherConfig {
            timeout: config.timeout,
            user_agent: config.user_agent.clone(),
            default_headers: config.custom_headers.clone(),
            max_redirects: 10,
            ignore_tls_errors: config.browser.ignore_https_errors,
            pool_max_idle_per_host: 20,
            max_body_bytes: 5 * 1024 * 1024,
        });

        let browser_pool = if config.browser.enabled {
            Some(
                BrowserPool::launch(BrowserPoolConfig {
                    pool_size: config.browser.pool_size,
                    headless: config.browser.headless,
                    recycle_after: config.browser.recycle_after,
                    ignore_https_errors: config.browser.ignore_https_errors,
                })
                .await?,
            )
        } else {
            None
        };

        let frontier = Arc::new(Frontier::new(0));
        frontier.push(QueueItem::seed(config.target.clone())).ok();

        Ok(CrawlEngine {
            renderer: Arc::new(PageRenderer::new(config.browser.max_retries)),
            sink: Arc::new(AccumulatingSink::new(sink)),
            stats: Arc::new(Mutex::new(CrawlStats::default())),
            cancel: CancellationToken::new(),
            started_at: now_millis(),
            dedup: Arc::new(Deduplicator::new()),
            passive: Arc::new(PassiveDiscovery::new()),
            frontier,
            scope,
            rate_limiter,
            fetcher,
            browser_pool,
            config,
        })
    }

    /// Reloads a persisted snapshot into a fresh engine instance (spec
    /// §6.5 "Loading"): queued URLs are pushed back onto the frontier,
    /// visited URLs are loaded into the dedup filter, and prior records
    /// are merged into this crawl's accumulator via the sink so a final
    /// `CrawlResult` still reflects them.
    pub async fn load_state(&self, path: &str) -> Result<(), EngineError> {
        let snapshot = state::load(path).await?;

        self.dedup.add_batch(&snapshot.visited_urls);

        let mut restored = Vec::with_capacity(snapshot.queue_urls.len());
        for mut item in snapshot.queue_urls {
            if item.depth == 0 && !item.parent_url.is_empty() {
                item.depth = 1;
            }
            restored.push(item);
        }
        self.frontier.push_batch(restored).ok();

        for endpoint in &snapshot.endpoints {
            let _ = self
                .sink
                .write_endpoint(&crate::models::EndpointRecord::from(endpoint))
                .await;
        }
        for form in &snapshot.forms {
            let _ = self
                .sink
                .write_form(&crate::models::FormRecord::from_form(form, now_millis()))
                .await;
        }
        for ws in &snapshot.websockets {
            let _ = self
                .sink
                .write_websocket(&crate::models::WebSocketRecord::from(ws))
                .await;
        }

        let mut stats = self.stats.lock().await;
        stats.endpoints_found = snapshot.stats.endpoints_found;
        stats.forms_found = snapshot.stats.forms_found;
        stats.websockets_found = snapshot.stats.websockets_found;
        stats.pages_crawled = snapshot.stats.pages_crawled;
        stats.urls_discovered = snapshot.stats.urls_discovered;
        stats.bytes_transferred = snapshot.stats.bytes_transferred;

        Ok(())
    }

    /// Writes a resumable snapshot of current progress to `path` (see
    /// §6.5). Safe to call mid-crawl; readers only ever see a
    /// point-in-time view, and stat counters are allowed to be mildly
    /// inconsistent across each other at any such snapshot (see §9).
    pub async fn save_state(&self) -> Result<(), EngineError> {
        let Some(path) = &self.config.state.path else {
            return Ok(());
        };
        let stats = self.stats.lock().await;
        let snapshot = CrawlerState {
            target: self.config.target.clone(),
            started_at: self.started_at,
            updated_at: now_millis(),
            stats: CrawlStatsSnapshot::from(&*stats),
            queue_urls: self
                .frontier
                .urls()
                .into_iter()
                .map(QueueItem::seed)
                .collect(),
            visited_urls: self.dedup.urls(),
            endpoints: self.passive.snapshot(),
            forms: Vec::<Form>::new(),
            websockets: Vec::<WebSocketEndpoint>::new(),
            errors: self.sink.errors(),
            config: serde_json::json!({
                "workers": self.config.workers,
                "max_depth": self.config.max_depth,
            }),
        };
        state::save(path, &snapshot).await?;
        Ok(())
    }

    /// Runs the crawl to completion: spawns `W` workers, waits for them
    /// to idle out or for cancellation, then finalizes and shuts down
    /// (spec §4.11 Termination, §5 shutdown procedure).
    pub async fn run(self: Arc<Self>) -> CrawlResult {
        let worker_count = match &self.browser_pool {
            Some(pool) => self.config.workers.min(pool.pool_stats().size.max(1)),
            None => self.config.workers,
        }
        .max(1);

        info!(workers = worker_count, target = %self.config.target, "starting crawl");

        let shared = Arc::new(SharedContext {
            frontier: self.frontier.clone(),
            dedup: self.dedup.clone(),
            scope: self.scope.clone(),
            rate_limiter: self.rate_limiter.clone(),
            fetcher: self.fetcher.clone(),
            browser_pool: self.browser_pool.clone(),
            renderer: self.renderer.clone(),
            passive: self.passive.clone(),
            sink: self.sink.clone() as Arc<dyn Sink>,
            stats: Mutex::new(CrawlStats::default()),
            cookies: Mutex::new(HashMap::new()),
            endpoint_seen: Mutex::new(Default::default()),
            websocket_seen: Mutex::new(Default::default()),
            cancel: self.cancel.clone(),
            config: WorkerConfig {
                batch_size: 5,
                max_empty_rounds: 15,
                empty_backoff_base: Duration::from_millis(100),
                empty_backoff_cap: Duration::from_secs(2),
                fast_mode: self.config.fast_mode,
                spa_mode: true,
                passive_discovery: self.config.passive_api_discovery,
                form_analysis: self.config.form_analysis,
                js_analysis: self.config.js_analysis,
                headers: self.config.custom_headers.clone(),
            },
        });

        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            let ctx = shared.clone();
            workers.spawn(async move { worker::run_worker(ctx, id).await });
        }

        let shutdown_budget = self.config.shutdown_budget;
        tokio::select! {
            _ = drain(&mut workers) => {
                info!("all workers idled out, crawl complete");
            }
            _ = self.cancel.cancelled() => {
                warn!("crawl cancelled, waiting for workers to stop");
                if tokio::time::timeout(shutdown_budget, drain(&mut workers))
                    .await
                    .is_err()
                {
                    warn!("graceful shutdown budget exceeded, aborting remaining workers");
                    workers.abort_all();
                }
            }
        }

        self.merge_worker_stats(&shared).await;
        self.finalize().await
    }

    async fn merge_worker_stats(&self, shared: &SharedContext) {
        let worker_stats = shared.stats.lock().await;
        let mut stats = self.stats.lock().await;
        stats.pages_crawled += worker_stats.pages_crawled;
        stats.urls_discovered += worker_stats.urls_discovered;
        stats.endpoints_found += worker_stats.endpoints_found;
        stats.forms_found += worker_stats.forms_found;
        stats.websockets_found += worker_stats.websockets_found;
        stats.errors += worker_stats.errors;
        stats.bytes_transferred += worker_stats.bytes_transferred;
        for (idx, count) in worker_stats.response_time_buckets.iter().enumerate() {
            stats.response_time_buckets[idx] += count;
        }
    }

    /// Signals every worker to stop at its next loop head, closes the
    /// frontier so blocked waiters observe terminal state, and returns
    /// all leased browser pages before the pool itself is closed (spec
    /// §5 shutdown procedure).
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.frontier.close();
        if let Some(pool) = &self.browser_pool {
            pool.close().await;
        }
    }

    async fn finalize(&self) -> CrawlResult {
        self.frontier.close();
        if let Some(pool) = &self.browser_pool {
            pool.close().await;
        }

        let stats = self.stats.lock().await;
        let result = CrawlResult {
            target: self.config.target.clone(),
            started_at: self.started_at,
            completed_at: Some(now_millis()),
            stats: CrawlStatsSnapshot::from(&*stats),
            endpoints: self.sink.endpoints(),
            forms: self.sink.forms(),
            websockets: self.sink.websockets(),
            errors: self.sink.errors(),
        };

        if let Err(err) = self.sink.write_result(&result).await {
            warn!(error = %err, "failed to write final crawl result");
        }
        let _ = self.sink.flush().await;
        let _ = self.sink.close().await;

        result
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn stats_snapshot(&self) -> CrawlStatsSnapshot {
        CrawlStatsSnapshot::from(&*self.stats.lock().await)
    }
}

async fn drain(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(err) = result {
            warn!(error = %err, "worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrawlError as CrawlErrorRecord, EndpointRecord, FormRecord, WebSocketRecord};
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl Sink for NullSink {
        async fn write_endpoint(&self, _: &EndpointRecord) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
        async fn write_form(&self, _: &FormRecord) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
        async fn write_websocket(&self, _: &WebSocketRecord) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
        async fn write_error(&self, _: &CrawlErrorRecord) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
        async fn write_result(&self, _: &CrawlResult) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
        async fn flush(&self) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        let mut config = Config::from_env("https://a.test/").unwrap();
        config.browser.enabled = false;
        config.workers = 2;
        config
    }

    #[tokio::test]
    async fn test_engine_seeds_frontier_on_construction() {
        let engine = CrawlEngine::new(test_config(), NullSink).await.unwrap();
        assert_eq!(engine.frontier.len(), 1);
        assert!(engine.frontier.contains(&crate::normalize::normalize("https://a.test/")));
    }

    #[tokio::test]
    async fn test_engine_runs_to_completion_with_no_fetcher_reachable() {
        // No real network is reachable in a unit-test sandbox; the
        // fetch itself fails, which the worker records as a
        // `CrawlError` rather than aborting the crawl (spec §7).
        let engine = Arc::new(CrawlEngine::new(test_config(), NullSink).await.unwrap());
        let result = engine.run().await;
        assert_eq!(result.target, "https://a.test/");
        assert!(result.completed_at.is_some());
    }
}
