use crawlcore::{CrawlEngine, Config, JsonLinesSink};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let target = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CRAWL_TARGET").ok())
        .expect("usage: crawlcore <target-url> (or set CRAWL_TARGET)");

    let config = Config::from_env(target).expect("failed to load configuration from environment");

    tracing::info!(target = %config.target, workers = config.workers, "starting crawl");

    let sink = JsonLinesSink::new(tokio::io::stdout());
    let engine = Arc::new(
        CrawlEngine::new(config, sink)
            .await
            .expect("failed to initialize crawl engine"),
    );

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received interrupt, shutting down");
            cancel.cancel();
        }
    });

    let result = engine.run().await;
    tracing::info!(
        pages_crawled = result.stats.pages_crawled,
        endpoints_found = result.stats.endpoints_found,
        errors = result.stats.errors,
        "crawl finished"
    );
}
