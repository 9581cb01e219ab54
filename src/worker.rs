//! Per-worker scheduling loop: pop a batch from the frontier, apply
//! scope/visited/rate-limit gates, fetch (HTTP first, browser fallback),
//! extract, and push discovered work back onto the frontier (spec §4.11).

use crate::browser::pool::BrowserPool;
use crate::browser::renderer::{detect_frameworks, PageRenderer, RenderOptions};
use crate::crawler::fetcher::HttpFetcher;
use crate::crawler::frontier::Frontier;
use crate::crawler::passive::PassiveDiscovery;
use crate::dedup::Deduplicator;
use crate::extract::{html as extract_html, js as extract_js};
use crate::models::{
    now_millis, CrawlError, CrawlStats, DiscoveredEndpoint, EndpointRecord, EndpointSource,
    FormRecord, ParamLocation, Parameter, QueueItem, WebSocketEndpoint, WebSocketRecord,
};
use crate::ratelimit::RateLimiter;
use crate::scope::ScopeChecker;
use crate::sink::Sink;
use scraper::{Html, Selector};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

const AUTH_PATH_MARKERS: &[&str] = &["login", "signin", "sso", "oauth"];
const SOFT_ERROR_PATTERNS: &[&str] = &[
    "page not found",
    "404 not found",
    "page does not exist",
    "we couldn't find that page",
];
const MAX_EXTERNAL_SCRIPTS_ANALYZED: usize = 20;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub max_empty_rounds: u32,
    pub empty_backoff_base: Duration,
    pub empty_backoff_cap: Duration,
    pub fast_mode: bool,
    pub spa_mode: bool,
    pub passive_discovery: bool,
    pub form_analysis: bool,
    pub js_analysis: bool,
    pub headers: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            batch_size: 5,
            max_empty_rounds: 15,
            empty_backoff_base: Duration::from_millis(100),
            empty_backoff_cap: Duration::from_secs(2),
            fast_mode: false,
            spa_mode: true,
            passive_discovery: true,
            form_analysis: true,
            js_analysis: true,
            headers: HashMap::new(),
        }
    }
}

/// Everything a worker needs, shared across the pool via `Arc`. One
/// instance backs every worker spawned by the engine.
pub struct SharedContext {
    pub frontier: Arc<Frontier>,
    pub dedup: Arc<Deduplicator>,
    pub scope: Arc<ScopeChecker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub fetcher: HttpFetcher,
    pub browser_pool: Option<Arc<BrowserPool>>,
    pub renderer: Arc<PageRenderer>,
    pub passive: Arc<PassiveDiscovery>,
    pub sink: Arc<dyn Sink>,
    pub stats: Mutex<CrawlStats>,
    pub cookies: Mutex<HashMap<String, String>>,
    pub endpoint_seen: Mutex<HashSet<String>>,
    pub websocket_seen: Mutex<HashSet<String>>,
    pub cancel: CancellationToken,
    pub config: WorkerConfig,
}

/// Runs until the frontier closes, the cancellation token fires, or this
/// worker observes `max_empty_rounds` consecutive empty polls while the
/// frontier itself is empty.
pub async fn run_worker(ctx: Arc<SharedContext>, worker_id: usize) {
    let mut empty_rounds: u32 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            debug!(worker_id, "worker cancelled");
            return;
        }

        let items = match ctx.frontier.pop_batch(ctx.config.batch_size) {
            Ok(items) => items,
            Err(_closed) => {
                debug!(worker_id, "frontier closed");
                return;
            }
        };

        if items.is_empty() {
            if ctx.frontier.is_empty() {
                empty_rounds += 1;
                if empty_rounds >= ctx.config.max_empty_rounds {
                    debug!(worker_id, "worker idling out after max empty rounds");
                    return;
                }
                tokio::time::sleep(progressive_backoff(&ctx.config, empty_rounds)).await;
            }
            continue;
        }
        empty_rounds = 0;

        for item in items {
            if ctx.cancel.is_cancelled() {
                return;
            }

            let normalized = crate::normalize::normalize(&item.url);
            if !ctx.scope.in_scope(&item.url, item.depth) {
                continue;
            }
            if ctx.dedup.has_seen(&normalized) {
                continue;
            }

            let Some(host) = Url::parse(&item.url).ok().and_then(|u| u.host_str().map(String::from))
            else {
                continue;
            };
            if ctx
                .rate_limiter
                .wait_domain(&ctx.cancel, &host)
                .await
                .is_err()
            {
                return;
            }

            process_item(&ctx, item, &normalized).await;
        }
    }
}

fn progressive_backoff(config: &WorkerConfig, round: u32) -> Duration {
    let scaled = config.empty_backoff_base.saturating_mul(round.min(32));
    scaled.min(config.empty_backoff_cap)
}

struct FetchedPage {
    final_url: String,
    status_code: u16,
    content_type: String,
    html: String,
    content_hash: String,
    xhr_requests: Vec<crate::models::InterceptedRequest>,
    cookies: HashMap<String, String>,
    is_soft_error: bool,
    is_auth_redirect: bool,
    duration_ms: u64,
    bytes: u64,
}

async fn process_item(ctx: &Arc<SharedContext>, item: QueueItem, normalized: &str) {
    ctx.dedup.add(normalized);

    let page = match fetch_page(ctx, &item).await {
        Ok(page) => page,
        Err(err) => {
            let domain = Url::parse(&item.url)
                .ok()
                .and_then(|u| u.host_str().map(String::from))
                .unwrap_or_default();
            ctx.rate_limiter.record_error(&domain);
            ctx.stats.lock().await.errors += 1;
            let _ = ctx
                .sink
                .write_error(&CrawlError {
                    url: item.url.clone(),
                    error: err,
                    timestamp: now_millis(),
                })
                .await;
            return;
        }
    };

    {
        let mut stats = ctx.stats.lock().await;
        stats.pages_crawled += 1;
        stats.bytes_transferred += page.bytes;
        stats.record_response_time(page.duration_ms);
    }

    if !page.cookies.is_empty() {
        ctx.cookies.lock().await.extend(page.cookies.clone());
    }

    if !is_http_success(page.status_code) {
        ctx.stats.lock().await.errors += 1;
        let _ = ctx
            .sink
            .write_error(&CrawlError {
                url: item.url.clone(),
                error: format!("HTTP {}", page.status_code),
                timestamp: now_millis(),
            })
            .await;
        return;
    }

    if page.is_soft_error {
        ctx.stats.lock().await.errors += 1;
        let _ = ctx
            .sink
            .write_error(&CrawlError {
                url: item.url.clone(),
                error: "soft error: page content suggests not-found".to_string(),
                timestamp: now_millis(),
            })
            .await;
        // A soft-404 still links elsewhere; fall through to extraction
        // instead of returning (spec §4.11 step 4).
    }

    if page.is_auth_redirect {
        ctx.stats.lock().await.errors += 1;
        let _ = ctx
            .sink
            .write_error(&CrawlError {
                url: item.url.clone(),
                error: format!("auth redirect to {}", page.final_url),
                timestamp: now_millis(),
            })
            .await;
        return;
    }

    let digest = page.content_hash.clone();
    if let Some(original) = ctx.dedup.has_duplicate_content(normalized, &digest) {
        debug!(url = %item.url, original = %original, "skipping near-duplicate content");
        return;
    }
    ctx.dedup.set_content_hash(normalized, &digest);

    if ctx.config.passive_discovery && !page.xhr_requests.is_empty() {
        emit_passive_endpoints(ctx, &page, &item).await;
    }

    if !page.content_type.contains("text/html") {
        return;
    }

    let extraction = extract_html::extract(&page.html, &page.final_url, item.depth);

    let mut children = Vec::new();
    for link in &extraction.links {
        let next_depth = item.depth + 1;
        if !ctx.scope.in_scope(&link.url, next_depth) {
            continue;
        }
        let link_normalized = crate::normalize::normalize(&link.url);
        if ctx.dedup.has_seen(&link_normalized) || ctx.frontier.contains(&link_normalized) {
            continue;
        }
        children.push(QueueItem::child(link.url.clone(), &item, 0));
    }
    if !children.is_empty() {
        let added = ctx.frontier.push_batch(children).unwrap_or(0);
        ctx.stats.lock().await.urls_discovered += added as u64;
    }

    if ctx.config.form_analysis && !extraction.forms.is_empty() {
        let mut stats = ctx.stats.lock().await;
        for form in &extraction.forms {
            let _ = ctx
                .sink
                .write_form(&FormRecord::from_form(form, now_millis()))
                .await;
            stats.forms_found += 1;
        }
    }

    if ctx.config.js_analysis && !ctx.config.fast_mode {
        analyze_scripts(ctx, &page, &item).await;
    }
}

/// HTTP-first with a browser fallback keyed on a cheap `needs_js`
/// heuristic, except for hash-routed URLs which always go straight to
/// the browser's hash-route navigation (spec §4.11 step 3).
async fn fetch_page(ctx: &Arc<SharedContext>, item: &QueueItem) -> Result<FetchedPage, String> {
    if crate::normalize::has_routing_fragment(&item.url) {
        if let Some(pool) = &ctx.browser_pool {
            if let Ok(parsed) = Url::parse(&item.url) {
                let mut base = parsed.clone();
                base.set_fragment(None);
                let hash_route = parsed.fragment().unwrap_or("");
                return render_with_browser(ctx, pool, item, Some((base.to_string(), hash_route.to_string())))
                    .await;
            }
        }
    }

    let http = ctx
        .fetcher
        .get(&item.url)
        .await
        .map_err(|e| e.to_string())?;

    let requires_js = needs_js(&http.content_type, http.html.len(), &http.html);

    if requires_js && !ctx.config.fast_mode {
        if let Some(pool) = &ctx.browser_pool {
            match render_with_browser(ctx, pool, item, None).await {
                Ok(rendered) => return Ok(rendered),
                Err(err) => {
                    warn!(url = %item.url, error = %err, "browser render failed, using HTTP result");
                }
            }
        }
    }

    Ok(http_to_fetched_page(http, item.url.clone()))
}

async fn render_with_browser(
    ctx: &Arc<SharedContext>,
    pool: &Arc<BrowserPool>,
    item: &QueueItem,
    hash_route: Option<(String, String)>,
) -> Result<FetchedPage, String> {
    let mut handle = pool
        .lease(&ctx.cancel)
        .await
        .map_err(|e| e.to_string())?;
    let cookies = ctx.cookies.lock().await.clone();
    let options = RenderOptions {
        fast_mode: ctx.config.fast_mode,
        spa_mode: ctx.config.spa_mode,
        enable_stealth: false,
        check_soft_error: true,
        navigation_timeout: None,
    };

    let result = match &hash_route {
        Some((base_url, route)) => {
            ctx.renderer
                .visit_hash_route(&mut handle, base_url, route, &ctx.config.headers, &cookies, &options)
                .await
        }
        None => {
            ctx.renderer
                .visit(&mut handle, &item.url, &ctx.config.headers, &cookies, &options)
                .await
        }
    };
    handle.release().await;

    let page_result = result.map_err(|e| e.to_string())?;
    Ok(FetchedPage {
        final_url: page_result.final_url,
        status_code: page_result.status_code,
        content_type: page_result.content_type,
        bytes: page_result.html.len() as u64,
        html: page_result.html,
        content_hash: page_result.content_hash,
        xhr_requests: page_result.xhr_requests,
        cookies: page_result.cookies,
        is_soft_error: page_result.is_soft_error,
        is_auth_redirect: page_result.is_auth_redirect,
        duration_ms: page_result.duration_ms,
    })
}

fn http_to_fetched_page(
    http: crate::crawler::fetcher::HttpResult,
    requested_url: String,
) -> FetchedPage {
    use sha2::{Digest, Sha256};
    let content_hash = {
        let mut hasher = Sha256::new();
        hasher.update(http.html.as_bytes());
        hex::encode(hasher.finalize())
    };
    let is_soft_error = is_http_success(http.status_code) && matches_soft_error(&http.html, http.title.as_deref());
    let is_auth_redirect = looks_like_auth_redirect(&requested_url, &http.final_url);

    FetchedPage {
        final_url: http.final_url,
        status_code: http.status_code,
        content_type: http.content_type,
        bytes: http.html.len() as u64,
        html: http.html,
        content_hash,
        xhr_requests: Vec::new(),
        cookies: HashMap::new(),
        is_soft_error,
        is_auth_redirect,
        duration_ms: http.duration.as_millis() as u64,
    }
}

/// Non-HTML responses never need a browser. A very small body, or a
/// recognized SPA framework signature, or an almost-empty body padded
/// out with many `<script>` tags, suggests the markup is a shell that
/// client-side JS fills in (spec §4.11 `needs_js`).
fn needs_js(content_type: &str, body_len: usize, html: &str) -> bool {
    if !content_type.contains("text/html") {
        return false;
    }
    if body_len < 500 {
        return true;
    }
    if !detect_frameworks(html).is_empty() {
        return true;
    }
    if body_len < 2000 {
        let script_tags = html.matches("<script").count();
        if script_tags > 5 {
            return true;
        }
    }
    false
}

fn is_http_success(status: u16) -> bool {
    (200..300).contains(&status)
}

fn matches_soft_error(html: &str, title: Option<&str>) -> bool {
    let lower_html = html.to_ascii_lowercase();
    if SOFT_ERROR_PATTERNS.iter().any(|p| lower_html.contains(p)) {
        return true;
    }
    if html.len() < 2000 {
        if let Some(title) = title {
            let lower = title.to_ascii_lowercase();
            return lower.contains("not found");
        }
    }
    false
}

fn looks_like_auth_redirect(requested_url: &str, final_url: &str) -> bool {
    let (Ok(final_parsed), Ok(requested_parsed)) =
        (Url::parse(final_url), Url::parse(requested_url))
    else {
        return false;
    };
    let path_lower = final_parsed.path().to_ascii_lowercase();
    if !AUTH_PATH_MARKERS.iter().any(|m| path_lower.contains(m)) {
        return false;
    }
    final_parsed.host_str() != requested_parsed.host_str()
        || final_parsed.path() != requested_parsed.path()
}

async fn emit_passive_endpoints(ctx: &Arc<SharedContext>, page: &FetchedPage, item: &QueueItem) {
    let discovered = ctx.passive.process_requests(
        &page.xhr_requests,
        &item.url,
        item.depth,
        now_millis(),
    );
    if discovered.is_empty() {
        return;
    }
    let mut stats = ctx.stats.lock().await;
    for endpoint in &discovered {
        let _ = ctx.sink.write_endpoint(&EndpointRecord::from(endpoint)).await;
        stats.endpoints_found += 1;
    }

    for request in &page.xhr_requests {
        if request.resource_type.eq_ignore_ascii_case("websocket") {
            emit_websocket(ctx, &request.url, &item.url, &mut stats).await;
        }
    }
}

async fn emit_websocket(
    ctx: &Arc<SharedContext>,
    url: &str,
    discovered_from: &str,
    stats: &mut CrawlStats,
) {
    let mut seen = ctx.websocket_seen.lock().await;
    if !seen.insert(url.to_string()) {
        return;
    }
    drop(seen);
    let record = WebSocketRecord::from(&WebSocketEndpoint {
        url: url.to_string(),
        discovered_from: discovered_from.to_string(),
        protocols: None,
        sample_messages: Vec::new(),
        timestamp: now_millis(),
    });
    let _ = ctx.sink.write_websocket(&record).await;
    stats.websockets_found += 1;
}

/// Runs JS extraction over inline `<script>` bodies always, and over
/// external `<script src>` bodies (fetched separately, capped) unless
/// fast mode is on (spec §4.11 step 8 / §4.10).
async fn analyze_scripts(ctx: &Arc<SharedContext>, page: &FetchedPage, item: &QueueItem) {
    let document = Html::parse_document(&page.html);
    let Ok(script_sel) = Selector::parse("script") else {
        return;
    };

    let mut inline_bodies = Vec::new();
    let mut external_srcs = Vec::new();
    let base = Url::parse(&page.final_url).ok();

    for el in document.select(&script_sel) {
        if let Some(src) = el.value().attr("src") {
            if let Some(base) = &base {
                if let Ok(resolved) = base.join(src) {
                    external_srcs.push(resolved.to_string());
                }
            }
        } else {
            let body = el.text().collect::<String>();
            if !body.trim().is_empty() {
                inline_bodies.push(body);
            }
        }
    }

    for body in &inline_bodies {
        emit_js_extraction(ctx, &extract_js::extract(body), item).await;
    }

    for src in external_srcs.into_iter().take(MAX_EXTERNAL_SCRIPTS_ANALYZED) {
        if let Ok(fetched) = ctx.fetcher.get(&src).await {
            emit_js_extraction(ctx, &extract_js::extract(&fetched.html), item).await;
        }
    }
}

async fn emit_js_extraction(
    ctx: &Arc<SharedContext>,
    extraction: &extract_js::JsExtraction,
    item: &QueueItem,
) {
    let mut stats = ctx.stats.lock().await;

    for call in &extraction.api_calls {
        let Some(resolved) = Url::parse(&item.url).ok().and_then(|b| b.join(&call.url).ok())
        else {
            continue;
        };
        let key = format!("{} {}", call.method, resolved.path());
        {
            let mut seen = ctx.endpoint_seen.lock().await;
            if !seen.insert(key) {
                continue;
            }
        }
        let mut parameters: Vec<Parameter> = call
            .path_params
            .iter()
            .map(|name| Parameter {
                name: name.clone(),
                location: ParamLocation::Path,
                example: None,
            })
            .collect();
        parameters.extend(call.query_params.iter().map(|name| Parameter {
            name: name.clone(),
            location: ParamLocation::Query,
            example: None,
        }));

        let endpoint = DiscoveredEndpoint {
            url: resolved.to_string(),
            method: call.method.clone(),
            source: EndpointSource::Js,
            parameters,
            headers: HashMap::new(),
            discovered_from: item.url.clone(),
            status_code: None,
            content_type: None,
            first_seen: now_millis(),
            hit_count: 1,
            depth: item.depth,
        };
        let _ = ctx.sink.write_endpoint(&EndpointRecord::from(&endpoint)).await;
        stats.endpoints_found += 1;
    }

    for ws_url in &extraction.websockets {
        emit_websocket(ctx, ws_url, &item.url, &mut stats).await;
    }

    for secret in &extraction.secrets {
        warn!(url = %item.url, kind = %secret.kind, value = %secret.masked_value, "possible secret in script");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_js_small_body() {
        assert!(needs_js("text/html", 100, "<html></html>"));
    }

    #[test]
    fn test_needs_js_framework_signature() {
        let html = "x".repeat(3000) + r#"<div data-reactroot=""></div>"#;
        assert!(needs_js("text/html", html.len(), &html));
    }

    #[test]
    fn test_needs_js_false_for_json() {
        assert!(!needs_js("application/json", 10, "{}"));
    }

    #[test]
    fn test_needs_js_normal_page_false() {
        let html = format!("<html><body>{}</body></html>", "content ".repeat(400));
        assert!(!needs_js("text/html", html.len(), &html));
    }

    #[test]
    fn test_progressive_backoff_caps() {
        let config = WorkerConfig::default();
        let backoff = progressive_backoff(&config, 1000);
        assert_eq!(backoff, config.empty_backoff_cap);
    }

    #[test]
    fn test_auth_redirect_detection() {
        assert!(looks_like_auth_redirect(
            "https://a.test/dashboard",
            "https://a.test/login"
        ));
        assert!(!looks_like_auth_redirect(
            "https://a.test/dashboard",
            "https://a.test/dashboard"
        ));
    }
}
