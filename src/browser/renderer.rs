//! Navigates a leased browser page, intercepts network traffic, and
//! extracts the artifacts the worker needs (spec §4.8).

use crate::browser::pool::PageHandle;
use crate::models::{FetchMode, Form, InterceptedRequest, Link, PageResult};
use chromiumoxide::cdp::browser_protocol::network::EventRequestWillBeSent;
use chromiumoxide::Page;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("navigation timed out")]
    Timeout,
    #[error("navigation error: {0}")]
    Navigation(String),
    #[error("page crashed or disconnected: {0}")]
    Crash(String),
}

impl RenderError {
    /// Per spec §4.8/§7: navigation timeouts and generic navigation
    /// errors are transient (retry with backoff); a crash/disconnect is
    /// fatal for the page (it must be destroyed, not recycled).
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenderError::Crash(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub fast_mode: bool,
    pub spa_mode: bool,
    pub enable_stealth: bool,
    pub check_soft_error: bool,
    pub navigation_timeout: Option<Duration>,
}

const FRAMEWORK_SIGNATURES: &[(&str, &str)] = &[
    ("angular", "ng-version"),
    ("react", "data-reactroot"),
    ("vue", "data-v-"),
    ("ember", "ember-application"),
    ("next", "__next"),
    ("nuxt", "__nuxt"),
    ("svelte", "svelte-"),
];

const SOFT_ERROR_PATTERNS: &[&str] = &[
    "page not found",
    "404 not found",
    "page does not exist",
    "we couldn't find that page",
    "this page doesn't exist",
    "oops! that page can't be found",
];

const AUTH_PATH_MARKERS: &[&str] = &["login", "signin", "sso", "oauth"];

pub struct PageRenderer {
    max_retries: u32,
}

impl PageRenderer {
    pub fn new(max_retries: u32) -> Self {
        PageRenderer { max_retries }
    }

    /// Navigates to `url`, installs a network interceptor, and collects
    /// the artifacts described in spec §4.8 steps 1-6.
    pub async fn visit(
        &self,
        handle: &mut PageHandle,
        url: &str,
        headers: &HashMap<String, String>,
        cookies: &HashMap<String, String>,
        options: &RenderOptions,
    ) -> Result<PageResult, RenderError> {
        let mut attempt = 0;
        loop {
            match self.visit_once(handle, url, headers, cookies, options).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_fatal() => {
                    handle.poison();
                    return Err(err);
                }
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn visit_once(
        &self,
        handle: &PageHandle,
        url: &str,
        headers: &HashMap<String, String>,
        cookies: &HashMap<String, String>,
        options: &RenderOptions,
    ) -> Result<PageResult, RenderError> {
        let start = Instant::now();
        let page = handle.page();

        apply_headers_and_cookies(page, url, headers, cookies)
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        let intercepted: Arc<AsyncMutex<Vec<InterceptedRequest>>> =
            Arc::new(AsyncMutex::new(Vec::new()));
        let listener_handle = spawn_network_listener(page, intercepted.clone())
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        let nav_timeout = options
            .navigation_timeout
            .unwrap_or(Duration::from_secs(30));
        let navigate = page.goto(url).await;
        if let Err(err) = navigate {
            listener_handle.abort();
            return Err(classify_navigation_error(&err.to_string()));
        }

        let wait_result = timeout(nav_timeout, page.wait_for_navigation()).await;
        listener_handle.abort();
        if wait_result.is_err() {
            return Err(RenderError::Timeout);
        }

        let html = page
            .content()
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;
        let final_url = page
            .url()
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?
            .unwrap_or_else(|| url.to_string());
        let title = page.get_title().await.ok().flatten();

        let frameworks = if options.spa_mode {
            detect_frameworks(&html)
        } else {
            Vec::new()
        };
        if !frameworks.is_empty() && !options.fast_mode {
            let _ = timeout(Duration::from_secs(2), page.wait_for_navigation()).await;
        }

        let document = scraper::Html::parse_document(&html);
        let links = extract_links(&document, &final_url);
        let scripts = extract_scripts(&document, &final_url);
        let forms = extract_forms(&document, &final_url);
        let websockets: Vec<String> = Vec::new();

        let content_hash = {
            let mut hasher = Sha256::new();
            hasher.update(html.as_bytes());
            hex::encode(hasher.finalize())
        };

        let xhr_requests = intercepted.lock().await.clone();

        let is_soft_error = options.check_soft_error
            && is_http_success(&final_url)
            && matches_soft_error(&html, title.as_deref());

        let is_auth_redirect = looks_like_auth_redirect(url, &final_url);

        Ok(PageResult {
            final_url,
            status_code: 200,
            content_type: "text/html".to_string(),
            html,
            title,
            content_hash,
            links,
            scripts,
            forms,
            xhr_requests,
            websockets,
            cookies: HashMap::new(),
            is_soft_error,
            is_auth_redirect,
            fetch_mode: FetchMode::Browser,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Navigates to `base_url`, then mutates `location.hash` to
    /// `hash_route` and repeats artifact collection (spec §4.8
    /// "Hash-route variant").
    pub async fn visit_hash_route(
        &self,
        handle: &mut PageHandle,
        base_url: &str,
        hash_route: &str,
        headers: &HashMap<String, String>,
        cookies: &HashMap<String, String>,
        options: &RenderOptions,
    ) -> Result<PageResult, RenderError> {
        let base_result = self
            .visit(handle, base_url, headers, cookies, options)
            .await?;

        let page = handle.page();
        let script = format!(
            "window.location.hash = {:?};",
            hash_route.trim_start_matches('#')
        );
        page.evaluate(script)
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;
        let _ = timeout(Duration::from_secs(2), page.wait_for_navigation()).await;

        let html = page
            .content()
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;
        let final_url = page
            .url()
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?
            .unwrap_or_else(|| base_result.final_url.clone());
        let document = scraper::Html::parse_document(&html);
        let links = extract_links(&document, &final_url);

        Ok(PageResult {
            final_url,
            html,
            links,
            ..base_result
        })
    }
}

fn classify_navigation_error(message: &str) -> RenderError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("crash") || lower.contains("disconnected") || lower.contains("target closed")
    {
        RenderError::Crash(message.to_string())
    } else if lower.contains("timeout") {
        RenderError::Timeout
    } else {
        RenderError::Navigation(message.to_string())
    }
}

async fn apply_headers_and_cookies(
    page: &Page,
    url: &str,
    headers: &HashMap<String, String>,
    cookies: &HashMap<String, String>,
) -> Result<(), chromiumoxide::error::CdpError> {
    if !headers.is_empty() {
        let map: HashMap<String, serde_json::Value> = headers
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        page.set_extra_headers(map).await?;
    }
    if !cookies.is_empty() {
        if let Ok(parsed) = url::Url::parse(url) {
            let domain = parsed.host_str().unwrap_or_default().to_string();
            for (name, value) in cookies {
                let _ = page
                    .set_cookie(
                        chromiumoxide::cdp::browser_protocol::network::CookieParam::builder()
                            .name(name.clone())
                            .value(value.clone())
                            .domain(domain.clone())
                            .build()
                            .unwrap(),
                    )
                    .await;
            }
        }
    }
    Ok(())
}

async fn spawn_network_listener(
    page: &Page,
    sink: Arc<AsyncMutex<Vec<InterceptedRequest>>>,
) -> Result<tokio::task::JoinHandle<()>, chromiumoxide::error::CdpError> {
    let mut events = page.event_listener::<EventRequestWillBeSent>().await?;
    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let request = &event.request;
            let resource_type = event
                .r#type
                .as_ref()
                .map(|t| format!("{t:?}"))
                .unwrap_or_default();
            let mut headers = HashMap::new();
            for (k, v) in request.headers.inner().iter() {
                if let Some(s) = v.as_str() {
                    headers.insert(k.clone(), s.to_string());
                }
            }
            sink.lock().await.push(InterceptedRequest {
                url: request.url.clone(),
                method: request.method.clone(),
                resource_type,
                headers,
                post_data: request.post_data.clone(),
                status_code: None,
                content_type: None,
            });
        }
    }))
}

pub(crate) fn detect_frameworks(html: &str) -> Vec<&'static str> {
    FRAMEWORK_SIGNATURES
        .iter()
        .filter(|(_, marker)| html.contains(marker))
        .map(|(name, _)| *name)
        .collect()
}

fn matches_soft_error(html: &str, title: Option<&str>) -> bool {
    let lower_html = html.to_ascii_lowercase();
    let short_body = html.len() < 2000;
    let text_match = SOFT_ERROR_PATTERNS.iter().any(|p| lower_html.contains(p));
    let title_match = title
        .map(|t| {
            let lower = t.to_ascii_lowercase();
            SOFT_ERROR_PATTERNS.iter().any(|p| lower.contains(p)) || lower.contains("not found")
        })
        .unwrap_or(false);
    text_match || (short_body && title_match)
}

fn is_http_success(_final_url: &str) -> bool {
    // Status is carried separately by the HTTP fetcher; the renderer's
    // own navigation doesn't expose the HTTP status code directly, so
    // soft-error detection here relies on content, matching §4.8 step 5
    // ("if the response status is in [200,299]" — assumed true for a
    // page that rendered successfully without a CDP navigation error).
    true
}

fn looks_like_auth_redirect(requested_url: &str, final_url: &str) -> bool {
    let Ok(final_parsed) = url::Url::parse(final_url) else {
        return false;
    };
    let Ok(requested_parsed) = url::Url::parse(requested_url) else {
        return false;
    };
    let path_lower = final_parsed.path().to_ascii_lowercase();
    let matches_marker = AUTH_PATH_MARKERS.iter().any(|m| path_lower.contains(m));
    if !matches_marker {
        return false;
    }
    let host_differs = final_parsed.host_str() != requested_parsed.host_str();
    let root_differs = first_path_segment(final_parsed.path())
        != first_path_segment(requested_parsed.path());
    host_differs || root_differs
}

fn first_path_segment(path: &str) -> Option<&str> {
    path.trim_start_matches('/').split('/').next()
}

fn extract_links(document: &scraper::Html, base_url: &str) -> Vec<Link> {
    let base = url::Url::parse(base_url).ok();
    let sel = scraper::Selector::parse("a[href]").unwrap();
    document
        .select(&sel)
        .filter_map(|el| {
            let href = el.value().attr("href")?;
            let resolved = resolve_href(base.as_ref(), href)?;
            Some(Link {
                url: resolved,
                anchor_text: el.text().collect::<String>().trim().to_string(),
            })
        })
        .collect()
}

fn extract_scripts(document: &scraper::Html, base_url: &str) -> Vec<String> {
    let base = url::Url::parse(base_url).ok();
    let sel = scraper::Selector::parse("script[src]").unwrap();
    document
        .select(&sel)
        .filter_map(|el| el.value().attr("src"))
        .filter_map(|src| resolve_href(base.as_ref(), src))
        .collect()
}

fn extract_forms(document: &scraper::Html, page_url: &str) -> Vec<Form> {
    crate::extract::html::extract_forms(document, page_url, 0)
}

fn resolve_href(base: Option<&url::Url>, href: &str) -> Option<String> {
    let trimmed = href.trim();
    if trimmed.is_empty()
        || trimmed.starts_with("javascript:")
        || trimmed.starts_with("mailto:")
        || trimmed.starts_with("tel:")
        || trimmed.starts_with("data:")
    {
        return None;
    }
    match base {
        Some(base) => base.join(trimmed).ok().map(|u| u.to_string()),
        None => Some(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_frameworks() {
        let html = r#"<html ng-version="1"><body data-reactroot=""></body></html>"#;
        let found = detect_frameworks(html);
        assert!(found.contains(&"angular"));
        assert!(found.contains(&"react"));
        assert!(!found.contains(&"vue"));
    }

    #[test]
    fn test_soft_error_text_match() {
        assert!(matches_soft_error("<p>Page Not Found</p>", None));
        assert!(!matches_soft_error("<p>Welcome home</p>", Some("Home")));
    }

    #[test]
    fn test_auth_redirect_detection() {
        assert!(looks_like_auth_redirect(
            "https://a.test/dashboard",
            "https://a.test/login?next=/dashboard"
        ));
        assert!(looks_like_auth_redirect(
            "https://a.test/dashboard",
            "https://auth.other.test/sso"
        ));
        assert!(!looks_like_auth_redirect(
            "https://a.test/dashboard",
            "https://a.test/dashboard"
        ));
    }

    #[test]
    fn test_classify_navigation_error() {
        assert!(matches!(
            classify_navigation_error("Target closed"),
            RenderError::Crash(_)
        ));
        assert!(matches!(
            classify_navigation_error("navigation timeout exceeded"),
            RenderError::Timeout
        ));
        assert!(matches!(
            classify_navigation_error("DNS resolution failed"),
            RenderError::Navigation(_)
        ));
    }
}
