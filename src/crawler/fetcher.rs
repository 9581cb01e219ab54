//! Plain HTTP(S) client: pooled connections, UA/header configuration,
//! redirect following, and an inexpensive preliminary HTML scan so the
//! worker can decide whether a browser fallback is needed without
//! re-parsing the body (spec §4.6).

use crate::models::Link;
use reqwest::redirect::Policy;
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub default_headers: HashMap<String, String>,
    pub max_redirects: usize,
    pub ignore_tls_errors: bool,
    pub pool_max_idle_per_host: usize,
    /// Body truncation ceiling in bytes; `0` means unbounded.
    pub max_body_bytes: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        FetcherConfig {
            timeout: Duration::from_secs(30),
            user_agent: "crawlcore/1.0".to_string(),
            default_headers: HashMap::new(),
            max_redirects: 10,
            ignore_tls_errors: false,
            pool_max_idle_per_host: 20,
            max_body_bytes: 5 * 1024 * 1024,
        }
    }
}

/// The fetcher's output for one plain-HTTP navigation.
#[derive(Debug, Clone)]
pub struct HttpResult {
    pub url: String,
    pub final_url: String,
    pub status_code: u16,
    pub content_type: String,
    pub html: String,
    pub links: Vec<Link>,
    pub scripts: Vec<String>,
    pub forms_present: bool,
    pub title: Option<String>,
    pub headers: HashMap<String, String>,
    pub duration: Duration,
    pub truncated: bool,
}

/// A shared HTTP client with pooled connections and a fixed header/UA
/// configuration, built via `Client::builder()` with the timeout, pool,
/// redirect, and TLS options §4.6 and §6.4 require.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (name, value) in &config.default_headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                default_headers.insert(name, value);
            }
        }

        let client = Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .redirect(Policy::limited(config.max_redirects))
            .danger_accept_invalid_certs(config.ignore_tls_errors)
            .gzip(true)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .default_headers(default_headers)
            .build()
            .expect("Failed to build HTTP client");

        HttpFetcher {
            client,
            max_body_bytes: config.max_body_bytes,
        }
    }

    /// Performs a GET request and runs a cheap preliminary HTML scan
    /// over the response body — the worker uses this to decide whether
    /// a browser fallback is needed before paying for a full extraction
    /// pass.
    pub async fn get(&self, url: &str) -> Result<HttpResult, FetchError> {
        self.request(reqwest::Method::GET, url).await
    }

    pub async fn head(&self, url: &str) -> Result<HttpResult, FetchError> {
        self.request(reqwest::Method::HEAD, url).await
    }

    async fn request(&self, method: reqwest::Method, url: &str) -> Result<HttpResult, FetchError> {
        let start = Instant::now();
        let response = self
            .client
            .request(method, url)
            .send()
            .await?;

        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut headers = HashMap::new();
        for (name, value) in response.headers().iter() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.to_string(), v.to_string());
            }
        }

        let body_bytes = response.bytes().await?;
        let truncated = self.max_body_bytes > 0 && body_bytes.len() > self.max_body_bytes;
        let slice = if truncated {
            &body_bytes[..self.max_body_bytes]
        } else {
            &body_bytes[..]
        };
        let html = String::from_utf8_lossy(slice).into_owned();
        let duration = start.elapsed();

        let (links, scripts, forms_present, title) = if content_type.contains("text/html") {
            prelim_scan(&html, &final_url)
        } else {
            (Vec::new(), Vec::new(), false, None)
        };

        Ok(HttpResult {
            url: url.to_string(),
            final_url,
            status_code,
            content_type,
            html,
            links,
            scripts,
            forms_present,
            title,
            headers,
            duration,
            truncated,
        })
    }
}

/// Cheap scan over raw HTML: anchor hrefs, script sources, form
/// presence and `<title>`. Deliberately lighter than the full
/// `extract::html` pass — just enough for the worker's `needs_js`
/// heuristic and a first batch of links.
fn prelim_scan(html: &str, base_url: &str) -> (Vec<Link>, Vec<String>, bool, Option<String>) {
    let document = Html::parse_document(html);
    let base = url::Url::parse(base_url).ok();

    let a_sel = Selector::parse("a[href]").unwrap();
    let script_sel = Selector::parse("script[src]").unwrap();
    let form_sel = Selector::parse("form").unwrap();
    let title_sel = Selector::parse("title").unwrap();

    let links = document
        .select(&a_sel)
        .filter_map(|el| {
            let href = el.value().attr("href")?;
            let resolved = resolve(base.as_ref(), href)?;
            let anchor_text = el.text().collect::<String>().trim().to_string();
            Some(Link {
                url: resolved,
                anchor_text,
            })
        })
        .collect();

    let scripts = document
        .select(&script_sel)
        .filter_map(|el| el.value().attr("src"))
        .filter_map(|src| resolve(base.as_ref(), src))
        .collect();

    let forms_present = document.select(&form_sel).next().is_some();

    let title = document
        .select(&title_sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string());

    (links, scripts, forms_present, title)
}

fn resolve(base: Option<&url::Url>, href: &str) -> Option<String> {
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
    fn test_prelim_scan_links_and_title() {
        let html = r#"
            <html><head><title>Hi</title></head>
            <body>
              <a href="/b">B</a>
              <a href="javascript:void(0)">skip</a>
              <script src="/app.js"></script>
              <form></form>
            </body></html>
        "#;
        let (links, scripts, forms_present, title) = prelim_scan(html, "https://a.test/");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url, "https://a.test/b");
        assert_eq!(scripts, vec!["https://a.test/app.js"]);
        assert!(forms_present);
        assert_eq!(title.as_deref(), Some("Hi"));
    }

    #[test]
    fn test_resolve_rejects_non_navigable_schemes() {
        let base = url::Url::parse("https://a.test/").unwrap();
        assert_eq!(resolve(Some(&base), "mailto:a@b.com"), None);
        assert_eq!(resolve(Some(&base), "tel:+1234"), None);
        assert_eq!(resolve(Some(&base), "data:text/plain,x"), None);
        assert_eq!(
            resolve(Some(&base), "/c"),
            Some("https://a.test/c".to_string())
        );
    }

    #[test]
    fn test_default_config_values() {
        let config = FetcherConfig::default();
        assert_eq!(config.max_redirects, 10);
        assert!(!config.ignore_tls_errors);
    }
}
