use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// A unit of work on the frontier (spec §3 `QueueItem`).
///
/// Created by the engine (seed) or by a worker while processing a page;
/// never mutated after construction. `depth` of any non-seed item must
/// equal `parent.depth + 1` — callers that push discovered URLs are
/// responsible for that invariant, the frontier itself does not check it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub depth: u32,
    #[serde(default)]
    pub parent_url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "now_millis")]
    pub enqueued_at: u64,
}

impl QueueItem {
    /// Build a seed item at depth 0 with default priority.
    pub fn seed(url: impl Into<String>) -> Self {
        QueueItem {
            url: url.into(),
            method: default_method(),
            depth: 0,
            parent_url: String::new(),
            headers: HashMap::new(),
            body: None,
            priority: 0,
            enqueued_at: now_millis(),
        }
    }

    /// Build an item discovered while processing `parent`.
    pub fn child(url: impl Into<String>, parent: &QueueItem, priority: i32) -> Self {
        QueueItem {
            url: url.into(),
            method: default_method(),
            depth: parent.depth + 1,
            parent_url: parent.url.clone(),
            headers: HashMap::new(),
            body: None,
            priority,
            enqueued_at: now_millis(),
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Parameter location for a discovered or form field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Query,
    Path,
    Body,
    Header,
    Cookie,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub location: ParamLocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

/// How an endpoint was discovered (spec §3 `DiscoveredEndpoint.source`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointSource {
    Passive,
    Js,
    Hateoas,
    Openapi,
}

/// A URL + method observed as an API call.
///
/// Invariant: at most one record per `(normalized_url_without_query,
/// method)`; repeated observations increment `hit_count` rather than
/// creating a new record (see `crawler::passive` and `Deduplicator`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredEndpoint {
    pub url: String,
    pub method: String,
    pub source: EndpointSource,
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub discovered_from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub first_seen: u64,
    pub hit_count: u32,
    #[serde(default)]
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormInput {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
}

/// An HTML form discovered on a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Form {
    pub page_url: String,
    pub action: String,
    pub method: String,
    pub enctype: String,
    pub inputs: Vec<FormInput>,
    pub has_csrf_token: bool,
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessageSample {
    pub direction: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: String,
    pub timestamp: u64,
}

/// A WebSocket endpoint observed or statically referenced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketEndpoint {
    pub url: String,
    pub discovered_from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_messages: Vec<WsMessageSample>,
    pub timestamp: u64,
}

/// How a page was fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Http,
    Browser,
}

/// A single intercepted network request, recorded while rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptedRequest {
    pub url: String,
    pub method: String,
    pub resource_type: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub post_data: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// A hyperlink or SPA-route link extracted from a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    #[serde(default)]
    pub anchor_text: String,
}

/// A fetched and parsed (or rendered) page — the fetcher's output for one
/// navigation (spec §3 `PageResult`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub final_url: String,
    pub status_code: u16,
    pub content_type: String,
    #[serde(default)]
    pub html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub content_hash: String,
    pub links: Vec<Link>,
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub forms: Vec<Form>,
    #[serde(default)]
    pub xhr_requests: Vec<InterceptedRequest>,
    #[serde(default)]
    pub websockets: Vec<String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    pub is_soft_error: bool,
    pub is_auth_redirect: bool,
    pub fetch_mode: FetchMode,
    pub duration_ms: u64,
}

/// Monotonic counters maintained by the engine. Snapshots may be mildly
/// inconsistent across fields under concurrent access — they exist for
/// operator visibility, not correctness (spec §9).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CrawlStats {
    pub pages_crawled: u64,
    pub urls_discovered: u64,
    pub endpoints_found: u64,
    pub forms_found: u64,
    pub websockets_found: u64,
    pub errors: u64,
    pub bytes_transferred: u64,
    /// Response-time histogram buckets in milliseconds:
    /// `<100, <250, <500, <1000, <2500, <5000, >=5000`.
    pub response_time_buckets: [u64; 7],
}

impl CrawlStats {
    pub fn record_response_time(&mut self, duration_ms: u64) {
        const EDGES: [u64; 6] = [100, 250, 500, 1000, 2500, 5000];
        let idx = EDGES
            .iter()
            .position(|edge| duration_ms < *edge)
            .unwrap_or(EDGES.len());
        self.response_time_buckets[idx] += 1;
    }
}

/// A resumable snapshot of crawl progress. Opaque to the core beyond
/// serialization and reload (spec §6.5) — the engine only knows how to
/// write and read this shape, not what a caller does with the file.
#[derive(Debug, Serialize, Deserialize)]
pub struct CrawlerState {
    pub target: String,
    pub started_at: u64,
    pub updated_at: u64,
    pub stats: CrawlStatsSnapshot,
    pub queue_urls: Vec<QueueItem>,
    pub visited_urls: Vec<String>,
    pub endpoints: Vec<DiscoveredEndpoint>,
    pub forms: Vec<Form>,
    pub websockets: Vec<WebSocketEndpoint>,
    pub errors: Vec<CrawlError>,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Plain-data mirror of `CrawlStats` for serialization (counters are
/// stored as u64 snapshots, not atomics).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlStatsSnapshot {
    pub pages_crawled: u64,
    pub urls_discovered: u64,
    pub endpoints_found: u64,
    pub forms_found: u64,
    pub websockets_found: u64,
    pub errors: u64,
    pub bytes_transferred: u64,
}

impl From<&CrawlStats> for CrawlStatsSnapshot {
    fn from(s: &CrawlStats) -> Self {
        CrawlStatsSnapshot {
            pages_crawled: s.pages_crawled,
            urls_discovered: s.urls_discovered,
            endpoints_found: s.endpoints_found,
            forms_found: s.forms_found,
            websockets_found: s.websockets_found,
            errors: s.errors,
            bytes_transferred: s.bytes_transferred,
        }
    }
}

// --- Sink record schemas (spec §6.1), field names fixed ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub url: String,
    pub method: String,
    pub source: EndpointSource,
    pub depth: u32,
    pub parameters: Vec<Parameter>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovered_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_size: Option<u64>,
    pub timestamp: u64,
}

impl From<&DiscoveredEndpoint> for EndpointRecord {
    fn from(e: &DiscoveredEndpoint) -> Self {
        EndpointRecord {
            url: e.url.clone(),
            method: e.method.clone(),
            source: e.source,
            depth: e.depth,
            parameters: e.parameters.clone(),
            headers: e.headers.clone(),
            discovered_from: if e.discovered_from.is_empty() {
                None
            } else {
                Some(e.discovered_from.clone())
            },
            status_code: e.status_code,
            content_type: e.content_type.clone(),
            response_size: None,
            timestamp: e.first_seen,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormRecord {
    pub url: String,
    pub action: String,
    pub method: String,
    pub enctype: String,
    pub inputs: Vec<FormInput>,
    pub has_csrf: bool,
    pub depth: u32,
    pub timestamp: u64,
}

impl FormRecord {
    pub fn from_form(f: &Form, timestamp: u64) -> Self {
        FormRecord {
            url: f.page_url.clone(),
            action: f.action.clone(),
            method: f.method.clone(),
            enctype: f.enctype.clone(),
            inputs: f.inputs.clone(),
            has_csrf: f.has_csrf_token,
            depth: f.depth,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketRecord {
    pub url: String,
    pub discovered_from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_messages: Option<Vec<WsMessageSample>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<String>>,
    pub timestamp: u64,
}

impl From<&WebSocketEndpoint> for WebSocketRecord {
    fn from(w: &WebSocketEndpoint) -> Self {
        WebSocketRecord {
            url: w.url.clone(),
            discovered_from: w.discovered_from.clone(),
            sample_messages: if w.sample_messages.is_empty() {
                None
            } else {
                Some(w.sample_messages.clone())
            },
            protocols: w.protocols.clone(),
            timestamp: w.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlError {
    pub url: String,
    pub error: String,
    pub timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CrawlResult {
    pub target: String,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    pub stats: CrawlStatsSnapshot,
    pub endpoints: Vec<EndpointRecord>,
    pub forms: Vec<FormRecord>,
    pub websockets: Vec<WebSocketRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<CrawlError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_depth_invariant() {
        let seed = QueueItem::seed("https://a.test/");
        let child = QueueItem::child("https://a.test/b", &seed, 5);
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_url, "https://a.test/");
        assert_eq!(child.priority, 5);
    }

    #[test]
    fn test_response_time_buckets() {
        let mut stats = CrawlStats::default();
        stats.record_response_time(50);
        stats.record_response_time(150);
        stats.record_response_time(6000);
        assert_eq!(stats.response_time_buckets[0], 1);
        assert_eq!(stats.response_time_buckets[1], 1);
        assert_eq!(stats.response_time_buckets[6], 1);
    }

    #[test]
    fn test_endpoint_record_from_discovered() {
        let e = DiscoveredEndpoint {
            url: "https://a.test/api/users".into(),
            method: "GET".into(),
            source: EndpointSource::Passive,
            parameters: vec![],
            headers: HashMap::new(),
            discovered_from: String::new(),
            status_code: Some(200),
            content_type: Some("application/json".into()),
            first_seen: 1000,
            hit_count: 1,
            depth: 2,
        };
        let rec = EndpointRecord::from(&e);
        assert_eq!(rec.discovered_from, None);
        assert_eq!(rec.timestamp, 1000);
    }
}
