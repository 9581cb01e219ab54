//! Digests intercepted XHR/Fetch requests into endpoint records without
//! probing (spec §4.9).

use crate::models::{DiscoveredEndpoint, EndpointSource, InterceptedRequest, ParamLocation, Parameter};
use std::collections::HashMap;
use std::sync::Mutex;
use url::Url;

const API_PATH_MARKERS: &[&str] = &[
    "/api/", "/v1/", "/v2/", "/v3/", "/graphql", "/rest/", "/json/", "/ajax/", "/_api/", "/rpc/",
];

fn is_relevant(request: &InterceptedRequest) -> bool {
    let resource_type = request.resource_type.to_ascii_lowercase();
    if resource_type.contains("xhr") || resource_type.contains("fetch") {
        return true;
    }
    let path_lower = request.url.to_ascii_lowercase();
    if API_PATH_MARKERS.iter().any(|m| path_lower.contains(m)) {
        return true;
    }
    if let Some(content_type) = &request.content_type {
        let ct = content_type.to_ascii_lowercase();
        if ct.starts_with("application/json") || ct.starts_with("application/xml") {
            return true;
        }
    }
    false
}

fn dedup_key(method: &str, url: &Url) -> String {
    format!(
        "{} {}://{}{}",
        method.to_ascii_uppercase(),
        url.scheme(),
        url.host_str().unwrap_or(""),
        url.path()
    )
}

fn looks_dynamic(segment: &str) -> bool {
    let is_digits = !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit());
    let hyphen_count = segment.chars().filter(|c| *c == '-').count();
    let uuid_ish = segment.len() >= 32 && hyphen_count >= 4;
    let opaque_token = segment.len() > 20;
    is_digits || uuid_ish || opaque_token
}

fn suggest_param_name(previous_segment: Option<&str>) -> String {
    match previous_segment {
        Some(seg) if seg.ends_with('s') => format!("{}_id", &seg[..seg.len() - 1]),
        Some(seg) => format!("{seg}_id"),
        None => "id".to_string(),
    }
}

fn path_parameters(url: &Url) -> Vec<Parameter> {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.collect())
        .unwrap_or_default();
    let mut params = Vec::new();
    for (idx, segment) in segments.iter().enumerate() {
        if looks_dynamic(segment) {
            let previous = if idx > 0 { Some(segments[idx - 1]) } else { None };
            params.push(Parameter {
                name: suggest_param_name(previous),
                location: ParamLocation::Path,
                example: Some(segment.to_string()),
            });
        }
    }
    params
}

fn query_parameters(url: &Url) -> Vec<Parameter> {
    url.query_pairs()
        .map(|(k, v)| Parameter {
            name: k.into_owned(),
            location: ParamLocation::Query,
            example: Some(v.into_owned()),
        })
        .collect()
}

fn body_parameters(request: &InterceptedRequest) -> Vec<Parameter> {
    let Some(body) = &request.post_data else {
        return Vec::new();
    };
    let is_json = request
        .content_type
        .as_deref()
        .map(|ct| ct.to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);

    if is_json {
        let truncated: String = body.chars().take(200).collect();
        return vec![Parameter {
            name: "body".to_string(),
            location: ParamLocation::Body,
            example: Some(truncated),
        }];
    }

    url::form_urlencoded::parse(body.as_bytes())
        .map(|(k, v)| Parameter {
            name: k.into_owned(),
            location: ParamLocation::Body,
            example: Some(v.into_owned()),
        })
        .collect()
}

/// Tracks observed `(method, url_no_query)` dedup keys so repeated
/// interceptions increment `hit_count` instead of producing new
/// endpoint records (spec invariant in §8: "Passive discovery dedup").
pub struct PassiveDiscovery {
    seen: Mutex<HashMap<String, DiscoveredEndpoint>>,
}

impl PassiveDiscovery {
    pub fn new() -> Self {
        PassiveDiscovery {
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Processes intercepted requests from one page, returning only the
    /// endpoints newly created on this call.
    pub fn process_requests(
        &self,
        requests: &[InterceptedRequest],
        source_url: &str,
        depth: u32,
        first_seen: u64,
    ) -> Vec<DiscoveredEndpoint> {
        let mut new_endpoints = Vec::new();
        let mut seen = self.seen.lock().unwrap();

        for request in requests {
            if !is_relevant(request) {
                continue;
            }
            let Ok(parsed) = Url::parse(&request.url) else {
                continue;
            };
            let key = dedup_key(&request.method, &parsed);

            if let Some(existing) = seen.get_mut(&key) {
                existing.hit_count += 1;
                continue;
            }

            let mut parameters = query_parameters(&parsed);
            parameters.extend(path_parameters(&parsed));
            if matches!(request.method.to_ascii_uppercase().as_str(), "POST" | "PUT" | "PATCH") {
                parameters.extend(body_parameters(request));
            }

            let mut url_no_query = parsed.clone();
            url_no_query.set_query(None);

            let endpoint = DiscoveredEndpoint {
                url: url_no_query.to_string(),
                method: request.method.to_ascii_uppercase(),
                source: EndpointSource::Passive,
                parameters,
                headers: request.headers.clone(),
                discovered_from: source_url.to_string(),
                status_code: request.status_code,
                content_type: request.content_type.clone(),
                first_seen,
                hit_count: 1,
                depth,
            };
            seen.insert(key, endpoint.clone());
            new_endpoints.push(endpoint);
        }

        new_endpoints
    }

    /// All endpoints recorded so far, for state snapshots (spec §6.5)
    /// and crawl-result assembly. Order is unspecified.
    pub fn snapshot(&self) -> Vec<DiscoveredEndpoint> {
        self.seen.lock().unwrap().values().cloned().collect()
    }
}

impl Default for PassiveDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str, method: &str) -> InterceptedRequest {
        InterceptedRequest {
            url: url.to_string(),
            method: method.to_string(),
            resource_type: "xhr".to_string(),
            headers: HashMap::new(),
            post_data: None,
            status_code: None,
            content_type: None,
        }
    }

    #[test]
    fn test_new_endpoint_with_path_and_query_params() {
        let discovery = PassiveDiscovery::new();
        let requests = vec![request(
            "https://a.test/api/users/42?page=1",
            "GET",
        )];
        let endpoints = discovery.process_requests(&requests, "https://a.test/dashboard", 0, 1000);
        assert_eq!(endpoints.len(), 1);
        let endpoint = &endpoints[0];
        assert_eq!(endpoint.url, "https://a.test/api/users/42");
        assert_eq!(endpoint.method, "GET");
        assert!(endpoint
            .parameters
            .iter()
            .any(|p| p.name == "page" && p.location == ParamLocation::Query));
        assert!(endpoint
            .parameters
            .iter()
            .any(|p| p.name == "user_id" && p.location == ParamLocation::Path));
    }

    #[test]
    fn test_repeated_observation_increments_hit_count_no_new_record() {
        let discovery = PassiveDiscovery::new();
        let requests = vec![request("https://a.test/api/users/42?page=1", "GET")];
        let first = discovery.process_requests(&requests, "https://a.test/dashboard", 0, 1000);
        assert_eq!(first.len(), 1);
        let second = discovery.process_requests(&requests, "https://a.test/dashboard", 0, 2000);
        assert!(second.is_empty());
        let stored = discovery.seen.lock().unwrap();
        let entry = stored.values().next().unwrap();
        assert_eq!(entry.hit_count, 2);
    }

    #[test]
    fn test_irrelevant_request_filtered() {
        let discovery = PassiveDiscovery::new();
        let mut req = request("https://a.test/static/logo.png", "GET");
        req.resource_type = "image".to_string();
        let endpoints = discovery.process_requests(&[req], "https://a.test/", 0, 1000);
        assert!(endpoints.is_empty());
    }

    #[test]
    fn test_looks_dynamic_classification() {
        assert!(looks_dynamic("42"));
        assert!(looks_dynamic(&"a".repeat(21)));
        assert!(looks_dynamic("aaaa-bbbb-cccc-dddd-eeee"));
        assert!(!looks_dynamic("users"));
    }
}
