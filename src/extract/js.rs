//! JavaScript extraction: URL literals, API call sites, WebSocket
//! targets, potential secrets, and client-side routes (spec §4.10).

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCallSite {
    pub method: String,
    pub url: String,
    pub path_params: Vec<String>,
    pub query_params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMatch {
    pub kind: String,
    pub masked_value: String,
}

#[derive(Debug, Default)]
pub struct JsExtraction {
    pub urls: Vec<String>,
    pub api_calls: Vec<ApiCallSite>,
    pub websockets: Vec<String>,
    pub secrets: Vec<SecretMatch>,
    pub routes: Vec<String>,
}

static URL_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["'](https?://[^"'\s]+|/api/[^"'\s]+|/v\d+/[^"'\s]+)["']"#).unwrap());

static FETCH_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"fetch\(\s*["']([^"']+)["']"#).unwrap());

static AXIOS_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"axios\.(get|post|put|delete|patch)\(\s*["']([^"']+)["']"#).unwrap()
});

static JQUERY_AJAX_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\$\.ajax\(\s*\{\s*url\s*:\s*["']([^"']+)["']"#).unwrap());

static JQUERY_SHORTHAND_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\$\.(get|post)\(\s*["']([^"']+)["']"#).unwrap());

static XHR_OPEN_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\.open\(\s*["'](\w+)["']\s*,\s*["']([^"']+)["']"#).unwrap()
});

static WEBSOCKET_CTOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"new\s+WebSocket\(\s*["']([^"']+)["']"#).unwrap());

static WEBSOCKET_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"["'](wss?://[^"'\s]+)["']"#).unwrap());

static ROUTE_JSX: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<Route\s+path=["']([^"']+)["']"#).unwrap());
static ROUTE_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"path\s*:\s*["']([^"']+)["']"#).unwrap());
static ROUTE_BUILDER: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\.route\(\s*["']([^"']+)["']"#).unwrap());

static PATH_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[:{]\$?\{?(\w+)\}?").unwrap());

const SECRET_PATTERNS: &[(&str, &str)] = &[
    ("api_key", r#"(?i)api[_-]?key["'\s:=]+["']?([A-Za-z0-9_\-]{16,})["']?"#),
    ("secret", r#"(?i)\bsecret["'\s:=]+["']?([A-Za-z0-9_\-]{16,})["']?"#),
    ("token", r#"(?i)\btoken["'\s:=]+["']?([A-Za-z0-9_\-.]{16,})["']?"#),
    ("access_token", r#"(?i)access[_-]?token["'\s:=]+["']?([A-Za-z0-9_\-.]{16,})["']?"#),
    ("aws_secret", r#"(?i)aws[_-]?secret[_-]?(access[_-]?)?key["'\s:=]+["']?([A-Za-z0-9/+=]{30,})["']?"#),
    ("aws_access_key_id", r"\bAKIA[0-9A-Z]{16}\b"),
    ("jwt", r"\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\b"),
];

const SECRET_PLACEHOLDER_BLACKLIST: &[&str] = &[
    "your_api_key",
    "your-api-key",
    "xxxxxxxx",
    "changeme",
    "example",
    "placeholder",
    "<token>",
    "{{token}}",
    "insert_key_here",
];

/// Runs the full JS extraction pass over the contents of one script.
pub fn extract(script: &str) -> JsExtraction {
    JsExtraction {
        urls: extract_url_literals(script),
        api_calls: extract_api_calls(script),
        websockets: extract_websockets(script),
        secrets: extract_secrets(script),
        routes: extract_routes(script),
    }
}

fn extract_url_literals(script: &str) -> Vec<String> {
    URL_LITERAL
        .captures_iter(script)
        .map(|c| c[1].to_string())
        .collect()
}

fn params_from_url(url: &str) -> (Vec<String>, Vec<String>) {
    let path_params: Vec<String> = PATH_PARAM
        .captures_iter(url)
        .map(|c| c[1].to_string())
        .collect();
    let query_params: Vec<String> = url
        .split_once('?')
        .map(|(_, q)| {
            q.split('&')
                .filter_map(|pair| pair.split_once('=').map(|(k, _)| k.to_string()))
                .collect()
        })
        .unwrap_or_default();
    (path_params, query_params)
}

fn extract_api_calls(script: &str) -> Vec<ApiCallSite> {
    let mut calls = Vec::new();

    for cap in FETCH_CALL.captures_iter(script) {
        let url = cap[1].to_string();
        let (path_params, query_params) = params_from_url(&url);
        calls.push(ApiCallSite {
            method: "GET".to_string(),
            url,
            path_params,
            query_params,
        });
    }

    for cap in AXIOS_CALL.captures_iter(script) {
        let url = cap[2].to_string();
        let (path_params, query_params) = params_from_url(&url);
        calls.push(ApiCallSite {
            method: cap[1].to_ascii_uppercase(),
            url,
            path_params,
            query_params,
        });
    }

    for cap in JQUERY_AJAX_CALL.captures_iter(script) {
        let url = cap[1].to_string();
        let (path_params, query_params) = params_from_url(&url);
        calls.push(ApiCallSite {
            method: "GET".to_string(),
            url,
            path_params,
            query_params,
        });
    }

    for cap in JQUERY_SHORTHAND_CALL.captures_iter(script) {
        let url = cap[2].to_string();
        let (path_params, query_params) = params_from_url(&url);
        calls.push(ApiCallSite {
            method: cap[1].to_ascii_uppercase(),
            url,
            path_params,
            query_params,
        });
    }

    for cap in XHR_OPEN_CALL.captures_iter(script) {
        let url = cap[2].to_string();
        let (path_params, query_params) = params_from_url(&url);
        calls.push(ApiCallSite {
            method: cap[1].to_ascii_uppercase(),
            url,
            path_params,
            query_params,
        });
    }

    calls
}

fn extract_websockets(script: &str) -> Vec<String> {
    let mut urls: Vec<String> = WEBSOCKET_CTOR
        .captures_iter(script)
        .map(|c| c[1].to_string())
        .collect();
    urls.extend(WEBSOCKET_LITERAL.captures_iter(script).map(|c| c[1].to_string()));
    urls.sort();
    urls.dedup();
    urls
}

fn extract_routes(script: &str) -> Vec<String> {
    let mut routes: Vec<String> = ROUTE_JSX.captures_iter(script).map(|c| c[1].to_string()).collect();
    routes.extend(ROUTE_OBJECT.captures_iter(script).map(|c| c[1].to_string()));
    routes.extend(ROUTE_BUILDER.captures_iter(script).map(|c| c[1].to_string()));
    routes.sort();
    routes.dedup();
    routes
}

fn mask(value: &str) -> String {
    if value.len() <= 8 {
        "*".repeat(value.len())
    } else {
        format!("{}…{}", &value[..4], &value[value.len() - 4..])
    }
}

fn extract_secrets(script: &str) -> Vec<SecretMatch> {
    let mut found = Vec::new();
    for (kind, pattern) in SECRET_PATTERNS {
        let Ok(re) = Regex::new(pattern) else {
            continue;
        };
        for cap in re.captures_iter(script) {
            let value = cap
                .iter()
                .skip(1)
                .filter_map(|m| m.map(|m| m.as_str()))
                .last()
                .unwrap_or("");
            if value.is_empty() {
                continue;
            }
            let lower = value.to_ascii_lowercase();
            if SECRET_PLACEHOLDER_BLACKLIST.iter().any(|p| lower.contains(p)) {
                continue;
            }
            found.push(SecretMatch {
                kind: kind.to_string(),
                masked_value: mask(value),
            });
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_and_websocket_extraction() {
        let script = r#"
            fetch('/api/users').then(r => r.json());
            const ws = new WebSocket('wss://a.test/ws');
        "#;
        let result = extract(script);
        assert_eq!(result.api_calls.len(), 1);
        assert_eq!(result.api_calls[0].url, "/api/users");
        assert_eq!(result.api_calls[0].method, "GET");
        assert_eq!(result.websockets, vec!["wss://a.test/ws".to_string()]);
    }

    #[test]
    fn test_axios_and_xhr_calls() {
        let script = r#"
            axios.post('/api/login', data);
            var x = new XMLHttpRequest();
            x.open('PUT', '/api/users/:id');
        "#;
        let result = extract(script);
        let methods: Vec<&str> = result.api_calls.iter().map(|c| c.method.as_str()).collect();
        assert!(methods.contains(&"POST"));
        assert!(methods.contains(&"PUT"));
        let put_call = result
            .api_calls
            .iter()
            .find(|c| c.method == "PUT")
            .unwrap();
        assert_eq!(put_call.path_params, vec!["id".to_string()]);
    }

    #[test]
    fn test_secret_extraction_masks_and_filters_placeholders() {
        let script = r#"
            const cfg = { api_key: "sk_live_abcdef1234567890", other: "your_api_key" };
        "#;
        let result = extract_secrets(script);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].kind, "api_key");
        assert!(result[0].masked_value.contains('…'));
    }

    #[test]
    fn test_route_extraction() {
        let script = r#"
            <Route path="/dashboard" component={Dashboard} />
            const routes = [{ path: "/users/:id" }];
            app.route("/legacy");
        "#;
        let result = extract_routes(script);
        assert!(result.contains(&"/dashboard".to_string()));
        assert!(result.contains(&"/users/:id".to_string()));
        assert!(result.contains(&"/legacy".to_string()));
    }
}
