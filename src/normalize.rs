//! Canonicalizes URLs for dedup and map keying, and classifies hash
//! fragments so SPA routes survive normalization while UI-state anchors
//! are dropped (spec §4.1, reference constants in §6.2).

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use url::Url;

const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "_ga",
    "gclid",
    "fbclid",
    "ref",
    "source",
    "_",
    "timestamp",
    "t",
    "nocache",
    "cache",
    "phpsessid",
    "jsessionid",
    "sid",
    "session_id",
];

const UI_STATE_FRAGMENT_PARAMS: &[&str] = &[
    "modal",
    "popup",
    "dialog",
    "overlay",
    "drawer",
    "scroll",
    "scrolltop",
    "scrolly",
    "scrollx",
    "tab",
    "panel",
    "accordion",
    "section",
    "expanded",
    "collapsed",
    "open",
    "closed",
    "highlight",
    "focus",
    "selected",
    "active",
    "view",
    "layout",
    "display",
];

static UI_STATE_FRAGMENT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^modal[-=]",
        r"^popup[-=]",
        r"^tab[-=]",
        r"^panel[-=]",
        r"^section[-=]",
        r"^scroll[-=]?\d*$",
        r"^page[-=]?\d+$",
        r"^offset[-=]?\d+$",
        r"^[a-z]+-\d+$",
        r"^\d+$",
        r"^[a-f0-9]{32}$",
        r"^[a-f0-9]{40}$",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("static pattern compiles"))
    .collect()
});

static ROUTE_STATE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9._-]+$").expect("static pattern compiles"));

fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    TRACKING_PARAMS.contains(&lower.as_str())
}

fn is_ui_state_fragment_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    UI_STATE_FRAGMENT_PARAMS.contains(&lower.as_str())
}

/// True iff `fragment` matches a whole-fragment UI-state pattern and
/// therefore represents display state rather than a distinct page.
pub fn should_skip_fragment(fragment: &str) -> bool {
    UI_STATE_FRAGMENT_PATTERNS
        .iter()
        .any(|re| re.is_match(fragment))
}

/// True iff `raw_url` carries a fragment the normalizer would classify
/// as a SPA route rather than an opaque anchor or UI-state marker — the
/// worker uses this to decide whether a page needs the browser's
/// hash-route navigation path (spec §4.11 step 3) instead of a plain
/// HTTP fetch.
pub fn has_routing_fragment(raw_url: &str) -> bool {
    let Ok(parsed) = Url::parse(raw_url) else {
        return false;
    };
    let Some(fragment) = parsed.fragment() else {
        return false;
    };
    if fragment.is_empty() {
        return false;
    }
    let stripped = fragment.strip_prefix('!').unwrap_or(fragment);
    looks_like_routing_fragment(stripped)
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let mut segments: Vec<&str> = Vec::new();
    for raw in path.split('/') {
        if raw.is_empty() {
            continue;
        }
        match raw {
            "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}", segments.join("/"))
}

fn sorted_query(pairs: Vec<(String, String)>, drop: &dyn Fn(&str) -> bool) -> String {
    let mut kept: Vec<(String, String)> = pairs.into_iter().filter(|(k, _)| !drop(k)).collect();
    kept.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    kept.iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                url::form_urlencoded::byte_serialize(k.as_bytes()).collect::<String>(),
                url::form_urlencoded::byte_serialize(v.as_bytes()).collect::<String>()
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// True for fragments that are unambiguously path-shaped routes — a
/// leading `/` or an embedded `/` with no whitespace. These never read
/// as UI-state markers, so they short-circuit the UI-state check below.
fn is_path_shaped_route(remainder: &str) -> bool {
    remainder.starts_with('/') || (remainder.contains('/') && !remainder.contains(char::is_whitespace))
}

fn looks_like_routing_fragment(remainder: &str) -> bool {
    is_path_shaped_route(remainder)
        || (!should_skip_fragment(remainder) && ROUTE_STATE_PATTERN.is_match(remainder))
}

fn normalize_fragment(fragment: &str) -> Option<String> {
    let stripped = fragment.strip_prefix('!').unwrap_or(fragment);

    if !is_path_shaped_route(stripped) && should_skip_fragment(stripped) {
        return None;
    }

    if looks_like_routing_fragment(stripped) {
        let (path_part, query_part) = match stripped.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (stripped, None),
        };
        let normalized_path = normalize_path(path_part);
        let normalized_query = query_part.map(|q| {
            let pairs: Vec<(String, String)> = url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            sorted_query(pairs, &|name| {
                is_tracking_param(name) || is_ui_state_fragment_param(name)
            })
        });
        return Some(match normalized_query {
            Some(q) if !q.is_empty() => format!("{normalized_path}?{q}"),
            _ => normalized_path,
        });
    }

    Some(fragment.to_string())
}

/// Produces the canonical string form of `raw_url`.
///
/// On parse failure, returns the input verbatim — callers that need to
/// distinguish a parse failure should call `url::Url::parse` themselves
/// first.
pub fn normalize(raw_url: &str) -> String {
    let Ok(mut parsed) = Url::parse(raw_url) else {
        return raw_url.to_string();
    };

    let scheme = parsed.scheme().to_ascii_lowercase();
    let _ = parsed.set_scheme(&scheme);

    if let Some(host) = parsed.host_str() {
        let lower = host.to_ascii_lowercase();
        let _ = parsed.set_host(Some(&lower));
    }

    let default_port = match scheme.as_str() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    };
    if parsed.port() == default_port {
        let _ = parsed.set_port(None);
    }

    let normalized_path = normalize_path(parsed.path());
    parsed.set_path(&normalized_path);

    let query_pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if query_pairs.is_empty() {
        parsed.set_query(None);
    } else {
        let query = sorted_query(query_pairs, &|name| is_tracking_param(name));
        parsed.set_query(if query.is_empty() { None } else { Some(&query) });
    }

    match parsed.fragment() {
        Some(fragment) if !fragment.is_empty() => match normalize_fragment(fragment) {
            Some(f) => parsed.set_fragment(Some(&f)),
            None => parsed.set_fragment(None),
        },
        _ => parsed.set_fragment(None),
    }

    parsed.to_string()
}

/// Tracking query-parameter names removed during normalization, exposed
/// for callers that want to pre-filter before constructing a URL.
pub fn tracking_params() -> HashSet<&'static str> {
    TRACKING_PARAMS.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotence() {
        let urls = [
            "HTTPS://Example.COM:443/a/../b/?utm_source=x&id=1",
            "https://a.test/#/home",
            "https://a.test/#modal-123",
            "https://a.test/#!/route",
            "not a url at all",
        ];
        for u in urls {
            let once = normalize(u);
            let twice = normalize(&once);
            assert_eq!(once, twice, "not idempotent for {u}");
        }
    }

    #[test]
    fn test_equivalence() {
        let a = normalize("HTTPS://Example.COM:443/a/../b/?utm_source=x&id=1");
        let b = normalize("https://example.com/b?id=1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_fragment_classification() {
        assert!(normalize("https://a.test/#/dashboard").ends_with("#/dashboard"));
        assert!(!normalize("https://a.test/#modal-123").contains('#'));
        assert_eq!(
            normalize("https://a.test/#!/route"),
            "https://a.test/#/route"
        );
    }

    #[test]
    fn test_should_skip_fragment() {
        assert!(should_skip_fragment("modal-42"));
        assert!(should_skip_fragment("page-3"));
        assert!(should_skip_fragment("5f4dcc3b5aa765d61d8327deb882cf99"));
        assert!(!should_skip_fragment("/dashboard"));
    }

    #[test]
    fn test_has_routing_fragment() {
        assert!(has_routing_fragment("https://a.test/#/dashboard"));
        assert!(has_routing_fragment("https://a.test/#!/route"));
        assert!(!has_routing_fragment("https://a.test/#modal-123"));
        assert!(!has_routing_fragment("https://a.test/page"));
    }

    #[test]
    fn test_parse_failure_returns_verbatim() {
        assert_eq!(normalize("::not a url::"), "::not a url::");
    }

    #[test]
    fn test_default_port_stripped() {
        assert_eq!(normalize("http://a.test:80/x"), "http://a.test/x");
        assert_eq!(normalize("https://a.test:443/x"), "https://a.test/x");
        assert_eq!(normalize("https://a.test:8443/x"), "https://a.test:8443/x");
    }

    #[test]
    fn test_trailing_slash_collapsed_except_root() {
        assert_eq!(normalize("https://a.test/b/"), "https://a.test/b");
        assert_eq!(normalize("https://a.test/"), "https://a.test/");
        assert_eq!(normalize("https://a.test//b//c/"), "https://a.test/b/c");
    }

    #[test]
    fn test_query_sorted_and_tracking_removed() {
        assert_eq!(
            normalize("https://a.test/x?b=2&a=1&utm_campaign=foo"),
            "https://a.test/x?a=1&b=2"
        );
    }
}
