//! HTML extraction: links (including SPA routing attributes), scripts,
//! stylesheets, images, iframes, meta tags, and forms (spec §4.10).

use crate::models::{Form, FormInput, Link};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashMap;

const CSRF_TOKEN_NAME_PATTERNS: &[&str] = &[
    "csrf",
    "_csrf",
    "csrftoken",
    "csrf_token",
    "csrfmiddlewaretoken",
    "__requestverificationtoken",
    "authenticity_token",
    "_token",
    "xsrf",
    "_xsrf",
    "antiforgery",
];

static UI_SREF_ARGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(.*\)").expect("static pattern"));

pub struct HtmlExtraction {
    pub links: Vec<Link>,
    pub scripts: Vec<String>,
    pub stylesheets: Vec<String>,
    pub images: Vec<String>,
    pub iframes: Vec<String>,
    pub meta: HashMap<String, String>,
    pub forms: Vec<Form>,
}

/// Runs the full HTML extraction pass over `html`, resolving relative
/// URLs against `base_url`.
pub fn extract(html: &str, base_url: &str, depth: u32) -> HtmlExtraction {
    let document = Html::parse_document(html);
    let base = url::Url::parse(base_url).ok();

    HtmlExtraction {
        links: extract_links(&document, base.as_ref()),
        scripts: select_attr(&document, "script[src]", "src", base.as_ref()),
        stylesheets: select_attr(&document, "link[rel=stylesheet][href]", "href", base.as_ref()),
        images: select_attr(&document, "img[src]", "src", base.as_ref()),
        iframes: select_attr(&document, "iframe[src]", "src", base.as_ref()),
        meta: extract_meta(&document),
        forms: extract_forms(&document, base_url, depth),
    }
}

fn resolve_url(base: Option<&url::Url>, href: &str) -> Option<String> {
    let trimmed = href.trim();
    if trimmed.is_empty()
        || trimmed.starts_with("javascript:")
        || trimmed.starts_with("mailto:")
        || trimmed.starts_with("tel:")
        || trimmed.starts_with("data:")
    {
        return None;
    }

    // Fragment-only hrefs are kept only when they look like SPA routes.
    if let Some(fragment) = trimmed.strip_prefix('#') {
        if fragment.starts_with('/') || fragment.starts_with('!') {
            return base.map(|b| format!("{}/{}", b.origin().ascii_serialization(), trimmed));
        }
        return None;
    }

    match base {
        Some(base) => base.join(trimmed).ok().map(|u| u.to_string()),
        None => Some(trimmed.to_string()),
    }
}

fn select_attr(
    document: &Html,
    selector: &str,
    attr: &str,
    base: Option<&url::Url>,
) -> Vec<String> {
    let Ok(sel) = Selector::parse(selector) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|el| el.value().attr(attr))
        .filter_map(|v| resolve_url(base, v))
        .collect()
}

fn extract_links(document: &Html, base: Option<&url::Url>) -> Vec<Link> {
    let mut links = Vec::new();

    if let Ok(sel) = Selector::parse("a[href]") {
        for el in document.select(&sel) {
            if let Some(href) = el.value().attr("href") {
                if let Some(url) = resolve_url(base, href) {
                    links.push(Link {
                        url,
                        anchor_text: el.text().collect::<String>().trim().to_string(),
                    });
                }
            }
        }
    }

    if let Ok(sel) = Selector::parse("[ng-href]") {
        for el in document.select(&sel) {
            if let Some(href) = el.value().attr("ng-href") {
                if href.contains("{{") {
                    continue;
                }
                if let Some(url) = resolve_url(base, href) {
                    links.push(Link {
                        url,
                        anchor_text: el.text().collect::<String>().trim().to_string(),
                    });
                }
            }
        }
    }

    if let Ok(sel) = Selector::parse("[ui-sref]") {
        for el in document.select(&sel) {
            if let Some(state) = el.value().attr("ui-sref") {
                let state_name = UI_SREF_ARGS.replace_all(state, "").trim().to_string();
                if let Some(origin) = base.map(|b| b.origin().ascii_serialization()) {
                    links.push(Link {
                        url: format!("{origin}/#/{state_name}"),
                        anchor_text: el.text().collect::<String>().trim().to_string(),
                    });
                }
            }
        }
    }

    if let Ok(sel) = Selector::parse("[routerLink]") {
        for el in document.select(&sel) {
            if let Some(href) = el.value().attr("routerLink") {
                if let Some(url) = resolve_url(base, href) {
                    links.push(Link {
                        url,
                        anchor_text: el.text().collect::<String>().trim().to_string(),
                    });
                }
            }
        }
    }

    links
}

fn extract_meta(document: &Html) -> HashMap<String, String> {
    let mut meta = HashMap::new();
    let Ok(sel) = Selector::parse("meta") else {
        return meta;
    };
    for el in document.select(&sel) {
        let key = el
            .value()
            .attr("name")
            .or_else(|| el.value().attr("property"));
        if let (Some(key), Some(content)) = (key, el.value().attr("content")) {
            meta.insert(key.to_string(), content.to_string());
        }
    }
    meta
}

pub fn extract_forms(document: &Html, page_url: &str, depth: u32) -> Vec<Form> {
    let Ok(form_sel) = Selector::parse("form") else {
        return Vec::new();
    };
    let Ok(input_sel) = Selector::parse("input, textarea, select") else {
        return Vec::new();
    };
    let base = url::Url::parse(page_url).ok();

    document
        .select(&form_sel)
        .map(|form_el| {
            let action = form_el
                .value()
                .attr("action")
                .and_then(|a| resolve_url(base.as_ref(), a))
                .unwrap_or_else(|| page_url.to_string());
            let method = form_el
                .value()
                .attr("method")
                .map(|m| m.to_ascii_uppercase())
                .unwrap_or_else(|| "GET".to_string());
            let enctype = form_el
                .value()
                .attr("enctype")
                .unwrap_or("application/x-www-form-urlencoded")
                .to_string();

            let mut inputs = Vec::new();
            let mut has_csrf_token = false;

            for input_el in form_el.select(&input_sel) {
                let name = input_el.value().attr("name").unwrap_or("").to_string();
                if name.is_empty() {
                    continue;
                }
                if is_csrf_name(&name) {
                    has_csrf_token = true;
                }
                let input_type = input_el
                    .value()
                    .attr("type")
                    .unwrap_or_else(|| match input_el.value().name() {
                        "textarea" => "textarea",
                        "select" => "select",
                        _ => "text",
                    })
                    .to_string();
                inputs.push(FormInput {
                    name,
                    input_type,
                    value: input_el.value().attr("value").map(String::from),
                    required: input_el.value().attr("required").is_some(),
                    placeholder: input_el.value().attr("placeholder").map(String::from),
                    pattern: input_el.value().attr("pattern").map(String::from),
                    min_length: input_el
                        .value()
                        .attr("minlength")
                        .and_then(|v| v.parse().ok()),
                    max_length: input_el
                        .value()
                        .attr("maxlength")
                        .and_then(|v| v.parse().ok()),
                });
            }

            Form {
                page_url: page_url.to_string(),
                action,
                method,
                enctype,
                inputs,
                has_csrf_token,
                depth,
            }
        })
        .collect()
}

fn is_csrf_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    CSRF_TOKEN_NAME_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_and_spa_attribute_extraction() {
        let html = r#"
            <a href="/b">B</a>
            <a ng-href="/c">C</a>
            <a ng-href="{{dynamic}}">skip</a>
            <a ui-sref="users.detail({id: 5})">User</a>
            <a routerLink="/d">D</a>
        "#;
        let result = extract(html, "https://a.test/", 0);
        let urls: Vec<&str> = result.links.iter().map(|l| l.url.as_str()).collect();
        assert!(urls.contains(&"https://a.test/b"));
        assert!(urls.contains(&"https://a.test/c"));
        assert!(urls.contains(&"https://a.test/d"));
        assert!(urls.iter().any(|u| u.ends_with("/#/users.detail")));
        assert_eq!(result.links.len(), 4);
    }

    #[test]
    fn test_fragment_only_href_spa_route_kept() {
        let html = r#"<a href="#/settings">Settings</a><a href="#anchor">Anchor</a>"#;
        let result = extract(html, "https://a.test/app", 0);
        let urls: Vec<&str> = result.links.iter().map(|l| l.url.as_str()).collect();
        assert!(urls.iter().any(|u| u.contains("#/settings")));
        assert_eq!(result.links.len(), 1);
    }

    #[test]
    fn test_forms_and_csrf_detection() {
        let html = r#"
            <form action="/submit" method="post">
                <input name="csrf_token" type="hidden" value="abc">
                <input name="email" type="email" required>
            </form>
        "#;
        let result = extract(html, "https://a.test/form", 2);
        assert_eq!(result.forms.len(), 1);
        let form = &result.forms[0];
        assert_eq!(form.action, "https://a.test/submit");
        assert_eq!(form.method, "POST");
        assert!(form.has_csrf_token);
        assert_eq!(form.depth, 2);
        assert_eq!(form.inputs.len(), 2);
    }

    #[test]
    fn test_non_navigable_schemes_rejected() {
        let html = r#"<a href="javascript:void(0)">x</a><a href="mailto:a@b.com">y</a>"#;
        let result = extract(html, "https://a.test/", 0);
        assert!(result.links.is_empty());
    }

    #[test]
    fn test_meta_tags() {
        let html = r#"<meta name="description" content="hi"><meta property="og:title" content="Title">"#;
        let result = extract(html, "https://a.test/", 0);
        assert_eq!(result.meta.get("description").map(String::as_str), Some("hi"));
        assert_eq!(result.meta.get("og:title").map(String::as_str), Some("Title"));
    }
}
