//! Environment-driven configuration for the crawl engine (spec §6.4).
//! Everything the core reads is optional with a documented default —
//! only `target` has no fallback.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub target: String,
    pub workers: usize,
    pub max_depth: u32,
    pub timeout: Duration,
    pub user_agent: String,
    pub custom_headers: HashMap<String, String>,
    pub fast_mode: bool,
    pub passive_api_discovery: bool,
    pub form_analysis: bool,
    pub js_analysis: bool,
    pub shutdown_budget: Duration,
    pub rate_limit: RateLimitSettings,
    pub browser: BrowserSettings,
    pub scope: ScopeSettings,
    pub state: StateSettings,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub rps: u32,
    pub burst: u32,
    pub per_domain_delay: Option<Duration>,
    pub adaptive: bool,
    pub adaptive_window: u32,
    pub adaptive_min_rate: u32,
    pub adaptive_max_rate: u32,
}

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub enabled: bool,
    pub pool_size: usize,
    pub headless: bool,
    pub recycle_after: u32,
    pub ignore_https_errors: bool,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct ScopeSettings {
    pub allowed_domains: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub follow_external: bool,
}

#[derive(Debug, Clone)]
pub struct StateSettings {
    pub path: Option<String>,
    pub save_interval: Duration,
}

impl Config {
    /// Loads configuration from the environment. `target` is the only
    /// value that must come from the caller rather than `CRAWL_TARGET`,
    /// so the same loader works for both CLI and embedded use.
    pub fn from_env(target: impl Into<String>) -> Result<Self, ConfigError> {
        let workers = parse_env("CRAWL_WORKERS", 8)?;
        let max_depth = parse_env("CRAWL_MAX_DEPTH", 5)?;
        let timeout_secs: u64 = parse_env("CRAWL_TIMEOUT_SECS", 30)?;
        let user_agent =
            env::var("CRAWL_USER_AGENT").unwrap_or_else(|_| "crawlcore/1.0".to_string());
        let custom_headers = parse_header_list("CRAWL_CUSTOM_HEADERS");
        let fast_mode = parse_bool_env("CRAWL_FAST_MODE", false);
        let passive_api_discovery = parse_bool_env("CRAWL_PASSIVE_API_DISCOVERY", true);
        let form_analysis = parse_bool_env("CRAWL_FORM_ANALYSIS", true);
        let js_analysis = parse_bool_env("CRAWL_JS_ANALYSIS", true);
        let shutdown_budget_secs: u64 = parse_env("CRAWL_SHUTDOWN_BUDGET_SECS", 10)?;

        let rate_limit = RateLimitSettings {
            rps: parse_env("RATE_LIMIT_RPS", 5)?,
            burst: parse_env("RATE_LIMIT_BURST", 10)?,
            per_domain_delay: parse_env_opt::<u64>("RATE_LIMIT_PER_DOMAIN_DELAY_MS")?
                .map(Duration::from_millis),
            adaptive: parse_bool_env("RATE_LIMIT_ADAPTIVE", false),
            adaptive_window: parse_env("RATE_LIMIT_ADAPTIVE_WINDOW", 50)?,
            adaptive_min_rate: parse_env("RATE_LIMIT_ADAPTIVE_MIN_RATE", 1)?,
            adaptive_max_rate: parse_env("RATE_LIMIT_ADAPTIVE_MAX_RATE", 20)?,
        };

        let browser = BrowserSettings {
            enabled: parse_bool_env("BROWSER_ENABLED", true),
            pool_size: parse_env("BROWSER_POOL_SIZE", 4)?,
            headless: parse_bool_env("BROWSER_HEADLESS", true),
            recycle_after: parse_env("BROWSER_RECYCLE_AFTER", 100)?,
            ignore_https_errors: parse_bool_env("BROWSER_IGNORE_HTTPS_ERRORS", false),
            max_retries: parse_env("BROWSER_MAX_RETRIES", 2)?,
        };

        let scope = ScopeSettings {
            allowed_domains: parse_csv("SCOPE_ALLOWED_DOMAINS"),
            include_patterns: parse_csv("SCOPE_INCLUDE_PATTERNS"),
            exclude_patterns: parse_csv("SCOPE_EXCLUDE_PATTERNS"),
            follow_external: parse_bool_env("SCOPE_FOLLOW_EXTERNAL", false),
        };

        let state = StateSettings {
            path: env::var("STATE_PATH").ok(),
            save_interval: Duration::from_secs(parse_env("STATE_SAVE_INTERVAL_SECS", 30)?),
        };

        Ok(Config {
            target: target.into(),
            workers,
            max_depth,
            timeout: Duration::from_secs(timeout_secs),
            user_agent,
            custom_headers,
            fast_mode,
            passive_api_discovery,
            form_analysis,
            js_analysis,
            shutdown_budget: Duration::from_secs(shutdown_budget_secs),
            rate_limit,
            browser,
            scope,
            state,
        })
    }
}

fn parse_env<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key, "could not parse value")),
        Err(_) => Ok(default),
    }
}

fn parse_env_opt<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key, "could not parse value")),
        Err(_) => Ok(None),
    }
}

fn parse_bool_env(key: &'static str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn parse_csv(key: &'static str) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_header_list(key: &'static str) -> HashMap<String, String> {
    env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .filter_map(|pair| pair.trim().split_once('='))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv_trims_and_drops_empty() {
        assert_eq!(
            parse_csv_from(" a.test, b.test ,,c.test"),
            vec!["a.test", "b.test", "c.test"]
        );
    }

    fn parse_csv_from(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    #[test]
    fn test_parse_header_list() {
        let headers = parse_header_list_from("X-Foo=bar, X-Baz = qux");
        assert_eq!(headers.get("X-Foo").map(String::as_str), Some("bar"));
        assert_eq!(headers.get("X-Baz").map(String::as_str), Some("qux"));
    }

    fn parse_header_list_from(raw: &str) -> HashMap<String, String> {
        raw.split(',')
            .filter_map(|pair| pair.trim().split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect()
    }

    #[test]
    fn test_parse_bool_env_values() {
        for truthy in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var("CONFIG_TEST_BOOL", truthy);
            assert!(parse_bool_env("CONFIG_TEST_BOOL", false));
        }
        std::env::remove_var("CONFIG_TEST_BOOL");
        assert!(parse_bool_env("CONFIG_TEST_BOOL", true));
    }
}
