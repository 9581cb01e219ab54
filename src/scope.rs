//! Accept/reject policy for discovered URLs (spec §4.3).

use regex::Regex;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("invalid target URL: {0}")]
    InvalidTarget(String),
    #[error("uncompilable pattern {pattern:?}: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub struct ScopeConfig {
    pub allowed_domains: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub max_depth: u32,
    pub follow_external: bool,
}

/// Decides whether a discovered URL may be crawled, given the target
/// host, extra allowed hosts, include/exclude patterns and a depth cap.
pub struct ScopeChecker {
    allowed_domains: Vec<String>,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    max_depth: u32,
    follow_external: bool,
}

impl ScopeChecker {
    pub fn new(target: &str, config: ScopeConfig) -> Result<Self, ScopeError> {
        let target_url =
            Url::parse(target).map_err(|_| ScopeError::InvalidTarget(target.to_string()))?;
        let target_host = target_url
            .host_str()
            .ok_or_else(|| ScopeError::InvalidTarget(target.to_string()))?
            .to_ascii_lowercase();

        let mut allowed_domains: Vec<String> = vec![target_host];
        allowed_domains.extend(config.allowed_domains.iter().map(|d| d.to_ascii_lowercase()));

        let include = compile_all(&config.include_patterns)?;
        let exclude = compile_all(&config.exclude_patterns)?;

        Ok(ScopeChecker {
            allowed_domains,
            include,
            exclude,
            max_depth: config.max_depth,
            follow_external: config.follow_external,
        })
    }

    /// Evaluates the seven-step acceptance algorithm from §4.3.
    pub fn in_scope(&self, url: &str, depth: u32) -> bool {
        if self.max_depth > 0 && depth > self.max_depth {
            return false;
        }

        let Ok(parsed) = Url::parse(url) else {
            return false;
        };

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return false;
        }

        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let host_in_scope = self
            .allowed_domains
            .iter()
            .any(|allowed| host == *allowed || host.ends_with(&format!(".{allowed}")));

        if !host_in_scope && !self.follow_external {
            return false;
        }

        if self.exclude.iter().any(|re| re.is_match(url)) {
            return false;
        }

        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(url)) {
            return false;
        }

        true
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, ScopeError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|source| ScopeError::BadPattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(follow_external: bool, max_depth: u32) -> ScopeChecker {
        ScopeChecker::new(
            "https://a.test/",
            ScopeConfig {
                allowed_domains: vec![],
                include_patterns: vec![],
                exclude_patterns: vec![],
                max_depth,
                follow_external,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_depth_cap() {
        let c = checker(false, 2);
        assert!(c.in_scope("https://a.test/x", 2));
        assert!(!c.in_scope("https://a.test/x", 3));
    }

    #[test]
    fn test_unlimited_depth_when_zero() {
        let c = checker(false, 0);
        assert!(c.in_scope("https://a.test/x", 9999));
    }

    #[test]
    fn test_subdomain_allowed() {
        let c = checker(false, 0);
        assert!(c.in_scope("https://www.a.test/x", 0));
        assert!(!c.in_scope("https://evil.com/x", 0));
    }

    #[test]
    fn test_follow_external() {
        let c = checker(true, 0);
        assert!(c.in_scope("https://other.test/x", 0));
    }

    #[test]
    fn test_scheme_rejected() {
        let c = checker(true, 0);
        assert!(!c.in_scope("ftp://a.test/x", 0));
        assert!(!c.in_scope("javascript:alert(1)", 0));
    }

    #[test]
    fn test_exclude_outranks_include() {
        let c = ScopeChecker::new(
            "https://a.test/",
            ScopeConfig {
                allowed_domains: vec![],
                include_patterns: vec![r"/public/".to_string()],
                exclude_patterns: vec![r"/public/admin".to_string()],
                max_depth: 0,
                follow_external: false,
            },
        )
        .unwrap();
        assert!(c.in_scope("https://a.test/public/page", 0));
        assert!(!c.in_scope("https://a.test/public/admin", 0));
        assert!(!c.in_scope("https://a.test/private/page", 0));
    }

    #[test]
    fn test_monotonicity_with_depth() {
        let c = checker(false, 5);
        assert!(c.in_scope("https://a.test/x", 3));
        assert!(c.in_scope("https://a.test/x", 2));
    }

    #[test]
    fn test_bad_pattern_errors_at_construction() {
        let err = ScopeChecker::new(
            "https://a.test/",
            ScopeConfig {
                allowed_domains: vec![],
                include_patterns: vec!["(".to_string()],
                exclude_patterns: vec![],
                max_depth: 0,
                follow_external: false,
            },
        );
        assert!(err.is_err());
    }
}
