use std::collections::BTreeMap;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

// hosts we know about, first match wins so order matters
const BUILT_IN_RULES: &str = include_str!("header_rules.json");

/// what a stock firefox sends for a cross-site fetch/xhr
pub const DEFAULT_BROWSER_HEADERS: [(&str, &str); 6] = [
    (
        "user-agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:137.0) Gecko/20100101 Firefox/137.0",
    ),
    ("accept", "*/*"),
    ("accept-language", "en-US,en;q=0.5"),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "cross-site"),
];

#[derive(Debug, Error)]
pub enum HeaderRuleError {
    #[error("failed to read header rules: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid header rules json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid host pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// one entry of a rules file
#[derive(Debug, Deserialize)]
struct RuleDefinition {
    patterns: Vec<String>,
    origin: String,
    referer: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOverlay {
    pub origin: String,
    pub referer: String,
    pub extra_headers: Vec<(String, String)>,
}

#[derive(Debug)]
struct HeaderRule {
    patterns: Vec<Regex>,
    overlay: HeaderOverlay,
}

impl HeaderRule {
    fn matches(&self, hostname: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(hostname))
    }
}

fn parse_rules(json: &str) -> Result<Vec<HeaderRule>, HeaderRuleError> {
    let definitions: Vec<RuleDefinition> = serde_json::from_str(json)?;

    definitions
        .into_iter()
        .map(|def| {
            let patterns = def
                .patterns
                .iter()
                .map(|pattern| {
                    RegexBuilder::new(pattern)
                        .case_insensitive(true)
                        .build()
                        .map_err(|source| HeaderRuleError::Pattern {
                            pattern: pattern.clone(),
                            source,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            Ok(HeaderRule {
                patterns,
                overlay: HeaderOverlay {
                    origin: def.origin,
                    referer: def.referer,
                    extra_headers: def.headers.into_iter().collect(),
                },
            })
        })
        .collect()
}

/// Ordered host rules that make upstream requests look like they came from the page that
/// embeds the stream.
#[derive(Debug)]
pub struct HeaderResolverService {
    rules: Vec<HeaderRule>,
}

impl HeaderResolverService {
    pub fn built_in() -> Result<Self, HeaderRuleError> {
        Ok(Self {
            rules: parse_rules(BUILT_IN_RULES)?,
        })
    }

    /// built in rules, with the rules from `path` (if any) evaluated first
    pub fn load(path: Option<&Path>) -> Result<Self, HeaderRuleError> {
        let mut resolver = Self::built_in()?;

        if let Some(path) = path {
            let custom = parse_rules(&std::fs::read_to_string(path)?)?;
            info!("loaded {} header rules from {}", custom.len(), path.display());
            resolver.rules.splice(0..0, custom);
        }

        debug!("{} header rules active", resolver.rules.len());
        Ok(resolver)
    }

    pub fn from_json(json: &str) -> Result<Self, HeaderRuleError> {
        Ok(Self {
            rules: parse_rules(json)?,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// first rule with a pattern matching `hostname`
    pub fn resolve(&self, hostname: &str) -> Option<&HeaderOverlay> {
        self.rules
            .iter()
            .find(|rule| rule.matches(hostname))
            .map(|rule| &rule.overlay)
    }

    /// Full browser header set for a target: the default browser headers, then origin/referer
    /// (from a rule or the target's own scheme and host), then the rule's extra headers.
    pub fn headers_for(&self, url: &Url) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = DEFAULT_BROWSER_HEADERS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        match url.host_str().and_then(|host| self.resolve(host)) {
            Some(overlay) => {
                headers.push(("origin".to_string(), overlay.origin.clone()));
                headers.push(("referer".to_string(), overlay.referer.clone()));
                headers.extend(overlay.extra_headers.iter().cloned());
            }
            None => {
                let origin = url.origin().ascii_serialization();
                headers.push(("referer".to_string(), format!("{}/", origin)));
                headers.push(("origin".to_string(), origin));
            }
        }

        headers
    }
}
