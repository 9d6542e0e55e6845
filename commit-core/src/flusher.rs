//! Cache-flush rule matching and the vendor-agnostic flush interface (C6).
//!
//! The core never speaks a real CDN vendor's wire protocol; it only builds the
//! URL/ARL set to flush and hands it to a [`Flusher`] implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::config::EnvironmentConfig;

/// `(name, templates, includes, excludes)`. A path matches the rule iff it
/// matches at least one include and no exclude, always against a
/// leading-slash-normalized path.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheFlushRule {
    pub name: String,
    pub templates: Vec<String>,
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl CacheFlushRule {
    fn normalize(path: &str) -> String {
        format!("/{}", path.trim_start_matches('/'))
    }

    fn compiled(&self, patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
        patterns.iter().map(|p| Regex::new(p)).collect()
    }

    /// True iff `path` matches at least one include and no exclude. Matching
    /// is insensitive to a leading slash.
    pub fn matches(&self, path: &str) -> Result<bool, regex::Error> {
        let normalized = Self::normalize(path);
        let includes = self.compiled(&self.includes)?;
        if !includes.iter().any(|re| re.is_match(&normalized)) {
            return Ok(false);
        }
        let excludes = self.compiled(&self.excludes)?;
        Ok(!excludes.iter().any(|re| re.is_match(&normalized)))
    }

    /// Render every template for a matched path, substituting `{ttl}`/`{path}`.
    /// If a template has no `{path}` placeholder, the path is appended.
    pub fn render(&self, path: &str, ttl: &str) -> Vec<String> {
        let normalized = Self::normalize(path);
        self.templates
            .iter()
            .map(|tpl| {
                let rendered = tpl.replace("{ttl}", ttl);
                if rendered.contains("{path}") {
                    rendered.replace("{path}", normalized.trim_start_matches('/'))
                } else {
                    format!("{rendered}{normalized}")
                }
            })
            .collect()
    }
}

/// A request to purge one logical path from the edge, expanded across aliases
/// before rule matching.
#[derive(Debug, Clone)]
pub struct FlushRequest {
    pub env: String,
    pub paths: Vec<String>,
    pub ttl: String,
}

/// The vendor-agnostic fast-purge client. Implementors only need to guarantee
/// idempotent submission and an honest success/failure result.
#[async_trait]
pub trait VendorClient: Send + Sync {
    async fn purge(&self, env: &str, urls: &[String]) -> Result<(), String>;
}

/// No-op vendor used when fastpurge credentials are absent, or in tests.
pub struct NullVendorClient;

#[async_trait]
impl VendorClient for NullVendorClient {
    async fn purge(&self, _env: &str, _urls: &[String]) -> Result<(), String> {
        Ok(())
    }
}

pub struct Flusher<'a> {
    rules: &'a HashMap<String, CacheFlushRule>,
    vendor: &'a dyn VendorClient,
}

impl<'a> Flusher<'a> {
    pub fn new(rules: &'a HashMap<String, CacheFlushRule>, vendor: &'a dyn VendorClient) -> Self {
        Self { rules, vendor }
    }

    /// Run the flush for one request against `env`'s configured rules.
    /// A no-op success when the environment isn't fastpurge-enabled or has no
    /// matching rule for any path.
    #[tracing::instrument(skip(self, env_config, request), fields(env = %request.env))]
    pub async fn run(
        &self,
        env_config: &EnvironmentConfig,
        request: &FlushRequest,
    ) -> Result<(), String> {
        if !env_config.fastpurge_enabled() {
            tracing::debug!("fastpurge not enabled for environment, skipping flush");
            return Ok(());
        }

        let mut urls = Vec::new();
        for rule_name in &env_config.cache_flush_rules {
            let Some(rule) = self.rules.get(rule_name) else {
                continue;
            };
            for path in &request.paths {
                match rule.matches(path) {
                    Ok(true) => urls.extend(rule.render(path, &request.ttl)),
                    Ok(false) => {}
                    Err(err) => tracing::warn!(rule = %rule.name, error = %err, "bad rule regex"),
                }
            }
        }

        if urls.is_empty() {
            return Ok(());
        }

        match self.vendor.purge(&request.env, &urls).await {
            Ok(()) => {
                metrics::counter!("commit_cache_flush_success_total").increment(1);
                Ok(())
            }
            Err(err) => {
                metrics::counter!("commit_cache_flush_failure_total").increment(1);
                tracing::warn!(error = %err, "cache flush failed, commit is unaffected");
                Err(err)
            }
        }
    }

    /// Expand `path` through each configured alias, returning the original
    /// path plus every aliased variant.
    pub fn expand_aliases(path: &str, aliases: &[crate::config::AliasConfig]) -> Vec<String> {
        let mut out = vec![path.to_string()];
        for alias in aliases {
            if let Some(rest) = path.strip_prefix(alias.src.as_str()) {
                out.push(format!("{}{}", alias.dest, rest));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> CacheFlushRule {
        CacheFlushRule {
            name: "edge".to_string(),
            templates: vec!["https://cdn.example.com{path}".to_string()],
            includes: vec!["^/content/.*".to_string()],
            excludes: vec!["^/content/private/.*".to_string()],
        }
    }

    #[test]
    fn leading_slash_is_normalized() {
        let r = rule();
        assert_eq!(r.matches("/content/foo").unwrap(), true);
        assert_eq!(r.matches("content/foo").unwrap(), true);
    }

    #[test]
    fn excludes_win_over_includes() {
        let r = rule();
        assert!(!r.matches("/content/private/foo").unwrap());
    }

    #[test]
    fn non_matching_path_is_rejected() {
        let r = rule();
        assert!(!r.matches("/other/foo").unwrap());
    }

    #[test]
    fn template_substitutes_path_and_ttl() {
        let r = CacheFlushRule {
            name: "arl".to_string(),
            templates: vec!["S/=/123/22334455/{ttl}/cdn1.example.com/{path}".to_string()],
            includes: vec!["^/.*".to_string()],
            excludes: vec![],
        };
        let rendered = r.render("/a/b", "3600");
        assert_eq!(
            rendered,
            vec!["S/=/123/22334455/3600/cdn1.example.com/a/b".to_string()]
        );
    }

    #[test]
    fn template_without_path_placeholder_appends_path() {
        let r = CacheFlushRule {
            name: "plain".to_string(),
            templates: vec!["https://cdn.example.com".to_string()],
            includes: vec!["^/.*".to_string()],
            excludes: vec![],
        };
        assert_eq!(
            r.render("/a/b", "3600"),
            vec!["https://cdn.example.com/a/b".to_string()]
        );
    }

    #[test]
    fn alias_expansion_adds_substituted_variant() {
        let aliases = vec![crate::config::AliasConfig {
            src: "/releases/9".to_string(),
            dest: "/releases/$releasever".to_string(),
        }];
        let expanded = Flusher::expand_aliases("/releases/9/repodata", &aliases);
        assert_eq!(
            expanded,
            vec![
                "/releases/9/repodata".to_string(),
                "/releases/$releasever/repodata".to_string(),
            ]
        );
    }
}
