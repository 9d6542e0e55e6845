//! Layered configuration: an INI file merged with `EXODUS_GW_<NAME>` environment
//! variable overrides. Settings are loaded once at process start into an
//! immutable snapshot ([`Settings`]) that is passed explicitly into every
//! commit invocation rather than read from a process-wide mutable default.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::flusher::CacheFlushRule;

const ENV_PREFIX: &str = "EXODUS_GW";

fn default_entry_point_files() -> Vec<String> {
    vec![
        "repomd.xml".to_string(),
        "repomd.xml.asc".to_string(),
        "PULP_MANIFEST".to_string(),
        "PULP_MANIFEST.asc".to_string(),
        "treeinfo".to_string(),
        "extra_files.json".to_string(),
    ]
}

fn default_phase2_patterns() -> Vec<String> {
    vec![r"/kickstart/.*(?<!\.rpm)$".to_string()]
}

fn default_autoindex_filename() -> String {
    ".__exodus_autoindex".to_string()
}

/// The raw, deserializable shape of the global (non-per-environment) settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawSettings {
    pub item_yield_size: usize,
    pub write_batch_size: usize,
    pub write_max_tries: u32,
    pub write_max_workers: usize,
    pub write_queue_size: usize,
    pub write_queue_timeout_secs: u64,
    pub publish_timeout_hours: i64,
    pub task_deadline_hours: i64,
    pub cdn_flush_on_commit: bool,
    pub mirror_writes_enabled: bool,
    pub autoindex_filename: String,
    pub entry_point_files: Vec<String>,
    pub phase2_patterns: Vec<String>,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            item_yield_size: 5000,
            write_batch_size: 25,
            write_max_tries: 20,
            write_max_workers: 10,
            write_queue_size: 1000,
            write_queue_timeout_secs: 600,
            publish_timeout_hours: 24,
            task_deadline_hours: 2,
            cdn_flush_on_commit: true,
            mirror_writes_enabled: true,
            autoindex_filename: default_autoindex_filename(),
            entry_point_files: default_entry_point_files(),
            phase2_patterns: default_phase2_patterns(),
        }
    }
}

/// A `(src, dest)` URL-prefix substitution producing additional KV keys for the
/// same content (e.g. `releasever`, `arch`).
#[derive(Debug, Clone, Deserialize)]
pub struct AliasConfig {
    pub src: String,
    pub dest: String,
}

/// Per-environment config: bucket, KV table name, CDN base URL, signing key id,
/// and the list of cache-flush rule names active for this environment.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub cdn_url: Option<String>,
    #[serde(default)]
    pub cdn_key_id: Option<String>,
    #[serde(default)]
    pub cache_flush_rules: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<AliasConfig>,
}

impl EnvironmentConfig {
    /// True once every `fastpurge_*` credential is present for this environment
    /// AND at least one cache-flush rule is configured.
    pub fn fastpurge_enabled(&self) -> bool {
        if self.cache_flush_rules.is_empty() {
            return false;
        }
        let key = self.name.to_uppercase();
        ["ACCESS_TOKEN", "CLIENT_SECRET", "CLIENT_TOKEN", "HOST"]
            .iter()
            .all(|suffix| std::env::var(format!("{ENV_PREFIX}_FASTPURGE_{suffix}_{key}")).is_ok())
    }
}

/// An immutable, fully-resolved settings snapshot, compiled once at load time.
///
/// Carries pre-compiled regexes and an `entry_point_files` set so
/// [`crate::classifier::ItemClassifier`] stays a pure, allocation-light function.
#[derive(Debug, Clone)]
pub struct Settings {
    pub item_yield_size: usize,
    pub write_batch_size: usize,
    pub write_max_tries: u32,
    pub write_max_workers: usize,
    pub write_queue_size: usize,
    pub write_queue_timeout: std::time::Duration,
    pub publish_timeout_hours: i64,
    pub task_deadline_hours: i64,
    pub cdn_flush_on_commit: bool,
    pub mirror_writes_enabled: bool,
    pub autoindex_filename: String,
    pub entry_point_files: HashSet<String>,
    pub phase2_patterns: Vec<Regex>,
    pub environments: HashMap<String, EnvironmentConfig>,
    pub cache_flush_rules: HashMap<String, CacheFlushRule>,
}

impl Settings {
    /// Load settings from an optional INI file, merged with `EXODUS_GW_*` env
    /// var overrides (env wins). `environments` and `cache_flush_rules` are
    /// read from `[env.<name>]` / `[cache_flush.<rule>]` sections.
    pub fn load(ini_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&RawSettings::default())
                .expect("default settings always serialize"),
        );

        if let Some(path) = ini_path {
            builder = builder.add_source(
                config::File::with_name(path).format(config::FileFormat::Ini),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("_")
                .try_parsing(true)
                .list_separator(","),
        );

        let raw_config = builder.build()?;
        let raw: RawSettings = raw_config.clone().try_deserialize().unwrap_or_default();

        let environments: HashMap<String, EnvironmentConfig> = raw_config
            .get("env")
            .unwrap_or_default();
        let cache_flush_rules: HashMap<String, CacheFlushRule> = raw_config
            .get("cache_flush")
            .unwrap_or_default();

        Self::from_raw(raw, environments, cache_flush_rules)
    }

    fn from_raw(
        raw: RawSettings,
        environments: HashMap<String, EnvironmentConfig>,
        cache_flush_rules: HashMap<String, CacheFlushRule>,
    ) -> Result<Self, ConfigError> {
        let phase2_patterns = raw
            .phase2_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| ConfigError::Regex {
                    field: "phase2_patterns",
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for env in environments.values() {
            for rule_name in &env.cache_flush_rules {
                if !cache_flush_rules.contains_key(rule_name) {
                    return Err(ConfigError::UnknownCacheFlushRule(rule_name.clone()));
                }
            }
        }

        Ok(Self {
            item_yield_size: raw.item_yield_size,
            write_batch_size: raw.write_batch_size,
            write_max_tries: raw.write_max_tries,
            write_max_workers: raw.write_max_workers,
            write_queue_size: raw.write_queue_size,
            write_queue_timeout: std::time::Duration::from_secs(raw.write_queue_timeout_secs),
            publish_timeout_hours: raw.publish_timeout_hours,
            task_deadline_hours: raw.task_deadline_hours,
            cdn_flush_on_commit: raw.cdn_flush_on_commit,
            mirror_writes_enabled: raw.mirror_writes_enabled,
            autoindex_filename: raw.autoindex_filename,
            entry_point_files: raw.entry_point_files.into_iter().collect(),
            phase2_patterns,
            environments,
            cache_flush_rules,
        })
    }

    /// Build a `Settings` snapshot directly from parsed parts, bypassing file/env
    /// loading. Used by tests and by anything embedding the engine in-process.
    pub fn from_parts(
        raw: RawSettings,
        environments: HashMap<String, EnvironmentConfig>,
        cache_flush_rules: HashMap<String, CacheFlushRule>,
    ) -> Result<Self, ConfigError> {
        Self::from_raw(raw, environments, cache_flush_rules)
    }

    pub fn environment(&self, env: &str) -> Result<&EnvironmentConfig, ConfigError> {
        self.environments
            .get(env)
            .ok_or_else(|| ConfigError::UnknownEnvironment(env.to_string()))
    }
}
