// src/config.rs

//! Manages proxy configuration: loading, resolving origin settings, and validation.

use crate::core::proxy::key::KeyHasher;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8482
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// A size given either as a plain byte count or as a string with a unit (e.g. "512kb").
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum SizeConfig {
    Bytes(usize),
    String(String),
}

/// Settings shared by every origin for the cache backend.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheConfig {
    /// Compress stored documents with zstd.
    #[serde(default)]
    pub compression: bool,
    /// Responses larger than this are never cached.
    #[serde(default = "default_max_object_size")]
    pub max_object_size_bytes: usize,
    /// How long merged timeseries stay in the cache.
    #[serde(default = "default_timeseries_ttl", with = "humantime_serde")]
    pub timeseries_ttl: Duration,
    /// Storage TTL for opaque objects.
    #[serde(default = "default_object_ttl", with = "humantime_serde")]
    pub object_ttl: Duration,
    /// Storage TTL for fast-forward points.
    #[serde(default = "default_fast_forward_ttl", with = "humantime_serde")]
    pub fast_forward_ttl: Duration,
    /// How often the memory backend sweeps expired entries.
    #[serde(default = "default_reap_interval", with = "humantime_serde")]
    pub reap_interval: Duration,
}

fn default_max_object_size() -> usize {
    512 * 1024 // 512 KB
}
fn default_timeseries_ttl() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}
fn default_object_ttl() -> Duration {
    Duration::from_secs(30)
}
fn default_fast_forward_ttl() -> Duration {
    Duration::from_secs(15)
}
fn default_reap_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            compression: false,
            max_object_size_bytes: default_max_object_size(),
            timeseries_ttl: default_timeseries_ttl(),
            object_ttl: default_object_ttl(),
            fast_forward_ttl: default_fast_forward_ttl(),
            reap_interval: default_reap_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
struct RawCacheConfig {
    #[serde(default)]
    compression: bool,
    #[serde(default)]
    max_object_size: Option<SizeConfig>,
    #[serde(default = "default_timeseries_ttl", with = "humantime_serde")]
    timeseries_ttl: Duration,
    #[serde(default = "default_object_ttl", with = "humantime_serde")]
    object_ttl: Duration,
    #[serde(default = "default_fast_forward_ttl", with = "humantime_serde")]
    fast_forward_ttl: Duration,
    #[serde(default = "default_reap_interval", with = "humantime_serde")]
    reap_interval: Duration,
}

impl Default for RawCacheConfig {
    fn default() -> Self {
        Self {
            compression: false,
            max_object_size: None,
            timeseries_ttl: default_timeseries_ttl(),
            object_ttl: default_object_ttl(),
            fast_forward_ttl: default_fast_forward_ttl(),
            reap_interval: default_reap_interval(),
        }
    }
}

/// The kind of origin behind a configured backend.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OriginType {
    #[default]
    Prometheus,
    /// A generic HTTP origin served through the object cache.
    ReverseProxyCache,
}

/// How cached timeseries are kept within their retention budget.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionMethod {
    /// Drop samples older than `timeseries_retention_factor` steps before now.
    #[default]
    Oldest,
    /// Keep at most `timeseries_retention_factor` timestamps, evicting the
    /// least recently requested extents first.
    Lru,
}

/// Which engine serves requests for a path.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    #[default]
    Proxy,
    ProxyCache,
    DeltaProxyCache,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PathMatchType {
    Exact,
    #[default]
    Prefix,
}

/// Routing and cache-key rules for one request path of an origin.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PathConfig {
    pub path: String,
    #[serde(default)]
    pub match_type: PathMatchType,
    #[serde(default)]
    pub handler: HandlerKind,
    /// Query parameters folded into the cache key. `["*"]` selects all of them.
    #[serde(default)]
    pub cache_key_params: Vec<String>,
    #[serde(default)]
    pub cache_key_headers: Vec<String>,
    /// Body fields folded into the cache key. JSON fields are `/`-delimited paths.
    #[serde(default)]
    pub cache_key_form_fields: Vec<String>,
    /// Freshness lifetime for cacheable responses that do not state one.
    #[serde(default = "default_path_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,
    #[serde(skip)]
    pub key_hasher: Option<KeyHasher>,
}

fn default_path_ttl() -> Duration {
    Duration::from_secs(60)
}

impl PathConfig {
    pub fn new(path: &str, handler: HandlerKind) -> Self {
        Self {
            path: path.to_string(),
            match_type: PathMatchType::Prefix,
            handler,
            cache_key_params: Vec::new(),
            cache_key_headers: Vec::new(),
            cache_key_form_fields: Vec::new(),
            default_ttl: default_path_ttl(),
            key_hasher: None,
        }
    }

    pub fn exact(mut self) -> Self {
        self.match_type = PathMatchType::Exact;
        self
    }

    pub fn with_key_params(mut self, params: &[&str]) -> Self {
        self.cache_key_params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_key_headers(mut self, headers: &[&str]) -> Self {
        self.cache_key_headers = headers.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn with_key_form_fields(mut self, fields: &[&str]) -> Self {
        self.cache_key_form_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn matches(&self, path: &str) -> bool {
        match self.match_type {
            PathMatchType::Exact => path == self.path,
            PathMatchType::Prefix => path.starts_with(&self.path),
        }
    }
}

/// The paths an origin gets when its configuration lists none.
pub fn default_paths(origin_type: OriginType) -> Vec<PathConfig> {
    match origin_type {
        OriginType::Prometheus => vec![
            PathConfig::new("/api/v1/query_range", HandlerKind::DeltaProxyCache)
                .exact()
                .with_key_params(&["query", "step"]),
            PathConfig::new("/api/v1/query", HandlerKind::ProxyCache)
                .exact()
                .with_key_params(&["query", "time"]),
            PathConfig::new("/api/v1/series", HandlerKind::ProxyCache)
                .exact()
                .with_key_params(&["match[]", "start", "end"]),
            PathConfig::new("/", HandlerKind::Proxy),
        ],
        OriginType::ReverseProxyCache => {
            vec![PathConfig::new("/", HandlerKind::ProxyCache).with_key_params(&["*"])]
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
struct RawOriginConfig {
    name: String,
    #[serde(default)]
    origin_type: OriginType,
    origin_url: String,
    #[serde(default)]
    is_default: bool,
    #[serde(default = "default_origin_timeout", with = "humantime_serde")]
    timeout: Duration,
    #[serde(default)]
    cache_key_prefix: Option<String>,
    #[serde(default, with = "humantime_serde")]
    backfill_tolerance: Duration,
    #[serde(default = "default_retention_factor")]
    timeseries_retention_factor: i32,
    #[serde(default)]
    timeseries_eviction_method: EvictionMethod,
    #[serde(default)]
    fast_forward_disable: bool,
    #[serde(default)]
    negative_cache: HashMap<String, humantime_serde::Serde<Duration>>,
    #[serde(default)]
    paths: Vec<PathConfig>,
}

fn default_origin_timeout() -> Duration {
    Duration::from_secs(180)
}
fn default_retention_factor() -> i32 {
    1024
}

/// A resolved origin definition.
#[derive(Debug, Clone)]
pub struct OriginConfig {
    pub name: String,
    pub origin_type: OriginType,
    pub origin_url: Url,
    pub is_default: bool,
    pub timeout: Duration,
    /// Prepended to every cache key of this origin. Defaults to the origin's host.
    pub cache_key_prefix: String,
    pub backfill_tolerance: Duration,
    /// With `Oldest` eviction, how many steps back from now a timeseries may
    /// still be cached; with `Lru`, how many timestamps one cached series keeps.
    pub timeseries_retention_factor: i32,
    pub timeseries_eviction_method: EvictionMethod,
    pub fast_forward_disable: bool,
    /// Status codes cached for a fixed TTL regardless of response headers.
    pub negative_cache: HashMap<u16, Duration>,
    pub paths: Vec<PathConfig>,
}

impl OriginConfig {
    /// Builds an origin with the default settings for its type.
    pub fn new(name: &str, origin_type: OriginType, origin_url: Url) -> Self {
        let cache_key_prefix = origin_url.host_str().unwrap_or(name).to_string();
        Self {
            name: name.to_string(),
            origin_type,
            origin_url,
            is_default: false,
            timeout: default_origin_timeout(),
            cache_key_prefix,
            backfill_tolerance: Duration::ZERO,
            timeseries_retention_factor: default_retention_factor(),
            timeseries_eviction_method: EvictionMethod::default(),
            fast_forward_disable: false,
            negative_cache: HashMap::new(),
            paths: default_paths(origin_type),
        }
    }

    /// Returns the longest configured path matching `path`.
    pub fn find_path(&self, path: &str) -> Option<&PathConfig> {
        self.paths
            .iter()
            .filter(|pc| pc.matches(path))
            .max_by_key(|pc| (pc.match_type == PathMatchType::Exact, pc.path.len()))
    }

    fn resolve(raw: RawOriginConfig) -> Result<Self> {
        let origin_url = Url::parse(&raw.origin_url)
            .with_context(|| format!("origin '{}' has an invalid origin_url", raw.name))?;

        let mut negative_cache = HashMap::new();
        for (code, ttl) in raw.negative_cache {
            let status: u16 = code.parse().with_context(|| {
                format!(
                    "origin '{}' has an invalid negative_cache status '{code}'",
                    raw.name
                )
            })?;
            negative_cache.insert(status, ttl.into_inner());
        }

        let paths = if raw.paths.is_empty() {
            default_paths(raw.origin_type)
        } else {
            raw.paths
        };
        let cache_key_prefix = raw
            .cache_key_prefix
            .or_else(|| origin_url.host_str().map(str::to_string))
            .unwrap_or_else(|| raw.name.clone());

        Ok(Self {
            name: raw.name,
            origin_type: raw.origin_type,
            origin_url,
            is_default: raw.is_default,
            timeout: raw.timeout,
            cache_key_prefix,
            backfill_tolerance: raw.backfill_tolerance,
            timeseries_retention_factor: raw.timeseries_retention_factor,
            timeseries_eviction_method: raw.timeseries_eviction_method,
            fast_forward_disable: raw.fast_forward_disable,
            negative_cache,
            paths,
        })
    }
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    cache: RawCacheConfig,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default)]
    origins: Vec<RawOriginConfig>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8480
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the final, validated, and resolved proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub cache: CacheConfig,
    pub metrics: MetricsConfig,
    pub origins: Vec<OriginConfig>,
}

impl Config {
    /// Loads and resolves the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml_str(&contents).with_context(|| format!("Invalid configuration in '{path}'"))
    }

    /// Parses, resolves and validates configuration text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw_config: RawConfig =
            toml::from_str(contents).context("Failed to parse TOML configuration")?;

        let max_object_size_bytes = match raw_config.cache.max_object_size {
            Some(size) => resolve_size(size)?,
            None => default_max_object_size(),
        };
        let cache = CacheConfig {
            compression: raw_config.cache.compression,
            max_object_size_bytes,
            timeseries_ttl: raw_config.cache.timeseries_ttl,
            object_ttl: raw_config.cache.object_ttl,
            fast_forward_ttl: raw_config.cache.fast_forward_ttl,
            reap_interval: raw_config.cache.reap_interval,
        };

        let mut origins = raw_config
            .origins
            .into_iter()
            .map(OriginConfig::resolve)
            .collect::<Result<Vec<_>>>()?;
        if origins.len() == 1 && !origins[0].is_default {
            info!(
                "Only one origin configured; '{}' becomes the default.",
                origins[0].name
            );
            origins[0].is_default = true;
        }

        let config = Config {
            host: raw_config.host,
            port: raw_config.port,
            log_level: raw_config.log_level,
            cache,
            metrics: raw_config.metrics,
            origins,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.origins.is_empty() {
            return Err(anyhow!("at least one origin must be configured"));
        }

        let mut names = std::collections::HashSet::new();
        for origin in &self.origins {
            if origin.name.trim().is_empty() {
                return Err(anyhow!("origin name cannot be empty"));
            }
            if !names.insert(origin.name.as_str()) {
                return Err(anyhow!("duplicate origin name '{}'", origin.name));
            }
            if origin.timeseries_retention_factor <= 0 {
                return Err(anyhow!(
                    "origin '{}': timeseries_retention_factor must be positive",
                    origin.name
                ));
            }
            if origin.timeout.is_zero() {
                return Err(anyhow!("origin '{}': timeout cannot be 0", origin.name));
            }
        }
        if self.origins.iter().filter(|o| o.is_default).count() > 1 {
            return Err(anyhow!("only one origin can be marked is_default"));
        }

        if self.cache.reap_interval.is_zero() {
            return Err(anyhow!("cache.reap_interval cannot be 0"));
        }
        if self.cache.max_object_size_bytes == 0 {
            warn!("cache.max_object_size is 0; no object will ever be cached.");
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main proxy port"
                ));
            }
        }
        Ok(())
    }

    pub fn default_origin(&self) -> Option<&OriginConfig> {
        self.origins.iter().find(|o| o.is_default)
    }
}

/// Resolves a `SizeConfig` into a byte count.
fn resolve_size(cfg: SizeConfig) -> Result<usize> {
    match cfg {
        SizeConfig::Bytes(b) => Ok(b),
        SizeConfig::String(s) => {
            let s_lower = s.to_lowercase();
            if let Some(val_str) = s_lower.strip_suffix("gb") {
                parse_size_string(&s, val_str, 1024 * 1024 * 1024)
            } else if let Some(val_str) = s_lower.strip_suffix("mb") {
                parse_size_string(&s, val_str, 1024 * 1024)
            } else if let Some(val_str) = s_lower.strip_suffix("kb") {
                parse_size_string(&s, val_str, 1024)
            } else {
                s.trim().parse().with_context(|| {
                    format!("Invalid size value '{s}'. Must be a number of bytes or have a unit (e.g., '512kb').")
                })
            }
        }
    }
}

/// Parses a string number with a unit (kb, mb, gb) and applies a multiplier.
fn parse_size_string(original_str: &str, value_str: &str, multiplier: u64) -> Result<usize> {
    let value: u64 = value_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid number in size value: '{original_str}'"))?;
    let result_u64 = value.saturating_mul(multiplier);
    if result_u64 > (usize::MAX as u64) {
        return Err(anyhow!(
            "size value '{}' is too large for this system's architecture (max is {} bytes)",
            original_str,
            usize::MAX
        ));
    }
    Ok(result_u64 as usize)
}
