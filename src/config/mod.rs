//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{collections::BTreeMap, num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{PartSpec, StrategyDefinition};

pub use cli::{CheckArgs, CliArgs, Command, EngineOverrides, RenderArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tessera";
const ENV_PREFIX: &str = "TESSERA";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_TAG_SECONDS: u64 = 60;
const DEFAULT_BLOCK_CAPACITY: u64 = 1024;
const DEFAULT_PAGE_CAPACITY: u64 = 256;
const DEFAULT_TTL_SECONDS: u64 = 3600;
const DEFAULT_MINIMAL_CACHE_TIME_SECONDS: u64 = 5;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;

const LIST_KEYS: [&str; 2] = ["policy.allow_caching_cookies", "policy.deny_cookies"];

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub engine: EngineSettings,
    pub cache: CacheSettings,
    pub policy: PolicySettings,
    pub strategies: Vec<StrategyDefinition>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub request_timeout: Duration,
    pub block_timeout: Duration,
    /// Cache time of blocks declared with `tag="yes"`.
    pub default_tag_time: Duration,
    pub force_no_threaded: bool,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enable_block_cache: bool,
    pub enable_page_cache: bool,
    pub block_capacity: NonZeroUsize,
    pub page_capacity: NonZeroUsize,
    pub ttl_seconds: u64,
    pub minimal_cache_time: u64,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct PolicySettings {
    /// Response cookies that do not prevent page caching.
    pub allow_caching_cookies: Vec<String>,
    /// Request cookies no strategy may key on.
    pub deny_cookies: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    let mut environment = Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",");
    for key in LIST_KEYS {
        environment = environment.with_list_parse_key(key);
    }
    builder = builder.add_source(environment);

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_cli(cli);

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    engine: RawEngineSettings,
    cache: RawCacheSettings,
    policy: RawPolicySettings,
    strategies: BTreeMap<String, RawStrategySettings>,
}

impl RawSettings {
    fn apply_cli(&mut self, cli: &CliArgs) {
        if let Some(level) = cli.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = cli.log_json {
            self.logging.json = Some(json);
        }
        self.apply_engine_overrides(cli.command.overrides());
    }

    fn apply_engine_overrides(&mut self, overrides: &EngineOverrides) {
        if let Some(ms) = overrides.request_timeout_ms {
            self.engine.request_timeout_ms = Some(ms);
        }
        if let Some(ms) = overrides.block_timeout_ms {
            self.engine.block_timeout_ms = Some(ms);
        }
        if let Some(value) = overrides.force_no_threaded {
            self.engine.force_no_threaded = Some(value);
        }
        if let Some(value) = overrides.enable_block_cache {
            self.cache.enable_block_cache = Some(value);
        }
        if let Some(value) = overrides.enable_page_cache {
            self.cache.enable_page_cache = Some(value);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            engine,
            cache,
            policy,
            strategies,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let engine = build_engine_settings(engine)?;
        let cache = build_cache_settings(cache)?;
        let policy = build_policy_settings(policy)?;
        let strategies = build_strategies(strategies)?;

        Ok(Self {
            logging,
            engine,
            cache,
            policy,
            strategies,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let request_timeout = positive_millis(
        engine.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
        "engine.request_timeout_ms",
    )?;
    let block_timeout = positive_millis(
        engine.block_timeout_ms.unwrap_or(DEFAULT_BLOCK_TIMEOUT_MS),
        "engine.block_timeout_ms",
    )?;
    if block_timeout > request_timeout {
        return Err(LoadError::invalid(
            "engine.block_timeout_ms",
            "must not exceed engine.request_timeout_ms",
        ));
    }

    let tag_seconds = engine.default_tag_seconds.unwrap_or(DEFAULT_TAG_SECONDS);
    if tag_seconds == 0 {
        return Err(LoadError::invalid(
            "engine.default_tag_seconds",
            "must be greater than zero",
        ));
    }

    Ok(EngineSettings {
        request_timeout,
        block_timeout,
        default_tag_time: Duration::from_secs(tag_seconds),
        force_no_threaded: engine.force_no_threaded.unwrap_or(false),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let block_capacity = non_zero_usize(
        cache.block_capacity.unwrap_or(DEFAULT_BLOCK_CAPACITY),
        "cache.block_capacity",
    )?;
    let page_capacity = non_zero_usize(
        cache.page_capacity.unwrap_or(DEFAULT_PAGE_CAPACITY),
        "cache.page_capacity",
    )?;
    let sweep_interval = positive_millis(
        cache.sweep_interval_ms.unwrap_or(DEFAULT_SWEEP_INTERVAL_MS),
        "cache.sweep_interval_ms",
    )?;

    Ok(CacheSettings {
        enable_block_cache: cache.enable_block_cache.unwrap_or(true),
        enable_page_cache: cache.enable_page_cache.unwrap_or(true),
        block_capacity,
        page_capacity,
        ttl_seconds: cache.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS),
        minimal_cache_time: cache
            .minimal_cache_time
            .unwrap_or(DEFAULT_MINIMAL_CACHE_TIME_SECONDS),
        sweep_interval,
    })
}

fn build_policy_settings(policy: RawPolicySettings) -> Result<PolicySettings, LoadError> {
    let allow_caching_cookies = trimmed_names(policy.allow_caching_cookies.unwrap_or_default());
    let deny_cookies = trimmed_names(policy.deny_cookies.unwrap_or_default());

    if let Some(name) = allow_caching_cookies
        .iter()
        .find(|name| deny_cookies.contains(name))
    {
        return Err(LoadError::invalid(
            "policy",
            format!("cookie `{name}` is both allowed and denied"),
        ));
    }

    Ok(PolicySettings {
        allow_caching_cookies,
        deny_cookies,
    })
}

fn build_strategies(
    strategies: BTreeMap<String, RawStrategySettings>,
) -> Result<Vec<StrategyDefinition>, LoadError> {
    strategies
        .into_iter()
        .map(|(name, raw)| {
            let parts = raw.into_parts();
            if parts.is_empty() {
                return Err(LoadError::invalid(
                    "strategies",
                    format!("strategy `{name}` declares no parts"),
                ));
            }
            Ok(StrategyDefinition { name, parts })
        })
        .collect()
}

fn trimmed_names(names: Vec<String>) -> Vec<String> {
    names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    request_timeout_ms: Option<u64>,
    block_timeout_ms: Option<u64>,
    default_tag_seconds: Option<u64>,
    force_no_threaded: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enable_block_cache: Option<bool>,
    enable_page_cache: Option<bool>,
    block_capacity: Option<u64>,
    page_capacity: Option<u64>,
    ttl_seconds: Option<u64>,
    minimal_cache_time: Option<u64>,
    sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicySettings {
    allow_caching_cookies: Option<Vec<String>>,
    deny_cookies: Option<Vec<String>>,
}

/// One `[strategies.<name>]` table. Parts are built in a fixed order so the
/// key layout does not depend on the order keys appear in the file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStrategySettings {
    query: Option<String>,
    query_sort: Option<bool>,
    query_except: Option<bool>,
    cookie: Option<String>,
    no_cache_cookie: Option<String>,
    no_cache_state: Option<String>,
}

impl RawStrategySettings {
    fn into_parts(self) -> Vec<PartSpec> {
        let mut parts = Vec::new();
        if let Some(query) = self.query {
            let mut part = PartSpec::new("query", query);
            if !self.query_sort.unwrap_or(true) {
                part = part.unsorted();
            }
            if self.query_except.unwrap_or(false) {
                part = part.except();
            }
            parts.push(part);
        }
        if let Some(cookie) = self.cookie {
            parts.push(PartSpec::new("cookie", cookie));
        }
        if let Some(cookie) = self.no_cache_cookie {
            parts.push(PartSpec::new("no-cache-cookie", cookie));
        }
        if let Some(state) = self.no_cache_state {
            parts.push(PartSpec::new("no-cache-state", state));
        }
        parts
    }
}

#[cfg(test)]
mod tests;
