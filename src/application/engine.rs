//! The engine: registries, stores and configuration shared by every request.

use std::{
    collections::BTreeSet,
    path::Path,
    sync::Arc,
    time::Duration,
};

use tracing::info;

use crate::{
    cache::{
        CacheConfig, CacheStore, CookiePolicy, StrategyDefinition, StrategyError,
        StrategyRegistry, StrategySet,
    },
    config::Settings,
};

use super::{
    block::BlockRegistry,
    script::{ParseEnv, Script, ScriptError},
    script_cache::ScriptCache,
};

const SOURCE: &str = "application::engine";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for a whole request, nested scripts included.
    pub request_timeout: Duration,
    /// Timeout of blocks that do not declare one.
    pub block_timeout: Duration,
    /// Cache time of blocks declared with `tag="yes"`.
    pub default_cache_time: Duration,
    pub force_no_threaded: bool,
    pub cache: CacheConfig,
    pub policy: CookiePolicy,
    pub strategies: Vec<StrategyDefinition>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            default_cache_time: DEFAULT_CACHE_TIME,
            force_no_threaded: false,
            cache: CacheConfig::default(),
            policy: CookiePolicy::default(),
            strategies: Vec::new(),
        }
    }
}

impl From<&Settings> for EngineConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            request_timeout: settings.engine.request_timeout,
            block_timeout: settings.engine.block_timeout,
            default_cache_time: settings.engine.default_tag_time,
            force_no_threaded: settings.engine.force_no_threaded,
            cache: CacheConfig::from(&settings.cache),
            policy: CookiePolicy {
                allow_caching_cookies: settings
                    .policy
                    .allow_caching_cookies
                    .iter()
                    .cloned()
                    .collect::<BTreeSet<_>>(),
                deny_cookies: settings.policy.deny_cookies.iter().cloned().collect(),
            },
            strategies: settings.strategies.clone(),
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    blocks: BlockRegistry,
    strategies: StrategySet,
    block_cache: Option<CacheStore>,
    page_cache: Option<CacheStore>,
    scripts: ScriptCache,
}

impl Engine {
    pub fn new(config: EngineConfig, blocks: BlockRegistry, strategies: StrategySet) -> Arc<Self> {
        let block_cache = config
            .cache
            .enable_block_cache
            .then(|| CacheStore::blocks(&config.cache));
        let page_cache = config
            .cache
            .enable_page_cache
            .then(|| CacheStore::pages(&config.cache));

        info!(
            target = SOURCE,
            blocks = ?blocks.names(),
            strategies = strategies.len(),
            block_cache = block_cache.is_some(),
            page_cache = page_cache.is_some(),
            "Engine initialised"
        );

        Arc::new(Self {
            config,
            blocks,
            strategies,
            block_cache,
            page_cache,
            scripts: ScriptCache::new(),
        })
    }

    /// Build the named strategies from the configuration, then the engine.
    pub fn with_strategies(
        config: EngineConfig,
        blocks: BlockRegistry,
        registry: &StrategyRegistry,
    ) -> Result<Arc<Self>, StrategyError> {
        let strategies = registry.build_all(&config.strategies, &config.policy)?;
        Ok(Self::new(config, blocks, strategies))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn blocks(&self) -> &BlockRegistry {
        &self.blocks
    }

    pub fn strategies(&self) -> &StrategySet {
        &self.strategies
    }

    pub fn block_cache(&self) -> Option<&CacheStore> {
        self.block_cache.as_ref()
    }

    pub fn page_cache(&self) -> Option<&CacheStore> {
        self.page_cache.as_ref()
    }

    pub fn scripts(&self) -> &ScriptCache {
        &self.scripts
    }

    pub fn parse_env<'a>(&'a self, base_dir: Option<&'a Path>) -> ParseEnv<'a> {
        ParseEnv {
            blocks: &self.blocks,
            strategies: &self.strategies,
            base_dir,
            default_timeout: self.config.block_timeout,
            default_cache_time: self.config.default_cache_time,
        }
    }

    pub fn parse_script(&self, name: &str, source: &str) -> Result<Arc<Script>, ScriptError> {
        Script::parse(name, source, &self.parse_env(None)).map(Arc::new)
    }

    /// Parsed script for `path`, re-parsed when the file changed.
    pub async fn load_script(&self, path: &Path) -> Result<Arc<Script>, ScriptError> {
        self.scripts.get_or_load(path, &self.parse_env(None)).await
    }

    /// Remove expired entries from both stores.
    pub fn sweep_expired(&self) -> usize {
        [self.block_cache.as_ref(), self.page_cache.as_ref()]
            .into_iter()
            .flatten()
            .map(CacheStore::sweep_expired)
            .sum()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("blocks", &self.blocks)
            .field("block_cache", &self.block_cache)
            .field("page_cache", &self.page_cache)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::cache::PartSpec;

    use super::*;

    pub(crate) fn test_engine() -> Arc<Engine> {
        test_engine_with(BlockRegistry::new())
    }

    pub(crate) fn test_engine_with(blocks: BlockRegistry) -> Arc<Engine> {
        Engine::new(EngineConfig::default(), blocks, StrategySet::default())
    }

    pub(crate) fn empty_script(engine: &Engine) -> Arc<Script> {
        engine
            .parse_script("empty.xml", "<page/>")
            .expect("empty script parses")
    }

    #[test]
    fn disabled_stores_are_not_created() {
        let config = EngineConfig {
            cache: CacheConfig {
                enable_block_cache: false,
                ..CacheConfig::default()
            },
            ..EngineConfig::default()
        };
        let engine = Engine::new(config, BlockRegistry::new(), StrategySet::default());

        assert!(engine.block_cache().is_none());
        assert!(engine.page_cache().is_some());
        assert_eq!(engine.sweep_expired(), 0);
    }

    #[test]
    fn configured_strategies_are_resolvable_by_name() {
        let config = EngineConfig {
            strategies: vec![StrategyDefinition {
                name: "by-query".to_string(),
                parts: vec![PartSpec::new("query", "")],
            }],
            ..EngineConfig::default()
        };
        let engine =
            Engine::with_strategies(config, BlockRegistry::new(), &StrategyRegistry::builtin())
                .expect("engine");

        assert!(engine.strategies().get("by-query").is_some());
        assert!(engine.strategies().get("missing").is_none());
    }

    #[test]
    fn unknown_strategy_kinds_fail_engine_construction() {
        let config = EngineConfig {
            strategies: vec![StrategyDefinition {
                name: "broken".to_string(),
                parts: vec![PartSpec::new("geo", "")],
            }],
            ..EngineConfig::default()
        };
        let result =
            Engine::with_strategies(config, BlockRegistry::new(), &StrategyRegistry::builtin());
        assert!(matches!(result, Err(StrategyError::UnknownKind { .. })));
    }
}
