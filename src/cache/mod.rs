//! Tagged document caching.
//!
//! Two stores share one implementation:
//!
//! - **Block store**: results of tag-capable blocks, keyed by block identity,
//!   evaluated arguments and strategy key
//! - **Page store**: fully assembled pages, keyed by URL, script and
//!   stylesheet modification times and the page strategy key
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enable_block_cache = true
//! enable_page_cache = true
//! block_capacity = 1024
//! page_capacity = 256
//! # ... see config.rs for all options
//! ```

mod config;
pub(crate) mod lock;
mod store;
mod strategy;

pub use config::CacheConfig;
pub use store::{
    CacheStore, Cached, LoadOutcome, RecomputeGuard, RecomputeWaiter, SaveOutcome,
};
pub use strategy::{
    CacheStrategy, CookieStrategy, CookiePolicy, NoCacheCookieStrategy, NoCacheStateStrategy,
    PartSpec, QueryStrategy, StrategyDefinition, StrategyError, StrategyRegistry, StrategySet,
    SubStrategy, SubStrategyFactory,
};
