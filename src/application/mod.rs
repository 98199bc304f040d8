//! Page assembly: contexts, blocks, scripts and the engine that runs them.

pub mod block;
pub mod context;
mod dispatch;
pub mod engine;
pub mod error;
pub mod invoke;
pub mod page;
pub mod request;
pub mod script;
pub mod script_cache;
