//! Tessera assembles XML pages from blocks: each block of a page script is
//! invoked (concurrently when declared threaded), its result is spliced back
//! in place of the block element, and tagged results are reused from a
//! freshness-aware cache.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
