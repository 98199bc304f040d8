//! Infrastructure adapters and runtime bootstrap.

pub mod blocks;
pub mod error;
pub mod sweeper;
pub mod telemetry;
