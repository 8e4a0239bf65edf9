//! Request-interception cache for offline operation.
//!
//! This module provides:
//! - Three tiers (static, pages, runtime) per cache generation
//! - Per-request strategy selection by resource class
//! - Install/activate lifecycle that provisions the current generation and
//!   purges stale ones
//! - Synthesized offline responses when nothing can answer

mod classify;
mod layer;
mod lifecycle;
mod offline;
mod storage;
mod tiers;

pub use classify::Classifier;
pub use lifecycle::{CacheLifecycle, ControlMessage, GenerationState, InstallReport, Manifest};
pub use storage::SqliteCacheStorage;
pub use tiers::Generation;
