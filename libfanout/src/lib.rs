//! Fanout - publication orchestrator for curated content
//!
//! This library drives curated content items through per-platform publish
//! attempts, tracks each platform's outcome, derives the item's aggregate
//! lifecycle phase and retries failures with backoff.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logging;
pub mod phase;
pub mod platforms;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod status;
pub mod store;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{FanoutError, Result};
pub use publisher::Publisher;
pub use types::{
    ContentItem, ItemId, Phase, PlatformKind, PublicationResult, PublicationStatus, Report,
    StatusSnapshot,
};
