//! file-relay - A file metadata registry with an asynchronous ingestion pipeline
//!
//! This crate accepts uploads and URL imports, returns an identifier right
//! away, and moves the content to external blob storage in the background:
//! - redb-backed file registry with a forward-only lifecycle (pending, processing, completed, failed)
//! - Bounded worker pool whose results are applied by a single write supervisor
//! - Swappable storage providers (local filesystem, Telegram Bot API)
//! - REST API guarded by an `X-API-Key` header

pub mod api;
pub mod config;
pub mod pipeline;
pub mod provider;
pub mod query;
pub mod state_machine;
pub mod storage;
#[cfg(test)]
pub mod testutil;

use config::Config;
use pipeline::Pipeline;
use query::QueryService;
use storage::Database;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub pipeline: Pipeline,
    pub query: QueryService,
}
