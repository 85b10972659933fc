//! Local-first GitHub mirror.
//!
//! Mirrors repositories (refs, commits, trees, blobs) and their issue
//! trackers (issues, comments, timeline events) into a local SQLite
//! database, keeping them fresh with a background sync engine and webhook
//! deliveries.
//!
//! ```no_run
//! use std::sync::Arc;
//! use octomirror::db;
//! use octomirror::services::{GitHubClient, GitHubClientConfig, SyncConfig, SyncEngine};
//!
//! # async fn run() -> Result<(), octomirror::error::AppError> {
//! let pool = db::initialize(&db::get_db_path("data".as_ref())).await?;
//! let client = Arc::new(GitHubClient::new(&GitHubClientConfig::new("<token>"))?);
//! let handle = SyncEngine::new(pool, client, SyncConfig::default()).start_background();
//! handle.trigger_sync(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use error::AppError;
