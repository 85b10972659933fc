//! Sync services.
//!
//! The layering goes client → phase services → engine: [`github_client`]
//! talks to the provider, the phase services ([`ref_syncer`],
//! [`object_ingester`], [`issue_syncer`], [`backfill`]) each own one part of
//! a sync run, and [`sync_engine`] schedules runs and records outcomes.
//! [`status_tracker`] carries the per-repository state machine and
//! cancellation flag through every phase.

pub mod backfill;
pub mod github_client;
pub mod issue_syncer;
pub mod object_ingester;
pub mod ref_syncer;
pub mod resolver;
pub mod status_tracker;
pub mod sync_engine;
pub mod webhook;

pub use github_client::{GitHubClient, GitHubClientConfig};
pub use resolver::{resolve_ref_and_path, ResolvedPath};
pub use status_tracker::StatusTracker;
pub use sync_engine::{run_sync, SyncCommand, SyncConfig, SyncEngine, SyncHandle};
