//! Data models for the mirror.
//!
//! These models represent the entities stored in the local SQLite database.
//! All models derive Serialize for callers and FromRow for SQLx queries.

pub mod git_object;
pub mod issue;
pub mod repository;

// Re-exports for convenient access
pub use git_object::{Blob, BlobEncoding, Commit, GitRef, TreeEntry, TreeEntryType};
pub use issue::{Issue, IssueActor, IssueComment, IssueTimelineItem, TimelineEvent};
pub use repository::{DownloadState, DownloadStatus, Repository};
