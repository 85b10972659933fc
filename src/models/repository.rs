//! Mirrored repository model and download status.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A mirrored GitHub repository.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Local row id.
    pub id: i64,

    /// Repository owner (user or organization login).
    pub owner: String,

    /// Repository name.
    pub name: String,

    /// Whether the repository is private on GitHub.
    pub private: bool,

    /// Name of the default branch, set by ref sync.
    pub head_ref: Option<String>,

    /// Count of open issues, maintained transactionally with issue upserts.
    pub open_issues: i64,

    /// Count of closed issues, maintained transactionally with issue upserts.
    pub closed_issues: i64,

    /// Unix timestamp of local row creation.
    pub created_at: i64,
}

impl Repository {
    /// "owner/name" form used in error messages and logs.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Download status state machine.
///
/// `initial → pending → {backfilling | syncing} → {success | error | cancelled}`.
/// Any phase may move to `error`; a set cancellation flag coerces the next
/// status write to `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Initial,
    Pending,
    Backfilling,
    Syncing,
    Success,
    Error,
    Cancelled,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Pending => "pending",
            Self::Backfilling => "backfilling",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(Self::Initial),
            "pending" => Some(Self::Pending),
            "backfilling" => Some(Self::Backfilling),
            "syncing" => Some(Self::Syncing),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether this state marks the end of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    /// Whether a sync pass is currently in progress.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Pending | Self::Backfilling | Self::Syncing)
    }
}

/// Download status row for a repository.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStatus {
    pub repo_id: i64,
    pub status: String,
    pub message: Option<String>,
    pub last_synced_at: Option<i64>,
    pub cancelled: bool,
    pub updated_at: i64,
}

impl DownloadStatus {
    pub fn state(&self) -> Option<DownloadState> {
        DownloadState::parse(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            DownloadState::Initial,
            DownloadState::Pending,
            DownloadState::Backfilling,
            DownloadState::Syncing,
            DownloadState::Success,
            DownloadState::Error,
            DownloadState::Cancelled,
        ] {
            assert_eq!(DownloadState::parse(state.as_str()), Some(state));
        }
        assert_eq!(DownloadState::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_and_progress_predicates() {
        assert!(DownloadState::Success.is_terminal());
        assert!(DownloadState::Cancelled.is_terminal());
        assert!(!DownloadState::Syncing.is_terminal());
        assert!(DownloadState::Backfilling.is_in_progress());
        assert!(!DownloadState::Initial.is_in_progress());
    }
}
