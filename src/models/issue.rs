//! Issue tracker models: issues, comments, timeline events.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The author of an issue, comment, or timeline event.
///
/// GitHub's actor shape is three-way and the distinction matters downstream:
/// a deleted account resolves to `Ghost`, the `github-actions` app has no
/// user database id and resolves to `Bot`, everything else is a `User`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IssueActor {
    /// Deleted or anonymized account.
    Ghost,
    /// The `github-actions` bot.
    Bot,
    /// A regular user with a database id.
    User { login: String, id: i64 },
}

impl IssueActor {
    /// The string stored in the `author_kind` column.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Ghost => "ghost",
            Self::Bot => "bot",
            Self::User { .. } => "user",
        }
    }

    pub fn login(&self) -> Option<&str> {
        match self {
            Self::User { login, .. } => Some(login),
            Self::Bot => Some("github-actions"),
            Self::Ghost => None,
        }
    }

    pub fn user_id(&self) -> Option<i64> {
        match self {
            Self::User { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Rebuild an actor from its stored columns.
    pub fn from_columns(kind: &str, login: Option<String>, id: Option<i64>) -> Self {
        match kind {
            "bot" => Self::Bot,
            "user" => match (login, id) {
                (Some(login), Some(id)) => Self::User { login, id },
                _ => Self::Ghost,
            },
            _ => Self::Ghost,
        }
    }
}

/// A mirrored issue row.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    /// Local row id.
    pub id: i64,
    pub repo_id: i64,
    /// GitHub's numeric database id.
    pub github_id: i64,
    /// Issue number within the repository.
    pub number: i64,
    pub title: String,
    /// "open" or "closed".
    pub state: String,
    pub body: Option<String>,
    pub author_kind: String,
    pub author_login: Option<String>,
    pub author_id: Option<i64>,
    /// Label names as a JSON array string.
    pub labels: String,
    /// Assignee logins as a JSON array string.
    pub assignees: String,
    pub comment_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub closed_at: Option<i64>,
}

impl Issue {
    pub fn author(&self) -> IssueActor {
        IssueActor::from_columns(&self.author_kind, self.author_login.clone(), self.author_id)
    }

    pub fn label_names(&self) -> Vec<String> {
        serde_json::from_str(&self.labels).unwrap_or_default()
    }

    pub fn assignee_logins(&self) -> Vec<String> {
        serde_json::from_str(&self.assignees).unwrap_or_default()
    }
}

/// A mirrored issue comment row.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct IssueComment {
    pub issue_id: i64,
    pub github_id: i64,
    pub author_kind: String,
    pub author_login: Option<String>,
    pub author_id: Option<i64>,
    pub body: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A mirrored timeline item row. `item` holds the serialized [`TimelineEvent`].
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct IssueTimelineItem {
    pub issue_id: i64,
    pub github_node_id: String,
    pub created_at: i64,
    pub actor_login: Option<String>,
    pub item: String,
}

impl IssueTimelineItem {
    pub fn event(&self) -> Option<TimelineEvent> {
        serde_json::from_str(&self.item).ok()
    }
}

/// Closed union of the timeline event shapes the mirror understands.
///
/// Unknown `__typename`s from the provider are logged and dropped during
/// normalization; they never reach this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEvent {
    Assigned { assignee: Option<String> },
    Unassigned { assignee: Option<String> },
    Labeled { label: String },
    Unlabeled { label: String },
    Milestoned { title: String },
    Demilestoned { title: String },
    Closed,
    Reopened,
    Renamed { previous_title: String, current_title: String },
    Referenced { commit_sha: Option<String> },
    CrossReferenced { source_number: Option<i64>, will_close: bool },
    Locked { reason: Option<String> },
    Unlocked,
    Pinned,
    Unpinned,
    Transferred { from_repository: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_column_round_trip() {
        let user = IssueActor::User {
            login: "octocat".to_string(),
            id: 583231,
        };
        let rebuilt =
            IssueActor::from_columns(user.kind_str(), user.login().map(String::from), user.user_id());
        assert_eq!(rebuilt, user);

        assert_eq!(IssueActor::from_columns("ghost", None, None), IssueActor::Ghost);
        assert_eq!(IssueActor::from_columns("bot", None, None), IssueActor::Bot);
    }

    #[test]
    fn test_actor_user_missing_columns_degrades_to_ghost() {
        // A user row with a lost login can't be joined; treat it as ghost
        assert_eq!(
            IssueActor::from_columns("user", None, Some(1)),
            IssueActor::Ghost
        );
    }

    #[test]
    fn test_timeline_event_serialization() {
        let event = TimelineEvent::Renamed {
            previous_title: "old".to_string(),
            current_title: "new".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"renamed\""));

        let back: TimelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_timeline_event_unit_variants() {
        let json = serde_json::to_string(&TimelineEvent::Closed).unwrap();
        assert_eq!(json, r#"{"type":"closed"}"#);
        let json = serde_json::to_string(&TimelineEvent::Unpinned).unwrap();
        assert_eq!(json, r#"{"type":"unpinned"}"#);
    }

    #[test]
    fn test_issue_label_decode() {
        let issue = Issue {
            id: 1,
            repo_id: 1,
            github_id: 100,
            number: 7,
            title: "t".to_string(),
            state: "open".to_string(),
            body: None,
            author_kind: "user".to_string(),
            author_login: Some("octocat".to_string()),
            author_id: Some(1),
            labels: r#"["bug","help wanted"]"#.to_string(),
            assignees: "[]".to_string(),
            comment_count: 0,
            created_at: 0,
            updated_at: 0,
            closed_at: None,
        };
        assert_eq!(issue.label_names(), vec!["bug", "help wanted"]);
        assert!(issue.assignee_logins().is_empty());
    }
}
