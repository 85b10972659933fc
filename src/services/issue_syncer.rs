//! Issue synchronization over the GraphQL API.
//!
//! Issues are fetched in pages ordered by updatedAt, newest first; the max
//! updatedAt seen across a completed run becomes the incremental watermark
//! for the next one (it is only stamped on success, so an interrupted run
//! re-covers its ground). Each
//! issue node embeds first-page label, assignee, comment and timeline
//! connections; when the provider reports one of those as overflowing, the
//! full set is re-fetched through dedicated per-issue pagination before
//! anything is written.
//!
//! Node parsing is defensive: a malformed issue is logged and skipped rather
//! than failing the page, since one bad node must not stall the mirror.

use std::time::Duration;

use serde_json::Value;

use crate::db::issue_store::{self, CommentUpsert, IssueUpsert, TimelineUpsert};
use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::issue::{IssueActor, TimelineEvent};
use crate::models::repository::Repository;
use crate::services::github_client::{retry_rate_limited, GitHubClient};
use crate::services::status_tracker::StatusTracker;

/// Login that GitHub reports for its own automation account.
const ACTIONS_LOGIN: &str = "github-actions";

/// Issue sync tuning knobs.
#[derive(Debug, Clone)]
pub struct IssueSyncConfig {
    /// Issues per GraphQL page.
    pub page_size: u32,
    /// Page size for per-issue sub-resource pagination.
    pub sub_page_size: u32,
    /// Pause between issue pages.
    pub inter_page_delay_ms: u64,
    /// Stop after this many pages even if more remain (used by backfill
    /// steps); `None` runs to exhaustion.
    pub max_pages: Option<u32>,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for IssueSyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            sub_page_size: 100,
            inter_page_delay_ms: 500,
            max_pages: None,
            retry_attempts: 5,
            retry_base_delay_ms: 1_000,
        }
    }
}

/// Result of one issue sync pass.
#[derive(Debug, Clone, Default)]
pub struct IssueSyncOutcome {
    pub pages_fetched: u32,
    pub issues_synced: usize,
    pub issues_skipped: usize,
    /// Cursor after the last fetched page, for resumption.
    pub end_cursor: Option<String>,
    /// Whether more pages remain past `end_cursor`.
    pub has_more: bool,
    /// Max updatedAt (unix seconds) across synced issues.
    pub max_updated_at: Option<i64>,
}

/// Sync issue pages for a repository.
///
/// `since_unix` bounds the fetch to issues updated at or after the
/// watermark; `start_cursor` resumes a previously interrupted pagination.
/// Rate limits retry the same cursor with exponential backoff.
pub async fn sync_issue_pages(
    pool: &DbPool,
    client: &GitHubClient,
    repo: &Repository,
    tracker: &StatusTracker,
    config: &IssueSyncConfig,
    since_unix: Option<i64>,
    start_cursor: Option<String>,
) -> Result<IssueSyncOutcome, AppError> {
    let mut outcome = IssueSyncOutcome {
        end_cursor: start_cursor,
        has_more: true,
        ..Default::default()
    };

    while outcome.has_more {
        if let Some(max) = config.max_pages {
            if outcome.pages_fetched >= max {
                break;
            }
        }

        tracker.check_cancelled().await?;

        let cursor = outcome.end_cursor.clone();
        let page = retry_rate_limited(
            || {
                let after = cursor.clone();
                async move {
                    client
                        .issues_page(
                            &repo.owner,
                            &repo.name,
                            config.page_size,
                            after.as_deref(),
                            since_unix,
                        )
                        .await
                }
            },
            config.retry_attempts,
            config.retry_base_delay_ms,
        )
        .await?;

        outcome.pages_fetched += 1;
        outcome.has_more = page.has_next_page;
        if page.end_cursor.is_some() {
            outcome.end_cursor = page.end_cursor;
        }

        for node in &page.nodes {
            tracker.check_cancelled().await?;

            let mut parsed = match parse_issue_node(node) {
                Ok(parsed) => parsed,
                Err(err) => {
                    log::warn!(
                        "Skipping malformed issue node in {}: {}",
                        repo.full_name(),
                        err
                    );
                    outcome.issues_skipped += 1;
                    continue;
                }
            };

            resolve_overflows(client, repo, config, &mut parsed).await?;

            let issue_id = issue_store::upsert_issue(pool, repo.id, &parsed.issue).await?;
            issue_store::replace_comments(pool, issue_id, &parsed.comments).await?;
            issue_store::replace_timeline(pool, issue_id, &parsed.timeline).await?;

            outcome.issues_synced += 1;
            outcome.max_updated_at = outcome
                .max_updated_at
                .max(Some(parsed.issue.updated_at));
        }

        tracker
            .progress(&format!(
                "{} issues synced ({} pages)",
                outcome.issues_synced, outcome.pages_fetched
            ))
            .await?;

        if outcome.has_more && config.inter_page_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.inter_page_delay_ms)).await;
        }
    }

    Ok(outcome)
}

/// A fully parsed issue node, plus flags for embedded connections the
/// provider reported as incomplete.
#[derive(Debug, Clone)]
pub struct ParsedIssue {
    pub issue: IssueUpsert,
    pub comments: Vec<CommentUpsert>,
    pub timeline: Vec<TimelineUpsert>,
    pub labels_overflow: bool,
    pub assignees_overflow: bool,
    pub comments_overflow: bool,
    pub timeline_overflow: bool,
}

/// Parse a raw GraphQL issue node.
///
/// Required scalars (number, databaseId, title, state, timestamps) fail the
/// node; optional structure degrades to empty or `Ghost`.
pub fn parse_issue_node(node: &Value) -> Result<ParsedIssue, AppError> {
    let number = require_i64(node, "number")?;
    let github_id = require_i64(node, "databaseId")?;
    let title = require_str(node, "title")?.to_string();
    let state = require_str(node, "state")?.to_lowercase();
    if state != "open" && state != "closed" {
        return Err(AppError::invalid_input(format!(
            "Unknown issue state {:?}",
            state
        )));
    }

    let created_at = require_timestamp(node, "createdAt")?;
    let updated_at = require_timestamp(node, "updatedAt")?;
    let closed_at = node
        .get("closedAt")
        .and_then(Value::as_str)
        .and_then(parse_rfc3339);

    let body = node
        .get("body")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);

    let author = parse_actor(node.get("author"));

    let labels = connection_nodes(node, "labels")
        .iter()
        .filter_map(|n| n.get("name").and_then(Value::as_str).map(String::from))
        .collect::<Vec<_>>();
    let assignees = connection_nodes(node, "assignees")
        .iter()
        .filter_map(|n| n.get("login").and_then(Value::as_str).map(String::from))
        .collect::<Vec<_>>();

    let comment_count = node
        .pointer("/comments/totalCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    let comments = connection_nodes(node, "comments")
        .iter()
        .filter_map(|n| parse_comment_node(n))
        .collect::<Vec<_>>();

    let timeline = connection_nodes(node, "timelineItems")
        .iter()
        .filter_map(|n| normalize_timeline_item(n))
        .collect::<Vec<_>>();

    Ok(ParsedIssue {
        issue: IssueUpsert {
            github_id,
            number,
            title,
            state,
            body,
            author,
            labels,
            assignees,
            comment_count,
            created_at,
            updated_at,
            closed_at,
        },
        comments,
        timeline,
        labels_overflow: connection_overflows(node, "labels"),
        assignees_overflow: connection_overflows(node, "assignees"),
        comments_overflow: connection_overflows(node, "comments"),
        timeline_overflow: connection_overflows(node, "timelineItems"),
    })
}

/// Re-fetch any embedded connection the first page couldn't hold in full.
async fn resolve_overflows(
    client: &GitHubClient,
    repo: &Repository,
    config: &IssueSyncConfig,
    parsed: &mut ParsedIssue,
) -> Result<(), AppError> {
    let number = parsed.issue.number;

    if parsed.labels_overflow {
        let nodes = fetch_all_sub_pages(config, |after| async move {
            client
                .issue_labels_page(
                    &repo.owner,
                    &repo.name,
                    number,
                    config.sub_page_size,
                    after.as_deref(),
                )
                .await
        })
        .await?;
        parsed.issue.labels = nodes
            .iter()
            .filter_map(|n| n.get("name").and_then(Value::as_str).map(String::from))
            .collect();
    }

    if parsed.assignees_overflow {
        let nodes = fetch_all_sub_pages(config, |after| async move {
            client
                .issue_assignees_page(
                    &repo.owner,
                    &repo.name,
                    number,
                    config.sub_page_size,
                    after.as_deref(),
                )
                .await
        })
        .await?;
        parsed.issue.assignees = nodes
            .iter()
            .filter_map(|n| n.get("login").and_then(Value::as_str).map(String::from))
            .collect();
    }

    if parsed.comments_overflow {
        let nodes = fetch_all_sub_pages(config, |after| async move {
            client
                .issue_comments_page(
                    &repo.owner,
                    &repo.name,
                    number,
                    config.sub_page_size,
                    after.as_deref(),
                )
                .await
        })
        .await?;
        parsed.comments = nodes.iter().filter_map(|n| parse_comment_node(n)).collect();
    }

    if parsed.timeline_overflow {
        let nodes = fetch_all_sub_pages(config, |after| async move {
            client
                .issue_timeline_page(
                    &repo.owner,
                    &repo.name,
                    number,
                    config.sub_page_size,
                    after.as_deref(),
                )
                .await
        })
        .await?;
        parsed.timeline = nodes
            .iter()
            .filter_map(|n| normalize_timeline_item(n))
            .collect();
    }

    Ok(())
}

async fn fetch_all_sub_pages<F, Fut>(
    config: &IssueSyncConfig,
    mut fetch: F,
) -> Result<Vec<Value>, AppError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<
        Output = Result<crate::services::github_client::SubResourcePage, AppError>,
    >,
{
    let mut nodes = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = retry_rate_limited(
            || fetch(cursor.clone()),
            config.retry_attempts,
            config.retry_base_delay_ms,
        )
        .await?;

        nodes.extend(page.nodes);
        if !page.has_next_page {
            break;
        }
        cursor = page.end_cursor;
        if cursor.is_none() {
            break;
        }
    }

    Ok(nodes)
}

/// Normalize a GraphQL actor object into the three-way actor model.
pub fn parse_actor(actor: Option<&Value>) -> IssueActor {
    let actor = match actor {
        Some(v) if !v.is_null() => v,
        _ => return IssueActor::Ghost,
    };

    let login = actor.get("login").and_then(Value::as_str);
    let typename = actor.get("__typename").and_then(Value::as_str);

    if typename == Some("Bot") || login == Some(ACTIONS_LOGIN) {
        return IssueActor::Bot;
    }

    match (login, actor.get("databaseId").and_then(Value::as_i64)) {
        (Some(login), Some(id)) => IssueActor::User {
            login: login.to_string(),
            id,
        },
        _ => IssueActor::Ghost,
    }
}

fn parse_comment_node(node: &Value) -> Option<CommentUpsert> {
    let github_id = node.get("databaseId").and_then(Value::as_i64)?;
    let created_at = node
        .get("createdAt")
        .and_then(Value::as_str)
        .and_then(parse_rfc3339)?;
    let updated_at = node
        .get("updatedAt")
        .and_then(Value::as_str)
        .and_then(parse_rfc3339)
        .unwrap_or(created_at);

    Some(CommentUpsert {
        github_id,
        author: parse_actor(node.get("author")),
        body: node
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        created_at,
        updated_at,
    })
}

/// Map a raw timeline node to a storable item.
///
/// Unknown `__typename`s are logged and dropped; the stored timeline is a
/// closed union.
pub fn normalize_timeline_item(node: &Value) -> Option<TimelineUpsert> {
    let typename = node.get("__typename").and_then(Value::as_str)?;

    let event = match typename {
        "AssignedEvent" => TimelineEvent::Assigned {
            assignee: str_at(node, "/assignee/login"),
        },
        "UnassignedEvent" => TimelineEvent::Unassigned {
            assignee: str_at(node, "/assignee/login"),
        },
        "LabeledEvent" => TimelineEvent::Labeled {
            label: str_at(node, "/label/name")?,
        },
        "UnlabeledEvent" => TimelineEvent::Unlabeled {
            label: str_at(node, "/label/name")?,
        },
        "MilestonedEvent" => TimelineEvent::Milestoned {
            title: str_at(node, "/milestoneTitle")?,
        },
        "DemilestonedEvent" => TimelineEvent::Demilestoned {
            title: str_at(node, "/milestoneTitle")?,
        },
        "ClosedEvent" => TimelineEvent::Closed,
        "ReopenedEvent" => TimelineEvent::Reopened,
        "RenamedTitleEvent" => TimelineEvent::Renamed {
            previous_title: str_at(node, "/previousTitle")?,
            current_title: str_at(node, "/currentTitle")?,
        },
        "ReferencedEvent" => TimelineEvent::Referenced {
            commit_sha: str_at(node, "/commit/oid"),
        },
        "CrossReferencedEvent" => TimelineEvent::CrossReferenced {
            source_number: node.pointer("/source/number").and_then(Value::as_i64),
            will_close: node
                .pointer("/willCloseTarget")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        "LockedEvent" => TimelineEvent::Locked {
            reason: str_at(node, "/lockReason"),
        },
        "UnlockedEvent" => TimelineEvent::Unlocked,
        "PinnedEvent" => TimelineEvent::Pinned,
        "UnpinnedEvent" => TimelineEvent::Unpinned,
        "TransferredEvent" => TimelineEvent::Transferred {
            from_repository: str_at(node, "/fromRepository/nameWithOwner"),
        },
        other => {
            log::warn!("Dropping unknown timeline item type {}", other);
            return None;
        }
    };

    let github_node_id = node.get("id").and_then(Value::as_str)?.to_string();
    let created_at = node
        .get("createdAt")
        .and_then(Value::as_str)
        .and_then(parse_rfc3339)?;

    Some(TimelineUpsert {
        github_node_id,
        created_at,
        actor_login: str_at(node, "/actor/login"),
        event,
    })
}

fn connection_nodes<'a>(node: &'a Value, field: &str) -> Vec<&'a Value> {
    node.pointer(&format!("/{}/nodes", field))
        .and_then(Value::as_array)
        .map(|nodes| nodes.iter().filter(|n| !n.is_null()).collect())
        .unwrap_or_default()
}

fn connection_overflows(node: &Value, field: &str) -> bool {
    node.pointer(&format!("/{}/pageInfo/hasNextPage", field))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn str_at(node: &Value, pointer: &str) -> Option<String> {
    node.pointer(pointer)
        .and_then(Value::as_str)
        .map(String::from)
}

fn require_i64(node: &Value, field: &str) -> Result<i64, AppError> {
    node.get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| AppError::invalid_input(format!("Missing field {}", field)))
}

fn require_str<'a>(node: &'a Value, field: &str) -> Result<&'a str, AppError> {
    node.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::invalid_input(format!("Missing field {}", field)))
}

fn require_timestamp(node: &Value, field: &str) -> Result<i64, AppError> {
    require_str(node, field).and_then(|s| {
        parse_rfc3339(s)
            .ok_or_else(|| AppError::invalid_input(format!("Bad timestamp in {}", field)))
    })
}

fn parse_rfc3339(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn issue_node() -> Value {
        json!({
            "databaseId": 9001,
            "number": 42,
            "title": "Panic on empty input",
            "state": "OPEN",
            "body": "Steps to reproduce...",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-02T12:00:00Z",
            "closedAt": null,
            "author": { "__typename": "User", "login": "octocat", "databaseId": 583231 },
            "labels": {
                "pageInfo": { "hasNextPage": false },
                "nodes": [ { "name": "bug" }, { "name": "help wanted" } ]
            },
            "assignees": {
                "pageInfo": { "hasNextPage": false },
                "nodes": [ { "login": "hubot" } ]
            },
            "comments": {
                "totalCount": 1,
                "pageInfo": { "hasNextPage": false },
                "nodes": [ {
                    "databaseId": 555,
                    "body": "Confirmed",
                    "createdAt": "2024-01-01T06:00:00Z",
                    "updatedAt": "2024-01-01T06:00:00Z",
                    "author": { "__typename": "User", "login": "hubot", "databaseId": 1 }
                } ]
            },
            "timelineItems": {
                "pageInfo": { "hasNextPage": false },
                "nodes": [
                    {
                        "__typename": "LabeledEvent",
                        "id": "LE_1",
                        "createdAt": "2024-01-01T01:00:00Z",
                        "actor": { "login": "octocat" },
                        "label": { "name": "bug" }
                    },
                    {
                        "__typename": "SubscribedEvent",
                        "id": "SE_1",
                        "createdAt": "2024-01-01T02:00:00Z"
                    }
                ]
            }
        })
    }

    #[test]
    fn test_parse_issue_node_full() {
        let parsed = parse_issue_node(&issue_node()).unwrap();

        assert_eq!(parsed.issue.number, 42);
        assert_eq!(parsed.issue.github_id, 9001);
        assert_eq!(parsed.issue.state, "open");
        assert_eq!(
            parsed.issue.author,
            IssueActor::User {
                login: "octocat".to_string(),
                id: 583231
            }
        );
        assert_eq!(parsed.issue.labels, vec!["bug", "help wanted"]);
        assert_eq!(parsed.issue.assignees, vec!["hubot"]);
        assert_eq!(parsed.issue.comment_count, 1);
        assert!(parsed.issue.closed_at.is_none());
        assert_eq!(parsed.comments.len(), 1);
        assert_eq!(parsed.comments[0].github_id, 555);
        assert!(!parsed.labels_overflow);
    }

    #[test]
    fn test_unknown_timeline_type_is_dropped() {
        let parsed = parse_issue_node(&issue_node()).unwrap();
        // SubscribedEvent is not in the closed union
        assert_eq!(parsed.timeline.len(), 1);
        assert_eq!(
            parsed.timeline[0].event,
            TimelineEvent::Labeled {
                label: "bug".to_string()
            }
        );
        assert_eq!(parsed.timeline[0].actor_login.as_deref(), Some("octocat"));
    }

    #[test]
    fn test_missing_required_field_fails_node() {
        let mut node = issue_node();
        node.as_object_mut().unwrap().remove("number");
        assert!(parse_issue_node(&node).is_err());

        let mut node = issue_node();
        node["updatedAt"] = json!("not a timestamp");
        assert!(parse_issue_node(&node).is_err());

        let mut node = issue_node();
        node["state"] = json!("DRAFT");
        assert!(parse_issue_node(&node).is_err());
    }

    #[test]
    fn test_actor_normalization() {
        assert_eq!(parse_actor(None), IssueActor::Ghost);
        assert_eq!(parse_actor(Some(&Value::Null)), IssueActor::Ghost);

        let bot = json!({ "__typename": "Bot", "login": "dependabot" });
        assert_eq!(parse_actor(Some(&bot)), IssueActor::Bot);

        let actions = json!({ "__typename": "User", "login": "github-actions" });
        assert_eq!(parse_actor(Some(&actions)), IssueActor::Bot);

        let user = json!({ "__typename": "User", "login": "octocat", "databaseId": 7 });
        assert_eq!(
            parse_actor(Some(&user)),
            IssueActor::User {
                login: "octocat".to_string(),
                id: 7
            }
        );

        // A user without a database id can't be referenced; treat as ghost
        let partial = json!({ "__typename": "User", "login": "octocat" });
        assert_eq!(parse_actor(Some(&partial)), IssueActor::Ghost);
    }

    #[test]
    fn test_overflow_flags_detected() {
        let mut node = issue_node();
        node["comments"]["pageInfo"]["hasNextPage"] = json!(true);
        let parsed = parse_issue_node(&node).unwrap();
        assert!(parsed.comments_overflow);
        assert!(!parsed.timeline_overflow);
    }

    #[test]
    fn test_closed_issue_parses_closed_at() {
        let mut node = issue_node();
        node["state"] = json!("CLOSED");
        node["closedAt"] = json!("2024-02-01T00:00:00Z");
        let parsed = parse_issue_node(&node).unwrap();
        assert_eq!(parsed.issue.state, "closed");
        assert!(parsed.issue.closed_at.is_some());
    }

    #[test]
    fn test_timeline_item_variants() {
        let cross = json!({
            "__typename": "CrossReferencedEvent",
            "id": "CRE_1",
            "createdAt": "2024-01-01T00:00:00Z",
            "actor": { "login": "octocat" },
            "willCloseTarget": true,
            "source": { "number": 99 }
        });
        let item = normalize_timeline_item(&cross).unwrap();
        assert_eq!(
            item.event,
            TimelineEvent::CrossReferenced {
                source_number: Some(99),
                will_close: true
            }
        );

        let renamed = json!({
            "__typename": "RenamedTitleEvent",
            "id": "RTE_1",
            "createdAt": "2024-01-01T00:00:00Z",
            "previousTitle": "old",
            "currentTitle": "new"
        });
        let item = normalize_timeline_item(&renamed).unwrap();
        assert_eq!(
            item.event,
            TimelineEvent::Renamed {
                previous_title: "old".to_string(),
                current_title: "new".to_string()
            }
        );

        // Closed union: no typename, no item
        assert!(normalize_timeline_item(&json!({ "id": "x" })).is_none());
    }
}
