//! Store operations over issues, comments, and timeline items.
//!
//! Issues are upserted by (repo, number) with the repo-level open/closed
//! counters adjusted in the same transaction. Comment and timeline sets are
//! replaced wholesale on each sync pass: the provider page is already a
//! complete current snapshot of those sub-resources, so no diffing is done.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::issue::{Issue, IssueActor, IssueComment, IssueTimelineItem, TimelineEvent};

/// Input for an issue upsert.
#[derive(Debug, Clone)]
pub struct IssueUpsert {
    pub github_id: i64,
    pub number: i64,
    pub title: String,
    /// "open" or "closed".
    pub state: String,
    pub body: Option<String>,
    pub author: IssueActor,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub comment_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub closed_at: Option<i64>,
}

/// Input for a comment row.
#[derive(Debug, Clone)]
pub struct CommentUpsert {
    pub github_id: i64,
    pub author: IssueActor,
    pub body: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for a timeline row.
#[derive(Debug, Clone)]
pub struct TimelineUpsert {
    pub github_node_id: String,
    pub created_at: i64,
    pub actor_login: Option<String>,
    pub event: TimelineEvent,
}

/// Upsert an issue by (repo, number), moving the repo's open/closed counters
/// in the same transaction.
///
/// Counters are derived state: a brand-new issue increments the counter for
/// its state, a state flip moves one count across, an unchanged state leaves
/// both counters alone. They are never recomputed by scan here; that is the
/// explicit [`recount_issue_counters`] repair path.
///
/// # Returns
/// The local issue row id.
pub async fn upsert_issue(
    pool: &DbPool,
    repo_id: i64,
    issue: &IssueUpsert,
) -> Result<i64, AppError> {
    let labels_json = serde_json::to_string(&issue.labels)?;
    let assignees_json = serde_json::to_string(&issue.assignees)?;

    let mut tx = pool.begin().await?;

    let existing: Option<(i64, String)> =
        sqlx::query_as("SELECT id, state FROM issues WHERE repo_id = ? AND number = ?")
            .bind(repo_id)
            .bind(issue.number)
            .fetch_optional(&mut *tx)
            .await?;

    sqlx::query(
        r#"
        INSERT INTO issues (
            repo_id, github_id, number, title, state, body,
            author_kind, author_login, author_id,
            labels, assignees, comment_count, created_at, updated_at, closed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(repo_id, number) DO UPDATE SET
            github_id = excluded.github_id,
            title = excluded.title,
            state = excluded.state,
            body = excluded.body,
            author_kind = excluded.author_kind,
            author_login = excluded.author_login,
            author_id = excluded.author_id,
            labels = excluded.labels,
            assignees = excluded.assignees,
            comment_count = excluded.comment_count,
            updated_at = excluded.updated_at,
            closed_at = excluded.closed_at
        "#,
    )
    .bind(repo_id)
    .bind(issue.github_id)
    .bind(issue.number)
    .bind(&issue.title)
    .bind(&issue.state)
    .bind(&issue.body)
    .bind(issue.author.kind_str())
    .bind(issue.author.login())
    .bind(issue.author.user_id())
    .bind(&labels_json)
    .bind(&assignees_json)
    .bind(issue.comment_count)
    .bind(issue.created_at)
    .bind(issue.updated_at)
    .bind(issue.closed_at)
    .execute(&mut *tx)
    .await?;

    // Counter deltas relative to the previous state
    let (open_delta, closed_delta): (i64, i64) = match &existing {
        None => {
            if issue.state == "open" {
                (1, 0)
            } else {
                (0, 1)
            }
        }
        Some((_, old_state)) if *old_state != issue.state => {
            if issue.state == "open" {
                (1, -1)
            } else {
                (-1, 1)
            }
        }
        Some(_) => (0, 0),
    };

    if open_delta != 0 || closed_delta != 0 {
        sqlx::query(
            "UPDATE repositories SET
                open_issues = MAX(0, open_issues + ?),
                closed_issues = MAX(0, closed_issues + ?)
             WHERE id = ?",
        )
        .bind(open_delta)
        .bind(closed_delta)
        .bind(repo_id)
        .execute(&mut *tx)
        .await?;
    }

    let issue_id: i64 = match existing {
        Some((id, _)) => id,
        None => sqlx::query_scalar("SELECT id FROM issues WHERE repo_id = ? AND number = ?")
            .bind(repo_id)
            .bind(issue.number)
            .fetch_one(&mut *tx)
            .await?,
    };

    tx.commit().await?;

    Ok(issue_id)
}

/// Replace an issue's comment set (delete-then-insert) and refresh the
/// issue's comment count.
pub async fn replace_comments(
    pool: &DbPool,
    issue_id: i64,
    comments: &[CommentUpsert],
) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM issue_comments WHERE issue_id = ?")
        .bind(issue_id)
        .execute(&mut *tx)
        .await?;

    for comment in comments {
        sqlx::query(
            "INSERT INTO issue_comments (
                issue_id, github_id, author_kind, author_login, author_id,
                body, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(issue_id)
        .bind(comment.github_id)
        .bind(comment.author.kind_str())
        .bind(comment.author.login())
        .bind(comment.author.user_id())
        .bind(&comment.body)
        .bind(comment.created_at)
        .bind(comment.updated_at)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE issues SET comment_count = ? WHERE id = ?")
        .bind(comments.len() as i64)
        .bind(issue_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(())
}

/// Replace an issue's timeline item set (delete-then-insert).
pub async fn replace_timeline(
    pool: &DbPool,
    issue_id: i64,
    items: &[TimelineUpsert],
) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM issue_timeline_items WHERE issue_id = ?")
        .bind(issue_id)
        .execute(&mut *tx)
        .await?;

    for item in items {
        let item_json = serde_json::to_string(&item.event)?;

        sqlx::query(
            "INSERT INTO issue_timeline_items (issue_id, github_node_id, created_at, actor_login, item)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(issue_id)
        .bind(&item.github_node_id)
        .bind(item.created_at)
        .bind(&item.actor_login)
        .bind(&item_json)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(())
}

/// Fetch an issue by (repo, number).
pub async fn get_issue(
    pool: &DbPool,
    repo_id: i64,
    number: i64,
) -> Result<Option<Issue>, AppError> {
    let issue = sqlx::query_as::<_, Issue>(
        "SELECT id, repo_id, github_id, number, title, state, body,
                author_kind, author_login, author_id, labels, assignees,
                comment_count, created_at, updated_at, closed_at
         FROM issues WHERE repo_id = ? AND number = ?",
    )
    .bind(repo_id)
    .bind(number)
    .fetch_optional(pool)
    .await?;

    Ok(issue)
}

/// List an issue's comments ordered by creation time.
pub async fn list_comments(pool: &DbPool, issue_id: i64) -> Result<Vec<IssueComment>, AppError> {
    let comments = sqlx::query_as::<_, IssueComment>(
        "SELECT issue_id, github_id, author_kind, author_login, author_id,
                body, created_at, updated_at
         FROM issue_comments WHERE issue_id = ? ORDER BY created_at, github_id",
    )
    .bind(issue_id)
    .fetch_all(pool)
    .await?;

    Ok(comments)
}

/// List an issue's timeline items ordered by creation time.
pub async fn list_timeline(
    pool: &DbPool,
    issue_id: i64,
) -> Result<Vec<IssueTimelineItem>, AppError> {
    let items = sqlx::query_as::<_, IssueTimelineItem>(
        "SELECT issue_id, github_node_id, created_at, actor_login, item
         FROM issue_timeline_items WHERE issue_id = ? ORDER BY created_at, github_node_id",
    )
    .bind(issue_id)
    .fetch_all(pool)
    .await?;

    Ok(items)
}

/// Repair path: recompute the repo's open/closed counters by full scan.
pub async fn recount_issue_counters(pool: &DbPool, repo_id: i64) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE repositories SET
            open_issues = (SELECT COUNT(*) FROM issues WHERE repo_id = ? AND state = 'open'),
            closed_issues = (SELECT COUNT(*) FROM issues WHERE repo_id = ? AND state = 'closed')
         WHERE id = ?",
    )
    .bind(repo_id)
    .bind(repo_id)
    .bind(repo_id)
    .execute(pool)
    .await?;

    Ok(())
}
