//! Initial issue backfill with resumable pagination.
//!
//! A backfill walks the entire issues connection from the beginning. Because
//! that can take many pages on a large repository, progress is checkpointed
//! after every step: the continuation record holds the GraphQL cursor, the
//! page count, and the wall-clock time the backfill started. On completion
//! the *start* time becomes the sync watermark, so issues updated while the
//! backfill was running are picked up again by the next incremental pass.

use crate::db::{issue_store, pool::DbPool};
use crate::error::AppError;
use crate::models::repository::{DownloadState, Repository};
use crate::services::github_client::GitHubClient;
use crate::services::issue_syncer::{self, IssueSyncConfig};
use crate::services::status_tracker::StatusTracker;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Backfill tuning knobs.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Issue pages fetched per checkpointed step.
    pub pages_per_step: u32,
    pub issue_sync: IssueSyncConfig,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            pages_per_step: 5,
            issue_sync: IssueSyncConfig::default(),
        }
    }
}

/// Persisted continuation record for an in-flight backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillCursor {
    pub cursor: Option<String>,
    pub pages_processed: i64,
    /// Unix time the backfill began; becomes the watermark on completion.
    pub started_at: i64,
}

/// Progress after one backfill step.
#[derive(Debug, Clone)]
pub struct BackfillProgress {
    pub complete: bool,
    pub pages_processed: i64,
    pub issues_synced: usize,
}

/// Load the continuation record, if a backfill is in flight.
pub async fn get_cursor(pool: &DbPool, repo_id: i64) -> Result<Option<BackfillCursor>, AppError> {
    let row: Option<(Option<String>, i64, i64)> = sqlx::query_as(
        "SELECT cursor, pages_processed, started_at FROM backfill_cursors WHERE repo_id = ?",
    )
    .bind(repo_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(cursor, pages_processed, started_at)| BackfillCursor {
        cursor,
        pages_processed,
        started_at,
    }))
}

/// Checkpoint the continuation record.
pub async fn save_cursor(
    pool: &DbPool,
    repo_id: i64,
    cursor: &BackfillCursor,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO backfill_cursors (repo_id, cursor, pages_processed, started_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(repo_id) DO UPDATE SET
           cursor = excluded.cursor,
           pages_processed = excluded.pages_processed,
           started_at = excluded.started_at",
    )
    .bind(repo_id)
    .bind(&cursor.cursor)
    .bind(cursor.pages_processed)
    .bind(cursor.started_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Drop the continuation record after a finished or abandoned backfill.
pub async fn delete_cursor(pool: &DbPool, repo_id: i64) -> Result<(), AppError> {
    sqlx::query("DELETE FROM backfill_cursors WHERE repo_id = ?")
        .bind(repo_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run one checkpointed backfill step.
///
/// Creates the continuation record on the first step, fetches up to
/// `pages_per_step` issue pages from the saved cursor, and re-checkpoints.
/// When the connection is exhausted the issue counters are recounted, the
/// record is dropped, and the run succeeds with the backfill start time as
/// the watermark.
pub async fn run_backfill_step(
    pool: &DbPool,
    client: &GitHubClient,
    repo: &Repository,
    tracker: &StatusTracker,
    config: &BackfillConfig,
) -> Result<BackfillProgress, AppError> {
    let mut cursor = match get_cursor(pool, repo.id).await? {
        Some(cursor) => cursor,
        None => {
            let fresh = BackfillCursor {
                cursor: None,
                pages_processed: 0,
                started_at: now(),
            };
            save_cursor(pool, repo.id, &fresh).await?;
            fresh
        }
    };

    tracker
        .set_status(
            DownloadState::Backfilling,
            Some(&format!("page {}", cursor.pages_processed + 1)),
        )
        .await?;

    let mut step_config = config.issue_sync.clone();
    step_config.max_pages = Some(config.pages_per_step);

    let outcome = issue_syncer::sync_issue_pages(
        pool,
        client,
        repo,
        tracker,
        &step_config,
        None,
        cursor.cursor.clone(),
    )
    .await?;

    cursor.cursor = outcome.end_cursor.clone();
    cursor.pages_processed += outcome.pages_fetched as i64;
    save_cursor(pool, repo.id, &cursor).await?;

    if outcome.has_more {
        return Ok(BackfillProgress {
            complete: false,
            pages_processed: cursor.pages_processed,
            issues_synced: outcome.issues_synced,
        });
    }

    // Upsert-maintained counters can drift if earlier runs were interrupted;
    // a completed backfill has seen every issue, so recount from truth.
    issue_store::recount_issue_counters(pool, repo.id).await?;
    delete_cursor(pool, repo.id).await?;
    tracker.mark_success(cursor.started_at).await?;

    Ok(BackfillProgress {
        complete: true,
        pages_processed: cursor.pages_processed,
        issues_synced: outcome.issues_synced,
    })
}

/// Drive backfill steps to completion.
pub async fn run_backfill(
    pool: &DbPool,
    client: &GitHubClient,
    repo: &Repository,
    tracker: &StatusTracker,
    config: &BackfillConfig,
) -> Result<BackfillProgress, AppError> {
    loop {
        let progress = run_backfill_step(pool, client, repo, tracker, config).await?;
        if progress.complete {
            return Ok(progress);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, object_store};
    use tempfile::tempdir;

    async fn setup() -> (tempfile::TempDir, DbPool, i64) {
        let dir = tempdir().unwrap();
        let pool = db::initialize(&dir.path().join("test.db")).await.unwrap();
        let repo = object_store::ensure_repository(&pool, "acme", "widgets", false)
            .await
            .unwrap();
        (dir, pool, repo.id)
    }

    #[tokio::test]
    async fn test_cursor_round_trip() {
        let (_dir, pool, repo_id) = setup().await;

        assert!(get_cursor(&pool, repo_id).await.unwrap().is_none());

        let cursor = BackfillCursor {
            cursor: Some("Y3Vyc29yOjUw".to_string()),
            pages_processed: 3,
            started_at: 1_700_000_000,
        };
        save_cursor(&pool, repo_id, &cursor).await.unwrap();
        assert_eq!(get_cursor(&pool, repo_id).await.unwrap(), Some(cursor.clone()));

        // Checkpoint advances in place
        let advanced = BackfillCursor {
            cursor: Some("Y3Vyc29yOjEwMA==".to_string()),
            pages_processed: 5,
            started_at: cursor.started_at,
        };
        save_cursor(&pool, repo_id, &advanced).await.unwrap();
        assert_eq!(get_cursor(&pool, repo_id).await.unwrap(), Some(advanced));

        delete_cursor(&pool, repo_id).await.unwrap();
        assert!(get_cursor(&pool, repo_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fresh_cursor_has_no_position() {
        let (_dir, pool, repo_id) = setup().await;

        let cursor = BackfillCursor {
            cursor: None,
            pages_processed: 0,
            started_at: 1_700_000_000,
        };
        save_cursor(&pool, repo_id, &cursor).await.unwrap();

        let loaded = get_cursor(&pool, repo_id).await.unwrap().unwrap();
        assert!(loaded.cursor.is_none());
        assert_eq!(loaded.pages_processed, 0);
    }
}
