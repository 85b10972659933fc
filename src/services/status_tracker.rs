//! Per-repository download status tracking and cooperative cancellation.
//!
//! The status row is the single externally visible record of a sync run.
//! Cancellation is a flag on that row: callers set it, sync phases poll it
//! via [`StatusTracker::check_cancelled`], and every status write re-reads it
//! inside the same transaction so a cancelled run can never be overwritten
//! with `success` or any other state by a racing writer. Only the start of a
//! new run (`pending`) clears the flag.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::repository::{DownloadState, DownloadStatus};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Tracks the download status of one repository.
#[derive(Clone)]
pub struct StatusTracker {
    pool: DbPool,
    repo_id: i64,
}

impl StatusTracker {
    pub fn new(pool: DbPool, repo_id: i64) -> Self {
        Self { pool, repo_id }
    }

    pub fn repo_id(&self) -> i64 {
        self.repo_id
    }

    /// Read the current status row.
    pub async fn get_status(&self) -> Result<Option<DownloadStatus>, AppError> {
        let status = sqlx::query_as::<_, DownloadStatus>(
            "SELECT repo_id, status, message, last_synced_at, cancelled, updated_at
             FROM download_status WHERE repo_id = ?",
        )
        .bind(self.repo_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    /// Write a status, honoring the cancellation guard.
    ///
    /// If the cancellation flag is set, any state other than `pending` is
    /// coerced to `cancelled`. Writing `pending` starts a new run and clears
    /// the flag.
    pub async fn set_status(
        &self,
        state: DownloadState,
        message: Option<&str>,
    ) -> Result<DownloadState, AppError> {
        self.write_status(state, message, None).await
    }

    /// Record a successful run, stamping the sync watermark.
    ///
    /// The watermark is the incremental floor for the next run: the max
    /// updatedAt observed, or the backfill start time when a backfill
    /// completes. Coerced to `cancelled` (without the watermark) if the
    /// cancellation flag is set.
    pub async fn mark_success(&self, watermark: i64) -> Result<DownloadState, AppError> {
        self.write_status(DownloadState::Success, None, Some(watermark))
            .await
    }

    async fn write_status(
        &self,
        state: DownloadState,
        message: Option<&str>,
        last_synced_at: Option<i64>,
    ) -> Result<DownloadState, AppError> {
        let mut tx = self.pool.begin().await?;

        let cancelled: Option<(bool,)> =
            sqlx::query_as("SELECT cancelled FROM download_status WHERE repo_id = ?")
                .bind(self.repo_id)
                .fetch_optional(&mut *tx)
                .await?;
        let flag_set = cancelled.map(|(c,)| c).unwrap_or(false);

        let (effective, clear_flag) = if state == DownloadState::Pending {
            (DownloadState::Pending, true)
        } else if flag_set && state != DownloadState::Cancelled {
            (DownloadState::Cancelled, false)
        } else {
            (state, false)
        };

        // A coerced write drops the watermark: a cancelled run has no
        // completion point to resume from.
        let watermark = if effective == state { last_synced_at } else { None };

        sqlx::query(
            r#"
            INSERT INTO download_status (repo_id, status, message, last_synced_at, cancelled, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(repo_id) DO UPDATE SET
                status = excluded.status,
                message = excluded.message,
                last_synced_at = COALESCE(excluded.last_synced_at, download_status.last_synced_at),
                cancelled = CASE WHEN ? THEN 0 ELSE download_status.cancelled END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(self.repo_id)
        .bind(effective.as_str())
        .bind(message)
        .bind(watermark)
        .bind(false)
        .bind(now())
        .bind(clear_flag)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(effective)
    }

    /// Update the progress message without changing the status.
    pub async fn progress(&self, message: &str) -> Result<(), AppError> {
        eprintln!("[sync] repo {}: {}", self.repo_id, message);

        sqlx::query("UPDATE download_status SET message = ?, updated_at = ? WHERE repo_id = ?")
            .bind(message)
            .bind(now())
            .bind(self.repo_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Request cancellation of the current run.
    pub async fn request_cancel(&self) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO download_status (repo_id, status, message, last_synced_at, cancelled, updated_at)
            VALUES (?, 'cancelled', NULL, NULL, 1, ?)
            ON CONFLICT(repo_id) DO UPDATE SET
                cancelled = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(self.repo_id)
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Whether cancellation has been requested.
    pub async fn is_cancelled(&self) -> Result<bool, AppError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT cancelled FROM download_status WHERE repo_id = ?")
                .bind(self.repo_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(c,)| c).unwrap_or(false))
    }

    /// Cancellation poll for sync phases: returns `Err(Cancelled)` when the
    /// flag is set so `?` unwinds the phase.
    pub async fn check_cancelled(&self) -> Result<(), AppError> {
        if self.is_cancelled().await? {
            return Err(AppError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, object_store};
    use tempfile::tempdir;

    async fn setup() -> (tempfile::TempDir, StatusTracker) {
        let dir = tempdir().unwrap();
        let pool = db::initialize(&dir.path().join("test.db")).await.unwrap();
        let repo = object_store::ensure_repository(&pool, "acme", "widgets", false)
            .await
            .unwrap();
        let tracker = StatusTracker::new(pool, repo.id);
        (dir, tracker)
    }

    #[tokio::test]
    async fn test_status_progression() {
        let (_dir, tracker) = setup().await;

        assert!(tracker.get_status().await.unwrap().is_none());

        tracker
            .set_status(DownloadState::Pending, None)
            .await
            .unwrap();
        tracker
            .set_status(DownloadState::Syncing, Some("syncing refs"))
            .await
            .unwrap();

        let status = tracker.get_status().await.unwrap().unwrap();
        assert_eq!(status.state(), Some(DownloadState::Syncing));
        assert_eq!(status.message.as_deref(), Some("syncing refs"));
        assert!(status.last_synced_at.is_none());
    }

    #[tokio::test]
    async fn test_mark_success_stamps_watermark() {
        let (_dir, tracker) = setup().await;

        tracker
            .set_status(DownloadState::Syncing, None)
            .await
            .unwrap();
        tracker.mark_success(1_700_000_123).await.unwrap();

        let status = tracker.get_status().await.unwrap().unwrap();
        assert_eq!(status.state(), Some(DownloadState::Success));
        assert_eq!(status.last_synced_at, Some(1_700_000_123));

        // A later non-watermark write keeps the stamp
        tracker
            .set_status(DownloadState::Syncing, None)
            .await
            .unwrap();
        let status = tracker.get_status().await.unwrap().unwrap();
        assert_eq!(status.last_synced_at, Some(1_700_000_123));
    }

    #[tokio::test]
    async fn test_cancel_flag_coerces_writes() {
        let (_dir, tracker) = setup().await;

        tracker
            .set_status(DownloadState::Syncing, None)
            .await
            .unwrap();
        tracker.request_cancel().await.unwrap();

        assert!(tracker.is_cancelled().await.unwrap());
        assert!(tracker
            .check_cancelled()
            .await
            .unwrap_err()
            .is_cancelled());

        // A racing success write must not land
        let written = tracker.mark_success(1_700_000_000).await.unwrap();
        assert_eq!(written, DownloadState::Cancelled);

        let status = tracker.get_status().await.unwrap().unwrap();
        assert_eq!(status.state(), Some(DownloadState::Cancelled));
        assert!(status.last_synced_at.is_none());
    }

    #[tokio::test]
    async fn test_pending_clears_cancel_flag() {
        let (_dir, tracker) = setup().await;

        tracker.request_cancel().await.unwrap();
        assert!(tracker.is_cancelled().await.unwrap());

        tracker
            .set_status(DownloadState::Pending, None)
            .await
            .unwrap();
        assert!(!tracker.is_cancelled().await.unwrap());

        // After the new run starts, normal writes go through
        let written = tracker
            .set_status(DownloadState::Syncing, None)
            .await
            .unwrap();
        assert_eq!(written, DownloadState::Syncing);
    }
}
