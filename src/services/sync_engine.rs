//! Background sync engine.
//!
//! One task owns the sync loop; callers talk to it through a command channel.
//! Each repository run picks backfill or incremental mode on its own: a
//! repository with an in-flight continuation record or no success watermark
//! backfills, everything else syncs incrementally from its watermark.
//! Outcomes land in the status row and the pruned sync log.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::FromRow;
use tokio::sync::mpsc;

use crate::db::{object_store, pool::DbPool};
use crate::error::AppError;
use crate::models::repository::DownloadState;
use crate::services::backfill::{self, BackfillConfig};
use crate::services::github_client::GitHubClient;
use crate::services::issue_syncer::{self, IssueSyncConfig};
use crate::services::object_ingester::{self, IngestConfig};
use crate::services::ref_syncer;
use crate::services::status_tracker::StatusTracker;

/// Sync log rows kept per repository.
const MAX_SYNC_LOG_ENTRIES: i64 = 500;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Seconds between automatic sync passes.
    pub interval_secs: u64,
    pub ingest: IngestConfig,
    pub issue_sync: IssueSyncConfig,
    pub backfill: BackfillConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            ingest: IngestConfig::default(),
            issue_sync: IssueSyncConfig::default(),
            backfill: BackfillConfig::default(),
        }
    }
}

/// Commands accepted by the background engine.
#[derive(Debug)]
pub enum SyncCommand {
    /// Sync one repository now, or all when `repo_id` is `None`.
    TriggerSync { repo_id: Option<i64> },
    UpdateConfig(SyncConfig),
    Stop,
}

/// Handle for sending commands to a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    pub async fn trigger_sync(&self, repo_id: Option<i64>) -> Result<(), AppError> {
        self.send(SyncCommand::TriggerSync { repo_id }).await
    }

    pub async fn update_config(&self, config: SyncConfig) -> Result<(), AppError> {
        self.send(SyncCommand::UpdateConfig(config)).await
    }

    pub async fn stop(&self) -> Result<(), AppError> {
        self.send(SyncCommand::Stop).await
    }

    async fn send(&self, command: SyncCommand) -> Result<(), AppError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| AppError::internal("Sync engine is not running"))
    }
}

/// The sync engine. Construct, then hand off to a background task with
/// [`SyncEngine::start_background`].
pub struct SyncEngine {
    pool: DbPool,
    client: Arc<GitHubClient>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(pool: DbPool, client: Arc<GitHubClient>, config: SyncConfig) -> Self {
        Self {
            pool,
            client,
            config,
        }
    }

    /// Spawn the engine loop and return a command handle.
    pub fn start_background(self) -> SyncHandle {
        let (tx, mut rx) = mpsc::channel::<SyncCommand>(16);

        tokio::spawn(async move {
            let mut engine = self;
            let mut interval =
                tokio::time::interval(Duration::from_secs(engine.config.interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        engine.sync_all().await;
                    }
                    command = rx.recv() => match command {
                        Some(SyncCommand::TriggerSync { repo_id: Some(id) }) => {
                            engine.sync_one(id).await;
                        }
                        Some(SyncCommand::TriggerSync { repo_id: None }) => {
                            engine.sync_all().await;
                        }
                        Some(SyncCommand::UpdateConfig(config)) => {
                            if config.interval_secs != engine.config.interval_secs {
                                interval = tokio::time::interval(
                                    Duration::from_secs(config.interval_secs),
                                );
                                interval.set_missed_tick_behavior(
                                    tokio::time::MissedTickBehavior::Delay,
                                );
                            }
                            engine.config = config;
                        }
                        Some(SyncCommand::Stop) | None => {
                            eprintln!("[sync] engine stopping");
                            break;
                        }
                    }
                }
            }
        });

        SyncHandle { tx }
    }

    async fn sync_all(&self) {
        let repo_ids: Vec<(i64,)> = match sqlx::query_as("SELECT id FROM repositories ORDER BY id")
            .fetch_all(&self.pool)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                log::warn!("Failed to list repositories for sync: {}", err);
                return;
            }
        };

        for (repo_id,) in repo_ids {
            self.sync_one(repo_id).await;
        }
    }

    async fn sync_one(&self, repo_id: i64) {
        // Failures are recorded in the status row and log; the loop goes on
        if let Err(err) = run_sync(&self.pool, &self.client, &self.config, repo_id).await {
            log::warn!("Sync failed for repo {}: {}", repo_id, err);
        }
    }
}

/// Run one sync pass for a repository.
///
/// Skips when a run is already in progress. Picks backfill mode when an
/// in-flight continuation record exists or the repository has never synced
/// successfully; otherwise runs refs, objects and issues incrementally from
/// the watermark. The outcome (including cancellation) is written to the
/// status row and appended to the sync log.
pub async fn run_sync(
    pool: &DbPool,
    client: &GitHubClient,
    config: &SyncConfig,
    repo_id: i64,
) -> Result<DownloadState, AppError> {
    let repo = object_store::get_repository_by_id(pool, repo_id)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("Repository", repo_id.to_string()))?;
    let tracker = StatusTracker::new(pool.clone(), repo_id);

    let status = tracker.get_status().await?;
    if let Some(state) = status.as_ref().and_then(|s| s.state()) {
        if state.is_in_progress() {
            eprintln!("[sync] repo {}: already in progress, skipping", repo_id);
            return Ok(state);
        }
    }
    let watermark = status.as_ref().and_then(|s| s.last_synced_at);

    tracker.set_status(DownloadState::Pending, None).await?;

    let backfilling =
        watermark.is_none() || backfill::get_cursor(pool, repo_id).await?.is_some();
    let operation = if backfilling { "backfill" } else { "incremental" };
    let started = Instant::now();

    let result = if backfilling {
        run_backfill_pass(pool, client, config, &repo, &tracker).await
    } else {
        run_incremental_pass(pool, client, config, &repo, &tracker, watermark).await
    };

    let duration_ms = started.elapsed().as_millis() as i64;

    let final_state = match result {
        Ok(()) => {
            // mark_success already ran inside the pass; re-read what landed,
            // since the cancellation guard may have coerced it
            let state = tracker
                .get_status()
                .await?
                .and_then(|s| s.state())
                .unwrap_or(DownloadState::Success);
            log_sync_operation(pool, repo_id, operation, state.as_str(), None, duration_ms)
                .await?;
            state
        }
        Err(err) if err.is_cancelled() => {
            tracker
                .set_status(DownloadState::Cancelled, Some("cancelled"))
                .await?;
            log_sync_operation(pool, repo_id, operation, "cancelled", None, duration_ms).await?;
            DownloadState::Cancelled
        }
        Err(err) => {
            let message = err.to_string();
            tracker
                .set_status(DownloadState::Error, Some(&message))
                .await?;
            log_sync_operation(
                pool,
                repo_id,
                operation,
                "error",
                Some(&message),
                duration_ms,
            )
            .await?;
            return Err(err);
        }
    };

    Ok(final_state)
}

async fn run_backfill_pass(
    pool: &DbPool,
    client: &GitHubClient,
    config: &SyncConfig,
    repo: &crate::models::repository::Repository,
    tracker: &StatusTracker,
) -> Result<(), AppError> {
    // Git objects first so the backfilled issues land on a mirrored tree
    tracker
        .set_status(DownloadState::Syncing, Some("syncing refs"))
        .await?;
    let refs = ref_syncer::sync_refs(pool, client, repo).await?;

    let repo = object_store::get_repository_by_id(pool, repo.id)
        .await?
        .ok_or_else(|| AppError::not_found("Repository"))?;

    tracker
        .set_status(DownloadState::Syncing, Some("ingesting objects"))
        .await?;
    object_ingester::ingest_commits(pool, client, &repo, tracker, &config.ingest, None).await?;

    eprintln!(
        "[sync] {}: refs synced ({} branches, {} tags), starting backfill",
        repo.full_name(),
        refs.branches,
        refs.tags
    );

    backfill::run_backfill(pool, client, &repo, tracker, &config.backfill).await?;
    Ok(())
}

async fn run_incremental_pass(
    pool: &DbPool,
    client: &GitHubClient,
    config: &SyncConfig,
    repo: &crate::models::repository::Repository,
    tracker: &StatusTracker,
    watermark: Option<i64>,
) -> Result<(), AppError> {
    tracker
        .set_status(DownloadState::Syncing, Some("syncing refs"))
        .await?;
    ref_syncer::sync_refs(pool, client, repo).await?;

    // Re-read: ref sync may have moved the head
    let repo = object_store::get_repository_by_id(pool, repo.id)
        .await?
        .ok_or_else(|| AppError::not_found("Repository"))?;

    tracker
        .set_status(DownloadState::Syncing, Some("ingesting objects"))
        .await?;
    object_ingester::ingest_commits(pool, client, &repo, tracker, &config.ingest, watermark)
        .await?;

    tracker
        .set_status(DownloadState::Syncing, Some("syncing issues"))
        .await?;
    let issues = issue_syncer::sync_issue_pages(
        pool,
        client,
        &repo,
        tracker,
        &config.issue_sync,
        watermark,
        None,
    )
    .await?;

    // The max updatedAt seen is the next incremental floor; with nothing
    // new the previous watermark stands
    let next_watermark = issues
        .max_updated_at
        .or(watermark)
        .unwrap_or_else(now);
    tracker.mark_success(next_watermark).await?;

    Ok(())
}

/// One row of the sync audit log.
#[derive(Debug, Clone, FromRow)]
pub struct SyncLogEntry {
    pub id: i64,
    pub repo_id: i64,
    pub operation: String,
    pub status: String,
    pub message: Option<String>,
    pub duration_ms: i64,
    pub timestamp: i64,
}

/// Append a sync log entry and prune old rows for the repository.
pub async fn log_sync_operation(
    pool: &DbPool,
    repo_id: i64,
    operation: &str,
    status: &str,
    message: Option<&str>,
    duration_ms: i64,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO sync_log (repo_id, operation, status, message, duration_ms, timestamp)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(repo_id)
    .bind(operation)
    .bind(status)
    .bind(message)
    .bind(duration_ms)
    .bind(now())
    .execute(pool)
    .await?;

    sqlx::query(
        "DELETE FROM sync_log WHERE repo_id = ? AND id NOT IN (
            SELECT id FROM sync_log WHERE repo_id = ? ORDER BY id DESC LIMIT ?
         )",
    )
    .bind(repo_id)
    .bind(repo_id)
    .bind(MAX_SYNC_LOG_ENTRIES)
    .execute(pool)
    .await?;

    Ok(())
}

/// Read the most recent sync log entries for a repository.
pub async fn list_sync_log(
    pool: &DbPool,
    repo_id: i64,
    limit: i64,
) -> Result<Vec<SyncLogEntry>, AppError> {
    let entries = sqlx::query_as::<_, SyncLogEntry>(
        "SELECT id, repo_id, operation, status, message, duration_ms, timestamp
         FROM sync_log WHERE repo_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(repo_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(entries)
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
    async fn test_sync_log_appends_and_lists_newest_first() {
        let (_dir, pool, repo_id) = setup().await;

        log_sync_operation(&pool, repo_id, "incremental", "success", None, 1200)
            .await
            .unwrap();
        log_sync_operation(&pool, repo_id, "incremental", "error", Some("boom"), 40)
            .await
            .unwrap();

        let entries = list_sync_log(&pool, repo_id, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, "error");
        assert_eq!(entries[0].message.as_deref(), Some("boom"));
        assert_eq!(entries[1].status, "success");
        assert_eq!(entries[1].duration_ms, 1200);
    }

    #[tokio::test]
    async fn test_sync_log_prunes_old_entries() {
        let (_dir, pool, repo_id) = setup().await;

        for i in 0..(MAX_SYNC_LOG_ENTRIES + 20) {
            log_sync_operation(&pool, repo_id, "incremental", "success", None, i)
                .await
                .unwrap();
        }

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_log WHERE repo_id = ?")
            .bind(repo_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, MAX_SYNC_LOG_ENTRIES);

        // Newest entries survived
        let entries = list_sync_log(&pool, repo_id, 1).await.unwrap();
        assert_eq!(entries[0].duration_ms, MAX_SYNC_LOG_ENTRIES + 19);
    }

    #[tokio::test]
    async fn test_run_sync_skips_repo_in_progress() {
        let (_dir, pool, repo_id) = setup().await;

        let tracker = StatusTracker::new(pool.clone(), repo_id);
        tracker
            .set_status(DownloadState::Syncing, None)
            .await
            .unwrap();

        let client = GitHubClient::new(&crate::services::github_client::GitHubClientConfig::new(
            "test-token",
        ))
        .unwrap();
        let state = run_sync(&pool, &client, &SyncConfig::default(), repo_id)
            .await
            .unwrap();

        // No network call was made; the in-progress state is returned as is
        assert_eq!(state, DownloadState::Syncing);
    }
}
