//! Idempotent store operations over the mirrored Git object model.
//!
//! All object rows are keyed by natural content keys (repo + sha, or repo +
//! root tree sha + path), so writes use `INSERT OR IGNORE` and retries or
//! concurrent writes of the same object are safe without locking.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::git_object::{Blob, Commit, GitRef, TreeEntry};
use crate::models::repository::Repository;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp.
pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Look up a repository by (owner, name).
pub async fn get_repository(
    pool: &DbPool,
    owner: &str,
    name: &str,
) -> Result<Option<Repository>, AppError> {
    let repo = sqlx::query_as::<_, Repository>(
        "SELECT id, owner, name, private, head_ref, open_issues, closed_issues, created_at
         FROM repositories WHERE owner = ? AND name = ?",
    )
    .bind(owner)
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(repo)
}

/// Look up a repository by local id.
pub async fn get_repository_by_id(
    pool: &DbPool,
    repo_id: i64,
) -> Result<Option<Repository>, AppError> {
    let repo = sqlx::query_as::<_, Repository>(
        "SELECT id, owner, name, private, head_ref, open_issues, closed_issues, created_at
         FROM repositories WHERE id = ?",
    )
    .bind(repo_id)
    .fetch_optional(pool)
    .await?;

    Ok(repo)
}

/// Create a repository row if it doesn't exist and return it.
pub async fn ensure_repository(
    pool: &DbPool,
    owner: &str,
    name: &str,
    private: bool,
) -> Result<Repository, AppError> {
    sqlx::query(
        "INSERT INTO repositories (owner, name, private, created_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(owner, name) DO UPDATE SET private = excluded.private",
    )
    .bind(owner)
    .bind(name)
    .bind(private)
    .bind(now())
    .execute(pool)
    .await?;

    get_repository(pool, owner, name)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("Repository", format!("{}/{}", owner, name)))
}

/// Set the repository's head to the default branch name.
pub async fn set_head_ref(pool: &DbPool, repo_id: i64, head_ref: &str) -> Result<(), AppError> {
    sqlx::query("UPDATE repositories SET head_ref = ? WHERE id = ?")
        .bind(head_ref)
        .bind(repo_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Replace the repository's ref set with the given refs.
///
/// Runs in a single transaction: refs missing from the new set are deleted,
/// the rest upserted. Nothing is committed if any statement fails.
pub async fn replace_refs(pool: &DbPool, repo_id: i64, refs: &[GitRef]) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    if refs.is_empty() {
        sqlx::query("DELETE FROM refs WHERE repo_id = ?")
            .bind(repo_id)
            .execute(&mut *tx)
            .await?;
    } else {
        let placeholders: Vec<&str> = refs.iter().map(|_| "?").collect();
        let query = format!(
            "DELETE FROM refs WHERE repo_id = ? AND name NOT IN ({})",
            placeholders.join(", ")
        );

        let mut q = sqlx::query(&query).bind(repo_id);
        for r in refs {
            q = q.bind(&r.name);
        }
        q.execute(&mut *tx).await?;
    }

    for r in refs {
        sqlx::query(
            "INSERT INTO refs (repo_id, name, commit_sha, is_tag)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(repo_id, name) DO UPDATE SET
               commit_sha = excluded.commit_sha,
               is_tag = excluded.is_tag",
        )
        .bind(repo_id)
        .bind(&r.name)
        .bind(&r.commit_sha)
        .bind(r.is_tag)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(())
}

/// List all refs for a repository.
pub async fn list_refs(pool: &DbPool, repo_id: i64) -> Result<Vec<GitRef>, AppError> {
    let refs = sqlx::query_as::<_, GitRef>(
        "SELECT repo_id, name, commit_sha, is_tag FROM refs WHERE repo_id = ? ORDER BY name",
    )
    .bind(repo_id)
    .fetch_all(pool)
    .await?;

    Ok(refs)
}

/// Point lookup: has this commit already been ingested?
pub async fn commit_exists(pool: &DbPool, repo_id: i64, sha: &str) -> Result<bool, AppError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM commits WHERE repo_id = ? AND sha = ?")
            .bind(repo_id)
            .bind(sha)
            .fetch_optional(pool)
            .await?;

    Ok(row.is_some())
}

/// Insert a commit row. Commits are immutable, so a duplicate sha is a no-op.
pub async fn insert_commit(pool: &DbPool, commit: &Commit) -> Result<(), AppError> {
    sqlx::query(
        "INSERT OR IGNORE INTO commits (
            repo_id, sha, tree_sha, message, parent_shas,
            author_name, author_email, authored_at,
            committer_name, committer_email, committed_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(commit.repo_id)
    .bind(&commit.sha)
    .bind(&commit.tree_sha)
    .bind(&commit.message)
    .bind(&commit.parent_shas)
    .bind(&commit.author_name)
    .bind(&commit.author_email)
    .bind(commit.authored_at)
    .bind(&commit.committer_name)
    .bind(&commit.committer_email)
    .bind(commit.committed_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a commit by sha.
pub async fn get_commit(
    pool: &DbPool,
    repo_id: i64,
    sha: &str,
) -> Result<Option<Commit>, AppError> {
    let commit = sqlx::query_as::<_, Commit>(
        "SELECT repo_id, sha, tree_sha, message, parent_shas,
                author_name, author_email, authored_at,
                committer_name, committer_email, committed_at
         FROM commits WHERE repo_id = ? AND sha = ?",
    )
    .bind(repo_id)
    .bind(sha)
    .fetch_optional(pool)
    .await?;

    Ok(commit)
}

/// Insert a tree object if it doesn't already exist (dedup by sha).
pub async fn upsert_tree(pool: &DbPool, repo_id: i64, sha: &str) -> Result<(), AppError> {
    sqlx::query("INSERT OR IGNORE INTO trees (repo_id, sha) VALUES (?, ?)")
        .bind(repo_id)
        .bind(sha)
        .execute(pool)
        .await?;

    Ok(())
}

/// Insert a tree entry row linking (root tree sha, path) to (entry sha, type).
pub async fn insert_tree_entry(pool: &DbPool, entry: &TreeEntry) -> Result<(), AppError> {
    sqlx::query(
        "INSERT OR IGNORE INTO tree_entries (repo_id, root_tree_sha, path, entry_sha, entry_type, mode)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.repo_id)
    .bind(&entry.root_tree_sha)
    .bind(&entry.path)
    .bind(&entry.entry_sha)
    .bind(&entry.entry_type)
    .bind(&entry.mode)
    .execute(pool)
    .await?;

    Ok(())
}

/// List the flattened entries of a root tree.
pub async fn list_tree_entries(
    pool: &DbPool,
    repo_id: i64,
    root_tree_sha: &str,
) -> Result<Vec<TreeEntry>, AppError> {
    let entries = sqlx::query_as::<_, TreeEntry>(
        "SELECT repo_id, root_tree_sha, path, entry_sha, entry_type, mode
         FROM tree_entries WHERE repo_id = ? AND root_tree_sha = ? ORDER BY path",
    )
    .bind(repo_id)
    .bind(root_tree_sha)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}

/// Insert a blob if it doesn't already exist (content-addressed dedup).
pub async fn upsert_blob(pool: &DbPool, blob: &Blob) -> Result<(), AppError> {
    sqlx::query(
        "INSERT OR IGNORE INTO blobs (repo_id, sha, content, encoding, size)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(blob.repo_id)
    .bind(&blob.sha)
    .bind(&blob.content)
    .bind(&blob.encoding)
    .bind(blob.size)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a blob by sha.
pub async fn get_blob(pool: &DbPool, repo_id: i64, sha: &str) -> Result<Option<Blob>, AppError> {
    let blob = sqlx::query_as::<_, Blob>(
        "SELECT repo_id, sha, content, encoding, size FROM blobs WHERE repo_id = ? AND sha = ?",
    )
    .bind(repo_id)
    .bind(sha)
    .fetch_optional(pool)
    .await?;

    Ok(blob)
}

/// Delete a repository and everything it owns.
///
/// Explicit per-table deletes rather than SQL cascade, so the operation is
/// visible and auditable in one place.
pub async fn delete_repository(pool: &DbPool, repo_id: i64) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM issue_comments WHERE issue_id IN (SELECT id FROM issues WHERE repo_id = ?)",
    )
    .bind(repo_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "DELETE FROM issue_timeline_items WHERE issue_id IN (SELECT id FROM issues WHERE repo_id = ?)",
    )
    .bind(repo_id)
    .execute(&mut *tx)
    .await?;

    for table in [
        "issues",
        "blobs",
        "tree_entries",
        "trees",
        "commits",
        "refs",
        "download_status",
        "backfill_cursors",
    ] {
        let query = format!("DELETE FROM {} WHERE repo_id = ?", table);
        sqlx::query(&query).bind(repo_id).execute(&mut *tx).await?;
    }

    sqlx::query("DELETE FROM repositories WHERE id = ?")
        .bind(repo_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::tempdir;

    async fn setup() -> (tempfile::TempDir, DbPool, Repository) {
        let dir = tempdir().unwrap();
        let pool = db::initialize(&dir.path().join("test.db")).await.unwrap();
        let repo = ensure_repository(&pool, "acme", "widgets", false)
            .await
            .unwrap();
        (dir, pool, repo)
    }

    #[tokio::test]
    async fn test_ensure_repository_is_idempotent() {
        let (_dir, pool, repo) = setup().await;

        let again = ensure_repository(&pool, "acme", "widgets", true)
            .await
            .unwrap();
        assert_eq!(again.id, repo.id);
        assert!(again.private, "private flag should be refreshed");

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM repositories")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_replace_refs_removes_stale() {
        let (_dir, pool, repo) = setup().await;

        let mk = |name: &str, sha: &str, is_tag: bool| GitRef {
            repo_id: repo.id,
            name: name.to_string(),
            commit_sha: sha.to_string(),
            is_tag,
        };

        replace_refs(
            &pool,
            repo.id,
            &[mk("main", "aaa", false), mk("develop", "bbb", false)],
        )
        .await
        .unwrap();

        // develop disappears, v1.0.0 appears, main moves
        replace_refs(
            &pool,
            repo.id,
            &[mk("main", "ccc", false), mk("v1.0.0", "ddd", true)],
        )
        .await
        .unwrap();

        let refs = list_refs(&pool, repo.id).await.unwrap();
        let names: Vec<&str> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["main", "v1.0.0"]);
        assert_eq!(refs[0].commit_sha, "ccc");
        assert!(refs[1].is_tag);
    }

    #[tokio::test]
    async fn test_commit_insert_is_idempotent() {
        let (_dir, pool, repo) = setup().await;

        let commit = Commit {
            repo_id: repo.id,
            sha: "a".repeat(40),
            tree_sha: "t".repeat(40),
            message: "initial".to_string(),
            parent_shas: "[]".to_string(),
            author_name: Some("Octo Cat".to_string()),
            author_email: None,
            authored_at: Some(1_700_000_000),
            committer_name: None,
            committer_email: None,
            committed_at: Some(1_700_000_000),
        };

        insert_commit(&pool, &commit).await.unwrap();
        insert_commit(&pool, &commit).await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM commits WHERE repo_id = ?")
            .bind(repo.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);

        assert!(commit_exists(&pool, repo.id, &commit.sha).await.unwrap());
        assert!(!commit_exists(&pool, repo.id, "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_blob_dedup_preserves_first_write() {
        let (_dir, pool, repo) = setup().await;

        let blob = Blob {
            repo_id: repo.id,
            sha: "b".repeat(40),
            content: "fn main() {}\n".to_string(),
            encoding: "utf-8".to_string(),
            size: 13,
        };
        upsert_blob(&pool, &blob).await.unwrap();

        let mut altered = blob.clone();
        altered.content = "tampered".to_string();
        upsert_blob(&pool, &altered).await.unwrap();

        let stored = get_blob(&pool, repo.id, &blob.sha).await.unwrap().unwrap();
        assert_eq!(stored.content, "fn main() {}\n");
    }

    #[tokio::test]
    async fn test_delete_repository_cascades() {
        let (_dir, pool, repo) = setup().await;

        upsert_tree(&pool, repo.id, "tree1").await.unwrap();
        upsert_blob(
            &pool,
            &Blob {
                repo_id: repo.id,
                sha: "blob1".to_string(),
                content: "x".to_string(),
                encoding: "utf-8".to_string(),
                size: 1,
            },
        )
        .await
        .unwrap();
        replace_refs(
            &pool,
            repo.id,
            &[GitRef {
                repo_id: repo.id,
                name: "main".to_string(),
                commit_sha: "c".to_string(),
                is_tag: false,
            }],
        )
        .await
        .unwrap();

        delete_repository(&pool, repo.id).await.unwrap();

        for table in ["repositories", "refs", "trees", "blobs"] {
            let query = format!("SELECT COUNT(*) FROM {}", table);
            let count: (i64,) = sqlx::query_as(&query).fetch_one(&pool).await.unwrap();
            assert_eq!(count.0, 0, "{} should be empty", table);
        }
    }
}
