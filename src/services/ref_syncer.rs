//! Ref synchronization: mirror the remote's branches and tags.
//!
//! Refs are replaced wholesale in one transaction, so a failed fetch leaves
//! the previous ref set intact and a successful one never exposes a partial
//! mix of old and new pointers.

use crate::db::{object_store, pool::DbPool};
use crate::error::AppError;
use crate::models::git_object::GitRef;
use crate::models::repository::Repository;
use crate::services::github_client::GitHubClient;

/// Result of one ref sync pass.
#[derive(Debug, Clone)]
pub struct RefSyncOutcome {
    pub branches: usize,
    pub tags: usize,
    pub head_ref: String,
}

/// Fetch the remote's branches and tags and replace the local ref set.
///
/// Also refreshes the repository's head (default branch) and private flag
/// from the remote metadata.
pub async fn sync_refs(
    pool: &DbPool,
    client: &GitHubClient,
    repo: &Repository,
) -> Result<RefSyncOutcome, AppError> {
    let metadata = client
        .get_repository(&repo.owner, &repo.name)
        .await
        .map_err(|e| wrap(e, repo))?;

    let heads = client
        .list_refs(&repo.owner, &repo.name, false)
        .await
        .map_err(|e| wrap(e, repo))?;
    let tags = client
        .list_refs(&repo.owner, &repo.name, true)
        .await
        .map_err(|e| wrap(e, repo))?;

    let mut refs = Vec::with_capacity(heads.len() + tags.len());
    let mut branch_count = 0;
    let mut tag_count = 0;

    for info in &heads {
        match strip_ref_prefix(&info.ref_name, "refs/heads/") {
            Some(name) => {
                branch_count += 1;
                refs.push(GitRef {
                    repo_id: repo.id,
                    name: name.to_string(),
                    commit_sha: info.object.sha.clone(),
                    is_tag: false,
                });
            }
            None => {
                log::warn!(
                    "Skipping unexpected ref {} for {}",
                    info.ref_name,
                    repo.full_name()
                );
            }
        }
    }

    for info in &tags {
        match strip_ref_prefix(&info.ref_name, "refs/tags/") {
            Some(name) => {
                tag_count += 1;
                refs.push(GitRef {
                    repo_id: repo.id,
                    name: name.to_string(),
                    commit_sha: info.object.sha.clone(),
                    is_tag: true,
                });
            }
            None => {
                log::warn!(
                    "Skipping unexpected ref {} for {}",
                    info.ref_name,
                    repo.full_name()
                );
            }
        }
    }

    object_store::replace_refs(pool, repo.id, &refs).await?;
    object_store::set_head_ref(pool, repo.id, &metadata.default_branch).await?;
    object_store::ensure_repository(pool, &repo.owner, &repo.name, metadata.private).await?;

    Ok(RefSyncOutcome {
        branches: branch_count,
        tags: tag_count,
        head_ref: metadata.default_branch,
    })
}

fn strip_ref_prefix<'a>(full: &'a str, prefix: &str) -> Option<&'a str> {
    full.strip_prefix(prefix).filter(|rest| !rest.is_empty())
}

fn wrap(err: AppError, repo: &Repository) -> AppError {
    if err.is_cancelled() || err.is_rate_limited() {
        return err;
    }
    AppError::sync_in_phase(
        format!("Ref sync failed for {}: {}", repo.full_name(), err),
        "refs",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ref_prefix() {
        assert_eq!(
            strip_ref_prefix("refs/heads/main", "refs/heads/"),
            Some("main")
        );
        assert_eq!(
            strip_ref_prefix("refs/heads/feature/auth", "refs/heads/"),
            Some("feature/auth")
        );
        assert_eq!(
            strip_ref_prefix("refs/tags/v1.0.0", "refs/tags/"),
            Some("v1.0.0")
        );
        assert_eq!(strip_ref_prefix("refs/tags/v1.0.0", "refs/heads/"), None);
        assert_eq!(strip_ref_prefix("refs/heads/", "refs/heads/"), None);
    }

    #[test]
    fn test_wrap_preserves_control_flow_errors() {
        let repo = Repository {
            id: 1,
            owner: "acme".to_string(),
            name: "widgets".to_string(),
            private: false,
            head_ref: None,
            open_issues: 0,
            closed_issues: 0,
            created_at: 0,
        };

        assert!(wrap(AppError::Cancelled, &repo).is_cancelled());
        assert!(wrap(AppError::rate_limited("limit", None), &repo).is_rate_limited());
        assert!(matches!(
            wrap(AppError::network("down"), &repo),
            AppError::Sync { .. }
        ));
    }
}
