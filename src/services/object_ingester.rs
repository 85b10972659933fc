//! Commit walk and Git object ingestion.
//!
//! For each new commit on the head ref the ingester mirrors the commit row,
//! its full recursive tree listing, and every blob the tree references. All
//! object writes are content-addressed and idempotent, so an interrupted run
//! resumes by re-walking and skipping commits whose rows already exist. The
//! commit row is written last: its presence marks the commit's tree and
//! blobs as fully ingested.

use std::collections::HashSet;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::db::{object_store, pool::DbPool};
use crate::error::AppError;
use crate::models::git_object::{Blob, BlobEncoding, Commit, TreeEntry};
use crate::models::repository::Repository;
use crate::services::github_client::{GitHubClient, TreeEntryInfo};
use crate::services::status_tracker::StatusTracker;

/// Limits for grouping blob fetches into batches.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Max total declared bytes per batch.
    pub max_bytes: i64,
    /// Max files per batch.
    pub max_files: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            max_files: 50,
        }
    }
}

/// Ingestion tuning knobs.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub commits_per_page: u32,
    pub batch: BatchConfig,
    /// Pause between blob batches to stay under API abuse limits.
    pub inter_batch_delay_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            commits_per_page: 100,
            batch: BatchConfig::default(),
            inter_batch_delay_ms: 250,
        }
    }
}

/// Counters from one ingestion pass.
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    pub commits_written: usize,
    pub tree_entries_written: usize,
    pub blobs_written: usize,
    pub commits_skipped: usize,
}

/// Walk commits on the head ref newer than `since_unix` and mirror their
/// objects.
///
/// Fails with [`AppError::TruncatedTree`] when the provider reports a
/// commit's recursive listing as incomplete; a partially mirrored tree would
/// silently misrepresent the repository, so the run stops there.
pub async fn ingest_commits(
    pool: &DbPool,
    client: &GitHubClient,
    repo: &Repository,
    tracker: &StatusTracker,
    config: &IngestConfig,
    since_unix: Option<i64>,
) -> Result<IngestOutcome, AppError> {
    let head = repo
        .head_ref
        .as_deref()
        .ok_or_else(|| AppError::sync_in_phase("Head ref not set; run ref sync first", "objects"))?;

    let mut outcome = IngestOutcome::default();
    // Shas already handled in this run, across commits
    let mut seen_blobs: HashSet<String> = HashSet::new();
    let mut seen_trees: HashSet<String> = HashSet::new();
    let mut page: u32 = 1;

    loop {
        tracker.check_cancelled().await?;

        let commits = client
            .list_commits(
                &repo.owner,
                &repo.name,
                head,
                since_unix,
                page,
                config.commits_per_page,
            )
            .await?;
        let page_len = commits.len();

        for info in commits {
            tracker.check_cancelled().await?;

            if object_store::commit_exists(pool, repo.id, &info.sha).await? {
                outcome.commits_skipped += 1;
                continue;
            }

            let tree = client
                .get_tree(&repo.owner, &repo.name, &info.commit.tree.sha)
                .await?;
            if tree.truncated {
                return Err(AppError::truncated_tree(repo.full_name(), info.sha.clone()));
            }

            object_store::upsert_tree(pool, repo.id, &tree.sha).await?;

            let mut new_blobs: Vec<TreeEntryInfo> = Vec::new();
            for entry in &tree.entries {
                tracker.check_cancelled().await?;

                // Submodule (commit) entries have no mirrored object
                if entry.entry_type != "blob" && entry.entry_type != "tree" {
                    log::warn!(
                        "Skipping unsupported tree entry type {:?} at {}",
                        entry.entry_type,
                        entry.path
                    );
                    continue;
                }

                object_store::insert_tree_entry(
                    pool,
                    &TreeEntry {
                        repo_id: repo.id,
                        root_tree_sha: tree.sha.clone(),
                        path: entry.path.clone(),
                        entry_sha: entry.sha.clone(),
                        entry_type: entry.entry_type.clone(),
                        mode: entry.mode.clone(),
                    },
                )
                .await?;
                outcome.tree_entries_written += 1;

                if entry.entry_type == "tree" {
                    // Sub-trees are objects in their own right
                    if seen_trees.insert(entry.sha.clone()) {
                        object_store::upsert_tree(pool, repo.id, &entry.sha).await?;
                    }
                } else if !seen_blobs.contains(&entry.sha)
                    && object_store::get_blob(pool, repo.id, &entry.sha)
                        .await?
                        .is_none()
                {
                    seen_blobs.insert(entry.sha.clone());
                    new_blobs.push(entry.clone());
                }
            }

            let batches = batch_blob_entries(&new_blobs, &config.batch);
            let batch_count = batches.len();
            for (i, batch) in batches.into_iter().enumerate() {
                tracker.check_cancelled().await?;

                for entry in batch {
                    let raw = client.get_blob(&repo.owner, &repo.name, &entry.sha).await?;
                    let (content, encoding) = decode_blob_content(&raw.content);

                    object_store::upsert_blob(
                        pool,
                        &Blob {
                            repo_id: repo.id,
                            sha: entry.sha.clone(),
                            content,
                            encoding: encoding.as_str().to_string(),
                            size: raw.size,
                        },
                    )
                    .await?;
                    outcome.blobs_written += 1;

                    tracker.progress(&format!("added {}", entry.path)).await?;
                }

                if i + 1 < batch_count && config.inter_batch_delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(config.inter_batch_delay_ms)).await;
                }
            }

            let parent_shas: Vec<String> = info.parents.iter().map(|p| p.sha.clone()).collect();
            object_store::insert_commit(
                pool,
                &Commit {
                    repo_id: repo.id,
                    sha: info.sha.clone(),
                    tree_sha: tree.sha.clone(),
                    message: info.commit.message.clone(),
                    parent_shas: serde_json::to_string(&parent_shas)?,
                    author_name: info.commit.author.as_ref().and_then(|s| s.name.clone()),
                    author_email: info.commit.author.as_ref().and_then(|s| s.email.clone()),
                    authored_at: info.commit.author.as_ref().and_then(|s| s.date_unix()),
                    committer_name: info.commit.committer.as_ref().and_then(|s| s.name.clone()),
                    committer_email: info.commit.committer.as_ref().and_then(|s| s.email.clone()),
                    committed_at: info.commit.committer.as_ref().and_then(|s| s.date_unix()),
                },
            )
            .await?;
            outcome.commits_written += 1;

            tracker
                .progress(&format!("{} commits written", outcome.commits_written))
                .await?;
        }

        if page_len < config.commits_per_page as usize {
            break;
        }
        page += 1;
    }

    Ok(outcome)
}

/// Group blob entries into fetch batches under the byte and file limits.
///
/// An entry larger than `max_bytes` on its own gets a singleton batch rather
/// than being dropped; entries with no declared size count as zero bytes.
/// Input order is preserved.
pub fn batch_blob_entries(
    entries: &[TreeEntryInfo],
    config: &BatchConfig,
) -> Vec<Vec<TreeEntryInfo>> {
    let mut batches: Vec<Vec<TreeEntryInfo>> = Vec::new();
    let mut current: Vec<TreeEntryInfo> = Vec::new();
    let mut current_bytes: i64 = 0;

    for entry in entries {
        let size = entry.size.unwrap_or(0).max(0);

        if size > config.max_bytes {
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            batches.push(vec![entry.clone()]);
            continue;
        }

        let over_files = current.len() >= config.max_files;
        let over_bytes = !current.is_empty() && current_bytes + size > config.max_bytes;
        if over_files || over_bytes {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }

        current_bytes += size;
        current.push(entry.clone());
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

/// Decode blob content from the provider's base64 form.
///
/// Valid UTF-8 is stored as decoded text so it can be displayed and diffed
/// directly; anything else keeps the original base64 so binary content
/// round-trips byte for byte.
pub fn decode_blob_content(raw_base64: &str) -> (String, BlobEncoding) {
    let stripped: String = raw_base64.chars().filter(|c| !c.is_whitespace()).collect();

    let bytes = match BASE64.decode(&stripped) {
        Ok(bytes) => bytes,
        Err(_) => return (stripped, BlobEncoding::Base64),
    };

    match String::from_utf8(bytes) {
        Ok(text) => (text, BlobEncoding::Utf8),
        Err(_) => (stripped, BlobEncoding::Base64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: Option<i64>) -> TreeEntryInfo {
        TreeEntryInfo {
            path: path.to_string(),
            mode: Some("100644".to_string()),
            entry_type: "blob".to_string(),
            sha: format!("{:0>40}", path.len()),
            size,
        }
    }

    #[test]
    fn test_batching_by_bytes() {
        let entries: Vec<TreeEntryInfo> = (0..25)
            .map(|i| entry(&format!("f{}", i), Some(100 * 1024)))
            .collect();
        let config = BatchConfig {
            max_bytes: 800 * 1024,
            max_files: 20,
        };

        let batches = batch_blob_entries(&entries, &config);
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![8, 8, 8, 1]);
    }

    #[test]
    fn test_batching_by_file_count() {
        let entries: Vec<TreeEntryInfo> =
            (0..7).map(|i| entry(&format!("f{}", i), Some(1))).collect();
        let config = BatchConfig {
            max_bytes: 1024,
            max_files: 3,
        };

        let batches = batch_blob_entries(&entries, &config);
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn test_oversized_entry_gets_own_batch() {
        let entries = vec![
            entry("small1", Some(10)),
            entry("huge", Some(10_000)),
            entry("small2", Some(10)),
            entry("small3", Some(10)),
        ];
        let config = BatchConfig {
            max_bytes: 100,
            max_files: 10,
        };

        let batches = batch_blob_entries(&entries, &config);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0][0].path, "small1");
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].path, "huge");
        assert_eq!(batches[2].len(), 2);
    }

    #[test]
    fn test_unknown_size_counts_as_zero() {
        let entries: Vec<TreeEntryInfo> =
            (0..5).map(|i| entry(&format!("f{}", i), None)).collect();
        let config = BatchConfig {
            max_bytes: 1,
            max_files: 10,
        };

        let batches = batch_blob_entries(&entries, &config);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
    }

    #[test]
    fn test_empty_input_yields_no_batches() {
        let batches = batch_blob_entries(&[], &BatchConfig::default());
        assert!(batches.is_empty());
    }

    #[test]
    fn test_decode_utf8_blob() {
        let encoded = BASE64.encode("fn main() {}\n");
        let (content, encoding) = decode_blob_content(&encoded);
        assert_eq!(content, "fn main() {}\n");
        assert_eq!(encoding, BlobEncoding::Utf8);
    }

    #[test]
    fn test_decode_handles_rfc2045_line_breaks() {
        let encoded = BASE64.encode("hello world, this is a longer payload");
        let wrapped = format!("{}\n{}\n", &encoded[..10], &encoded[10..]);
        let (content, encoding) = decode_blob_content(&wrapped);
        assert_eq!(content, "hello world, this is a longer payload");
        assert_eq!(encoding, BlobEncoding::Utf8);
    }

    #[test]
    fn test_decode_binary_blob_keeps_base64() {
        let png_header = [0x89u8, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0xff];
        let encoded = BASE64.encode(png_header);
        let (content, encoding) = decode_blob_content(&encoded);
        assert_eq!(encoding, BlobEncoding::Base64);
        assert_eq!(content, encoded);
        assert_eq!(BASE64.decode(&content).unwrap(), png_header);
    }
}
