//! Mirrored Git object model: refs, commits, trees, tree entries, blobs.
//!
//! Commits, trees and blobs are content-addressed by sha and immutable once
//! written; refs are mutable pointers replaced wholesale on each ref sync.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A named pointer (branch or tag) to a commit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct GitRef {
    pub repo_id: i64,

    /// Ref name with the `refs/heads/` or `refs/tags/` prefix stripped.
    pub name: String,

    pub commit_sha: String,

    pub is_tag: bool,
}

/// An immutable commit row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub repo_id: i64,
    pub sha: String,
    pub tree_sha: String,
    pub message: String,

    /// Parent shas as a JSON array string.
    pub parent_shas: String,

    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub authored_at: Option<i64>,
    pub committer_name: Option<String>,
    pub committer_email: Option<String>,
    pub committed_at: Option<i64>,
}

impl Commit {
    /// Decode the parent sha list.
    pub fn parents(&self) -> Vec<String> {
        serde_json::from_str(&self.parent_shas).unwrap_or_default()
    }
}

/// Kind of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeEntryType {
    Blob,
    Tree,
}

impl TreeEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blob" => Some(Self::Blob),
            "tree" => Some(Self::Tree),
            _ => None,
        }
    }
}

/// One row of a flattened recursive tree listing.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TreeEntry {
    pub repo_id: i64,
    pub root_tree_sha: String,
    pub path: String,
    pub entry_sha: String,
    pub entry_type: String,
    pub mode: Option<String>,
}

/// How a blob's content column is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobEncoding {
    /// Lossless UTF-8 text, stored decoded for diffing and display.
    #[serde(rename = "utf-8")]
    Utf8,
    /// Binary content kept in the provider's base64 form.
    #[serde(rename = "base64")]
    Base64,
}

impl BlobEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Base64 => "base64",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "utf-8" => Some(Self::Utf8),
            "base64" => Some(Self::Base64),
            _ => None,
        }
    }
}

/// A content-addressed file blob.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub repo_id: i64,
    pub sha: String,
    pub content: String,
    pub encoding: String,
    pub size: i64,
}

impl Blob {
    pub fn encoding_enum(&self) -> Option<BlobEncoding> {
        BlobEncoding::parse(&self.encoding)
    }
}
