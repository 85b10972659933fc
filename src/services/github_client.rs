//! GitHub API client.
//!
//! Git data (refs, commits, trees, blobs) comes from the REST v3 API; issue
//! data comes from the GraphQL v4 API because a single issues query carries
//! the embedded label/assignee/comment/timeline connections that REST would
//! need one round trip each for.
//!
//! Rate limiting is surfaced as [`AppError::RateLimited`] so callers can back
//! off and retry the same page or cursor; [`retry_rate_limited`] implements
//! that loop.

use std::future::Future;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppError;

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const DEFAULT_USER_AGENT: &str = "octomirror";

/// Configuration for the API client.
#[derive(Debug, Clone)]
pub struct GitHubClientConfig {
    /// API root, e.g. `https://api.github.com` or a GHES `/api/v3` root.
    pub base_url: String,
    pub token: String,
    pub user_agent: Option<String>,
    pub timeout_secs: u64,
}

impl GitHubClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
            user_agent: None,
            timeout_secs: 30,
        }
    }
}

/// Repository metadata from the REST API.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoMetadata {
    pub default_branch: String,
    pub private: bool,
}

/// A ref as returned by the matching-refs endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RefInfo {
    /// Fully qualified, e.g. `refs/heads/main`.
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub object: RefObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefObject {
    pub sha: String,
}

/// A commit from the list-commits endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub commit: CommitDetail,
    #[serde(default)]
    pub parents: Vec<CommitParent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitDetail {
    pub message: String,
    pub tree: CommitTreeRef,
    pub author: Option<CommitSignature>,
    pub committer: Option<CommitSignature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitTreeRef {
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitSignature {
    pub name: Option<String>,
    pub email: Option<String>,
    /// RFC 3339 timestamp.
    pub date: Option<String>,
}

impl CommitSignature {
    /// Parse the signature date to unix seconds.
    pub fn date_unix(&self) -> Option<i64> {
        let raw = self.date.as_deref()?;
        chrono::DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.timestamp())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitParent {
    pub sha: String,
}

/// A recursive tree listing.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeResponse {
    pub sha: String,
    #[serde(default)]
    pub truncated: bool,
    #[serde(rename = "tree", default)]
    pub entries: Vec<TreeEntryInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeEntryInfo {
    pub path: String,
    pub mode: Option<String>,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub sha: String,
    /// Present for blobs only.
    pub size: Option<i64>,
}

/// A blob fetched by sha. Content arrives base64-encoded with embedded
/// newlines per RFC 2045.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobResponse {
    pub sha: String,
    pub content: String,
    pub encoding: String,
    pub size: i64,
}

/// One page of the GraphQL issues connection. Nodes are kept as raw JSON so
/// normalization can be defensive per issue instead of failing the page.
#[derive(Debug, Clone)]
pub struct IssuesPage {
    pub nodes: Vec<Value>,
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// One page of a per-issue sub-resource connection (labels, assignees,
/// comments, or timeline items).
#[derive(Debug, Clone)]
pub struct SubResourcePage {
    pub nodes: Vec<Value>,
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

const ISSUES_QUERY: &str = r#"
query($owner: String!, $name: String!, $first: Int!, $after: String, $since: DateTime) {
  repository(owner: $owner, name: $name) {
    issues(first: $first, after: $after, filterBy: { since: $since },
           orderBy: { field: UPDATED_AT, direction: DESC }) {
      pageInfo { hasNextPage endCursor }
      nodes {
        id databaseId number title state body createdAt updatedAt closedAt
        author { __typename login ... on User { databaseId } }
        labels(first: 20) { pageInfo { hasNextPage } nodes { name } }
        assignees(first: 10) { pageInfo { hasNextPage } nodes { login } }
        comments(first: 20) {
          totalCount
          pageInfo { hasNextPage }
          nodes {
            databaseId body createdAt updatedAt
            author { __typename login ... on User { databaseId } }
          }
        }
        timelineItems(first: 50, itemTypes: [
          ASSIGNED_EVENT, UNASSIGNED_EVENT, LABELED_EVENT, UNLABELED_EVENT,
          MILESTONED_EVENT, DEMILESTONED_EVENT, CLOSED_EVENT, REOPENED_EVENT,
          RENAMED_TITLE_EVENT, REFERENCED_EVENT, CROSS_REFERENCED_EVENT,
          LOCKED_EVENT, UNLOCKED_EVENT, PINNED_EVENT, UNPINNED_EVENT,
          TRANSFERRED_EVENT
        ]) {
          pageInfo { hasNextPage }
          nodes {
            __typename
            ... on AssignedEvent { id createdAt actor { login } assignee { ... on User { login } } }
            ... on UnassignedEvent { id createdAt actor { login } assignee { ... on User { login } } }
            ... on LabeledEvent { id createdAt actor { login } label { name } }
            ... on UnlabeledEvent { id createdAt actor { login } label { name } }
            ... on MilestonedEvent { id createdAt actor { login } milestoneTitle }
            ... on DemilestonedEvent { id createdAt actor { login } milestoneTitle }
            ... on ClosedEvent { id createdAt actor { login } }
            ... on ReopenedEvent { id createdAt actor { login } }
            ... on RenamedTitleEvent { id createdAt actor { login } previousTitle currentTitle }
            ... on ReferencedEvent { id createdAt actor { login } commit { oid } }
            ... on CrossReferencedEvent { id createdAt actor { login } willCloseTarget source { ... on Issue { number } ... on PullRequest { number } } }
            ... on LockedEvent { id createdAt actor { login } lockReason }
            ... on UnlockedEvent { id createdAt actor { login } }
            ... on PinnedEvent { id createdAt actor { login } }
            ... on UnpinnedEvent { id createdAt actor { login } }
            ... on TransferredEvent { id createdAt actor { login } fromRepository { nameWithOwner } }
          }
        }
      }
    }
  }
}
"#;

const ISSUE_LABELS_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!, $first: Int!, $after: String) {
  repository(owner: $owner, name: $name) {
    issue(number: $number) {
      labels(first: $first, after: $after) {
        pageInfo { hasNextPage endCursor }
        nodes { name }
      }
    }
  }
}
"#;

const ISSUE_ASSIGNEES_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!, $first: Int!, $after: String) {
  repository(owner: $owner, name: $name) {
    issue(number: $number) {
      assignees(first: $first, after: $after) {
        pageInfo { hasNextPage endCursor }
        nodes { login }
      }
    }
  }
}
"#;

const ISSUE_COMMENTS_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!, $first: Int!, $after: String) {
  repository(owner: $owner, name: $name) {
    issue(number: $number) {
      comments(first: $first, after: $after) {
        pageInfo { hasNextPage endCursor }
        nodes {
          databaseId body createdAt updatedAt
          author { __typename login ... on User { databaseId } }
        }
      }
    }
  }
}
"#;

const ISSUE_TIMELINE_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!, $first: Int!, $after: String) {
  repository(owner: $owner, name: $name) {
    issue(number: $number) {
      timelineItems(first: $first, after: $after, itemTypes: [
        ASSIGNED_EVENT, UNASSIGNED_EVENT, LABELED_EVENT, UNLABELED_EVENT,
        MILESTONED_EVENT, DEMILESTONED_EVENT, CLOSED_EVENT, REOPENED_EVENT,
        RENAMED_TITLE_EVENT, REFERENCED_EVENT, CROSS_REFERENCED_EVENT,
        LOCKED_EVENT, UNLOCKED_EVENT, PINNED_EVENT, UNPINNED_EVENT,
        TRANSFERRED_EVENT
      ]) {
        pageInfo { hasNextPage endCursor }
        nodes {
          __typename
          ... on AssignedEvent { id createdAt actor { login } assignee { ... on User { login } } }
          ... on UnassignedEvent { id createdAt actor { login } assignee { ... on User { login } } }
          ... on LabeledEvent { id createdAt actor { login } label { name } }
          ... on UnlabeledEvent { id createdAt actor { login } label { name } }
          ... on MilestonedEvent { id createdAt actor { login } milestoneTitle }
          ... on DemilestonedEvent { id createdAt actor { login } milestoneTitle }
          ... on ClosedEvent { id createdAt actor { login } }
          ... on ReopenedEvent { id createdAt actor { login } }
          ... on RenamedTitleEvent { id createdAt actor { login } previousTitle currentTitle }
          ... on ReferencedEvent { id createdAt actor { login } commit { oid } }
          ... on CrossReferencedEvent { id createdAt actor { login } willCloseTarget source { ... on Issue { number } ... on PullRequest { number } } }
          ... on LockedEvent { id createdAt actor { login } lockReason }
          ... on UnlockedEvent { id createdAt actor { login } }
          ... on PinnedEvent { id createdAt actor { login } }
          ... on UnpinnedEvent { id createdAt actor { login } }
          ... on TransferredEvent { id createdAt actor { login } fromRepository { nameWithOwner } }
        }
      }
    }
  }
}
"#;

/// HTTP client for the GitHub REST and GraphQL APIs.
pub struct GitHubClient {
    client: Client,
    base_url: String,
}

impl GitHubClient {
    pub fn new(config: &GitHubClientConfig) -> Result<Self, AppError> {
        let mut headers = HeaderMap::new();

        let auth_value = format!("Bearer {}", config.token);
        let mut auth_header = HeaderValue::from_str(&auth_value)
            .map_err(|_| AppError::invalid_input("Invalid API token"))?;
        auth_header.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth_header);

        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );

        let ua = config
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&ua)
                .map_err(|_| AppError::invalid_input("Invalid user agent"))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch repository metadata (default branch, visibility).
    pub async fn get_repository(&self, owner: &str, name: &str) -> Result<RepoMetadata, AppError> {
        let endpoint = format!("/repos/{}/{}", owner, name);
        let response = self
            .client
            .get(format!("{}{}", self.base_url, endpoint))
            .send()
            .await?;
        handle_response(response, &endpoint).await
    }

    /// List branch or tag refs via the matching-refs endpoint.
    pub async fn list_refs(
        &self,
        owner: &str,
        name: &str,
        tags: bool,
    ) -> Result<Vec<RefInfo>, AppError> {
        let namespace = if tags { "tags" } else { "heads" };
        let endpoint = format!("/repos/{}/{}/git/matching-refs/{}/", owner, name, namespace);
        let response = self
            .client
            .get(format!("{}{}", self.base_url, endpoint))
            .send()
            .await?;
        handle_response(response, &endpoint).await
    }

    /// List commits reachable from a ref, newest first, optionally bounded by
    /// an updated-since watermark.
    pub async fn list_commits(
        &self,
        owner: &str,
        name: &str,
        ref_sha: &str,
        since_unix: Option<i64>,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<CommitInfo>, AppError> {
        let endpoint = format!("/repos/{}/{}/commits", owner, name);
        let mut request = self
            .client
            .get(format!("{}{}", self.base_url, endpoint))
            .query(&[
                ("sha", ref_sha.to_string()),
                ("page", page.to_string()),
                ("per_page", per_page.to_string()),
            ]);

        if let Some(since) = since_unix {
            if let Some(dt) = Utc.timestamp_opt(since, 0).single() {
                request = request.query(&[("since", dt.to_rfc3339())]);
            }
        }

        let response = request.send().await?;
        handle_response(response, &endpoint).await
    }

    /// Fetch a full recursive tree listing for a tree sha.
    pub async fn get_tree(
        &self,
        owner: &str,
        name: &str,
        tree_sha: &str,
    ) -> Result<TreeResponse, AppError> {
        let endpoint = format!("/repos/{}/{}/git/trees/{}", owner, name, tree_sha);
        let response = self
            .client
            .get(format!("{}{}", self.base_url, endpoint))
            .query(&[("recursive", "1")])
            .send()
            .await?;
        handle_response(response, &endpoint).await
    }

    /// Fetch a blob by sha. Content is base64 with embedded newlines.
    pub async fn get_blob(
        &self,
        owner: &str,
        name: &str,
        sha: &str,
    ) -> Result<BlobResponse, AppError> {
        let endpoint = format!("/repos/{}/{}/git/blobs/{}", owner, name, sha);
        let response = self
            .client
            .get(format!("{}{}", self.base_url, endpoint))
            .send()
            .await?;
        handle_response(response, &endpoint).await
    }

    /// Fetch one page of issues ordered by updatedAt ascending.
    pub async fn issues_page(
        &self,
        owner: &str,
        name: &str,
        first: u32,
        after: Option<&str>,
        since_unix: Option<i64>,
    ) -> Result<IssuesPage, AppError> {
        let since = since_unix
            .and_then(|s| Utc.timestamp_opt(s, 0).single())
            .map(|dt| dt.to_rfc3339());

        let data = self
            .graphql(
                ISSUES_QUERY,
                json!({
                    "owner": owner,
                    "name": name,
                    "first": first,
                    "after": after,
                    "since": since,
                }),
            )
            .await?;

        let connection = data
            .pointer("/repository/issues")
            .ok_or_else(|| AppError::github_api("Missing issues connection in response"))?;

        Ok(IssuesPage {
            nodes: connection
                .pointer("/nodes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            has_next_page: connection
                .pointer("/pageInfo/hasNextPage")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            end_cursor: connection
                .pointer("/pageInfo/endCursor")
                .and_then(Value::as_str)
                .map(String::from),
        })
    }

    /// Fetch one page of an issue's labels connection.
    pub async fn issue_labels_page(
        &self,
        owner: &str,
        name: &str,
        number: i64,
        first: u32,
        after: Option<&str>,
    ) -> Result<SubResourcePage, AppError> {
        self.sub_resource_page(ISSUE_LABELS_QUERY, "labels", owner, name, number, first, after)
            .await
    }

    /// Fetch one page of an issue's assignees connection.
    pub async fn issue_assignees_page(
        &self,
        owner: &str,
        name: &str,
        number: i64,
        first: u32,
        after: Option<&str>,
    ) -> Result<SubResourcePage, AppError> {
        self.sub_resource_page(
            ISSUE_ASSIGNEES_QUERY,
            "assignees",
            owner,
            name,
            number,
            first,
            after,
        )
        .await
    }

    /// Fetch one page of an issue's comments connection.
    pub async fn issue_comments_page(
        &self,
        owner: &str,
        name: &str,
        number: i64,
        first: u32,
        after: Option<&str>,
    ) -> Result<SubResourcePage, AppError> {
        self.sub_resource_page(
            ISSUE_COMMENTS_QUERY,
            "comments",
            owner,
            name,
            number,
            first,
            after,
        )
        .await
    }

    /// Fetch one page of an issue's timeline connection.
    pub async fn issue_timeline_page(
        &self,
        owner: &str,
        name: &str,
        number: i64,
        first: u32,
        after: Option<&str>,
    ) -> Result<SubResourcePage, AppError> {
        self.sub_resource_page(
            ISSUE_TIMELINE_QUERY,
            "timelineItems",
            owner,
            name,
            number,
            first,
            after,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn sub_resource_page(
        &self,
        query: &str,
        field: &str,
        owner: &str,
        name: &str,
        number: i64,
        first: u32,
        after: Option<&str>,
    ) -> Result<SubResourcePage, AppError> {
        let data = self
            .graphql(
                query,
                json!({
                    "owner": owner,
                    "name": name,
                    "number": number,
                    "first": first,
                    "after": after,
                }),
            )
            .await?;

        let pointer = format!("/repository/issue/{}", field);
        let connection = data
            .pointer(&pointer)
            .ok_or_else(|| AppError::github_api(format!("Missing {} connection", field)))?;

        Ok(SubResourcePage {
            nodes: connection
                .pointer("/nodes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            has_next_page: connection
                .pointer("/pageInfo/hasNextPage")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            end_cursor: connection
                .pointer("/pageInfo/endCursor")
                .and_then(Value::as_str)
                .map(String::from),
        })
    }

    /// Execute a GraphQL query and return the `data` object.
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, AppError> {
        let endpoint = "/graphql";
        let response = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let body: Value = handle_response(response, endpoint).await?;

        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                let rate_limited = errors.iter().any(|e| {
                    e.get("type").and_then(Value::as_str) == Some("RATE_LIMITED")
                });
                let messages: Vec<&str> = errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(Value::as_str))
                    .collect();
                let message = messages.join("; ");

                if rate_limited {
                    return Err(AppError::rate_limited(message, None));
                }
                return Err(AppError::github_api(format!("GraphQL error: {}", message)));
            }
        }

        body.get("data")
            .cloned()
            .ok_or_else(|| AppError::github_api("GraphQL response missing data"))
    }
}

/// Decode a response, mapping HTTP failures to typed errors.
///
/// Both primary (403/429 with `retry-after`) and secondary (403 with
/// `x-ratelimit-remaining: 0`) rate limits become [`AppError::RateLimited`].
async fn handle_response<T: DeserializeOwned>(
    response: Response,
    endpoint: &str,
) -> Result<T, AppError> {
    let status = response.status();

    if status.is_success() {
        return response.json::<T>().await.map_err(|e| {
            AppError::github_api(format!("Failed to parse response from {}: {}", endpoint, e))
        });
    }

    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && is_rate_limit_headers(&response))
    {
        let reset_at = response
            .headers()
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        return Err(AppError::rate_limited(
            format!("Rate limit hit on {}", endpoint),
            reset_at,
        ));
    }

    if status == StatusCode::NOT_FOUND {
        return Err(AppError::not_found_with_id("endpoint", endpoint));
    }

    let body = response.text().await.unwrap_or_default();
    Err(AppError::github_api_full(
        format!("Request failed ({}): {}", status, truncate(&body, 200)),
        status.as_u16(),
        endpoint,
    ))
}

fn is_rate_limit_headers(response: &Response) -> bool {
    let remaining_zero = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0");
    remaining_zero || response.headers().contains_key("retry-after")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Run an operation, retrying on rate limits with exponential backoff.
///
/// The same inputs (page, cursor) are retried; any other error propagates
/// immediately. The final attempt's rate-limit error propagates if the
/// budget is exhausted.
pub async fn retry_rate_limited<T, F, Fut>(
    mut operation: F,
    max_attempts: u32,
    base_delay_ms: u64,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut delay_ms = base_delay_ms;
    let mut attempt = 1;

    loop {
        match operation().await {
            Err(err) if err.is_rate_limited() && attempt < max_attempts => {
                log::warn!(
                    "Rate limited (attempt {}/{}), backing off {}ms",
                    attempt,
                    max_attempts,
                    delay_ms
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = delay_ms.saturating_mul(2);
                attempt += 1;
            }
            other => return other,
        }
    }
}
