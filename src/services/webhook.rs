//! Webhook event application.
//!
//! Webhook payloads use the REST shapes, not GraphQL, so actors and
//! timestamps are normalized here before reuse of the regular stores. Events
//! only nudge the mirror between sync passes; the next full pass remains the
//! source of truth for anything a dropped delivery missed.

use serde::Deserialize;
use serde_json::Value;

use crate::db::issue_store::{self, IssueUpsert};
use crate::db::object_store;
use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::issue::IssueActor;

/// `issues` event payload.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueEventPayload {
    pub action: String,
    pub repository: WebhookRepository,
    pub issue: WebhookIssue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRepository {
    pub name: String,
    pub owner: WebhookOwner,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookOwner {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookIssue {
    pub id: i64,
    pub number: i64,
    pub title: String,
    pub state: String,
    pub body: Option<String>,
    pub user: Option<WebhookUser>,
    #[serde(default)]
    pub labels: Vec<WebhookLabel>,
    #[serde(default)]
    pub assignees: Vec<WebhookUser>,
    #[serde(default)]
    pub comments: i64,
    pub created_at: String,
    pub updated_at: String,
    pub closed_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookUser {
    pub login: String,
    pub id: i64,
    #[serde(rename = "type", default)]
    pub user_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookLabel {
    pub name: String,
}

/// `installation`/`installation_repositories` event payload, covering both
/// the whole-installation and added/removed shapes.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationEventPayload {
    pub action: String,
    #[serde(default)]
    pub repositories: Vec<InstallationRepo>,
    #[serde(default)]
    pub repositories_added: Vec<InstallationRepo>,
    #[serde(default)]
    pub repositories_removed: Vec<InstallationRepo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationRepo {
    /// "owner/name".
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
}

/// Apply an `issues` event: ensure the repository exists locally and upsert
/// the issue through the counter-maintaining store path.
///
/// # Returns
/// The local issue row id.
pub async fn apply_issue_event(
    pool: &DbPool,
    payload: &IssueEventPayload,
) -> Result<i64, AppError> {
    let repo = object_store::ensure_repository(
        pool,
        &payload.repository.owner.login,
        &payload.repository.name,
        payload.repository.private,
    )
    .await?;

    let issue = &payload.issue;
    let state = issue.state.to_lowercase();
    if state != "open" && state != "closed" {
        return Err(AppError::invalid_input(format!(
            "Unknown issue state {:?} in webhook",
            issue.state
        )));
    }

    let upsert = IssueUpsert {
        github_id: issue.id,
        number: issue.number,
        title: issue.title.clone(),
        state,
        body: issue.body.clone().filter(|b| !b.is_empty()),
        author: normalize_rest_actor(issue.user.as_ref()),
        labels: issue.labels.iter().map(|l| l.name.clone()).collect(),
        assignees: issue.assignees.iter().map(|a| a.login.clone()).collect(),
        comment_count: issue.comments,
        created_at: parse_timestamp(&issue.created_at)?,
        updated_at: parse_timestamp(&issue.updated_at)?,
        closed_at: issue
            .closed_at
            .as_deref()
            .and_then(|s| parse_timestamp(s).ok()),
    };

    issue_store::upsert_issue(pool, repo.id, &upsert).await
}

/// Apply an installation event.
///
/// `created` and `added` register repositories; `deleted` and `removed`
/// delete them with everything they own. Other actions are ignored.
pub async fn apply_installation_event(
    pool: &DbPool,
    payload: &InstallationEventPayload,
) -> Result<(), AppError> {
    match payload.action.as_str() {
        "created" | "added" => {
            let repos = if payload.repositories_added.is_empty() {
                &payload.repositories
            } else {
                &payload.repositories_added
            };
            for repo in repos {
                let (owner, name) = split_full_name(&repo.full_name)?;
                object_store::ensure_repository(pool, owner, name, repo.private).await?;
            }
        }
        "deleted" | "removed" => {
            let repos = if payload.repositories_removed.is_empty() {
                &payload.repositories
            } else {
                &payload.repositories_removed
            };
            for repo in repos {
                let (owner, name) = split_full_name(&repo.full_name)?;
                if let Some(existing) = object_store::get_repository(pool, owner, name).await? {
                    object_store::delete_repository(pool, existing.id).await?;
                }
            }
        }
        other => {
            log::warn!("Ignoring installation action {:?}", other);
        }
    }

    Ok(())
}

/// Parse and apply a raw webhook delivery by event name.
pub async fn apply_event(pool: &DbPool, event: &str, body: &Value) -> Result<(), AppError> {
    match event {
        "issues" => {
            let payload: IssueEventPayload = serde_json::from_value(body.clone())?;
            apply_issue_event(pool, &payload).await?;
        }
        "installation" | "installation_repositories" => {
            let payload: InstallationEventPayload = serde_json::from_value(body.clone())?;
            apply_installation_event(pool, &payload).await?;
        }
        other => {
            log::warn!("Ignoring webhook event {:?}", other);
        }
    }

    Ok(())
}

/// REST actors name bots with a `[bot]` login suffix instead of a typename.
fn normalize_rest_actor(user: Option<&WebhookUser>) -> IssueActor {
    let user = match user {
        Some(user) => user,
        None => return IssueActor::Ghost,
    };

    if user.user_type == "Bot" || user.login.ends_with("[bot]") {
        return IssueActor::Bot;
    }

    IssueActor::User {
        login: user.login.clone(),
        id: user.id,
    }
}

fn parse_timestamp(raw: &str) -> Result<i64, AppError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .map_err(|_| AppError::invalid_input(format!("Bad timestamp {:?} in webhook", raw)))
}

fn split_full_name(full_name: &str) -> Result<(&str, &str), AppError> {
    full_name
        .split_once('/')
        .filter(|(owner, name)| !owner.is_empty() && !name.is_empty())
        .ok_or_else(|| {
            AppError::invalid_input(format!("Bad repository full name {:?}", full_name))
        })
}
