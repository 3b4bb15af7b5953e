//! Todoist API adapter implementing `RemoteTaskStore`.
//!
//! Thin mapping onto the Todoist v1 API:
//! - `GET  /tasks/{id}` for a single task (completed tasks included)
//! - `GET  /tasks` for the bulk listing, following `next_cursor`
//! - `POST /tasks/{id}/close` and `POST /tasks/{id}/reopen`
//! - `POST /tasks/{id}` for content edits
//!
//! Status codes are turned into `RemoteError` variants here and nowhere else.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use todoist_sync_core::remote::{self, RemoteError, RemoteTask, RemoteTaskStore, TaskUpdate};
use tracing::{debug, info};

pub const DEFAULT_API_BASE: &str = "https://api.todoist.com/api/v1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Task as returned by the API. Only the fields the sync reads.
#[derive(Debug, Deserialize)]
struct ApiTask {
    id: String,
    #[serde(default)]
    content: String,
    #[serde(default, alias = "is_completed")]
    checked: bool,
    #[serde(default)]
    due: Option<ApiDue>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiDue {
    date: String,
}

#[derive(Debug, Deserialize)]
struct TaskPage {
    results: Vec<ApiTask>,
    #[serde(default)]
    next_cursor: Option<String>,
}

impl From<ApiTask> for RemoteTask {
    fn from(task: ApiTask) -> Self {
        RemoteTask {
            id: task.id,
            content: task.content,
            completed: task.checked,
            due_date: task.due.and_then(|due| parse_due_date(&due.date)),
            completed_at: task.completed_at,
        }
    }
}

/// Due dates come as `YYYY-MM-DD` or a full datetime; only the day matters.
fn parse_due_date(date: &str) -> Option<NaiveDate> {
    let day = date.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn network_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Network(e.to_string())
}

/// Client for one Todoist account.
pub struct TodoistClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl TodoistClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, DEFAULT_API_BASE)
    }

    pub fn with_base_url(token: impl Into<String>, base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map a non-success response onto a `RemoteError`.
    async fn check(response: Response, task_id: &str) -> remote::Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RemoteError::RateLimited {
                retry_after: parse_retry_after(&response),
            });
        }
        let message = response.text().await.unwrap_or_default();
        debug!("Todoist returned {} for {}: {}", status, task_id, message);
        Err(RemoteError::from_status(status.as_u16(), task_id, message))
    }

    async fn post(&self, path: &str, task_id: &str, body: Option<serde_json::Value>) -> remote::Result<()> {
        let mut request = self.http.post(self.url(path)).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(network_error)?;
        Self::check(response, task_id).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteTaskStore for TodoistClient {
    async fn get_task(&self, id: &str) -> remote::Result<RemoteTask> {
        let response = self
            .http
            .get(self.url(&format!("/tasks/{}", id)))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(network_error)?;
        let task: ApiTask = Self::check(response, id)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(task.into())
    }

    async fn list_tasks(&self) -> remote::Result<Vec<RemoteTask>> {
        let mut tasks = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut request = self.http.get(self.url("/tasks")).bearer_auth(&self.token);
            if let Some(cursor) = &cursor {
                request = request.query(&[("cursor", cursor)]);
            }
            let response = request.send().await.map_err(network_error)?;
            let page: TaskPage = Self::check(response, "*")
                .await?
                .json()
                .await
                .map_err(|e| RemoteError::Decode(e.to_string()))?;
            tasks.extend(page.results.into_iter().map(RemoteTask::from));
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        info!("Listed {} Todoist tasks", tasks.len());
        Ok(tasks)
    }

    async fn close_task(&self, id: &str) -> remote::Result<()> {
        self.post(&format!("/tasks/{}/close", id), id, None).await
    }

    async fn update_task(&self, id: &str, update: &TaskUpdate) -> remote::Result<()> {
        if let Some(content) = &update.content {
            let body = serde_json::json!({ "content": content });
            self.post(&format!("/tasks/{}", id), id, Some(body)).await?;
        }
        match update.completed {
            Some(true) => self.close_task(id).await,
            Some(false) => self.post(&format!("/tasks/{}/reopen", id), id, None).await,
            None => Ok(()),
        }
    }
}
