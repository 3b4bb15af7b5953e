//! RemoteTaskStore trait: the narrow view of Todoist the sync core needs.
//!
//! Implementations surface HTTP-style statuses as distinct [`RemoteError`]
//! variants so change detection can tell permanent failures (404/403,
//! tombstone the task) from transient ones (429, network; retry later).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Remote task not found: {0}")]
    NotFound(String),

    #[error("Access to remote task forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited by remote")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Remote HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// HTTP status code behind this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::NotFound(_) => Some(404),
            RemoteError::Forbidden(_) => Some(403),
            RemoteError::RateLimited { .. } => Some(429),
            RemoteError::Http { status, .. } => Some(*status),
            RemoteError::Network(_) | RemoteError::Decode(_) => None,
        }
    }

    /// 404/403: the task will never become readable again.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RemoteError::NotFound(_) | RemoteError::Forbidden(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RemoteError::RateLimited { .. })
    }

    /// Map a status code onto the matching variant.
    pub fn from_status(status: u16, task_id: &str, message: impl Into<String>) -> Self {
        match status {
            404 => RemoteError::NotFound(task_id.to_string()),
            403 => RemoteError::Forbidden(task_id.to_string()),
            429 => RemoteError::RateLimited { retry_after: None },
            _ => RemoteError::Http {
                status,
                message: message.into(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// The fields of a remote task the sync core reads.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTask {
    pub id: String,
    pub content: String,
    pub completed: bool,
    pub due_date: Option<NaiveDate>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields to change on a remote task. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    /// `Some(false)` reopens a completed task
    pub completed: Option<bool>,
    pub content: Option<String>,
}

#[async_trait]
pub trait RemoteTaskStore: Send + Sync {
    async fn get_task(&self, id: &str) -> Result<RemoteTask>;

    /// Bulk listing of every task visible to the account.
    async fn list_tasks(&self) -> Result<Vec<RemoteTask>>;

    async fn close_task(&self, id: &str) -> Result<()>;

    async fn update_task(&self, id: &str, update: &TaskUpdate) -> Result<()>;
}

/// Wraps a store and counts the calls made through it.
pub struct MeteredRemote {
    inner: Arc<dyn RemoteTaskStore>,
    calls: AtomicU64,
}

impl MeteredRemote {
    pub fn new(inner: Arc<dyn RemoteTaskStore>) -> Self {
        Self {
            inner,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Return the count so far and start again from zero.
    pub fn take_calls(&self) -> u64 {
        self.calls.swap(0, Ordering::SeqCst)
    }

    fn record(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteTaskStore for MeteredRemote {
    async fn get_task(&self, id: &str) -> Result<RemoteTask> {
        self.record();
        self.inner.get_task(id).await
    }

    async fn list_tasks(&self) -> Result<Vec<RemoteTask>> {
        self.record();
        self.inner.list_tasks().await
    }

    async fn close_task(&self, id: &str) -> Result<()> {
        self.record();
        self.inner.close_task(id).await
    }

    async fn update_task(&self, id: &str, update: &TaskUpdate) -> Result<()> {
        self.record();
        self.inner.update_task(id, update).await
    }
}

/// Kinds of calls recorded by [`InMemoryRemoteStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Get(String),
    List,
    Close(String),
    Update(String),
}

/// In-memory remote for testing, with a call log and scripted failures.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    tasks: Mutex<HashMap<String, RemoteTask>>,
    /// Ids that answer 403 to every call
    forbidden: Mutex<HashSet<String>>,
    /// One-shot failures consumed in order, per task id
    scripted: Mutex<HashMap<String, VecDeque<RemoteError>>>,
    /// Like `scripted`, but only consumed by close/update calls
    scripted_writes: Mutex<HashMap<String, VecDeque<RemoteError>>>,
    calls: Mutex<Vec<RemoteCall>>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: RemoteTask) {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
    }

    /// Insert an open task with the given content.
    pub fn insert_open(&self, id: &str, content: &str) {
        self.insert(RemoteTask {
            id: id.to_string(),
            content: content.to_string(),
            completed: false,
            due_date: None,
            completed_at: None,
        });
    }

    pub fn remove(&self, id: &str) {
        self.tasks.lock().unwrap().remove(id);
    }

    pub fn forbid(&self, id: &str) {
        self.forbidden.lock().unwrap().insert(id.to_string());
    }

    /// Make the next call touching `id` fail with `error`.
    pub fn fail_next(&self, id: &str, error: RemoteError) {
        self.scripted
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Make the next close or update of `id` fail with `error`. Reads are
    /// unaffected.
    pub fn fail_next_write(&self, id: &str, error: RemoteError) {
        self.scripted_writes
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Complete or reopen a task as if done in the remote app.
    pub fn set_completed(&self, id: &str, completed: bool, at: Option<DateTime<Utc>>) {
        if let Some(task) = self.tasks.lock().unwrap().get_mut(id) {
            task.completed = completed;
            task.completed_at = if completed { at } else { None };
        }
    }

    pub fn task(&self, id: &str) -> Option<RemoteTask> {
        self.tasks.lock().unwrap().get(id).cloned()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that touched `id` (bulk listings excluded).
    pub fn calls_for(&self, id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| match call {
                RemoteCall::Get(i) | RemoteCall::Close(i) | RemoteCall::Update(i) => i == id,
                RemoteCall::List => false,
            })
            .count()
    }

    pub fn count(&self, matches: impl Fn(&RemoteCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn check_write(&self, id: &str) -> Result<()> {
        if let Some(error) = self
            .scripted_writes
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        self.check(id)
    }

    fn check(&self, id: &str) -> Result<()> {
        if let Some(error) = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if self.forbidden.lock().unwrap().contains(id) {
            return Err(RemoteError::Forbidden(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTaskStore for InMemoryRemoteStore {
    async fn get_task(&self, id: &str) -> Result<RemoteTask> {
        self.calls.lock().unwrap().push(RemoteCall::Get(id.to_string()));
        self.check(id)?;
        self.task(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn list_tasks(&self) -> Result<Vec<RemoteTask>> {
        self.calls.lock().unwrap().push(RemoteCall::List);
        let forbidden = self.forbidden.lock().unwrap().clone();
        let mut tasks: Vec<RemoteTask> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| !forbidden.contains(&t.id))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn close_task(&self, id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(RemoteCall::Close(id.to_string()));
        self.check_write(id)?;
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        task.completed = true;
        task.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn update_task(&self, id: &str, update: &TaskUpdate) -> Result<()> {
        self.calls.lock().unwrap().push(RemoteCall::Update(id.to_string()));
        self.check_write(id)?;
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        if let Some(completed) = update.completed {
            task.completed = completed;
            if !completed {
                task.completed_at = None;
            }
        }
        if let Some(content) = &update.content {
            task.content = content.clone();
        }
        Ok(())
    }
}
