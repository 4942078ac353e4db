//! Remote task API seam and its HTTP implementation.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::mutation::{MutationKind, MutationOp, MutationRecord};
use crate::models::task::{Identity, Priority, Task};
use crate::{AppError, Result};

/// Header carrying the queue item id so the server can drop replays.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// What the server returned for an accepted mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Update or delete applied.
    Applied,
    /// Create applied; carries the task under its permanent identity.
    Created(Task),
}

/// Idempotent delivery of queue items plus the full-collection fetch.
///
/// `send` must fail with [`AppError::Conflict`] when the server reports a
/// concurrent change, and with another variant for transient failures.
pub trait Transport: Send + Sync {
    /// Deliver one mutation.
    fn send<'a>(&'a self, item: &'a MutationRecord) -> BoxFuture<'a, Result<SendOutcome>>;

    /// Fetch the server's full task collection.
    fn fetch_all(&self) -> BoxFuture<'_, Result<Vec<Task>>>;
}

/// Task representation on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireTask {
    /// Server identifier.
    pub id: String,
    /// Short title.
    pub title: String,
    /// Optional long-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Completion flag.
    #[serde(default)]
    pub completed: bool,
    /// Priority bucket.
    #[serde(default)]
    pub priority: Priority,
    /// Optional due date.
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl From<WireTask> for Task {
    fn from(wire: WireTask) -> Self {
        Self {
            id: Identity::Permanent(wire.id),
            title: wire.title,
            description: wire.description,
            completed: wire.completed,
            priority: wire.priority,
            due_at: wire.due_at,
            tags: wire.tags,
            created_at: wire.created_at,
            updated_at: wire.updated_at,
        }
    }
}

/// Body of `POST /tasks`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateTaskBody {
    /// Client-side temporary token, echoed for correlation.
    pub client_id: String,
    /// Short title.
    pub title: String,
    /// Optional long-form description.
    pub description: Option<String>,
    /// Completion flag.
    pub completed: bool,
    /// Priority bucket.
    pub priority: Priority,
    /// Optional due date.
    pub due_at: Option<DateTime<Utc>>,
    /// Free-form labels.
    pub tags: Vec<String>,
    /// Local creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for CreateTaskBody {
    fn from(task: &Task) -> Self {
        Self {
            client_id: task.id.value(),
            title: task.title.clone(),
            description: task.description.clone(),
            completed: task.completed,
            priority: task.priority,
            due_at: task.due_at,
            tags: task.tags.clone(),
            created_at: task.created_at,
        }
    }
}

/// [`Transport`] speaking JSON over HTTP to the task API.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransport {
    /// Create a transport for `base_url` with an optional bearer token.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token,
        }
    }

    fn tasks_url(&self, id: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/tasks", self.base_url))
            .map_err(|err| AppError::Config(format!("invalid server_url: {err}")))?;
        if let Some(id) = id {
            url.path_segments_mut()
                .map_err(|()| AppError::Config("server_url cannot be a base".into()))?
                .push(id);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_item(&self, item: &MutationRecord) -> Result<SendOutcome> {
        let permanent_id = match &item.entity_id {
            Identity::Permanent(id) => Some(id.as_str()),
            Identity::Temporary(_) => None,
        };

        let builder = match (&item.op, permanent_id) {
            (MutationOp::Create(task), _) => self
                .request(Method::POST, self.tasks_url(None)?)
                .json(&CreateTaskBody::from(task)),
            (MutationOp::Update(patch), Some(id)) => self
                .request(Method::PATCH, self.tasks_url(Some(id))?)
                .json(patch),
            (MutationOp::Delete, Some(id)) => {
                self.request(Method::DELETE, self.tasks_url(Some(id))?)
            }
            (_, None) => {
                return Err(AppError::Transport(format!(
                    "{} still addresses unresolved {}",
                    item.id, item.entity_id
                )));
            }
        };

        let response = builder
            .header(IDEMPOTENCY_HEADER, &item.id)
            .send()
            .await?;
        let status = response.status();
        debug!(item_id = %item.id, %status, "mutation response");

        classify(item.kind(), status)?;
        if item.kind() == MutationKind::Create {
            let created: WireTask = response.json().await?;
            Ok(SendOutcome::Created(created.into()))
        } else {
            Ok(SendOutcome::Applied)
        }
    }

    async fn fetch_tasks(&self) -> Result<Vec<Task>> {
        let response = self
            .request(Method::GET, self.tasks_url(None)?)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Transport(format!("fetch returned {status}")));
        }
        let tasks: Vec<WireTask> = response.json().await?;
        Ok(tasks.into_iter().map(Task::from).collect())
    }
}

/// Map an HTTP status to the error taxonomy.
fn classify(kind: MutationKind, status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    match (kind, status) {
        (_, StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED) => {
            Err(AppError::Conflict(format!("server returned {status}")))
        }
        (MutationKind::Update, StatusCode::NOT_FOUND | StatusCode::GONE) => {
            Err(AppError::Conflict("entity deleted on the server".into()))
        }
        // Already gone is the outcome a delete wanted.
        (MutationKind::Delete, StatusCode::NOT_FOUND | StatusCode::GONE) => Ok(()),
        _ => Err(AppError::Transport(format!("server returned {status}"))),
    }
}

impl Transport for HttpTransport {
    fn send<'a>(&'a self, item: &'a MutationRecord) -> BoxFuture<'a, Result<SendOutcome>> {
        Box::pin(self.send_item(item))
    }

    fn fetch_all(&self) -> BoxFuture<'_, Result<Vec<Task>>> {
        Box::pin(self.fetch_tasks())
    }
}
