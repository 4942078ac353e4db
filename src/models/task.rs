//! Task entity, identity, and partial-update models.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Entity type tag recorded on queue items addressing tasks.
pub const TASK_ENTITY: &str = "task";

/// Identity of a task: client-generated until the server assigns one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Identity {
    /// Placeholder minted by the client before the create is acknowledged.
    Temporary(Uuid),
    /// Server-assigned identifier.
    Permanent(String),
}

impl Identity {
    /// Mint a fresh temporary identity.
    #[must_use]
    pub fn new_temporary() -> Self {
        Self::Temporary(Uuid::new_v4())
    }

    /// Whether the server has not acknowledged this identity yet.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Storage discriminator, paired with [`value`](Self::value) in persisted rows.
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Temporary(_) => "temporary",
            Self::Permanent(_) => "permanent",
        }
    }

    /// Raw identifier without the kind discriminator.
    #[must_use]
    pub fn value(&self) -> String {
        match self {
            Self::Temporary(token) => token.to_string(),
            Self::Permanent(id) => id.clone(),
        }
    }

    /// Rebuild an identity from its persisted `(kind, value)` pair.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for an unknown kind or a malformed token.
    pub fn from_parts(kind: &str, value: &str) -> Result<Self> {
        match kind {
            "temporary" => Uuid::parse_str(value)
                .map(Self::Temporary)
                .map_err(|e| AppError::Db(format!("invalid temporary id {value}: {e}"))),
            "permanent" => Ok(Self::Permanent(value.to_owned())),
            other => Err(AppError::Db(format!("invalid identity kind: {other}"))),
        }
    }

    /// Key used for the local cache: `<kind>:<value>`.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.kind_str(), self.value())
    }

    /// Inverse of [`storage_key`](Self::storage_key).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the key has no kind discriminator or
    /// does not decode to an identity.
    pub fn from_storage_key(key: &str) -> Result<Self> {
        let (kind, value) = key
            .split_once(':')
            .ok_or_else(|| AppError::Storage(format!("malformed cache key: {key}")))?;
        Self::from_parts(kind, value)
            .map_err(|err| AppError::Storage(format!("malformed cache key {key}: {err}")))
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Temporary(token) => write!(f, "tmp-{token}"),
            Self::Permanent(id) => f.write_str(id),
        }
    }
}

/// Task priority.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Can wait.
    Low,
    /// Default priority.
    #[default]
    Medium,
    /// Needs attention first.
    High,
}

/// A task record as held by the optimistic store and the local cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    /// Temporary or permanent identity.
    pub id: Identity,
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
    #[serde(default)]
    pub tags: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last local or server modification.
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields for a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTask {
    /// Short title.
    pub title: String,
    /// Optional long-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Priority bucket.
    #[serde(default)]
    pub priority: Priority,
    /// Optional due date.
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewTask {
    /// New task with only a title.
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

impl Task {
    /// Build a task from caller fields with both timestamps set to `now`.
    #[must_use]
    pub fn from_new(id: Identity, fields: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: fields.title,
            description: fields.description,
            completed: false,
            priority: fields.priority,
            due_at: fields.due_at,
            tags: fields.tags,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the fields present in `patch`.
    pub fn apply(&mut self, patch: &TaskPatch) {
        if let Some(title) = &patch.title {
            title.clone_into(&mut self.title);
        }
        if let Some(description) = &patch.description {
            self.description.clone_from(description);
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(due_at) = patch.due_at {
            self.due_at = due_at;
        }
        if let Some(tags) = &patch.tags {
            self.tags.clone_from(tags);
        }
    }
}

/// Partial update: `None` leaves a field untouched.
///
/// Nullable fields use `Option<Option<_>>` so that `Some(None)` clears them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPatch {
    /// New title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New description, or `Some(None)` to clear.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub description: Option<Option<String>>,
    /// New completion flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    /// New priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// New due date, or `Some(None)` to clear.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub due_at: Option<Option<DateTime<Utc>>>,
    /// Replacement tag list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl TaskPatch {
    /// Whether the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Fold a later patch into this one; fields set in `newer` win.
    pub fn merge(&mut self, newer: Self) {
        if newer.title.is_some() {
            self.title = newer.title;
        }
        if newer.description.is_some() {
            self.description = newer.description;
        }
        if newer.completed.is_some() {
            self.completed = newer.completed;
        }
        if newer.priority.is_some() {
            self.priority = newer.priority;
        }
        if newer.due_at.is_some() {
            self.due_at = newer.due_at;
        }
        if newer.tags.is_some() {
            self.tags = newer.tags;
        }
    }

    /// Set the title.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set or clear the description.
    #[must_use]
    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = Some(description);
        self
    }

    /// Set the completion flag.
    #[must_use]
    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Distinguish an explicit `null` from an absent field.
fn double_option<'de, T, D>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
