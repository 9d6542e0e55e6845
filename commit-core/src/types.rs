use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum PublishState {
    Pending,
    Committing,
    Committed,
    Failed,
}

impl FromStr for PublishState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "committing" => Ok(Self::Committing),
            "committed" => Ok(Self::Committed),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TaskState {
    NotStarted,
    InProgress,
    Complete,
    Failed,
}

impl TaskState {
    /// Terminal states are absorbing: once reached, a task never transitions again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed)
    }
}

impl FromStr for TaskState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommitMode {
    Phase1,
    Phase2,
}

impl Default for CommitMode {
    fn default() -> Self {
        CommitMode::Phase2
    }
}

impl FromStr for CommitMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phase1" => Ok(Self::Phase1),
            "phase2" => Ok(Self::Phase2),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Deserialize, Serialize)]
pub struct Publish {
    pub id: Uuid,
    pub env: String,
    pub state: PublishState,
    pub updated: DateTime<Utc>,
}

/// One (web_uri, object_key) binding belonging to a publish.
///
/// `dirty` is true from creation until the commit that writes the row to KV
/// marks it false; `link_to` items with an unresolved `object_key` are skipped
/// by phase-1 selection.
#[derive(Debug, Clone, sqlx::FromRow, Deserialize, Serialize)]
pub struct Item {
    pub id: Uuid,
    pub publish_id: Uuid,
    pub web_uri: String,
    pub object_key: String,
    pub content_type: Option<String>,
    pub link_to: Option<String>,
    pub dirty: bool,
}

impl Item {
    /// Last chance to verify an item before it reaches the KV write path.
    ///
    /// Incoming items are always validated to have either `object_key` or
    /// `link_to` (with `link_to` resolved to an `object_key` before enqueue),
    /// so an empty `object_key` here is always a bug upstream, never bad
    /// client input.
    pub fn check(&self) -> Result<(), crate::error::CommitError> {
        if self.object_key.is_empty() {
            return Err(crate::error::CommitError::MissingObjectKey(
                self.web_uri.clone(),
            ));
        }
        Ok(())
    }
}

/// `CommitTask`: identified by the broker message ID.
#[derive(Debug, Clone, sqlx::FromRow, Deserialize, Serialize)]
pub struct Task {
    pub id: String,
    pub publish_id: Uuid,
    pub state: TaskState,
    pub updated: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl Task {
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline < now
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Deserialize, Serialize)]
pub struct PublishedPath {
    pub env: String,
    pub web_uri: String,
    pub updated: DateTime<Utc>,
}
