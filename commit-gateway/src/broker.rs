//! The narrow `JobSource` contract: `commit(publish_id, env, from_date,
//! commit_mode)`. No concrete broker wire protocol is implemented here — only
//! the polling interface the actor entry point drives against, plus an
//! in-memory implementation for tests and local running.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use commit_core::types::CommitMode;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One unit of work as delivered by the broker message.
#[derive(Debug, Clone)]
pub struct CommitJob {
    pub task_id: String,
    pub publish_id: Uuid,
    pub env: String,
    pub from_date: DateTime<Utc>,
    pub commit_mode: CommitMode,
}

#[async_trait]
pub trait JobSource: Send + Sync {
    /// Block (or poll) for the next job. `None` means no work is currently
    /// available; callers should back off and retry.
    async fn next_job(&self) -> Option<CommitJob>;
}

/// A trivial FIFO `JobSource` backed by a `Vec`, used for local running and
/// integration tests. `push` is the producer side a real broker integration
/// would replace with a Kafka/SQS/dramatiq-equivalent consumer loop.
#[derive(Default)]
pub struct InMemoryJobSource {
    queue: Mutex<VecDeque<CommitJob>>,
}

impl InMemoryJobSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, job: CommitJob) {
        self.queue.lock().await.push_back(job);
    }
}

#[async_trait]
impl JobSource for InMemoryJobSource {
    async fn next_job(&self) -> Option<CommitJob> {
        self.queue.lock().await.pop_front()
    }
}
