use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the relational layer (publishes/items/tasks/published_paths).
#[derive(Error, Debug)]
pub enum DbError {
    #[error("connection failed: {0}")]
    Connection(#[from] sqlx::Error),
    #[error("publish {0} not found")]
    PublishNotFound(Uuid),
    #[error("task {0} not found")]
    TaskNotFound(String),
}

/// Errors surfaced by the KV batcher (`KvStore` implementations).
///
/// The transient/permanent split drives retry behavior in [`crate::kv::KvBatcher`]:
/// transient errors are retried up to `write_max_tries`, permanent errors fail the
/// batch immediately.
#[derive(Error, Debug, Clone)]
pub enum KvError {
    #[error("throttled by backend")]
    Throttled,
    #[error("{0} item(s) left unprocessed after exhausting retries")]
    UnprocessedAfterRetries(usize),
    #[error("backend validation error: {0}")]
    Validation(String),
    #[error("backend auth error: {0}")]
    Auth(String),
    #[error("backend transport error: {0}")]
    Transport(String),
}

impl KvError {
    /// True if this error represents a condition that may clear up on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::Throttled | KvError::Transport(_))
    }
}

/// Errors raised while draining a [`crate::batch_writer::BatchWriter`] queue.
#[derive(Error, Debug, Clone)]
pub enum WriteError {
    #[error("kv write failed: {0}")]
    Kv(#[from] KvError),
    #[error("timed out waiting {0:?} for queue capacity")]
    QueueTimeout(std::time::Duration),
    #[error("commit incomplete, queue not empty after stop()")]
    QueueNotEmpty,
}

/// Top-level error for a single commit attempt.
///
/// Every variant here is terminal for the commit: `CommitBase::run` catches
/// this exactly once, at the actor boundary, and converts it into a task/publish
/// state transition rather than propagating it to the caller.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("item {0} is missing an object_key (programmer bug, not user error)")]
    MissingObjectKey(String),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("autoindex enrichment failed: {0}")]
    Autoindex(String),
    #[error("task {0} passed its deadline before any writes occurred")]
    DeadlineExceeded(String),
}

/// Errors from loading layered configuration (INI file + env overrides).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid regex in {field}: {source}")]
    Regex {
        field: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("environment {0} is not configured")]
    UnknownEnvironment(String),
    #[error("cache flush rule {0} referenced by environment but not defined")]
    UnknownCacheFlushRule(String),
}
