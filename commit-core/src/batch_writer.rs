//! Bounded producer/consumer write pipeline (C2): a queue of [`KvBatch`]es
//! drained by a pool of worker tasks, each delegating to [`KvBatcher`].

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::error::WriteError;
use crate::kv::{KvBatch, KvBatcher, KvStore};

/// Append-only error list, written by workers and read once after `stop()`.
type ErrorList = Arc<Mutex<Vec<WriteError>>>;

/// A scoped resource wrapping a bounded channel and a worker pool. One
/// `BatchWriter` instance exists per phase-1/phase-2/rollback pass; it is not
/// reused across passes.
pub struct BatchWriter {
    sender: Option<mpsc::Sender<KvBatch>>,
    workers: Vec<JoinHandle<()>>,
    errors: ErrorList,
    progress: Arc<crate::progress::ProgressLogger>,
    queue_timeout: std::time::Duration,
}

impl BatchWriter {
    /// Spawn `settings.write_max_workers` worker tasks draining a channel of
    /// capacity `settings.write_queue_size`. Each worker writes or deletes
    /// (per `delete`) through `store`/`settings`'s retry policy.
    pub fn start(
        store: Arc<dyn KvStore>,
        settings: Arc<Settings>,
        delete: bool,
        progress: Arc<crate::progress::ProgressLogger>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<KvBatch>(settings.write_queue_size);
        let receiver = Arc::new(Mutex::new(receiver));
        let errors: ErrorList = Arc::new(Mutex::new(Vec::new()));
        let queue_timeout = settings.write_queue_timeout;

        let mut workers = Vec::with_capacity(settings.write_max_workers);
        for worker_id in 0..settings.write_max_workers {
            let receiver = receiver.clone();
            let store = store.clone();
            let settings = settings.clone();
            let errors = errors.clone();
            let progress = progress.clone();

            let span = tracing::Span::current();
            workers.push(tokio::spawn(async move {
                let _enter = span.enter();
                loop {
                    let batch = {
                        let mut guard = receiver.lock().await;
                        tokio::time::timeout(queue_timeout, guard.recv()).await
                    };

                    let batch = match batch {
                        Ok(Some(batch)) => batch,
                        // Sender dropped: end of stream, exit cleanly.
                        Ok(None) => break,
                        Err(_) => {
                            tracing::error!(worker_id, delete, "queue pop timed out with no sentinel observed");
                            errors.lock().await.push(WriteError::QueueTimeout(queue_timeout));
                            break;
                        }
                    };

                    let batcher = KvBatcher::new(store.as_ref(), settings.as_ref());
                    let size = batch.records.len();
                    match batcher.write_batch(&batch).await {
                        Ok(()) => {
                            progress.advance(size);
                        }
                        Err(err) => {
                            tracing::error!(event = "publish", success = false, error = %err, "batch write failed");
                            errors.lock().await.push(WriteError::Kv(err));
                            break;
                        }
                    }
                }
            }));
        }

        Self {
            sender: Some(sender),
            workers,
            errors,
            progress,
            queue_timeout,
        }
    }

    /// True once any worker has recorded an error. Callers MUST stop queueing
    /// further batches once this is true.
    pub async fn has_error(&self) -> bool {
        !self.errors.lock().await.is_empty()
    }

    /// Push `batch` onto the queue, bounded by `write_queue_timeout`. Returns
    /// an error (without pushing) if a worker has already failed, or if the
    /// push itself times out.
    pub async fn push(&self, batch: KvBatch) -> Result<(), WriteError> {
        if let Some(first) = self.errors.lock().await.first().cloned() {
            return Err(first);
        }

        let sender = self.sender.as_ref().expect("push called after stop");
        match tokio::time::timeout(self.queue_timeout, sender.send(batch)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(WriteError::QueueNotEmpty),
            Err(_) => {
                let err = WriteError::QueueTimeout(self.queue_timeout);
                self.errors.lock().await.push(WriteError::QueueTimeout(self.queue_timeout));
                Err(err)
            }
        }
    }

    /// Adjust the progress denominator, used when items are reclassified
    /// mid-stream (phase-2 items pulled out of a phase-1 partition).
    pub fn adjust_total(&self, delta: i64) {
        self.progress.adjust_total(delta);
    }

    /// Close the sender so every worker observes end-of-stream, join them
    /// all, and surface the first recorded error (if any). A queue that still
    /// holds entries after join (workers exited early on error) is itself
    /// recorded as `QueueNotEmpty`.
    pub async fn stop(mut self) -> Result<(), WriteError> {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }

        let mut errors = self.errors.lock().await;
        if let Some(first) = errors.drain(..).next() {
            return Err(first);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawSettings;
    use crate::kv::InMemoryKvStore;
    use chrono::Utc;
    use std::collections::HashMap;

    fn settings(queue_size: usize, workers: usize) -> Arc<Settings> {
        let mut raw = RawSettings::default();
        raw.write_queue_size = queue_size;
        raw.write_max_workers = workers;
        raw.write_batch_size = 2;
        Arc::new(Settings::from_parts(raw, HashMap::new(), HashMap::new()).unwrap())
    }

    fn batch(table: &str, n: usize) -> KvBatch {
        KvBatch {
            table: table.to_string(),
            records: (0..n)
                .map(|i| crate::kv::KvRecord {
                    web_uri: format!("/p/{i}"),
                    from_date: Utc::now().to_rfc3339(),
                    object_key: "k".to_string(),
                    content_type: None,
                })
                .collect(),
            delete: false,
        }
    }

    #[tokio::test]
    async fn drains_all_batches_and_reports_no_error() {
        let settings = settings(8, 2);
        let store = Arc::new(InMemoryKvStore::default());
        let progress = Arc::new(crate::progress::ProgressLogger::new(10));
        let writer = BatchWriter::start(store.clone(), settings, false, progress.clone());

        for _ in 0..5 {
            writer.push(batch("tbl", 2)).await.unwrap();
        }
        writer.stop().await.unwrap();

        let tables = store.tables.lock().await;
        assert_eq!(tables.get("tbl").unwrap().len(), 2);
        assert_eq!(progress.done(), 10);
    }

    #[tokio::test]
    async fn single_worker_still_drains_correctly() {
        let settings = settings(4, 1);
        let store = Arc::new(InMemoryKvStore::default());
        let progress = Arc::new(crate::progress::ProgressLogger::new(4));
        let writer = BatchWriter::start(store.clone(), settings, false, progress.clone());
        writer.push(batch("tbl", 2)).await.unwrap();
        writer.push(batch("tbl", 2)).await.unwrap();
        writer.stop().await.unwrap();
        assert_eq!(progress.done(), 4);
    }
}
