//! Chunked key-value writes with retry (C3): the DynamoDB-shaped abstraction
//! the engine writes `(web_uri) -> item attributes` through.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{AliasConfig, Settings};
use crate::error::KvError;
use crate::types::Item;

/// One KV record, shaped after the backend-native attribute schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvRecord {
    pub web_uri: String,
    pub from_date: String,
    pub object_key: String,
    pub content_type: Option<String>,
}

/// A batch of writes or deletes destined for one table.
#[derive(Debug, Clone)]
pub struct KvBatch {
    pub table: String,
    pub records: Vec<KvRecord>,
    pub delete: bool,
}

/// Backend abstraction so the engine is testable without a real DynamoDB-
/// compatible store. An implementor returns the subset of `web_uri` keys it
/// could *not* process, mirroring DynamoDB's `UnprocessedItems` contract.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn write_batch(&self, batch: &KvBatch) -> Result<Vec<String>, KvError>;
}

/// Retry shape for [`KvBatcher::write_batch`], structurally identical to the
/// exponential-backoff policy used for job retries elsewhere in this stack.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub backoff_coefficient: u32,
    pub initial_interval: Duration,
    pub maximum_interval: Option<Duration>,
    pub max_tries: u32,
}

impl RetryPolicy {
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let candidate = self.initial_interval * self.backoff_coefficient.saturating_pow(attempt.saturating_sub(1));
        match self.maximum_interval {
            Some(max) => std::cmp::min(candidate, max),
            None => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(250),
            maximum_interval: Some(Duration::from_secs(20)),
            max_tries: 20,
        }
    }
}

pub struct KvBatcher<'a> {
    store: &'a dyn KvStore,
    settings: &'a Settings,
    retry: RetryPolicy,
}

impl<'a> KvBatcher<'a> {
    pub fn new(store: &'a dyn KvStore, settings: &'a Settings) -> Self {
        Self {
            store,
            settings,
            retry: RetryPolicy {
                max_tries: settings.write_max_tries,
                ..RetryPolicy::default()
            },
        }
    }

    /// Resolve `(src, dest)` aliases for one URI, returning the original plus
    /// every matching aliased variant.
    fn alias_uris(uri: &str, aliases: &[AliasConfig]) -> Vec<String> {
        let mut out = vec![uri.to_string()];
        for alias in aliases {
            if let Some(rest) = uri.strip_prefix(alias.src.as_str()) {
                out.push(format!("{}{}", alias.dest, rest));
            }
        }
        out
    }

    /// Split `items` into chunks of `write_batch_size`, mirroring each item
    /// into its aliased URIs when `mirror_writes_enabled`. A batch may contain
    /// more physical records than `write_batch_size` due to mirroring; the
    /// backend-facing chunk size itself is never exceeded.
    pub fn get_batches(
        &self,
        table: &str,
        items: &[Item],
        aliases: &[AliasConfig],
        from_date: DateTime<Utc>,
        delete: bool,
    ) -> Vec<KvBatch> {
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let uris = if self.settings.mirror_writes_enabled {
                Self::alias_uris(&item.web_uri, aliases)
            } else {
                vec![item.web_uri.clone()]
            };
            for uri in uris {
                records.push(KvRecord {
                    web_uri: uri,
                    from_date: from_date.to_rfc3339(),
                    object_key: item.object_key.clone(),
                    content_type: item.content_type.clone(),
                });
            }
        }

        records
            .chunks(self.settings.write_batch_size)
            .map(|chunk| KvBatch {
                table: table.to_string(),
                records: chunk.to_vec(),
                delete,
            })
            .collect()
    }

    /// Submit `batch`, retrying unprocessed items with exponential backoff up
    /// to `write_max_tries`. Remaining unprocessed items after exhausting
    /// retries surface as a permanent error.
    #[tracing::instrument(skip(self, batch), fields(table = %batch.table, delete = batch.delete, size = batch.records.len()))]
    pub async fn write_batch(&self, batch: &KvBatch) -> Result<(), KvError> {
        let by_uri: HashMap<&str, &KvRecord> =
            batch.records.iter().map(|r| (r.web_uri.as_str(), r)).collect();

        let mut pending = batch.clone();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let unprocessed_keys = self.store.write_batch(&pending).await?;
            if unprocessed_keys.is_empty() {
                metrics::counter!("commit_kv_items_written_total")
                    .increment(pending.records.len() as u64);
                return Ok(());
            }

            if attempt >= self.retry.max_tries {
                metrics::counter!("commit_kv_unprocessed_total")
                    .increment(unprocessed_keys.len() as u64);
                return Err(KvError::UnprocessedAfterRetries(unprocessed_keys.len()));
            }

            let delay = self.retry.retry_interval(attempt);
            tracing::debug!(attempt, unprocessed = unprocessed_keys.len(), ?delay, "retrying unprocessed kv items");
            tokio::time::sleep(delay).await;

            pending.records = unprocessed_keys
                .iter()
                .filter_map(|k| by_uri.get(k.as_str()).map(|r| (*r).clone()))
                .collect();
        }
    }
}

/// AWS SDK-backed `KvStore` writing to a DynamoDB-compatible table.
pub struct DynamoKvStore {
    client: aws_sdk_dynamodb::Client,
}

impl DynamoKvStore {
    pub fn new(client: aws_sdk_dynamodb::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KvStore for DynamoKvStore {
    async fn write_batch(&self, batch: &KvBatch) -> Result<Vec<String>, KvError> {
        use aws_sdk_dynamodb::types::{
            AttributeValue, DeleteRequest, PutRequest, WriteRequest,
        };

        let requests: Vec<WriteRequest> = batch
            .records
            .iter()
            .map(|record| {
                if batch.delete {
                    WriteRequest::builder()
                        .delete_request(
                            DeleteRequest::builder()
                                .key("web_uri", AttributeValue::S(record.web_uri.clone()))
                                .key("from_date", AttributeValue::S(record.from_date.clone()))
                                .build()
                                .expect("key attributes always present"),
                        )
                        .build()
                } else {
                    let mut item = HashMap::new();
                    item.insert("web_uri".to_string(), AttributeValue::S(record.web_uri.clone()));
                    item.insert("from_date".to_string(), AttributeValue::S(record.from_date.clone()));
                    item.insert("object_key".to_string(), AttributeValue::S(record.object_key.clone()));
                    if let Some(ct) = &record.content_type {
                        item.insert("content_type".to_string(), AttributeValue::S(ct.clone()));
                    }
                    WriteRequest::builder()
                        .put_request(PutRequest::builder().set_item(Some(item)).build().expect("item always present"))
                        .build()
                }
            })
            .collect();

        let result = self
            .client
            .batch_write_item()
            .request_items(&batch.table, requests)
            .send()
            .await
            .map_err(|err| classify_dynamo_error(&err.to_string()))?;

        let unprocessed = result
            .unprocessed_items
            .unwrap_or_default()
            .get(&batch.table)
            .map(|reqs| {
                reqs.iter()
                    .filter_map(|r| {
                        r.put_request
                            .as_ref()
                            .and_then(|p| p.item.get("web_uri"))
                            .or_else(|| {
                                r.delete_request
                                    .as_ref()
                                    .and_then(|d| d.key.get("web_uri"))
                            })
                            .and_then(|v| v.as_s().ok())
                            .cloned()
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(unprocessed)
    }
}

fn classify_dynamo_error(message: &str) -> KvError {
    let lower = message.to_lowercase();
    if lower.contains("throttl") || lower.contains("provisionedthroughputexceeded") {
        KvError::Throttled
    } else if lower.contains("validationexception") {
        KvError::Validation(message.to_string())
    } else if lower.contains("accessdenied") || lower.contains("unauthorized") {
        KvError::Auth(message.to_string())
    } else {
        KvError::Transport(message.to_string())
    }
}

/// In-memory `KvStore` used by tests and the fake pipeline in integration
/// tests. Always fully processes its input; never reports unprocessed items.
#[derive(Default)]
pub struct InMemoryKvStore {
    pub tables: tokio::sync::Mutex<HashMap<String, HashMap<String, KvRecord>>>,
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn write_batch(&self, batch: &KvBatch) -> Result<Vec<String>, KvError> {
        let mut tables = self.tables.lock().await;
        let table = tables.entry(batch.table.clone()).or_default();
        for record in &batch.records {
            if batch.delete {
                table.remove(&record.web_uri);
            } else {
                table.insert(record.web_uri.clone(), record.clone());
            }
        }
        Ok(Vec::new())
    }
}
