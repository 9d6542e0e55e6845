use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use commit_core::commit::phase1::Phase1;
use commit_core::commit::phase2::Phase2;
use commit_core::commit::{CommitContext, CommitEngine, CommitTx, NullAutoindexEnricher};
use commit_core::config::{EnvironmentConfig, RawSettings, Settings};
use commit_core::error::KvError;
use commit_core::flusher::NullVendorClient;
use commit_core::kv::{InMemoryKvStore, KvBatch, KvStore};
use commit_core::types::{Item, Publish, PublishState, Task, TaskState};
use sqlx::PgPool;
use uuid::Uuid;

fn env_config() -> EnvironmentConfig {
    EnvironmentConfig {
        name: "prod".to_string(),
        table: "prod-items".to_string(),
        cdn_url: None,
        cdn_key_id: None,
        cache_flush_rules: vec![],
        aliases: vec![],
    }
}

fn settings() -> Arc<Settings> {
    let mut envs = HashMap::new();
    envs.insert("prod".to_string(), env_config());
    Arc::new(Settings::from_parts(RawSettings::default(), envs, HashMap::new()).unwrap())
}

async fn seed_publish(pool: &PgPool, state: PublishState) -> Uuid {
    let id = Uuid::now_v7();
    sqlx::query("INSERT INTO publishes (id, env, state, updated) VALUES ($1, $2, $3, now())")
        .bind(id)
        .bind("prod")
        .bind(state)
        .execute(pool)
        .await
        .unwrap();
    id
}

async fn seed_task(pool: &PgPool, publish_id: Uuid, deadline: chrono::DateTime<Utc>) -> String {
    let id = Uuid::now_v7().to_string();
    sqlx::query(
        "INSERT INTO tasks (id, publish_id, state, updated, deadline) VALUES ($1, $2, $3, now(), $4)",
    )
    .bind(&id)
    .bind(publish_id)
    .bind(TaskState::NotStarted)
    .bind(deadline)
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn seed_item(pool: &PgPool, publish_id: Uuid, web_uri: &str, object_key: &str) -> Uuid {
    let id = Uuid::now_v7();
    sqlx::query(
        "INSERT INTO items (id, publish_id, web_uri, object_key, content_type, link_to, dirty)
         VALUES ($1, $2, $3, $4, NULL, NULL, TRUE)",
    )
    .bind(id)
    .bind(publish_id)
    .bind(web_uri)
    .bind(object_key)
    .execute(pool)
    .await
    .unwrap();
    id
}

fn ctx(
    pool: &PgPool,
    publish_id: Uuid,
    task_id: String,
    settings: Arc<Settings>,
    kv_store: Arc<dyn KvStore>,
) -> CommitContext {
    CommitContext {
        publish_id,
        env: "prod".to_string(),
        env_config: env_config(),
        task_id,
        from_date: Utc::now(),
        settings,
        pool: pool.clone(),
        kv_store,
        vendor: Arc::new(NullVendorClient),
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn empty_phase2_commit_completes_instantly(pool: PgPool) {
    let publish_id = seed_publish(&pool, PublishState::Committing).await;
    let task_id = seed_task(&pool, publish_id, Utc::now() + Duration::hours(2)).await;

    let settings = settings();
    let kv_store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::default());
    let engine = CommitEngine::new(
        ctx(&pool, publish_id, task_id.clone(), settings, kv_store),
        Box::new(Phase2::new(Arc::new(NullAutoindexEnricher))),
    );
    engine.run().await;

    let task = sqlx::query_as::<_, Task>(
        "SELECT id, publish_id, state, updated, deadline FROM tasks WHERE id = $1",
    )
    .bind(&task_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(task.state, TaskState::NotStarted);

    let publish = sqlx::query_as::<_, Publish>(
        "SELECT id, env, state, updated FROM publishes WHERE id = $1",
    )
    .bind(publish_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(publish.state, PublishState::Committed);
}

#[sqlx::test(migrations = "./migrations")]
async fn phase1_happy_path_writes_kv_and_clears_dirty(pool: PgPool) {
    let publish_id = seed_publish(&pool, PublishState::Pending).await;
    let task_id = seed_task(&pool, publish_id, Utc::now() + Duration::hours(2)).await;
    let item_id = seed_item(&pool, publish_id, "/content/dist/packages/foo.rpm", "abc123").await;

    let settings = settings();
    let kv_store = Arc::new(InMemoryKvStore::default());
    let dyn_store: Arc<dyn KvStore> = kv_store.clone();
    let engine = CommitEngine::new(
        ctx(&pool, publish_id, task_id.clone(), settings, dyn_store),
        Box::new(Phase1),
    );
    engine.run().await;

    let item = sqlx::query_as::<_, Item>(
        "SELECT id, publish_id, web_uri, object_key, content_type, link_to, dirty FROM items WHERE id = $1",
    )
    .bind(item_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(!item.dirty);

    let tables = kv_store.tables.lock().await;
    assert!(tables.get("prod-items").unwrap().contains_key("/content/dist/packages/foo.rpm"));

    let task = sqlx::query_as::<_, Task>(
        "SELECT id, publish_id, state, updated, deadline FROM tasks WHERE id = $1",
    )
    .bind(&task_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(task.state, TaskState::Complete);
}

#[sqlx::test(migrations = "./migrations")]
async fn phase2_autoindex_enricher_inserted_items_are_written(pool: PgPool) {
    let publish_id = seed_publish(&pool, PublishState::Committing).await;
    let task_id = seed_task(&pool, publish_id, Utc::now() + Duration::hours(2)).await;

    struct InsertingEnricher;

    #[async_trait]
    impl commit_core::commit::AutoindexEnricher for InsertingEnricher {
        async fn run(&self, ctx: &CommitContext, tx: &mut CommitTx) -> Result<(), String> {
            let item = Item {
                id: Uuid::now_v7(),
                publish_id: ctx.publish_id,
                web_uri: "/content/dist/repomd.xml".to_string(),
                object_key: "generated-key".to_string(),
                content_type: None,
                link_to: None,
                dirty: true,
            };
            commit_core::db::items::insert_item(&mut **tx, &item)
                .await
                .map_err(|e| e.to_string())
        }
    }

    let settings = settings();
    let kv_store = Arc::new(InMemoryKvStore::default());
    let dyn_store: Arc<dyn KvStore> = kv_store.clone();
    let engine = CommitEngine::new(
        ctx(&pool, publish_id, task_id.clone(), settings, dyn_store),
        Box::new(Phase2::new(Arc::new(InsertingEnricher))),
    );
    engine.run().await;

    let tables = kv_store.tables.lock().await;
    assert!(tables.get("prod-items").unwrap().contains_key("/content/dist/repomd.xml"));

    let published = sqlx::query_as::<_, commit_core::types::PublishedPath>(
        "SELECT env, web_uri, updated FROM published_paths WHERE web_uri = $1",
    )
    .bind("/content/dist/repomd.xml")
    .fetch_optional(&pool)
    .await
    .unwrap();
    assert!(published.is_some());
}

#[sqlx::test(migrations = "./migrations")]
async fn phase2_commit_writes_phase1_classified_items_first(pool: PgPool) {
    let publish_id = seed_publish(&pool, PublishState::Committing).await;
    let task_id = seed_task(&pool, publish_id, Utc::now() + Duration::hours(2)).await;
    let body_id = seed_item(&pool, publish_id, "/d/data.rpm", "body-key").await;
    let autoindex_id = seed_item(&pool, publish_id, "/d/.__exodus_autoindex", "index-key").await;

    let settings = settings();
    let kv_store = Arc::new(InMemoryKvStore::default());
    let dyn_store: Arc<dyn KvStore> = kv_store.clone();
    let engine = CommitEngine::new(
        ctx(&pool, publish_id, task_id.clone(), settings, dyn_store),
        Box::new(Phase2::new(Arc::new(NullAutoindexEnricher))),
    );
    engine.run().await;

    // Both the phase-1-classified body and the phase-2-classified autoindex
    // file are written in a standalone phase-2 commit, not just the latter.
    let tables = kv_store.tables.lock().await;
    let table = tables.get("prod-items").unwrap();
    assert!(table.contains_key("/d/data.rpm"));
    assert!(table.contains_key("/d/.__exodus_autoindex"));

    for id in [body_id, autoindex_id] {
        let item = sqlx::query_as::<_, Item>(
            "SELECT id, publish_id, web_uri, object_key, content_type, link_to, dirty FROM items WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(!item.dirty);
    }

    // The autoindex item's published path is the rewritten directory form,
    // not the raw file path.
    let published_dir = sqlx::query_as::<_, commit_core::types::PublishedPath>(
        "SELECT env, web_uri, updated FROM published_paths WHERE web_uri = $1",
    )
    .bind("/d/")
    .fetch_optional(&pool)
    .await
    .unwrap();
    assert!(published_dir.is_some());

    let published_raw = sqlx::query_as::<_, commit_core::types::PublishedPath>(
        "SELECT env, web_uri, updated FROM published_paths WHERE web_uri = $1",
    )
    .bind("/d/.__exodus_autoindex")
    .fetch_optional(&pool)
    .await
    .unwrap();
    assert!(published_raw.is_none());

    let task = sqlx::query_as::<_, Task>(
        "SELECT id, publish_id, state, updated, deadline FROM tasks WHERE id = $1",
    )
    .bind(&task_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(task.state, TaskState::Complete);

    let publish = sqlx::query_as::<_, Publish>(
        "SELECT id, env, state, updated FROM publishes WHERE id = $1",
    )
    .bind(publish_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(publish.state, PublishState::Committed);
}

struct AlwaysUnprocessedStore;

#[async_trait]
impl KvStore for AlwaysUnprocessedStore {
    async fn write_batch(&self, batch: &KvBatch) -> Result<Vec<String>, KvError> {
        Ok(batch.records.iter().map(|r| r.web_uri.clone()).collect())
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn kv_failure_mid_stream_triggers_rollback(pool: PgPool) {
    let publish_id = seed_publish(&pool, PublishState::Pending).await;
    let task_id = seed_task(&pool, publish_id, Utc::now() + Duration::hours(2)).await;
    let item_id = seed_item(&pool, publish_id, "/content/dist/packages/foo.rpm", "abc123").await;

    let mut raw = RawSettings::default();
    raw.write_max_tries = 1;
    let mut envs = HashMap::new();
    envs.insert("prod".to_string(), env_config());
    let settings = Arc::new(Settings::from_parts(raw, envs, HashMap::new()).unwrap());

    let kv_store: Arc<dyn KvStore> = Arc::new(AlwaysUnprocessedStore);
    let engine = CommitEngine::new(
        ctx(&pool, publish_id, task_id.clone(), settings, kv_store),
        Box::new(Phase1),
    );
    engine.run().await;

    let task = sqlx::query_as::<_, Task>(
        "SELECT id, publish_id, state, updated, deadline FROM tasks WHERE id = $1",
    )
    .bind(&task_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(task.state, TaskState::Failed);

    let item = sqlx::query_as::<_, Item>(
        "SELECT id, publish_id, web_uri, object_key, content_type, link_to, dirty FROM items WHERE id = $1",
    )
    .bind(item_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(item.dirty, "item must remain dirty after a failed commit");
}

#[sqlx::test(migrations = "./migrations")]
async fn expired_task_fails_without_any_writes(pool: PgPool) {
    let publish_id = seed_publish(&pool, PublishState::Pending).await;
    let task_id = seed_task(&pool, publish_id, Utc::now() - Duration::hours(1)).await;
    seed_item(&pool, publish_id, "/content/dist/packages/foo.rpm", "abc123").await;

    let settings = settings();
    let kv_store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::default());
    let engine = CommitEngine::new(
        ctx(&pool, publish_id, task_id.clone(), settings, kv_store),
        Box::new(Phase1),
    );
    engine.run().await;

    let task = sqlx::query_as::<_, Task>(
        "SELECT id, publish_id, state, updated, deadline FROM tasks WHERE id = $1",
    )
    .bind(&task_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(task.state, TaskState::Failed);
}
