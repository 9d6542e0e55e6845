use uuid::Uuid;

use crate::error::DbError;
use crate::types::Item;

/// Fetch the next partition of dirty items for `publish_id`, ordered by
/// `web_uri`, locking the returned rows with `FOR UPDATE`. `after` is the
/// `web_uri` of the last row seen in the previous partition (keyset
/// pagination), or `None` for the first call. `phase1_only` additionally
/// filters out items with an empty `object_key`.
pub async fn next_dirty_partition<'c, E>(
    executor: E,
    publish_id: Uuid,
    after: Option<&str>,
    limit: i64,
    phase1_only: bool,
) -> Result<Vec<Item>, DbError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows = sqlx::query_as::<_, Item>(
        "SELECT id, publish_id, web_uri, object_key, content_type, link_to, dirty
         FROM items
         WHERE publish_id = $1
           AND dirty = TRUE
           AND ($2::text IS NULL OR web_uri > $2)
           AND (NOT $4 OR object_key != '')
         ORDER BY web_uri
         LIMIT $3
         FOR UPDATE",
    )
    .bind(publish_id)
    .bind(after)
    .bind(limit)
    .bind(phase1_only)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

/// `UPDATE items SET dirty = FALSE WHERE id = ANY($1)`, chunked by the caller
/// at `item_yield_size` so a single statement never covers an unbounded `IN`.
pub async fn mark_clean<'c, E>(executor: E, ids: &[Uuid]) -> Result<(), DbError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query("UPDATE items SET dirty = FALSE WHERE id = ANY($1)")
        .bind(ids)
        .execute(executor)
        .await?;
    Ok(())
}

/// Reload the full rows for a chunk of item IDs, used by rollback to rebuild
/// KV delete batches from `written_item_ids`.
pub async fn reload_by_ids<'c, E>(executor: E, ids: &[Uuid]) -> Result<Vec<Item>, DbError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query_as::<_, Item>(
        "SELECT id, publish_id, web_uri, object_key, content_type, link_to, dirty
         FROM items WHERE id = ANY($1)",
    )
    .bind(ids)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

pub async fn count_dirty<'c, E>(executor: E, publish_id: Uuid) -> Result<i64, DbError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM items WHERE publish_id = $1 AND dirty = TRUE",
    )
    .bind(publish_id)
    .fetch_one(executor)
    .await?;
    Ok(count.0)
}

pub async fn insert_item<'c, E>(executor: E, item: &Item) -> Result<(), DbError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        "INSERT INTO items (id, publish_id, web_uri, object_key, content_type, link_to, dirty)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(item.id)
    .bind(item.publish_id)
    .bind(&item.web_uri)
    .bind(&item.object_key)
    .bind(&item.content_type)
    .bind(&item.link_to)
    .bind(item.dirty)
    .execute(executor)
    .await?;
    Ok(())
}
