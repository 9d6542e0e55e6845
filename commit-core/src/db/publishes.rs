use uuid::Uuid;

use crate::error::DbError;
use crate::types::{Publish, PublishState};

pub async fn get_publish<'c, E>(executor: E, id: Uuid) -> Result<Publish, DbError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_as::<_, Publish>(
        "SELECT id, env, state, updated FROM publishes WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or(DbError::PublishNotFound(id))
}

pub async fn set_publish_state<'c, E>(
    executor: E,
    id: Uuid,
    state: PublishState,
) -> Result<(), DbError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query("UPDATE publishes SET state = $1, updated = now() WHERE id = $2")
        .bind(state)
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}
