use uuid::Uuid;

use crate::error::DbError;
use crate::types::{Task, TaskState};

pub async fn get_task<'c, E>(executor: E, id: &str) -> Result<Task, DbError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_as::<_, Task>(
        "SELECT id, publish_id, state, updated, deadline FROM tasks WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| DbError::TaskNotFound(id.to_string()))
}

/// Transition a task's state. Terminal states are absorbing; callers are
/// responsible for not calling this again once a task is `Complete`/`Failed`.
pub async fn set_task_state<'c, E>(
    executor: E,
    id: &str,
    state: TaskState,
) -> Result<(), DbError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query("UPDATE tasks SET state = $1, updated = now() WHERE id = $2")
        .bind(state)
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn insert_task<'c, E>(
    executor: E,
    id: &str,
    publish_id: Uuid,
    deadline: chrono::DateTime<chrono::Utc>,
) -> Result<(), DbError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        "INSERT INTO tasks (id, publish_id, state, updated, deadline) VALUES ($1, $2, $3, now(), $4)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(id)
    .bind(publish_id)
    .bind(TaskState::NotStarted)
    .bind(deadline)
    .execute(executor)
    .await?;
    Ok(())
}
