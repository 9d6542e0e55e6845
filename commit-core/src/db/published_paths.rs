use crate::error::DbError;

/// Upsert `(env, web_uri, updated)`, bumping `updated` on repeat publishes of
/// the same path.
pub async fn upsert<'c, E>(executor: E, env: &str, web_uri: &str) -> Result<(), DbError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        "INSERT INTO published_paths (env, web_uri, updated) VALUES ($1, $2, now())
         ON CONFLICT (env, web_uri) DO UPDATE SET updated = EXCLUDED.updated",
    )
    .bind(env)
    .bind(web_uri)
    .execute(executor)
    .await?;
    Ok(())
}
