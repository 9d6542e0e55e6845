//! The relational layer: publishes, items, tasks, published paths.
//!
//! Every function takes a generic `sqlx::Executor` so callers can run inside
//! either a bare `PgPool` or an open `Transaction`. In practice the commit
//! engine always passes a `Transaction` held for the duration of one attempt
//! — that's what makes `items::next_dirty_partition`'s `FOR UPDATE` lock
//! actually serialize concurrent commits of the same publish, rather than
//! releasing the instant the query that took it returns. Queries are built
//! with `sqlx::query`/`query_as` rather than the compile-time `query!` macros,
//! since this crate has no `DATABASE_URL`/offline cache available at build
//! time.

pub mod items;
pub mod published_paths;
pub mod publishes;
pub mod tasks;
