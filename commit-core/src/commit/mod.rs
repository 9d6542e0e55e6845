//! The commit state machine (C4) and its phase-specific behavior (C5).
//!
//! `CommitEngine` drives the shared readiness-gate / write / rollback flow;
//! the varying parts (which publish states are acceptable, whether to filter
//! unresolved items, autoindex enrichment, cache flush, final state) are
//! supplied by a [`CommitPhase`] implementor — [`phase1::Phase1`] or
//! [`phase2::Phase2`].
//!
//! The whole attempt — readiness gates, write path, and rollback — runs
//! inside a single `sqlx::Transaction`, opened with `pool.begin()` before the
//! first gate and committed exactly once after the attempt finishes, success
//! or failure. This is what makes `next_dirty_partition`'s `FOR UPDATE` lock
//! actually serialize concurrent commits of the same publish: the lock is
//! held for the duration of the attempt rather than released the instant the
//! query that took it returns.

pub mod phase1;
pub mod phase2;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::batch_writer::BatchWriter;
use crate::config::{AliasConfig, EnvironmentConfig, Settings};
use crate::error::CommitError;
use crate::flusher::{Flusher, VendorClient};
use crate::kv::{KvBatcher, KvStore};
use crate::progress::ProgressLogger;
use crate::types::{CommitMode, Item, PublishState, TaskState};

/// A transaction held open for the lifetime of one commit attempt.
pub type CommitTx = Transaction<'static, Postgres>;

/// Everything a phase implementation needs to do its part of a commit,
/// gathered in one place so `CommitEngine::run` can pass it by reference.
pub struct CommitContext {
    pub publish_id: Uuid,
    pub env: String,
    pub env_config: EnvironmentConfig,
    pub task_id: String,
    pub from_date: DateTime<Utc>,
    pub settings: Arc<Settings>,
    pub pool: PgPool,
    pub kv_store: Arc<dyn KvStore>,
    pub vendor: Arc<dyn VendorClient>,
}

/// One item that made it onto the KV write queue during this commit, carried
/// forward so rollback can reload it by id and restate its uri for
/// cache-flush bookkeeping.
#[derive(Debug, Clone)]
pub struct WrittenItem {
    pub id: Uuid,
    pub web_uri: String,
}

/// Black-box autoindex enricher invoked once before phase-2 selection.
/// Implementations may insert additional `Item` rows for this publish;
/// `CommitEngine` picks those up in the subsequent partition scan. Runs
/// inside the commit's own transaction so an inserted row is immediately
/// visible to `next_dirty_partition` without waiting on a separate commit.
#[async_trait]
pub trait AutoindexEnricher: Send + Sync {
    async fn run(&self, ctx: &CommitContext, tx: &mut CommitTx) -> Result<(), String>;
}

pub struct NullAutoindexEnricher;

#[async_trait]
impl AutoindexEnricher for NullAutoindexEnricher {
    async fn run(&self, _ctx: &CommitContext, _tx: &mut CommitTx) -> Result<(), String> {
        Ok(())
    }
}

/// The varying behavior between phase 1 and phase 2.
#[async_trait]
pub trait CommitPhase: Send + Sync {
    fn mode(&self) -> CommitMode;
    fn allowed_publish_states(&self) -> &'static [PublishState];
    /// True for phase 1: items with an empty `object_key` are excluded from
    /// selection rather than reaching the write path.
    fn filter_unresolved(&self) -> bool;

    async fn pre_write(&self, ctx: &CommitContext, tx: &mut CommitTx) -> Result<(), CommitError>;

    /// Called once writes for this commit have drained successfully, with
    /// every item this commit queued (used by phase 2 to build the
    /// cache-flush list and `published_paths` upserts).
    async fn on_succeeded(
        &self,
        ctx: &CommitContext,
        tx: &mut CommitTx,
        written: &[WrittenItem],
    ) -> Result<(), CommitError>;

    /// Called after rollback deletes have been issued, with the same written
    /// set (used by phase 2 to attempt edge restoration).
    async fn on_failed(
        &self,
        ctx: &CommitContext,
        tx: &mut CommitTx,
        written: &[WrittenItem],
    ) -> Result<(), CommitError>;
}

pub struct CommitEngine {
    ctx: CommitContext,
    phase: Box<dyn CommitPhase>,
}

impl CommitEngine {
    pub fn new(ctx: CommitContext, phase: Box<dyn CommitPhase>) -> Self {
        Self { ctx, phase }
    }

    fn aliases(&self) -> Vec<AliasConfig> {
        if self.ctx.settings.mirror_writes_enabled {
            self.ctx.env_config.aliases.clone()
        } else {
            Vec::new()
        }
    }

    /// Readiness gate 1: task not terminal and not past its deadline.
    async fn task_ready(&self, tx: &mut CommitTx, now: DateTime<Utc>) -> Result<bool, CommitError> {
        let task = crate::db::tasks::get_task(&mut **tx, &self.ctx.task_id).await?;
        if task.state.is_terminal() {
            return Ok(false);
        }
        if task.is_past_deadline(now) {
            crate::db::tasks::set_task_state(&mut **tx, &self.ctx.task_id, TaskState::Failed).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Readiness gate 2: publish is in a state this phase is allowed to act on.
    async fn publish_ready(&self, tx: &mut CommitTx) -> Result<bool, CommitError> {
        let publish = crate::db::publishes::get_publish(&mut **tx, self.ctx.publish_id).await?;
        if !self.phase.allowed_publish_states().contains(&publish.state) {
            crate::db::tasks::set_task_state(&mut **tx, &self.ctx.task_id, TaskState::Failed).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Readiness gate 3: there is at least one dirty item to act on, evaluated
    /// after `pre_write` so phase-2 autoindex enrichment gets a chance to
    /// insert rows even when the publish had nothing dirty going in. An empty
    /// commit is instant success.
    async fn has_items(&self, tx: &mut CommitTx) -> Result<bool, CommitError> {
        let count = crate::db::items::count_dirty(&mut **tx, self.ctx.publish_id).await?;
        if count == 0 {
            self.phase.on_succeeded(&self.ctx, tx, &[]).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Drive the full readiness-gate / write / rollback flow for one commit
    /// attempt. Never surfaces an error to the caller: every failure is
    /// absorbed into task/publish state, which is the sole durable record of
    /// outcome. Opens one transaction for the whole attempt and commits it
    /// exactly once, regardless of which path below was taken.
    pub async fn run(self) {
        let mut tx = match self.ctx.pool.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                tracing::error!(task_id = %self.ctx.task_id, error = %err, "failed to open commit transaction");
                return;
            }
        };

        self.run_attempt(&mut tx).await;

        if let Err(err) = tx.commit().await {
            tracing::error!(task_id = %self.ctx.task_id, error = %err, "failed to commit transaction");
        }
    }

    async fn run_attempt(&self, tx: &mut CommitTx) {
        let now = Utc::now();

        match self.task_ready(tx, now).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::error!(task_id = %self.ctx.task_id, error = %err, "failed evaluating task readiness");
                return;
            }
        }

        match self.publish_ready(tx).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::error!(task_id = %self.ctx.task_id, error = %err, "failed evaluating publish readiness");
                return;
            }
        }

        // Run pre_write (phase-2 autoindex enrichment) before counting dirty
        // items: enrichment may insert the only items this commit will act on.
        if let Err(err) = self.phase.pre_write(&self.ctx, tx).await {
            self.rollback(tx, &[], &err).await;
            return;
        }

        match self.has_items(tx).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::error!(task_id = %self.ctx.task_id, error = %err, "failed on empty-commit fast path");
                return;
            }
        }

        if let Err(err) =
            crate::db::tasks::set_task_state(&mut **tx, &self.ctx.task_id, TaskState::InProgress).await
        {
            tracing::error!(task_id = %self.ctx.task_id, error = %err, "failed to mark task in progress");
            return;
        }

        match self.write_path(tx).await {
            Ok(written) => {
                if let Err(err) = self.phase.on_succeeded(&self.ctx, tx, &written).await {
                    self.rollback(tx, &written, &err).await;
                }
            }
            Err((written, err)) => {
                self.rollback(tx, &written, &err).await;
            }
        }
    }

    /// The write path. Phase 1 writes only its own classified items, in one
    /// pass. Phase 2 writes in two ordered passes: phase-1-classified items
    /// first (still-dirty bodies a standalone phase-2 commit must flush too),
    /// then phase-2-classified items — each pass a fully-drained `BatchWriter`
    /// scope, so every body is durable before any entry point is written.
    async fn write_path(&self, tx: &mut CommitTx) -> Result<Vec<WrittenItem>, (Vec<WrittenItem>, CommitError)> {
        let modes: &[CommitMode] = match self.phase.mode() {
            CommitMode::Phase1 => &[CommitMode::Phase1],
            CommitMode::Phase2 => &[CommitMode::Phase1, CommitMode::Phase2],
        };

        let mut written: Vec<WrittenItem> = Vec::new();
        for &target in modes {
            match self.write_pass(tx, target).await {
                Ok(mut pass) => written.append(&mut pass),
                Err((mut pass, err)) => {
                    written.append(&mut pass);
                    return Err((written, err));
                }
            }
        }

        if let Err(err) =
            crate::db::tasks::set_task_state(&mut **tx, &self.ctx.task_id, TaskState::Complete).await
        {
            return Err((written, CommitError::from(err)));
        }

        Ok(written)
    }

    /// One partitioned selection + classification + queueing pass over every
    /// item still dirty for this publish, keeping only the ones that classify
    /// as `target`. Items written and marked clean by an earlier pass in the
    /// same transaction no longer show up here, so the cursor naturally
    /// narrows to whatever `target` pass is currently running.
    async fn write_pass(
        &self,
        tx: &mut CommitTx,
        target: CommitMode,
    ) -> Result<Vec<WrittenItem>, (Vec<WrittenItem>, CommitError)> {
        let table = self.ctx.env_config.table.clone();
        let aliases = self.aliases();

        let total = crate::db::items::count_dirty(&mut **tx, self.ctx.publish_id)
            .await
            .unwrap_or(0);
        let progress = Arc::new(ProgressLogger::new(total as usize));
        let writer = BatchWriter::start(
            self.ctx.kv_store.clone(),
            self.ctx.settings.clone(),
            false,
            progress.clone(),
        );

        let mut written: Vec<WrittenItem> = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let partition = match crate::db::items::next_dirty_partition(
                &mut **tx,
                self.ctx.publish_id,
                after.as_deref(),
                self.ctx.settings.item_yield_size as i64,
                self.phase.filter_unresolved(),
            )
            .await
            {
                Ok(p) => p,
                Err(err) => return Err((written, CommitError::from(err))),
            };

            if partition.is_empty() {
                break;
            }
            after = Some(partition.last().unwrap().web_uri.clone());

            let mut to_write: Vec<Item> = Vec::with_capacity(partition.len());
            for item in partition {
                if let Err(err) = item.check() {
                    return Err((written, err));
                }
                let mode = crate::classifier::ItemClassifier::classify(&item, &self.ctx.settings);
                if mode == target {
                    written.push(WrittenItem {
                        id: item.id,
                        web_uri: item.web_uri.clone(),
                    });
                    to_write.push(item);
                } else {
                    progress.adjust_total(-1);
                }
            }

            if to_write.is_empty() {
                continue;
            }

            let batcher = KvBatcher::new(self.ctx.kv_store.as_ref(), &self.ctx.settings);
            let batches = batcher.get_batches(&table, &to_write, &aliases, self.ctx.from_date, false);
            for batch in batches {
                if writer.has_error().await {
                    break;
                }
                if let Err(err) = writer.push(batch).await {
                    return Err((written, CommitError::from(err)));
                }
            }
        }

        if let Err(err) = writer.stop().await {
            return Err((written, CommitError::from(err)));
        }

        let ids: Vec<Uuid> = written.iter().map(|w| w.id).collect();
        for chunk in ids.chunks(self.ctx.settings.item_yield_size) {
            if let Err(err) = crate::db::items::mark_clean(&mut **tx, chunk).await {
                return Err((written, CommitError::from(err)));
            }
        }

        Ok(written)
    }

    /// Rollback: reload written items in chunks, stream them through a
    /// delete-mode `BatchWriter` mirrored into the same aliases the forward
    /// write used, then run the phase's failure hook. Never propagates
    /// further; the task's terminal state is the sole durable record of the
    /// outcome.
    async fn rollback(&self, tx: &mut CommitTx, written: &[WrittenItem], cause: &CommitError) {
        tracing::error!(
            task_id = %self.ctx.task_id,
            publish_id = %self.ctx.publish_id,
            event = "publish",
            success = false,
            error = %cause,
            "commit failed, rolling back"
        );

        if !written.is_empty() {
            let ids: Vec<Uuid> = written.iter().map(|w| w.id).collect();
            let progress = Arc::new(ProgressLogger::new(written.len()));
            let writer = BatchWriter::start(
                self.ctx.kv_store.clone(),
                self.ctx.settings.clone(),
                true,
                progress,
            );
            let table = self.ctx.env_config.table.clone();
            let batcher = KvBatcher::new(self.ctx.kv_store.as_ref(), &self.ctx.settings);
            let aliases = self.aliases();

            for chunk in ids.chunks(self.ctx.settings.item_yield_size) {
                let reloaded = match crate::db::items::reload_by_ids(&mut **tx, chunk).await {
                    Ok(items) => items,
                    Err(err) => {
                        tracing::error!(error = %err, "failed reloading items for rollback delete");
                        continue;
                    }
                };
                let batches =
                    batcher.get_batches(&table, &reloaded, &aliases, self.ctx.from_date, true);
                for batch in batches {
                    let _ = writer.push(batch).await;
                }
            }
            let _ = writer.stop().await;
        }

        if let Err(err) = self.phase.on_failed(&self.ctx, tx, written).await {
            tracing::error!(task_id = %self.ctx.task_id, error = %err, "on_failed hook itself failed");
        }

        if let Err(err) =
            crate::db::tasks::set_task_state(&mut **tx, &self.ctx.task_id, TaskState::Failed).await
        {
            tracing::error!(task_id = %self.ctx.task_id, error = %err, "failed to mark task failed after rollback");
        }
    }

    pub fn flusher<'a>(
        &'a self,
        rules: &'a std::collections::HashMap<String, crate::flusher::CacheFlushRule>,
    ) -> Flusher<'a> {
        Flusher::new(rules, self.ctx.vendor.as_ref())
    }
}
