//! Phase 2: mutable entry points. Runs only once a publish is `Committing`,
//! after phase 1 has fully drained (the happens-before boundary is enforced
//! by the caller opening a fresh `CommitEngine` only once the phase-1 one has
//! returned). Runs autoindex enrichment before selection, and owns the
//! publish's terminal state plus cache invalidation.

use std::sync::Arc;

use async_trait::async_trait;

use super::{AutoindexEnricher, CommitContext, CommitPhase, CommitTx, WrittenItem};
use crate::error::CommitError;
use crate::flusher::{FlushRequest, Flusher};
use crate::types::{CommitMode, PublishState};

const ALLOWED: &[PublishState] = &[PublishState::Committing];

/// Default immediate-invalidation ttl substituted into `CacheFlushRule`
/// templates; this engine does not support scheduled (non-zero) TTL flushes.
const FLUSH_TTL: &str = "0";

pub struct Phase2 {
    enricher: Arc<dyn AutoindexEnricher>,
}

impl Phase2 {
    pub fn new(enricher: Arc<dyn AutoindexEnricher>) -> Self {
        Self { enricher }
    }

    /// Build the flush-path list for a set of written uris: if the basename
    /// is the autoindex filename, flush the containing directory (with
    /// trailing slash) instead of the file itself.
    fn flush_paths(ctx: &CommitContext, written: &[WrittenItem]) -> Vec<String> {
        written
            .iter()
            .map(|w| {
                let path = std::path::Path::new(&w.web_uri);
                let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if basename == ctx.settings.autoindex_filename {
                    let dir = path.parent().and_then(|p| p.to_str()).unwrap_or("/");
                    format!("{}/", dir.trim_end_matches('/'))
                } else {
                    w.web_uri.clone()
                }
            })
            .collect()
    }

    async fn flush(ctx: &CommitContext, written: &[WrittenItem]) {
        if !ctx.settings.cdn_flush_on_commit || written.is_empty() {
            return;
        }
        let paths = Self::flush_paths(ctx, written);
        let flusher = Flusher::new(&ctx.settings.cache_flush_rules, ctx.vendor.as_ref());
        let request = FlushRequest {
            env: ctx.env.clone(),
            paths,
            ttl: FLUSH_TTL.to_string(),
        };
        if let Err(err) = flusher.run(&ctx.env_config, &request).await {
            tracing::warn!(error = %err, "cache flush failed, commit outcome is unaffected");
        }
    }
}

#[async_trait]
impl CommitPhase for Phase2 {
    fn mode(&self) -> CommitMode {
        CommitMode::Phase2
    }

    fn allowed_publish_states(&self) -> &'static [PublishState] {
        ALLOWED
    }

    fn filter_unresolved(&self) -> bool {
        false
    }

    async fn pre_write(&self, ctx: &CommitContext, tx: &mut CommitTx) -> Result<(), CommitError> {
        self.enricher
            .run(ctx, tx)
            .await
            .map_err(CommitError::Autoindex)
    }

    async fn on_succeeded(
        &self,
        ctx: &CommitContext,
        tx: &mut CommitTx,
        written: &[WrittenItem],
    ) -> Result<(), CommitError> {
        Self::flush(ctx, written).await;

        // Published paths are built from the same autoindex-directory
        // rewrite the cache flush uses, not the raw queued uri, so an
        // autoindex file's published path is the directory form.
        for path in Self::flush_paths(ctx, written) {
            for uri in Flusher::expand_aliases(&path, &ctx.env_config.aliases) {
                crate::db::published_paths::upsert(&mut **tx, &ctx.env, &uri).await?;
            }
        }

        crate::db::publishes::set_publish_state(&mut **tx, ctx.publish_id, PublishState::Committed).await?;
        Ok(())
    }

    async fn on_failed(
        &self,
        ctx: &CommitContext,
        tx: &mut CommitTx,
        written: &[WrittenItem],
    ) -> Result<(), CommitError> {
        Self::flush(ctx, written).await;
        crate::db::publishes::set_publish_state(&mut **tx, ctx.publish_id, PublishState::Failed).await?;
        Ok(())
    }
}
