//! Phase 1: immutable bodies. Allowed while a publish is still accepting
//! uploads (`Pending`) or already committing (`Committing`); never flushes
//! the cache and never transitions the publish itself — phase 2 owns that.

use async_trait::async_trait;

use super::{CommitContext, CommitPhase, CommitTx, WrittenItem};
use crate::error::CommitError;
use crate::types::{CommitMode, PublishState};

const ALLOWED: &[PublishState] = &[PublishState::Pending, PublishState::Committing];

pub struct Phase1;

#[async_trait]
impl CommitPhase for Phase1 {
    fn mode(&self) -> CommitMode {
        CommitMode::Phase1
    }

    fn allowed_publish_states(&self) -> &'static [PublishState] {
        ALLOWED
    }

    fn filter_unresolved(&self) -> bool {
        true
    }

    async fn pre_write(&self, _ctx: &CommitContext, _tx: &mut CommitTx) -> Result<(), CommitError> {
        Ok(())
    }

    async fn on_succeeded(
        &self,
        _ctx: &CommitContext,
        _tx: &mut CommitTx,
        _written: &[WrittenItem],
    ) -> Result<(), CommitError> {
        Ok(())
    }

    async fn on_failed(
        &self,
        _ctx: &CommitContext,
        _tx: &mut CommitTx,
        _written: &[WrittenItem],
    ) -> Result<(), CommitError> {
        Ok(())
    }
}
