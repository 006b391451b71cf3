//! Folds the event stream into positions and persists them with checkpoints.

use crate::metrics::PipelineMetrics;
use crate::onchain::types::WormEvent;
use crate::pipeline::PipelineError;
use crate::position::Position;
use crate::store::{Store, StoreError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, Instrument, Span};

pub struct Coordinator {
    store: Arc<dyn Store>,
    metrics: Arc<PipelineMetrics>,
    span: Span,
    /// Last persisted position; the accumulator state.
    current: Position,
}

impl Coordinator {
    /// Start from the most recently persisted position (origin if none).
    pub async fn seed(
        store: Arc<dyn Store>,
        metrics: Arc<PipelineMetrics>,
        span: Span,
    ) -> Result<Self, PipelineError> {
        let current = store.latest_position().await?;
        info!(
            parent: &span,
            id = current.id,
            block = current.block,
            x = current.x,
            y = current.y,
            direction = current.direction,
            "seeded position"
        );
        Ok(Self {
            store,
            metrics,
            span,
            current,
        })
    }

    pub fn current(&self) -> &Position {
        &self.current
    }

    /// Consume both channels until one closes or a write fails.
    ///
    /// Only returns with an error; the producers never close their side during
    /// normal operation.
    pub async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<WormEvent>,
        mut checkpoints_rx: mpsc::Receiver<u64>,
    ) -> Result<(), PipelineError> {
        let span = self.span.clone();
        async move {
            loop {
                tokio::select! {
                    checkpoint = checkpoints_rx.recv() => {
                        let block = checkpoint.ok_or(PipelineError::ChannelClosed("checkpoints"))?;
                        self.apply_checkpoint(block).await?;
                    }
                    event = events_rx.recv() => {
                        let event = event.ok_or(PipelineError::ChannelClosed("events"))?;
                        self.apply_event(event).await?;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Advance the accumulator by one event and persist the result.
    pub async fn apply_event(&mut self, event: WormEvent) -> Result<(), PipelineError> {
        info!(
            block = event.block,
            left_muscle = event.left_muscle,
            right_muscle = event.right_muscle,
            price = event.price,
            ts = %event.timestamp,
            "received worm event"
        );

        let mut next = self.current.advance(&event);
        next.id = self.store.save_position(&next).await?;
        self.metrics.record_position_saved();
        self.current = next;
        Ok(())
    }

    /// Persist a checkpoint. Re-announced blocks are not an error.
    pub async fn apply_checkpoint(&self, block: u64) -> Result<(), PipelineError> {
        match self.store.save_checkpoint(block).await {
            Ok(()) => {
                info!(block = block, "new block tracked");
                self.metrics.record_checkpoint_saved(block);
                Ok(())
            }
            Err(StoreError::DuplicateCheckpoint(block)) => {
                info!(block = block, "block already checked");
                self.metrics.record_duplicate_checkpoint();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
