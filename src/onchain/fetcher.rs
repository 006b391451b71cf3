//! Checkpointed log fetcher.
//!
//! Walks `[start, head]` in batches of `batch_size` blocks and, for every
//! range it gets through:
//! - sends each decoded, non-zero-movement event on the events channel, in
//!   block order then log order
//! - sends the range's upper bound on the checkpoints channel
//!
//! Some RPC nodes refuse ranges inconsistently. When a range is rejected the
//! fetcher drops to single-block queries for the same cursor, and goes back to
//! the default batch size after the next success. A single block that is still
//! rejected on its own is logged and skipped.
//!
//! `fetch` returns once the head read at the start of the call is reached;
//! the supervisor re-invokes it after a cooldown to pick up new blocks.

use crate::config::ChainConfig;
use crate::metrics::PipelineMetrics;
use crate::onchain::source::{EventSource, SourceError};
use crate::onchain::types::WormEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
}

/// Scan parameters.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Block scanned from when there is nothing to resume from
    pub start_block: u64,
    /// Default number of blocks per query
    pub batch_size: u64,
    /// Pause between queries
    pub batch_delay: Duration,
}

impl From<&ChainConfig> for FetcherConfig {
    fn from(chain: &ChainConfig) -> Self {
        Self {
            start_block: chain.start_block,
            batch_size: chain.batch_size,
            batch_delay: chain.batch_delay(),
        }
    }
}

/// Outcome of one `fetch` invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchSummary {
    pub from_block: u64,
    pub head: u64,
    pub ranges: usize,
    pub events: usize,
    pub skipped_blocks: Vec<u64>,
}

pub struct LogFetcher {
    source: Arc<dyn EventSource>,
    config: FetcherConfig,
    metrics: Arc<PipelineMetrics>,
    /// Highest checkpoint sent by this process.
    last_checkpoint: AtomicU64,
}

impl LogFetcher {
    pub fn new(
        source: Arc<dyn EventSource>,
        config: FetcherConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            source,
            config,
            metrics,
            last_checkpoint: AtomicU64::new(0),
        }
    }

    /// Highest block this fetcher has announced as scanned, 0 if none.
    pub fn last_checkpoint(&self) -> u64 {
        self.last_checkpoint.load(Ordering::SeqCst)
    }

    /// Block to pass to `fetch` given the persisted checkpoint.
    ///
    /// Checkpoints already sent but not yet persisted still count, so a
    /// restart never re-emits events that are queued for the coordinator.
    pub fn resume_block(&self, stored_checkpoint: u64) -> u64 {
        match stored_checkpoint.max(self.last_checkpoint()) {
            0 => 0,
            checkpoint => checkpoint.saturating_add(1),
        }
    }

    /// Scan from `resume_from` (or the configured start block when 0) up to
    /// the current head.
    pub async fn fetch(
        &self,
        events_tx: &mpsc::Sender<WormEvent>,
        checkpoints_tx: &mpsc::Sender<u64>,
        resume_from: u64,
    ) -> Result<FetchSummary, FetchError> {
        let start = if resume_from == 0 {
            self.config.start_block
        } else {
            resume_from
        };
        let head = self.source.current_head().await?;

        info!(
            start = start,
            latest = head,
            to_query = head.saturating_add(1).saturating_sub(start),
            "fetching blocks"
        );

        let default_batch = self.config.batch_size.max(1);
        let mut batch_size = default_batch;
        let mut cursor = start;
        let mut summary = FetchSummary {
            from_block: start,
            head,
            ..Default::default()
        };

        while cursor <= head {
            let to = cursor.saturating_add(batch_size - 1).min(head);

            let logs = match self.source.query_range(cursor, to).await {
                Ok(logs) => logs,
                Err(SourceError::RangeRejected { .. }) => {
                    self.metrics.record_range_rejection();
                    if batch_size > 1 {
                        info!(
                            from_block = cursor,
                            to_block = to,
                            "range rejected, switching to single block fetching"
                        );
                        batch_size = 1;
                    } else {
                        warn!(block = cursor, "block rejected on its own, skipping");
                        self.metrics.record_block_skipped();
                        summary.skipped_blocks.push(cursor);
                        cursor += 1;
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if batch_size < default_batch {
                batch_size = default_batch;
                info!(at_block = cursor, batch_size = batch_size, "resuming batch fetching");
            }

            let mut forwarded = 0usize;
            for log in &logs {
                let event = match self.source.decode(log) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, block = ?log.block_number, "failed to decode log, skipping");
                        self.metrics.record_decode_failure();
                        continue;
                    }
                };

                if !event.is_movement() {
                    debug!(event = %event, "zero muscle movements, ignoring");
                    self.metrics.record_zero_movement();
                    continue;
                }

                events_tx
                    .send(event)
                    .await
                    .map_err(|_| FetchError::ChannelClosed("events"))?;
                self.metrics.record_event_forwarded();
                forwarded += 1;
            }

            checkpoints_tx
                .send(to)
                .await
                .map_err(|_| FetchError::ChannelClosed("checkpoints"))?;
            self.last_checkpoint.fetch_max(to, Ordering::SeqCst);

            info!(from = cursor, to = to, logs = logs.len(), events = forwarded, "scanned block range");
            summary.ranges += 1;
            summary.events += forwarded;

            cursor = match to.checked_add(1) {
                Some(next) => next,
                None => break,
            };
            if cursor <= head && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        Ok(summary)
    }
}
