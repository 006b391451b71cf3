//! Keeps the log fetcher running.
//!
//! Each pass resumes from the highest known checkpoint, scans to the current
//! head and then waits out the cooldown before looking for new blocks. Source
//! failures end a pass but not the supervisor.

use crate::metrics::PipelineMetrics;
use crate::onchain::fetcher::{FetchError, LogFetcher};
use crate::onchain::types::WormEvent;
use crate::pipeline::PipelineError;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Instrument, Span};

pub struct FetchSupervisor {
    fetcher: LogFetcher,
    store: Arc<dyn Store>,
    cooldown: Duration,
    metrics: Arc<PipelineMetrics>,
    span: Span,
}

impl FetchSupervisor {
    pub fn new(
        fetcher: LogFetcher,
        store: Arc<dyn Store>,
        cooldown: Duration,
        metrics: Arc<PipelineMetrics>,
        span: Span,
    ) -> Self {
        Self {
            fetcher,
            store,
            cooldown,
            metrics,
            span,
        }
    }

    /// Run fetch passes until the coordinator goes away.
    pub async fn run(
        self,
        events_tx: mpsc::Sender<WormEvent>,
        checkpoints_tx: mpsc::Sender<u64>,
    ) -> Result<(), PipelineError> {
        let span = self.span.clone();
        async move {
            info!(cooldown = ?self.cooldown, "starting fetcher in live mode");
            loop {
                if events_tx.is_closed() {
                    return Err(PipelineError::ChannelClosed("events"));
                }
                if checkpoints_tx.is_closed() {
                    return Err(PipelineError::ChannelClosed("checkpoints"));
                }

                match self.store.latest_checkpoint().await {
                    Ok(stored) => {
                        let resume_from = self.fetcher.resume_block(stored);
                        match self.fetcher.fetch(&events_tx, &checkpoints_tx, resume_from).await {
                            Ok(summary) => {
                                info!(
                                    from = summary.from_block,
                                    head = summary.head,
                                    events = summary.events,
                                    skipped = summary.skipped_blocks.len(),
                                    "fetcher reached head, sleeping"
                                );
                            }
                            Err(FetchError::ChannelClosed(name)) => {
                                error!(channel = name, "fetcher output closed, stopping");
                                return Err(PipelineError::ChannelClosed(name));
                            }
                            Err(FetchError::Source(e)) => {
                                warn!(
                                    error = %e,
                                    last_checkpoint = self.fetcher.last_checkpoint(),
                                    "fetcher error, restarting after cooldown"
                                );
                                self.metrics.record_fetcher_restart();
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read latest checkpoint, retrying after cooldown");
                    }
                }

                tokio::time::sleep(self.cooldown).await;
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onchain::abi::test_helpers::worm_log;
    use crate::onchain::fetcher::FetcherConfig;
    use crate::onchain::source::{EventSource, SourceError};
    use crate::store::SqliteStore;
    use alloy::rpc::types::Log;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first log query, then serves two events.
    struct FlakyOnceSource {
        queries: AtomicUsize,
    }

    #[async_trait]
    impl EventSource for FlakyOnceSource {
        async fn current_head(&self) -> Result<u64, SourceError> {
            Ok(10)
        }

        async fn query_range(&self, from: u64, to: u64) -> Result<Vec<Log>, SourceError> {
            if self.queries.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(SourceError::Timeout(Duration::from_secs(30)));
            }
            Ok([worm_log(3, 0, 10, 30), worm_log(8, 0, 5, 5)]
                .into_iter()
                .filter(|log| (from..=to).contains(&log.block_number.unwrap_or_default()))
                .collect())
        }
    }

    #[tokio::test]
    async fn test_restarts_after_source_error_without_duplicates() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize(false).unwrap();
        let metrics = Arc::new(PipelineMetrics::new());
        let fetcher = LogFetcher::new(
            Arc::new(FlakyOnceSource {
                queries: AtomicUsize::new(0),
            }),
            FetcherConfig {
                start_block: 1,
                batch_size: 50,
                batch_delay: Duration::ZERO,
            },
            metrics.clone(),
        );
        let supervisor = FetchSupervisor::new(
            fetcher,
            Arc::new(store),
            Duration::from_millis(5),
            metrics.clone(),
            Span::none(),
        );

        let (events_tx, mut events_rx) = mpsc::channel(10);
        let (checkpoints_tx, mut checkpoints_rx) = mpsc::channel(10);
        let handle = tokio::spawn(supervisor.run(events_tx, checkpoints_tx));

        let first = events_rx.recv().await.unwrap();
        let second = events_rx.recv().await.unwrap();
        assert_eq!((first.block, second.block), (3, 8));
        assert_eq!(checkpoints_rx.recv().await, Some(10));

        // Later passes resume past block 10 and find nothing new.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events_rx.try_recv().is_err());
        assert!(checkpoints_rx.try_recv().is_err());
        assert_eq!(metrics.snapshot().fetcher_restarts, 1);

        drop(events_rx);
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PipelineError::ChannelClosed("events"))));
    }
}
