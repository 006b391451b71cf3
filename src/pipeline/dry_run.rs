//! Synthetic event generator used in place of the chain fetcher.
//!
//! Exercises the coordinator, store and cache without network access. No
//! checkpoints are produced.

use crate::metrics::PipelineMetrics;
use crate::onchain::types::WormEvent;
use crate::pipeline::PipelineError;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, Instrument, Span};

pub struct DryRunGenerator {
    interval: Duration,
    rng: StdRng,
    next_block: u64,
    metrics: Arc<PipelineMetrics>,
    span: Span,
}

impl DryRunGenerator {
    pub fn new(interval: Duration, metrics: Arc<PipelineMetrics>, span: Span) -> Self {
        Self::with_rng(interval, StdRng::from_entropy(), metrics, span)
    }

    pub fn with_rng(
        interval: Duration,
        rng: StdRng,
        metrics: Arc<PipelineMetrics>,
        span: Span,
    ) -> Self {
        Self {
            interval,
            rng,
            next_block: 1,
            metrics,
            span,
        }
    }

    /// Next synthetic event. Block numbers increase by one per call.
    pub fn next_event(&mut self) -> WormEvent {
        let block = self.next_block;
        self.next_block += 1;
        WormEvent {
            block,
            tx_hash: format!("dry-run-{block}"),
            left_muscle: self.rng.gen_range(0..100),
            right_muscle: self.rng.gen_range(0..100),
            price: self.rng.gen::<f64>(),
            timestamp: Utc::now(),
        }
    }

    /// Emit one event per interval until the events channel closes.
    pub async fn run(mut self, events_tx: mpsc::Sender<WormEvent>) -> Result<(), PipelineError> {
        let span = self.span.clone();
        async move {
            info!(interval = ?self.interval, "starting fetcher in dry-run mode");
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                let event = self.next_event();
                if !event.is_movement() {
                    debug!(event = %event, "zero muscle movements, ignoring");
                    self.metrics.record_zero_movement();
                    continue;
                }
                events_tx
                    .send(event)
                    .await
                    .map_err(|_| PipelineError::ChannelClosed("events"))?;
                self.metrics.record_event_forwarded();
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(interval: Duration) -> DryRunGenerator {
        DryRunGenerator::with_rng(
            interval,
            StdRng::seed_from_u64(7),
            Arc::new(PipelineMetrics::new()),
            Span::none(),
        )
    }

    #[test]
    fn test_synthetic_events_shape() {
        let mut generator = generator(Duration::from_secs(5));
        let mut last_block = 0;
        for _ in 0..200 {
            let event = generator.next_event();
            assert!(event.block > last_block);
            last_block = event.block;
            assert_eq!(event.tx_hash, format!("dry-run-{}", event.block));
            assert!((0..100).contains(&event.left_muscle));
            assert!((0..100).contains(&event.right_muscle));
            assert!((0.0..1.0).contains(&event.price));
        }
    }

    #[tokio::test]
    async fn test_run_emits_until_closed() {
        let generator = generator(Duration::from_millis(1));
        let (events_tx, mut events_rx) = mpsc::channel(10);
        let handle = tokio::spawn(generator.run(events_tx));

        let first = events_rx.recv().await.unwrap();
        let second = events_rx.recv().await.unwrap();
        assert!(second.block > first.block);
        assert!(first.is_movement() && second.is_movement());

        drop(events_rx);
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PipelineError::ChannelClosed("events"))));
    }
}
