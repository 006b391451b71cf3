//! Refreshing read cache of the most recent positions.
//!
//! Readers get an `Arc` to the current window and never touch the store.
//! `refresh` builds a complete new window and swaps it in under the mutex, so
//! a reader sees either the old window or the new one, never a mix. A failed
//! refresh keeps the previous window.

use crate::config::CacheConfig;
use crate::metrics::PipelineMetrics;
use crate::position::Position;
use crate::store::{Store, StoreResult};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

pub struct PositionCache {
    store: Arc<dyn Store>,
    window_size: usize,
    refresh_interval: Duration,
    snapshot: Mutex<Arc<Vec<Position>>>,
    metrics: Arc<PipelineMetrics>,
    span: Span,
    cancel: CancellationToken,
}

impl PositionCache {
    /// Cold cache; `get` returns an empty window until the first refresh.
    pub fn new(
        store: Arc<dyn Store>,
        config: &CacheConfig,
        metrics: Arc<PipelineMetrics>,
        span: Span,
    ) -> Self {
        Self {
            store,
            window_size: config.window_size.max(1),
            refresh_interval: config.refresh_interval(),
            snapshot: Mutex::new(Arc::new(Vec::new())),
            metrics,
            span,
            cancel: CancellationToken::new(),
        }
    }

    /// Build the cache and load the first window before returning it.
    ///
    /// A failing first load is logged and leaves the cache empty.
    pub async fn warm(
        store: Arc<dyn Store>,
        config: &CacheConfig,
        metrics: Arc<PipelineMetrics>,
        span: Span,
    ) -> Arc<Self> {
        let cache = Arc::new(Self::new(store, config, metrics, span));
        // Errors are already logged by refresh.
        let _ = cache.refresh().await;
        cache
    }

    /// Current window, ascending by id.
    pub fn get(&self) -> Arc<Vec<Position>> {
        self.snapshot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Last `n` positions of the current window.
    pub fn recent(&self, n: usize) -> Vec<Position> {
        let window = self.get();
        let skip = window.len().saturating_sub(n);
        window[skip..].to_vec()
    }

    /// Reload the window from the store. Returns the new window length.
    pub async fn refresh(&self) -> StoreResult<usize> {
        match self.load_window().await {
            Ok(window) => {
                let len = window.len();
                *self.snapshot.lock().unwrap_or_else(|p| p.into_inner()) = Arc::new(window);
                self.metrics.record_cache_refresh();
                debug!(parent: &self.span, positions = len, "cache refreshed");
                Ok(len)
            }
            Err(e) => {
                self.metrics.record_cache_refresh_failure();
                warn!(parent: &self.span, error = %e, "cache refresh failed, keeping stale snapshot");
                Err(e)
            }
        }
    }

    async fn load_window(&self) -> StoreResult<Vec<Position>> {
        let latest = self.store.latest_position().await?;
        if latest.id == 0 {
            return Ok(Vec::new());
        }
        let after = latest.id.saturating_sub(self.window_size as i64);
        self.store.fetch_positions(after, self.window_size).await
    }

    /// Refresh on every tick until `close` is called.
    pub async fn run(&self) {
        async {
            info!(interval = ?self.refresh_interval, window = self.window_size, "cache refresh loop started");
            let mut ticker = tokio::time::interval(self.refresh_interval);
            // The warm-up already covered the immediate tick.
            ticker.reset();

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("cache refresh loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let _ = self.refresh().await;
                    }
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Stop the refresh loop.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store wrapper that can be switched into failing reads.
    struct FlakyStore {
        inner: SqliteStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn latest_position(&self) -> StoreResult<Position> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Sqlite("database is locked".to_string()));
            }
            self.inner.latest_position().await
        }
        async fn latest_checkpoint(&self) -> StoreResult<u64> {
            self.inner.latest_checkpoint().await
        }
        async fn save_position(&self, position: &Position) -> StoreResult<i64> {
            self.inner.save_position(position).await
        }
        async fn save_checkpoint(&self, block: u64) -> StoreResult<()> {
            self.inner.save_checkpoint(block).await
        }
        async fn fetch_positions(&self, after_id: i64, limit: usize) -> StoreResult<Vec<Position>> {
            self.inner.fetch_positions(after_id, limit).await
        }
        async fn fetch_sample(&self, count: usize) -> StoreResult<Vec<Position>> {
            self.inner.fetch_sample(count).await
        }
    }

    async fn flaky_store(n: u64) -> Arc<FlakyStore> {
        let inner = SqliteStore::in_memory().unwrap();
        inner.initialize(false).unwrap();
        for block in 1..=n {
            let p = Position {
                block,
                x: block as f64,
                ..Position::origin()
            };
            inner.save_position(&p).await.unwrap();
        }
        Arc::new(FlakyStore {
            inner,
            failing: AtomicBool::new(false),
        })
    }

    fn config(window_size: usize) -> CacheConfig {
        CacheConfig {
            window_size,
            refresh_interval_secs: 3600,
        }
    }

    #[tokio::test]
    async fn test_window_after_refresh() {
        let store = flaky_store(25).await;
        let cache = PositionCache::warm(
            store.clone(),
            &config(10),
            Arc::new(PipelineMetrics::new()),
            Span::none(),
        )
        .await;

        let ids: Vec<i64> = cache.get().iter().map(|p| p.id).collect();
        assert_eq!(ids, (16..=25).collect::<Vec<_>>());

        let recent: Vec<i64> = cache.recent(3).iter().map(|p| p.id).collect();
        assert_eq!(recent, vec![23, 24, 25]);
        assert_eq!(cache.recent(50).len(), 10);
    }

    #[tokio::test]
    async fn test_window_smaller_than_store() {
        let store = flaky_store(4).await;
        let cache = PositionCache::warm(
            store,
            &config(1000),
            Arc::new(PipelineMetrics::new()),
            Span::none(),
        )
        .await;
        assert_eq!(cache.get().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_snapshot() {
        let store = flaky_store(5).await;
        let metrics = Arc::new(PipelineMetrics::new());
        let cache =
            PositionCache::warm(store.clone(), &config(10), metrics.clone(), Span::none()).await;
        let before = cache.get();

        store
            .save_position(&Position {
                block: 99,
                ..Position::origin()
            })
            .await
            .unwrap();
        store.failing.store(true, Ordering::SeqCst);

        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.get(), before);
        assert_eq!(cache.get().len(), 5);

        store.failing.store(false, Ordering::SeqCst);
        assert_eq!(cache.refresh().await.unwrap(), 6);
        assert_eq!(cache.get().last().unwrap().block, 99);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cache_refresh_failures, 1);
        assert_eq!(snapshot.cache_refreshes, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_close() {
        let store = flaky_store(0).await;
        let cache = PositionCache::warm(
            store,
            &config(10),
            Arc::new(PipelineMetrics::new()),
            Span::none(),
        )
        .await;
        assert!(cache.get().is_empty());

        let runner = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.run().await })
        };
        cache.close();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
    }
}
