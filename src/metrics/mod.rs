//! Pipeline metrics.
//!
//! Counters are shared through an `Arc<PipelineMetrics>` handed to each
//! component at construction:
//! - Fetcher: events forwarded, zero-movement events, decode failures,
//!   range rejections, skipped blocks, restarts
//! - Coordinator: positions and checkpoints saved, duplicate checkpoints
//! - Cache: refreshes and refresh failures

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide pipeline counters.
#[derive(Debug)]
pub struct PipelineMetrics {
    started_at: Instant,
    events_forwarded: AtomicU64,
    zero_movement_filtered: AtomicU64,
    decode_failures: AtomicU64,
    range_rejections: AtomicU64,
    blocks_skipped: AtomicU64,
    fetcher_restarts: AtomicU64,
    positions_saved: AtomicU64,
    checkpoints_saved: AtomicU64,
    duplicate_checkpoints: AtomicU64,
    cache_refreshes: AtomicU64,
    cache_refresh_failures: AtomicU64,
    last_checkpoint: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub events_forwarded: u64,
    pub zero_movement_filtered: u64,
    pub decode_failures: u64,
    pub range_rejections: u64,
    pub blocks_skipped: u64,
    pub fetcher_restarts: u64,
    pub positions_saved: u64,
    pub checkpoints_saved: u64,
    pub duplicate_checkpoints: u64,
    pub cache_refreshes: u64,
    pub cache_refresh_failures: u64,
    pub last_checkpoint: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events_forwarded: AtomicU64::new(0),
            zero_movement_filtered: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            range_rejections: AtomicU64::new(0),
            blocks_skipped: AtomicU64::new(0),
            fetcher_restarts: AtomicU64::new(0),
            positions_saved: AtomicU64::new(0),
            checkpoints_saved: AtomicU64::new(0),
            duplicate_checkpoints: AtomicU64::new(0),
            cache_refreshes: AtomicU64::new(0),
            cache_refresh_failures: AtomicU64::new(0),
            last_checkpoint: AtomicU64::new(0),
        }
    }

    pub fn record_event_forwarded(&self) {
        bump(&self.events_forwarded);
    }

    pub fn record_zero_movement(&self) {
        bump(&self.zero_movement_filtered);
    }

    pub fn record_decode_failure(&self) {
        bump(&self.decode_failures);
    }

    pub fn record_range_rejection(&self) {
        bump(&self.range_rejections);
    }

    pub fn record_block_skipped(&self) {
        bump(&self.blocks_skipped);
    }

    pub fn record_fetcher_restart(&self) {
        bump(&self.fetcher_restarts);
    }

    pub fn record_position_saved(&self) {
        bump(&self.positions_saved);
    }

    /// Record a persisted checkpoint and keep the high-water mark.
    pub fn record_checkpoint_saved(&self, block: u64) {
        bump(&self.checkpoints_saved);
        self.last_checkpoint.fetch_max(block, Ordering::Relaxed);
    }

    pub fn record_duplicate_checkpoint(&self) {
        bump(&self.duplicate_checkpoints);
    }

    pub fn record_cache_refresh(&self) {
        bump(&self.cache_refreshes);
    }

    pub fn record_cache_refresh_failure(&self) {
        bump(&self.cache_refresh_failures);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            events_forwarded: get(&self.events_forwarded),
            zero_movement_filtered: get(&self.zero_movement_filtered),
            decode_failures: get(&self.decode_failures),
            range_rejections: get(&self.range_rejections),
            blocks_skipped: get(&self.blocks_skipped),
            fetcher_restarts: get(&self.fetcher_restarts),
            positions_saved: get(&self.positions_saved),
            checkpoints_saved: get(&self.checkpoints_saved),
            duplicate_checkpoints: get(&self.duplicate_checkpoints),
            cache_refreshes: get(&self.cache_refreshes),
            cache_refresh_failures: get(&self.cache_refresh_failures),
            last_checkpoint: get(&self.last_checkpoint),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
