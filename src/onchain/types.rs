//! Decoded worm events emitted by the log fetcher.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One decoded `WormStateUpdated` log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WormEvent {
    pub block: u64,
    pub tx_hash: String,
    pub left_muscle: i64,
    pub right_muscle: i64,
    /// Contract price (fixed point, 7 decimals) as a float.
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl WormEvent {
    /// An event with both muscles at rest does not move the worm.
    pub fn is_movement(&self) -> bool {
        self.left_muscle != 0 || self.right_muscle != 0
    }
}

impl std::fmt::Display for WormEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WormEvent(block={}, left={}, right={}, price={})",
            self.block, self.left_muscle, self.right_muscle, self.price
        )
    }
}
