//! The worm's cumulative position and the movement model that advances it.
//!
//! Each accepted `WormEvent` carries a left and a right muscle reading. The
//! difference turns the worm, the mean moves it forward:
//!
//! ```text
//! angle     = (right - left) / 2
//! magnitude = (right + left) / 2
//! ```
//!
//! The step is taken along the heading the worm had *before* the turn, and
//! the turn is then applied to the heading.

use crate::onchain::types::WormEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Cumulative derived state after folding all events up to `block`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    /// Store-assigned identity; 0 until persisted.
    pub id: i64,
    pub block: u64,
    pub tx_hash: String,
    pub x: f64,
    pub y: f64,
    /// Heading in degrees, always in [0, 360).
    pub direction: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl Position {
    /// The zero-value origin used when nothing has been persisted yet.
    pub fn origin() -> Self {
        Self {
            id: 0,
            block: 0,
            tx_hash: String::new(),
            x: 0.0,
            y: 0.0,
            direction: 0.0,
            price: 0.0,
            timestamp: DateTime::<Utc>::default(),
        }
    }

    /// Next position after applying `event` to `self`.
    pub fn advance(&self, event: &WormEvent) -> Position {
        next_position(event, self)
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::origin()
    }
}

/// Normalize an angle in degrees into [0, 360).
///
/// Non-finite input maps to 0.
pub fn normalize_360(degrees: f64) -> f64 {
    if !degrees.is_finite() {
        return 0.0;
    }
    let r = degrees.rem_euclid(360.0);
    // rem_euclid rounds tiny negatives up to exactly 360.0
    if r >= 360.0 {
        0.0
    } else {
        r
    }
}

/// Turn and step sizes derived from a pair of muscle readings.
pub fn movement(left: f64, right: f64) -> (f64, f64) {
    let angle = (right - left) / 2.0;
    let magnitude = (right + left) / 2.0;
    (angle, magnitude)
}

/// Fold one event into the previous position.
pub fn next_position(event: &WormEvent, previous: &Position) -> Position {
    let (angle, magnitude) = movement(event.left_muscle as f64, event.right_muscle as f64);

    let heading = previous.direction.to_radians();
    let dx = magnitude * heading.cos();
    let dy = magnitude * heading.sin();

    Position {
        id: 0,
        block: event.block,
        tx_hash: event.tx_hash.clone(),
        x: previous.x + dx,
        y: previous.y + dy,
        direction: normalize_360(previous.direction + angle),
        price: event.price,
        timestamp: event.timestamp,
    }
}
