//! Worm contract event ABI and log decoding.
//!
//! The contract emits a single event type. All fields are non-indexed, so
//! topic0 selects the event and everything else lives in the log data.

use crate::onchain::types::WormEvent;
use alloy::primitives::B256;
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;
use chrono::DateTime;
use thiserror::Error;

/// Fixed-point scale of `positionPrice`.
pub const PRICE_SCALE: f64 = 10_000_000.0;

sol! {
    /// Emitted by the worm contract on every muscle update.
    event WormStateUpdated(
        int256 deltaX,
        int256 deltaY,
        int256 leftMuscle,
        int256 rightMuscle,
        uint256 positionTimestamp,
        uint256 positionPrice
    );
}

/// keccak256("WormStateUpdated(int256,int256,int256,int256,uint256,uint256)")
pub const WORM_STATE_UPDATED_TOPIC: B256 = WormStateUpdated::SIGNATURE_HASH;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("log has no {0}")]
    MissingField(&'static str),
    #[error("abi decode failed: {0}")]
    Abi(#[from] alloy::sol_types::Error),
    #[error("{field} out of range")]
    OutOfRange { field: &'static str },
}

/// Decode a raw `WormStateUpdated` log into a `WormEvent`.
pub fn decode_worm_log(log: &Log) -> Result<WormEvent, DecodeError> {
    let block = log
        .block_number
        .ok_or(DecodeError::MissingField("block_number"))?;
    let tx_hash = log
        .transaction_hash
        .ok_or(DecodeError::MissingField("transaction_hash"))?;

    let event = WormStateUpdated::decode_log_data(log.data())?;

    let left_muscle = i64::try_from(event.leftMuscle)
        .map_err(|_| DecodeError::OutOfRange { field: "leftMuscle" })?;
    let right_muscle = i64::try_from(event.rightMuscle)
        .map_err(|_| DecodeError::OutOfRange { field: "rightMuscle" })?;
    let raw_price = u64::try_from(event.positionPrice)
        .map_err(|_| DecodeError::OutOfRange { field: "positionPrice" })?;
    let ts_secs = u64::try_from(event.positionTimestamp)
        .ok()
        .and_then(|s| i64::try_from(s).ok())
        .ok_or(DecodeError::OutOfRange { field: "positionTimestamp" })?;
    let timestamp = DateTime::from_timestamp(ts_secs, 0)
        .ok_or(DecodeError::OutOfRange { field: "positionTimestamp" })?;

    Ok(WormEvent {
        block,
        tx_hash: tx_hash.to_string(),
        left_muscle,
        right_muscle,
        price: raw_price as f64 / PRICE_SCALE,
        timestamp,
    })
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;
    use alloy::primitives::{Address, I256, U256};

    /// Build an RPC log carrying an encoded `WormStateUpdated`.
    pub fn worm_log(block: u64, log_index: u64, left: i64, right: i64) -> Log {
        let event = WormStateUpdated {
            deltaX: I256::ZERO,
            deltaY: I256::ZERO,
            leftMuscle: I256::try_from(left).unwrap(),
            rightMuscle: I256::try_from(right).unwrap(),
            positionTimestamp: U256::from(1_700_000_000u64 + block),
            positionPrice: U256::from(12_500_000u64),
        };
        Log {
            inner: alloy::primitives::Log {
                address: Address::ZERO,
                data: event.encode_log_data(),
            },
            block_number: Some(block),
            transaction_hash: Some(B256::with_last_byte(log_index as u8)),
            log_index: Some(log_index),
            ..Default::default()
        }
    }
}
