//! Log-query capability the fetcher drives.
//!
//! `RpcEventSource` talks HTTP JSON-RPC through alloy. Upstream responses are
//! classified here, at the adapter boundary: a refused block span becomes
//! `SourceError::RangeRejected`, everything else is `Rpc` or `Timeout`.

use crate::onchain::abi::{self, DecodeError};
use crate::onchain::types::WormEvent;
use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::json_rpc::ErrorPayload;
use alloy::rpc::types::{Filter, Log};
use alloy::transports::http::reqwest::Url;
use alloy::transports::TransportError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// JSON-RPC "invalid params", used by most nodes to refuse a log range.
const INVALID_PARAMS_CODE: i64 = -32602;
/// Message fragments nodes use when a log range is refused.
const RANGE_REJECTION_HINTS: &[&str] = &[
    "invalid block range",
    "block range",
    "range too large",
];

#[derive(Error, Debug)]
pub enum SourceError {
    /// The upstream refused to serve the requested span.
    #[error("block range {from}..={to} rejected by upstream")]
    RangeRejected { from: u64, to: u64 },
    #[error("rpc call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rpc error: {0}")]
    Rpc(String),
}

/// Remote log-query capability for a single contract.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Current chain head block number.
    async fn current_head(&self) -> Result<u64, SourceError>;

    /// Raw logs of the tracked contract in `from..=to`.
    async fn query_range(&self, from: u64, to: u64) -> Result<Vec<Log>, SourceError>;

    /// Decode a raw log into a worm event.
    fn decode(&self, log: &Log) -> Result<WormEvent, DecodeError> {
        abi::decode_worm_log(log)
    }
}

/// alloy HTTP provider bound to the worm contract.
pub struct RpcEventSource {
    provider: DynProvider,
    contract: Address,
    request_timeout: Duration,
}

impl RpcEventSource {
    pub fn new(
        rpc_url: &str,
        contract: Address,
        request_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| SourceError::Rpc(format!("invalid rpc url {rpc_url:?}: {e}")))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self {
            provider,
            contract,
            request_timeout,
        })
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    /// Run one RPC call under the per-call deadline.
    async fn with_deadline<T, F>(&self, call: F) -> Result<Result<T, TransportError>, SourceError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| SourceError::Timeout(self.request_timeout))
    }
}

#[async_trait]
impl EventSource for RpcEventSource {
    async fn current_head(&self) -> Result<u64, SourceError> {
        self.with_deadline(self.provider.get_block_number())
            .await?
            .map_err(|e| SourceError::Rpc(e.to_string()))
    }

    async fn query_range(&self, from: u64, to: u64) -> Result<Vec<Log>, SourceError> {
        let filter = Filter::new()
            .address(self.contract)
            .from_block(from)
            .to_block(to);

        let mut logs = self
            .with_deadline(self.provider.get_logs(&filter))
            .await?
            .map_err(|e| classify_rpc_error(e, from, to))?;

        // Forward in block order, then log order within a block.
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        debug!(from = from, to = to, logs = logs.len(), "queried block range");
        Ok(logs)
    }
}

/// Map a transport error into the adapter's error kinds.
fn classify_rpc_error(err: TransportError, from: u64, to: u64) -> SourceError {
    match err.as_error_resp() {
        Some(payload) if is_range_rejection(payload) => SourceError::RangeRejected { from, to },
        _ => SourceError::Rpc(err.to_string()),
    }
}

fn is_range_rejection(payload: &ErrorPayload) -> bool {
    let message = payload.message.to_lowercase();
    let hinted = RANGE_REJECTION_HINTS.iter().any(|h| message.contains(h));
    hinted || (payload.code == INVALID_PARAMS_CODE && message.contains("range"))
}
