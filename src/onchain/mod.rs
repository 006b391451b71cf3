//! On-chain side of the tracker.
//!
//! Polls the worm contract's `WormStateUpdated` logs over HTTP JSON-RPC:
//! - `EventSource`: the log-query capability (head, range query, decode)
//! - `LogFetcher`: walks the block range from the last checkpoint to the
//!   chain head in adaptive batches
//! - Decoded events and scanned-through block numbers leave on two separate
//!   `tokio::sync::mpsc` channels consumed by the pipeline coordinator

pub mod abi;
pub mod fetcher;
pub mod source;
pub mod types;

pub use fetcher::{FetchError, FetchSummary, LogFetcher};
pub use source::{EventSource, RpcEventSource, SourceError};
pub use types::WormEvent;
