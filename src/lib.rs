//! Worm tracker: follows the worm contract's muscle updates on chain, folds
//! them into a running position and serves the result over HTTP.
//!
//! Modules are public so the pipeline can be driven from tests and tools
//! without going through the binary.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod onchain;
pub mod pipeline;
pub mod position;
pub mod server;
pub mod store;
