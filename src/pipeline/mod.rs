//! Fetch-and-accumulate pipeline.
//!
//! ```text
//! FetchSupervisor ─┬─ events (bounded) ──────┐
//!   (or DryRun)    └─ checkpoints (bounded) ─┴─> Coordinator ──> Store
//! ```
//!
//! The coordinator is the only writer of positions and checkpoints.

pub mod coordinator;
pub mod dry_run;
pub mod supervisor;

pub use coordinator::Coordinator;
pub use dry_run::DryRunGenerator;
pub use supervisor::FetchSupervisor;

use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A pipeline channel lost its other side.
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
}
