//! Shared Stats - concurrent persisted statistics store
//!
//! Records operational counters and capped history logs in JSON documents on a
//! directory shared by cooperating processes, possibly on different machines.
//! Writes are serialized with advisory file locks and land via temp file,
//! fsync and atomic rename; reads retry transient failures and recover from
//! corrupt documents.

pub mod config;
pub mod document_store;
pub mod error;
pub mod logging;
pub mod platform_lock;
pub mod retry;
pub mod stats_repository;
pub mod stats_types;

pub use error::{RepositoryErrorKind, Result, StatsRepositoryError, StoreError};
pub use stats_repository::{SessionHistory, StatsRepository, StatsRepositoryBuilder};
pub use stats_types::{ClientId, ClientStats, GlobalStats, HistoryEntry, Metadata};
