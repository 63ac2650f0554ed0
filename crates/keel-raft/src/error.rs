//! Error types for the replication core.

use crate::store::StoreError;
use crate::types::{Endpoint, PartitionId};
use thiserror::Error;

/// Errors surfaced by the replication core.
///
/// Rejections that belong to the replication protocol itself (not leader,
/// stale term) travel as `RaftOperationStatus` values, not errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// The partition id is outside `0..max_partitions`.
    #[error("Unknown partition {partition}")]
    UnknownPartition { partition: PartitionId },

    /// Durable log store failure.
    #[error("Storage error: {source}")]
    Storage {
        #[from]
        source: StoreError,
    },

    /// Transport failure on an outbound send.
    #[error("Transport error sending to {target}: {reason}")]
    Transport { target: Endpoint, reason: String },

    /// Discovery failure.
    #[error("Discovery error: {reason}")]
    Discovery { reason: String },

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// An actor mailbox was closed or a reply channel dropped; the
    /// partition is shutting down or has crashed.
    #[error("Partition {partition} is unavailable: {reason}")]
    PartitionUnavailable {
        partition: PartitionId,
        reason: String,
    },

    /// Internal error (bug).
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

/// Result alias for the replication core.
pub type Result<T> = std::result::Result<T, RaftError>;
