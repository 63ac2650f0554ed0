//! keel-raft: partitioned Raft replication core.
//!
//! A process hosts one replica per partition; each partition is an
//! independent Raft instance with its own term, leader, and write-ahead
//! log. Per partition, three single-consumer agents exchange messages:
//!
//! - the **state machine** owns election state and in-flight proposal
//!   tickets;
//! - the **WAL worker** owns the durable propose/commit indices and
//!   serializes all log store access;
//! - the **responder** performs outbound transport calls so the state
//!   machine never blocks on the network.
//!
//! External collaborators plug in behind traits: [`RaftTransport`] for the
//! wire, [`Discovery`] for peer enumeration, [`LogStore`] for durable
//! storage, and [`ReplicationEvents`] for commit/recovery callbacks.

pub mod cluster;
pub mod config;
pub mod error;
pub mod hlc;
pub mod node;
pub mod responder;
pub mod state_machine;
pub mod store;
pub mod ticket;
pub mod transport;
pub mod types;
pub mod wal;

pub use cluster::{ClusterView, Discovery, StaticDiscovery};
pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use hlc::{HlcClock, HlcTimestamp};
pub use node::RaftNode;
pub use store::{LogStore, MemoryLogStore, StoreError, StoreResult};
pub use ticket::TicketState;
pub use transport::{InMemoryTransport, InboundMessage, InboundReceiver, RaftTransport};
pub use types::*;

use bytes::Bytes;

/// Callbacks the embedding application receives from the replication core.
///
/// `replication_received` fires on a follower when an entry commits;
/// `replication_restored` fires during WAL recovery for every committed
/// entry replayed. Both return false to signal the application failed to
/// apply the entry, which is reported through `replication_error` without
/// stopping replication.
pub trait ReplicationEvents: Send + Sync {
    fn replication_received(&self, log_type: &str, data: &Bytes) -> bool;

    fn replication_restored(&self, log_type: &str, data: &Bytes) -> bool;

    fn replication_error(&self, log: &LogEntry);
}

/// Events sink that accepts everything and reports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl ReplicationEvents for NoopEvents {
    fn replication_received(&self, _log_type: &str, _data: &Bytes) -> bool {
        true
    }

    fn replication_restored(&self, _log_type: &str, _data: &Bytes) -> bool {
        true
    }

    fn replication_error(&self, log: &LogEntry) {
        tracing::error!(id = %log.id, log_type = %log.log_type, "replication error");
    }
}
