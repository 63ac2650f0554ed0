//! Core replication types: partitions, terms, log ids, entries, wire messages.

use crate::hlc::HlcTimestamp;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a replication group within the process.
///
/// Each partition is an independent Raft instance with its own term,
/// leader, and log. Valid ids are `0..max_partitions`.
pub type PartitionId = u32;

/// Raft term number (monotonically non-decreasing per partition).
///
/// A term increments when a follower starts a candidacy, and jumps when a
/// node observes a higher term on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log entry id (1-indexed, dense per partition; 0 is the "no entry" sentinel).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId(pub u64);

impl LogId {
    pub const ZERO: LogId = LogId(0);

    pub fn next(self) -> LogId {
        LogId(self.0 + 1)
    }

    /// Rewind by `n`, clamped at zero.
    pub fn rewind(self, n: u64) -> LogId {
        LogId(self.0.saturating_sub(n))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Cluster node address in `host:port` form.
///
/// Endpoints identify nodes on the wire and key all per-follower
/// bookkeeping (match indices, vote tallies, ticket acknowledgments).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint(pub String);

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Endpoint(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a log entry.
///
/// Entries are durably written as `Proposed` and flipped to `Committed` by
/// a superseding record at the same id; checkpoints follow the same two
/// steps. No other transition exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftLogType {
    Proposed = 0,
    Committed = 1,
    ProposedCheckpoint = 2,
    CommittedCheckpoint = 3,
}

impl RaftLogType {
    pub fn is_committed(self) -> bool {
        matches!(self, RaftLogType::Committed | RaftLogType::CommittedCheckpoint)
    }

    pub fn is_checkpoint(self) -> bool {
        matches!(
            self,
            RaftLogType::ProposedCheckpoint | RaftLogType::CommittedCheckpoint
        )
    }

    /// The committed form of this entry kind.
    pub fn committed_form(self) -> RaftLogType {
        match self {
            RaftLogType::Proposed | RaftLogType::Committed => RaftLogType::Committed,
            RaftLogType::ProposedCheckpoint | RaftLogType::CommittedCheckpoint => {
                RaftLogType::CommittedCheckpoint
            }
        }
    }
}

/// Wire-level outcome of a replication operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftOperationStatus {
    /// Operation accepted.
    Success = 0,
    /// Local durability failure, quorum unreachable, or unexpected internal
    /// condition. Carries no replay semantics.
    Errored = 1,
    /// Replication attempted on a replica that is not leader of the partition.
    NodeIsNotLeader = 2,
    /// Receiver's term is higher than the sender's.
    LeaderInOldTerm = 3,
    /// A different leader was already accepted for the sender's term.
    LeaderInOutdatedTerm = 4,
}

impl fmt::Display for RaftOperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaftOperationStatus::Success => "Success",
            RaftOperationStatus::Errored => "Errored",
            RaftOperationStatus::NodeIsNotLeader => "NodeIsNotLeader",
            RaftOperationStatus::LeaderInOldTerm => "LeaderInOldTerm",
            RaftOperationStatus::LeaderInOutdatedTerm => "LeaderInOutdatedTerm",
        };
        write!(f, "{}", s)
    }
}

/// A replicated log entry.
///
/// `id` is dense and monotonic per partition starting at 1. `time` is the
/// leader's proposal timestamp (and the ticket key for the batch it was
/// proposed in); followers restamp their receive time on their own clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogId,
    pub term: Term,
    pub kind: RaftLogType,
    /// Opaque user tag, surfaced unchanged through the replication events.
    pub log_type: String,
    /// Opaque payload.
    pub data: Bytes,
    pub time: HlcTimestamp,
}

impl LogEntry {
    /// A freshly proposed entry awaiting id assignment by the WAL worker.
    pub fn proposed(log_type: impl Into<String>, data: Bytes, time: HlcTimestamp) -> Self {
        Self {
            id: LogId::ZERO,
            term: Term::ZERO,
            kind: RaftLogType::Proposed,
            log_type: log_type.into(),
            data,
            time,
        }
    }

    /// A checkpoint marker. Contents are replay-irrelevant.
    pub fn checkpoint(time: HlcTimestamp) -> Self {
        Self {
            id: LogId::ZERO,
            term: Term::ZERO,
            kind: RaftLogType::ProposedCheckpoint,
            log_type: "checkpoint".to_string(),
            data: Bytes::new(),
            time,
        }
    }
}

/// RequestVotes broadcast, sent by a candidate to every peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVotesMessage {
    pub partition: PartitionId,
    pub term: Term,
    /// Highest log id in the candidate's WAL; voters refuse candidates
    /// whose log is behind their own.
    pub max_log_id: LogId,
    pub time: HlcTimestamp,
    pub from: Endpoint,
}

/// Vote reply, sent by a voter back to the candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteMessage {
    pub partition: PartitionId,
    pub term: Term,
    /// Highest log id in the voter's WAL; the candidate records it as the
    /// voter's match index and refuses leadership if it is behind.
    pub max_log_id: LogId,
    pub time: HlcTimestamp,
    pub from: Endpoint,
}

/// Log replication / heartbeat message from a leader.
///
/// An empty `logs` vector is a heartbeat. For proposal batches, `time` is
/// the ticket key the leader correlates acknowledgments against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendLogsMessage {
    pub partition: PartitionId,
    pub term: Term,
    pub time: HlcTimestamp,
    pub from: Endpoint,
    pub logs: Vec<LogEntry>,
}

/// Follower acknowledgment of an AppendLogs round.
///
/// `committed_index` is the follower's resulting commit index, or -1 when
/// the round carried no entries or applied none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteAppendLogsMessage {
    pub partition: PartitionId,
    pub from: Endpoint,
    /// Ticket key of the AppendLogs round being acknowledged.
    pub time: HlcTimestamp,
    pub status: RaftOperationStatus,
    pub committed_index: i64,
}

impl CompleteAppendLogsMessage {
    /// The follower's commit index as a log id, when one was reported.
    pub fn committed_log_id(&self) -> Option<LogId> {
        if self.committed_index > 0 {
            Some(LogId(self.committed_index as u64))
        } else {
            None
        }
    }
}

/// Role of a replica within its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "Follower"),
            NodeRole::Candidate => write!(f, "Candidate"),
            NodeRole::Leader => write!(f, "Leader"),
        }
    }
}

/// Point-in-time view of a partition's election state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub partition: PartitionId,
    pub role: NodeRole,
    pub term: Term,
    pub leader: Option<Endpoint>,
}

impl NodeState {
    pub fn initial(partition: PartitionId) -> Self {
        Self {
            partition,
            role: NodeRole::Follower,
            term: Term::ZERO,
            leader: None,
        }
    }
}
