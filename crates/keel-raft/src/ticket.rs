//! Proposal tickets: the leader's handle for in-flight replication batches.

use crate::hlc::HlcTimestamp;
use crate::types::{Endpoint, LogEntry, LogId};
use std::collections::HashSet;

/// Client-visible state of a proposal ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    /// Never seen, or already reaped.
    NotFound,
    /// Durable at the leader, awaiting quorum acknowledgment.
    Proposed,
    /// Committed durably at the leader.
    Committed,
}

/// An in-flight proposal batch, keyed by the HLC timestamp the leader
/// assigned at proposal time.
///
/// HLC stamps are strictly increasing on the leader, so tickets order
/// naturally in a `BTreeMap` and expiration can walk the prefix. A ticket
/// is satisfied when its acknowledgment set reaches quorum, counting the
/// leader's own implicit ack; it is destroyed on leader step-down or when
/// reaped after commit.
#[derive(Debug, Clone)]
pub struct ProposalTicket {
    pub time: HlcTimestamp,
    /// The batch, with ids assigned by the WAL worker.
    pub logs: Vec<LogEntry>,
    /// Followers whose acknowledgment is expected.
    pub expected: HashSet<Endpoint>,
    /// Followers that have acknowledged receipt.
    pub acked: HashSet<Endpoint>,
    /// Highest id in the batch.
    pub max_id: LogId,
    /// Whether the batch has been durably committed at the leader.
    pub committed: bool,
}

impl ProposalTicket {
    pub fn new(time: HlcTimestamp, logs: Vec<LogEntry>, expected: &[Endpoint]) -> Self {
        let max_id = logs.iter().map(|l| l.id).max().unwrap_or(LogId::ZERO);
        Self {
            time,
            logs,
            expected: expected.iter().cloned().collect(),
            acked: HashSet::new(),
            max_id,
            committed: false,
        }
    }

    /// Record an acknowledgment. Returns true if `from` was expected and
    /// had not acknowledged before.
    pub fn acknowledge(&mut self, from: &Endpoint) -> bool {
        if !self.expected.contains(from) {
            return false;
        }
        self.acked.insert(from.clone())
    }

    /// Whether the acknowledgment set has reached quorum, counting the
    /// leader's implicit ack.
    pub fn satisfied(&self, quorum: usize) -> bool {
        self.acked.len() + 1 >= quorum
    }

    /// Flip the batch to its committed form, mirroring the WAL transition.
    pub fn mark_committed(&mut self) {
        for log in &mut self.logs {
            log.kind = log.kind.committed_form();
        }
        self.committed = true;
    }

    pub fn state(&self) -> TicketState {
        if self.committed {
            TicketState::Committed
        } else {
            TicketState::Proposed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RaftLogType;
    use bytes::Bytes;

    fn entry(id: u64) -> LogEntry {
        LogEntry {
            id: LogId(id),
            term: crate::types::Term(1),
            kind: RaftLogType::Proposed,
            log_type: "test".to_string(),
            data: Bytes::from_static(b"x"),
            time: HlcTimestamp::default(),
        }
    }

    fn ep(s: &str) -> Endpoint {
        Endpoint::new(s)
    }

    #[test]
    fn test_ticket_tracks_max_id() {
        let ticket = ProposalTicket::new(
            HlcTimestamp::new(1, 0),
            vec![entry(4), entry(5), entry(6)],
            &[ep("a:1")],
        );
        assert_eq!(ticket.max_id, LogId(6));
        assert_eq!(ticket.state(), TicketState::Proposed);
    }

    #[test]
    fn test_acknowledge_only_expected_peers() {
        let mut ticket =
            ProposalTicket::new(HlcTimestamp::new(1, 0), vec![entry(1)], &[ep("a:1"), ep("b:1")]);

        assert!(ticket.acknowledge(&ep("a:1")));
        assert!(!ticket.acknowledge(&ep("a:1"))); // duplicate
        assert!(!ticket.acknowledge(&ep("z:1"))); // unexpected
        assert_eq!(ticket.acked.len(), 1);
    }

    #[test]
    fn test_quorum_counts_implicit_leader_ack() {
        let mut ticket =
            ProposalTicket::new(HlcTimestamp::new(1, 0), vec![entry(1)], &[ep("a:1"), ep("b:1")]);

        // Quorum of 2 = leader + one follower.
        assert!(!ticket.satisfied(2));
        ticket.acknowledge(&ep("a:1"));
        assert!(ticket.satisfied(2));
    }

    #[test]
    fn test_mark_committed_flips_entry_kinds() {
        let mut ticket = ProposalTicket::new(HlcTimestamp::new(1, 0), vec![entry(1)], &[ep("a:1")]);
        ticket.mark_committed();
        assert_eq!(ticket.state(), TicketState::Committed);
        assert_eq!(ticket.logs[0].kind, RaftLogType::Committed);
    }
}
