//! Per-partition election and replication state machine.
//!
//! The state machine is the only mutator of a partition's election state:
//! role, term, expected leaders, vote tallies, per-follower match indices,
//! and the in-flight proposal tickets. It consumes control messages from a
//! single mailbox, asks the WAL worker for durable operations, and emits
//! outbound wire messages by posting to the responder; it never touches
//! the network directly.
//!
//! Messages are processed one at a time to completion, so no handler ever
//! observes another handler's partial state. All timeouts are driven by
//! the periodic `CheckLeader` message; there are no blocking waits.

use crate::cluster::ClusterView;
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::hlc::{HlcClock, HlcTimestamp};
use crate::responder::{OutboundMessage, ResponderHandle};
use crate::ticket::{ProposalTicket, TicketState};
use crate::types::{
    AppendLogsMessage, CompleteAppendLogsMessage, Endpoint, LogEntry, LogId, NodeRole, NodeState,
    PartitionId, RaftOperationStatus, RequestVotesMessage, Term, VoteMessage,
};
use crate::wal::WalHandle;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

const MAILBOX_CAPACITY: usize = 1024;

/// How far behind a follower's match index each AppendLogs round starts.
/// The rewind tolerates lost acknowledgments; followers reject entries
/// they already hold by index check, so re-sends are no-ops.
const MATCH_INDEX_REWIND: u64 = 3;

/// How many terms of vote bookkeeping to retain behind the current term.
const TERM_RETENTION: u64 = 8;

/// Outcome of a replication call: the wire status plus the ticket key when
/// the proposal was accepted.
pub type ReplicateOutcome = (RaftOperationStatus, Option<HlcTimestamp>);

/// Messages consumed by the state machine.
pub enum SmMessage {
    /// Periodic tick driving every timeout.
    CheckLeader,
    GetNodeState {
        reply: oneshot::Sender<NodeState>,
    },
    GetTicketState {
        time: HlcTimestamp,
        reply: oneshot::Sender<(TicketState, LogId)>,
    },
    /// Local client proposes a batch of (log_type, data) pairs.
    ReplicateLogs {
        entries: Vec<(String, Bytes)>,
        reply: oneshot::Sender<ReplicateOutcome>,
    },
    ReplicateCheckpoint {
        reply: oneshot::Sender<ReplicateOutcome>,
    },
    /// Membership refresh from discovery.
    UpdateNodes { nodes: Vec<Endpoint> },
    AppendLogs(AppendLogsMessage),
    CompleteAppendLogs(CompleteAppendLogsMessage),
    RequestVotes(RequestVotesMessage),
    Vote(VoteMessage),
}

impl SmMessage {
    fn kind(&self) -> &'static str {
        match self {
            SmMessage::CheckLeader => "CheckLeader",
            SmMessage::GetNodeState { .. } => "GetNodeState",
            SmMessage::GetTicketState { .. } => "GetTicketState",
            SmMessage::ReplicateLogs { .. } => "ReplicateLogs",
            SmMessage::ReplicateCheckpoint { .. } => "ReplicateCheckpoint",
            SmMessage::UpdateNodes { .. } => "UpdateNodes",
            SmMessage::AppendLogs(_) => "AppendLogs",
            SmMessage::CompleteAppendLogs(_) => "CompleteAppendLogs",
            SmMessage::RequestVotes(_) => "RequestVotes",
            SmMessage::Vote(_) => "Vote",
        }
    }
}

/// Handle for sending messages to a partition's state machine.
#[derive(Clone)]
pub struct SmHandle {
    partition: PartitionId,
    tx: mpsc::Sender<SmMessage>,
}

impl SmHandle {
    fn unavailable(&self, reason: &str) -> RaftError {
        RaftError::PartitionUnavailable {
            partition: self.partition,
            reason: reason.to_string(),
        }
    }

    /// Enqueue a message, awaiting mailbox capacity.
    pub async fn deliver(&self, message: SmMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| self.unavailable("state machine mailbox closed"))
    }

    /// Enqueue a CheckLeader tick without blocking. Ticks are dropped when
    /// the mailbox is full; the next tick covers for them.
    pub fn tick(&self) {
        let _ = self.tx.try_send(SmMessage::CheckLeader);
    }

    pub async fn node_state(&self) -> Result<NodeState> {
        let (reply, rx) = oneshot::channel();
        self.deliver(SmMessage::GetNodeState { reply }).await?;
        rx.await.map_err(|_| self.unavailable("reply dropped"))
    }

    pub async fn ticket_state(&self, time: HlcTimestamp) -> Result<(TicketState, LogId)> {
        let (reply, rx) = oneshot::channel();
        self.deliver(SmMessage::GetTicketState { time, reply }).await?;
        rx.await.map_err(|_| self.unavailable("reply dropped"))
    }

    pub async fn replicate(&self, entries: Vec<(String, Bytes)>) -> Result<ReplicateOutcome> {
        let (reply, rx) = oneshot::channel();
        self.deliver(SmMessage::ReplicateLogs { entries, reply }).await?;
        rx.await.map_err(|_| self.unavailable("reply dropped"))
    }

    pub async fn replicate_checkpoint(&self) -> Result<ReplicateOutcome> {
        let (reply, rx) = oneshot::channel();
        self.deliver(SmMessage::ReplicateCheckpoint { reply }).await?;
        rx.await.map_err(|_| self.unavailable("reply dropped"))
    }

    pub async fn update_nodes(&self, nodes: Vec<Endpoint>) -> Result<()> {
        self.deliver(SmMessage::UpdateNodes { nodes }).await
    }
}

/// The per-partition state machine actor.
pub struct StateMachine {
    partition: PartitionId,
    config: Arc<RaftConfig>,
    cluster: ClusterView,
    clock: Arc<HlcClock>,
    wal: WalHandle,
    responder: ResponderHandle,

    role: NodeRole,
    current_term: Term,
    leader: Option<Endpoint>,
    last_heartbeat: Instant,
    last_vote: Option<Instant>,
    voting_started: Instant,
    election_timeout: Duration,
    /// Vote tallies per term. A non-empty set for a term also records that
    /// this node voted (for itself) in that term.
    votes_by_term: HashMap<Term, HashSet<Endpoint>>,
    /// The leader this node has promised each term to.
    expected_leader_by_term: HashMap<Term, Endpoint>,
    /// Per-follower highest acknowledged log id.
    match_index: HashMap<Endpoint, LogId>,
    /// In-flight proposals, ordered by ticket key so expiration walks the
    /// prefix.
    active_proposals: BTreeMap<HlcTimestamp, ProposalTicket>,
    recovered: bool,

    state_tx: watch::Sender<NodeState>,
}

impl StateMachine {
    /// Spawn the state machine task for a partition.
    ///
    /// Returns the mailbox handle and a watch channel carrying the latest
    /// published node state (the non-blocking, possibly stale view).
    pub fn spawn(
        partition: PartitionId,
        config: Arc<RaftConfig>,
        cluster: ClusterView,
        clock: Arc<HlcClock>,
        wal: WalHandle,
        responder: ResponderHandle,
        shutdown: broadcast::Receiver<()>,
    ) -> (SmHandle, watch::Receiver<NodeState>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (state_tx, state_rx) = watch::channel(NodeState::initial(partition));

        let election_timeout = config.random_election_timeout();
        let sm = StateMachine {
            partition,
            config,
            cluster,
            clock,
            wal,
            responder,
            role: NodeRole::Follower,
            current_term: Term::ZERO,
            leader: None,
            last_heartbeat: Instant::now(),
            last_vote: None,
            voting_started: Instant::now(),
            election_timeout,
            votes_by_term: HashMap::new(),
            expected_leader_by_term: HashMap::new(),
            match_index: HashMap::new(),
            active_proposals: BTreeMap::new(),
            recovered: false,
            state_tx,
        };

        tokio::spawn(sm.run(rx, shutdown));
        (SmHandle { partition, tx }, state_rx)
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SmMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };

                    if !self.recovered {
                        self.recover().await;
                    }

                    let kind = message.kind();
                    let started = Instant::now();
                    if let Err(e) = self.handle(message).await {
                        // A single bad message must not halt the partition.
                        tracing::error!(
                            partition = self.partition,
                            message = kind,
                            error = %e,
                            "state machine message failed"
                        );
                    }

                    let elapsed = started.elapsed();
                    if elapsed >= self.config.slow_state_machine_log() {
                        tracing::warn!(
                            partition = self.partition,
                            message = kind,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "slow state machine message"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!(partition = self.partition, "state machine shutting down");
                    break;
                }
            }
        }
    }

    /// One-time recovery, run before the first message is processed.
    async fn recover(&mut self) {
        match self.wal.recover().await {
            Ok(commit_index) => {
                tracing::info!(
                    partition = self.partition,
                    commit_index = %commit_index,
                    "partition recovered"
                );
            }
            Err(e) => {
                tracing::error!(partition = self.partition, error = %e, "WAL recovery failed");
            }
        }

        match self.wal.get_current_term().await {
            Ok(term) => self.current_term = self.current_term.max(term),
            Err(e) => {
                tracing::error!(partition = self.partition, error = %e, "term recovery failed");
            }
        }

        self.last_heartbeat = Instant::now();
        self.recovered = true;
        self.publish();
    }

    async fn handle(&mut self, message: SmMessage) -> Result<()> {
        match message {
            SmMessage::CheckLeader => self.check_leader().await,
            SmMessage::GetNodeState { reply } => {
                let _ = reply.send(self.node_state());
                Ok(())
            }
            SmMessage::GetTicketState { time, reply } => {
                let state = match self.active_proposals.get(&time) {
                    Some(ticket) => (ticket.state(), ticket.max_id),
                    None => (TicketState::NotFound, LogId::ZERO),
                };
                let _ = reply.send(state);
                Ok(())
            }
            SmMessage::ReplicateLogs { entries, reply } => {
                let outcome = self.replicate(entries).await;
                let _ = reply.send(outcome);
                Ok(())
            }
            SmMessage::ReplicateCheckpoint { reply } => {
                let outcome = self.replicate_checkpoint().await;
                let _ = reply.send(outcome);
                Ok(())
            }
            SmMessage::UpdateNodes { nodes } => {
                self.cluster.set_nodes(nodes);
                Ok(())
            }
            SmMessage::AppendLogs(msg) => self.on_append_logs(msg).await,
            SmMessage::CompleteAppendLogs(msg) => self.on_complete_append_logs(msg).await,
            SmMessage::RequestVotes(msg) => self.on_request_votes(msg).await,
            SmMessage::Vote(msg) => self.on_vote(msg).await,
        }
    }

    fn node_state(&self) -> NodeState {
        NodeState {
            partition: self.partition,
            role: self.role,
            term: self.current_term,
            leader: self.leader.clone(),
        }
    }

    fn publish(&self) {
        let _ = self.state_tx.send_replace(self.node_state());
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    async fn check_leader(&mut self) -> Result<()> {
        match self.role {
            NodeRole::Leader => {
                self.reap_tickets();
                if self.last_heartbeat.elapsed() >= self.config.heartbeat_interval() {
                    self.send_heartbeats().await;
                    self.last_heartbeat = Instant::now();
                }
            }
            NodeRole::Candidate => {
                if self.voting_started.elapsed() >= self.config.voting_timeout() {
                    tracing::info!(
                        partition = self.partition,
                        term = %self.current_term,
                        "candidacy timed out without quorum, reverting to follower"
                    );
                    self.become_follower(None);
                    self.election_timeout += self.config.random_election_timeout_increment();
                    self.last_heartbeat = Instant::now();
                    self.publish();
                }
            }
            NodeRole::Follower => {
                let heartbeat_fresh = self.last_heartbeat.elapsed() < self.election_timeout;
                let vote_fresh = self
                    .last_vote
                    .map_or(false, |t| t.elapsed() < self.election_timeout * 2);
                if !heartbeat_fresh && !vote_fresh {
                    self.start_candidacy().await;
                }
            }
        }
        Ok(())
    }

    /// Drop committed tickets past their retention window. Walks the
    /// ordered prefix of the proposal map; ticket keys are HLC stamps, so
    /// age falls out of the key itself.
    fn reap_tickets(&mut self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let horizon = HlcTimestamp::new(
            now_ms.saturating_sub(self.config.ticket_retention().as_millis() as i64),
            0,
        );

        let expired: Vec<HlcTimestamp> = self
            .active_proposals
            .range(..horizon)
            .filter(|(_, ticket)| ticket.committed)
            .map(|(time, _)| *time)
            .collect();
        for time in expired {
            self.active_proposals.remove(&time);
        }
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    async fn start_candidacy(&mut self) {
        self.role = NodeRole::Candidate;
        self.current_term = self.current_term.next();
        self.voting_started = Instant::now();
        let term = self.current_term;

        self.prune_term_maps();
        self.votes_by_term
            .entry(term)
            .or_default()
            .insert(self.cluster.local().clone());

        let max_log_id = match self.wal.get_max_log().await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(partition = self.partition, error = %e, "max log lookup failed");
                LogId::ZERO
            }
        };

        tracing::info!(
            partition = self.partition,
            term = %term,
            max_log_id = %max_log_id,
            "election timeout elapsed, requesting votes"
        );

        let time = self.clock.send_event();
        for peer in self.cluster.peers().to_vec() {
            self.responder
                .post(OutboundMessage::RequestVotes {
                    target: peer,
                    request: RequestVotesMessage {
                        partition: self.partition,
                        term,
                        max_log_id,
                        time,
                        from: self.cluster.local().clone(),
                    },
                })
                .await;
        }
        self.publish();
    }

    /// Incoming RequestVotes from a candidate.
    async fn on_request_votes(&mut self, msg: RequestVotesMessage) -> Result<()> {
        let vote_term = msg.term;

        // Already voted in this term (a non-empty tally for a term means
        // this node self-voted as a candidate there).
        if self.votes_by_term.contains_key(&vote_term) {
            return Ok(());
        }
        // Candidates and leaders do not vote within their own term.
        if self.role != NodeRole::Follower && vote_term == self.current_term {
            return Ok(());
        }
        if self.current_term > vote_term {
            return Ok(());
        }
        // Already promised this term to another candidate.
        if self.expected_leader_by_term.contains_key(&vote_term) {
            return Ok(());
        }

        let local_max = self.wal.get_max_log().await?;
        if local_max > msg.max_log_id {
            // This node's log is ahead of the requester's: refuse, and bump
            // the term so the next election timeout runs a candidacy that
            // can win against the requester.
            self.current_term = self.current_term.next();
            tracing::debug!(
                partition = self.partition,
                term = %self.current_term,
                candidate = %msg.from,
                "refusing vote for candidate with shorter log"
            );
            self.publish();
            return Ok(());
        }

        self.expected_leader_by_term.insert(vote_term, msg.from.clone());
        self.clock.receive_event(msg.time);
        self.last_heartbeat = Instant::now();
        self.last_vote = Some(Instant::now());

        self.responder
            .post(OutboundMessage::Vote {
                target: msg.from,
                request: VoteMessage {
                    partition: self.partition,
                    term: vote_term,
                    max_log_id: local_max,
                    time: self.clock.send_event(),
                    from: self.cluster.local().clone(),
                },
            })
            .await;
        Ok(())
    }

    /// Incoming Vote from a peer we solicited.
    async fn on_vote(&mut self, msg: VoteMessage) -> Result<()> {
        if self.role == NodeRole::Follower {
            return Ok(()); // unsolicited
        }
        if msg.term < self.current_term {
            return Ok(());
        }
        if self.role == NodeRole::Leader {
            // Late vote: still useful as a match index observation.
            self.match_index.insert(msg.from, msg.max_log_id);
            return Ok(());
        }

        let local_max = self.wal.get_max_log().await?;
        if local_max < msg.max_log_id {
            // Refuse to lead behind a voter.
            return Ok(());
        }

        self.votes_by_term
            .entry(msg.term)
            .or_default()
            .insert(msg.from.clone());
        self.match_index.insert(msg.from.clone(), msg.max_log_id);

        let votes = self
            .votes_by_term
            .get(&msg.term)
            .map(|s| s.len())
            .unwrap_or(0);
        if votes >= self.cluster.quorum() {
            self.become_leader(votes).await;
        }
        Ok(())
    }

    async fn become_leader(&mut self, votes: usize) {
        self.role = NodeRole::Leader;
        self.leader = Some(self.cluster.local().clone());
        tracing::info!(
            partition = self.partition,
            term = %self.current_term,
            votes,
            "won election, becoming leader"
        );
        self.publish();
        self.send_heartbeats().await;
        self.last_heartbeat = Instant::now();
    }

    /// Transition to follower, clearing leader-side and voter-side state.
    /// Callers record the induced leader's expected-leader entry afterward
    /// when the transition came from an accepted AppendLogs.
    fn become_follower(&mut self, leader: Option<Endpoint>) {
        self.role = NodeRole::Follower;
        self.leader = leader;
        self.expected_leader_by_term.clear();
        self.match_index.clear();
        self.active_proposals.clear();
    }

    fn prune_term_maps(&mut self) {
        let keep_from = Term(self.current_term.as_u64().saturating_sub(TERM_RETENTION));
        self.votes_by_term.retain(|term, _| *term >= keep_from);
        self.expected_leader_by_term.retain(|term, _| *term >= keep_from);
    }

    // ------------------------------------------------------------------
    // Leader replication
    // ------------------------------------------------------------------

    /// Send one heartbeat round. Peers whose match index trails the local
    /// log get the missing entries piggybacked on the heartbeat, so a
    /// lagging or freshly joined follower converges without waiting for
    /// the next proposal.
    async fn send_heartbeats(&mut self) {
        let max_log = match self.wal.get_max_log().await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(partition = self.partition, error = %e, "max log lookup failed");
                LogId::ZERO
            }
        };

        let time = self.clock.send_event();
        for peer in self.cluster.peers().to_vec() {
            let match_id = self.match_index.get(&peer).copied().unwrap_or(LogId::ZERO);
            let logs = if match_id < max_log {
                match self.wal.get_range(match_id.rewind(MATCH_INDEX_REWIND)).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        tracing::error!(
                            partition = self.partition,
                            peer = %peer,
                            error = %e,
                            "log range read failed, sending bare heartbeat"
                        );
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };

            self.responder
                .post(OutboundMessage::AppendLogs {
                    target: peer,
                    request: AppendLogsMessage {
                        partition: self.partition,
                        term: self.current_term,
                        time,
                        from: self.cluster.local().clone(),
                        logs,
                    },
                })
                .await;
        }
    }

    async fn replicate(&mut self, entries: Vec<(String, Bytes)>) -> ReplicateOutcome {
        if self.role != NodeRole::Leader {
            return (RaftOperationStatus::NodeIsNotLeader, None);
        }
        if self.cluster.peers().is_empty() {
            tracing::warn!(partition = self.partition, "no peers to replicate to");
            return (RaftOperationStatus::Errored, None);
        }

        let time = self.clock.local_event();
        let batch: Vec<LogEntry> = entries
            .into_iter()
            .map(|(log_type, data)| LogEntry::proposed(log_type, data, time))
            .collect();

        self.propose_batch(time, batch).await
    }

    async fn replicate_checkpoint(&mut self) -> ReplicateOutcome {
        if self.role != NodeRole::Leader {
            return (RaftOperationStatus::NodeIsNotLeader, None);
        }
        if self.cluster.peers().is_empty() {
            return (RaftOperationStatus::Errored, None);
        }

        let time = self.clock.local_event();
        let batch = vec![LogEntry::checkpoint(time)];
        self.propose_batch(time, batch).await
    }

    async fn propose_batch(&mut self, time: HlcTimestamp, batch: Vec<LogEntry>) -> ReplicateOutcome {
        let assigned = match self.wal.propose(self.current_term, time, batch).await {
            Ok((_, assigned)) => assigned,
            Err(e) => {
                tracing::error!(partition = self.partition, error = %e, "propose failed");
                return (RaftOperationStatus::Errored, None);
            }
        };

        let peers = self.cluster.peers().to_vec();
        let ticket = ProposalTicket::new(time, assigned, &peers);
        self.active_proposals.insert(time, ticket);

        self.send_append_round(time, &peers).await;
        (RaftOperationStatus::Success, Some(time))
    }

    /// Send one AppendLogs round carrying entries since each target's
    /// match index, rewound to tolerate lost acknowledgments.
    async fn send_append_round(&mut self, time: HlcTimestamp, targets: &[Endpoint]) {
        for peer in targets {
            let from_id = self
                .match_index
                .get(peer)
                .copied()
                .unwrap_or(LogId::ZERO)
                .rewind(MATCH_INDEX_REWIND);

            let logs = match self.wal.get_range(from_id).await {
                Ok(logs) => logs,
                Err(e) => {
                    tracing::error!(
                        partition = self.partition,
                        peer = %peer,
                        error = %e,
                        "log range read failed, skipping peer this round"
                    );
                    continue;
                }
            };

            self.responder
                .post(OutboundMessage::AppendLogs {
                    target: peer.clone(),
                    request: AppendLogsMessage {
                        partition: self.partition,
                        term: self.current_term,
                        time,
                        from: self.cluster.local().clone(),
                        logs,
                    },
                })
                .await;
        }
    }

    /// Follower acknowledgment of an AppendLogs round.
    async fn on_complete_append_logs(&mut self, msg: CompleteAppendLogsMessage) -> Result<()> {
        if let Some(committed) = msg.committed_log_id() {
            self.match_index.insert(msg.from.clone(), committed);
        }

        if msg.status != RaftOperationStatus::Success {
            tracing::debug!(
                partition = self.partition,
                from = %msg.from,
                status = %msg.status,
                "append round not acknowledged"
            );
            return Ok(());
        }

        let quorum = self.cluster.quorum();
        let to_commit = match self.active_proposals.get_mut(&msg.time) {
            Some(ticket) => {
                ticket.acknowledge(&msg.from);
                if !ticket.committed && ticket.satisfied(quorum) {
                    Some(ticket.logs.clone())
                } else {
                    None
                }
            }
            None => None,
        };

        let Some(logs) = to_commit else { return Ok(()) };

        if let Err(e) = self.wal.commit(logs).await {
            tracing::error!(partition = self.partition, error = %e, "commit failed");
            return Ok(());
        }

        let participants = match self.active_proposals.get_mut(&msg.time) {
            Some(ticket) => {
                ticket.mark_committed();
                ticket.expected.iter().cloned().collect::<Vec<_>>()
            }
            // Step-down raced the commit; the ticket is gone.
            None => return Ok(()),
        };

        tracing::info!(
            partition = self.partition,
            term = %self.current_term,
            ticket = %msg.time,
            "proposal reached quorum, committed"
        );

        // Participants observe the commit on their next round.
        self.send_append_round(msg.time, &participants).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Follower replication
    // ------------------------------------------------------------------

    async fn on_append_logs(&mut self, msg: AppendLogsMessage) -> Result<()> {
        let leader_term = msg.term;

        if self.current_term > leader_term {
            self.reply_append(&msg, RaftOperationStatus::LeaderInOldTerm, -1).await;
            return Ok(());
        }

        // A different leader was already accepted for this term.
        if let Some(expected) = self.expected_leader_by_term.get(&leader_term) {
            if *expected != msg.from {
                self.reply_append(&msg, RaftOperationStatus::LeaderInOutdatedTerm, -1)
                    .await;
                return Ok(());
            }
        }

        if self.leader.as_ref() != Some(&msg.from) {
            let previous_role = self.role;
            self.become_follower(Some(msg.from.clone()));
            self.current_term = leader_term;
            self.expected_leader_by_term
                .insert(leader_term, msg.from.clone());
            if previous_role != NodeRole::Follower {
                tracing::info!(
                    partition = self.partition,
                    term = %leader_term,
                    leader = %msg.from,
                    "stepping down, accepted leader"
                );
            }
            self.publish();
        } else if leader_term > self.current_term {
            self.current_term = leader_term;
            self.expected_leader_by_term
                .insert(leader_term, msg.from.clone());
            self.publish();
        }

        self.last_heartbeat = Instant::now();

        if msg.logs.is_empty() {
            self.clock.receive_event(msg.time);
            self.reply_append(&msg, RaftOperationStatus::Success, -1).await;
            return Ok(());
        }

        let receive_time = self.clock.receive_event(msg.time);
        match self.wal.propose_or_commit(receive_time, msg.logs.clone()).await {
            Ok(Some(commit_index)) => {
                self.reply_append(&msg, RaftOperationStatus::Success, commit_index.as_u64() as i64)
                    .await;
            }
            Ok(None) => {
                self.reply_append(&msg, RaftOperationStatus::Success, -1).await;
            }
            Err(e) => {
                tracing::error!(partition = self.partition, error = %e, "follower apply failed");
                self.reply_append(&msg, RaftOperationStatus::Errored, -1).await;
            }
        }
        Ok(())
    }

    async fn reply_append(
        &mut self,
        msg: &AppendLogsMessage,
        status: RaftOperationStatus,
        committed_index: i64,
    ) {
        self.responder
            .post(OutboundMessage::CompleteAppendLogs {
                target: msg.from.clone(),
                request: CompleteAppendLogsMessage {
                    partition: self.partition,
                    from: self.cluster.local().clone(),
                    time: msg.time,
                    status,
                    committed_index,
                },
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder;
    use crate::store::{LogStore, MemoryLogStore};
    use crate::transport::{InMemoryTransport, InboundMessage};
    use crate::wal::WalWorker;
    use crate::NoopEvents;
    use crate::types::RaftLogType;

    struct Fixture {
        sm: SmHandle,
        state_rx: watch::Receiver<NodeState>,
        transport: InMemoryTransport,
        _shutdown: broadcast::Sender<()>,
    }

    fn test_config() -> RaftConfig {
        RaftConfig {
            start_election_timeout_ms: 40,
            end_election_timeout_ms: 60,
            start_election_timeout_increment_ms: 10,
            end_election_timeout_increment_ms: 20,
            heartbeat_interval_ms: 20,
            voting_timeout_ms: 100,
            check_leader_interval_ms: 10,
            ..RaftConfig::default()
        }
    }

    fn ep(s: &str) -> Endpoint {
        Endpoint::new(s)
    }

    /// Spawn a state machine for partition 0 at `local` with the given
    /// peers, over an in-memory transport and store.
    fn fixture(local: &str, peers: &[&str]) -> Fixture {
        let transport = InMemoryTransport::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let store = Arc::new(MemoryLogStore::new());
        let wal = WalWorker::spawn(0, store, Arc::new(NoopEvents), shutdown_tx.subscribe());
        let resp = responder::spawn(0, Arc::new(transport.clone()), shutdown_tx.subscribe());

        let nodes: Vec<Endpoint> = std::iter::once(ep(local))
            .chain(peers.iter().map(|p| ep(p)))
            .collect();
        let cluster = ClusterView::new(ep(local), nodes);

        let (sm, state_rx) = StateMachine::spawn(
            0,
            Arc::new(test_config()),
            cluster,
            Arc::new(HlcClock::new()),
            wal,
            resp,
            shutdown_tx.subscribe(),
        );

        Fixture {
            sm,
            state_rx,
            transport,
            _shutdown: shutdown_tx,
        }
    }

    /// Drive the fixture to candidacy by letting the election timeout lapse.
    async fn drive_to_candidate(fx: &Fixture) -> Term {
        for _ in 0..60 {
            fx.sm.tick();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let state = fx.sm.node_state().await.unwrap();
            if state.role == NodeRole::Candidate {
                return state.term;
            }
        }
        panic!("state machine never became candidate");
    }

    /// Drive the fixture to leadership by feeding it a peer vote.
    async fn drive_to_leader(fx: &Fixture, voter: &str) -> Term {
        let term = drive_to_candidate(fx).await;
        fx.sm
            .deliver(SmMessage::Vote(VoteMessage {
                partition: 0,
                term,
                max_log_id: LogId::ZERO,
                time: HlcTimestamp::default(),
                from: ep(voter),
            }))
            .await
            .unwrap();
        let state = fx.sm.node_state().await.unwrap();
        assert_eq!(state.role, NodeRole::Leader);
        term
    }

    #[tokio::test]
    async fn test_replicate_rejected_on_follower() {
        let fx = fixture("localhost:8001", &["localhost:8002"]);
        let (status, ticket) = fx
            .sm
            .replicate(vec![("greeting".to_string(), Bytes::from_static(b"hi"))])
            .await
            .unwrap();
        assert_eq!(status, RaftOperationStatus::NodeIsNotLeader);
        assert!(ticket.is_none());
    }

    #[tokio::test]
    async fn test_follower_grants_vote_once_per_term() {
        let fx = fixture("localhost:8001", &["localhost:8002", "localhost:8003"]);
        let mut candidate_rx = fx.transport.register(ep("localhost:8002"));

        let request = RequestVotesMessage {
            partition: 0,
            term: Term(1),
            max_log_id: LogId(5),
            time: HlcTimestamp::new(1, 0),
            from: ep("localhost:8002"),
        };
        fx.sm
            .deliver(SmMessage::RequestVotes(request.clone()))
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(1), candidate_rx.recv()).await {
            Ok(Some(InboundMessage::Vote(vote))) => {
                assert_eq!(vote.term, Term(1));
                assert_eq!(vote.from, ep("localhost:8001"));
            }
            other => panic!("expected vote, got {:?}", other),
        }

        // A competing candidate in the same term gets nothing.
        let rival = RequestVotesMessage {
            from: ep("localhost:8003"),
            ..request
        };
        let mut rival_rx = fx.transport.register(ep("localhost:8003"));
        fx.sm.deliver(SmMessage::RequestVotes(rival)).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_millis(100), rival_rx.recv()).await;
        assert!(outcome.is_err(), "rival unexpectedly received a vote");
    }

    #[tokio::test]
    async fn test_vote_refused_when_local_log_is_ahead() {
        // Node whose store is pre-seeded ahead of the candidate's claimed max.
        let transport = InMemoryTransport::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let store = Arc::new(MemoryLogStore::new());
        let seeded = LogEntry {
            id: LogId(2),
            term: Term(1),
            kind: RaftLogType::Committed,
            log_type: "seed".to_string(),
            data: Bytes::new(),
            time: HlcTimestamp::default(),
        };
        store.commit(0, &seeded).await.unwrap();
        let wal = WalWorker::spawn(0, store, Arc::new(NoopEvents), shutdown_tx.subscribe());
        let resp = responder::spawn(0, Arc::new(transport.clone()), shutdown_tx.subscribe());
        let cluster = ClusterView::new(ep("localhost:8001"), vec![ep("localhost:8002")]);
        let (sm, _) = StateMachine::spawn(
            0,
            Arc::new(test_config()),
            cluster,
            Arc::new(HlcClock::new()),
            wal,
            resp,
            shutdown_tx.subscribe(),
        );

        let before = sm.node_state().await.unwrap().term;
        sm.deliver(SmMessage::RequestVotes(RequestVotesMessage {
            partition: 0,
            term: before.next(),
            max_log_id: LogId(1), // behind our max of 2
            time: HlcTimestamp::new(1, 0),
            from: ep("localhost:8002"),
        }))
        .await
        .unwrap();

        // The refusal bumps our term so we out-compete the shorter log.
        let after = sm.node_state().await.unwrap().term;
        assert_eq!(after, before.next());
    }

    #[tokio::test]
    async fn test_election_and_commit_round_trip() {
        let fx = fixture("localhost:8001", &["localhost:8002"]);
        let term = drive_to_leader(&fx, "localhost:8002").await;

        let (status, ticket) = fx
            .sm
            .replicate(vec![("greeting".to_string(), Bytes::from_static(b"hi"))])
            .await
            .unwrap();
        assert_eq!(status, RaftOperationStatus::Success);
        let ticket = ticket.unwrap();

        let (state, _) = fx.sm.ticket_state(ticket).await.unwrap();
        assert_eq!(state, TicketState::Proposed);

        // The follower acknowledges the round: quorum of 2 is reached and
        // the leader commits.
        fx.sm
            .deliver(SmMessage::CompleteAppendLogs(CompleteAppendLogsMessage {
                partition: 0,
                from: ep("localhost:8002"),
                time: ticket,
                status: RaftOperationStatus::Success,
                committed_index: 2,
            }))
            .await
            .unwrap();

        let (state, max_id) = fx.sm.ticket_state(ticket).await.unwrap();
        assert_eq!(state, TicketState::Committed);
        assert_eq!(max_id, LogId(1));

        let node = fx.sm.node_state().await.unwrap();
        assert_eq!(node.term, term);
        assert_eq!(node.role, NodeRole::Leader);

        // The published snapshot (the non-blocking view) agrees.
        assert_eq!(fx.state_rx.borrow().role, NodeRole::Leader);
    }

    #[tokio::test]
    async fn test_candidate_reverts_after_voting_timeout() {
        let fx = fixture("localhost:8001", &["localhost:8002", "localhost:8003"]);
        drive_to_candidate(&fx).await;

        // No votes arrive; the voting timeout reverts the candidacy.
        for _ in 0..30 {
            fx.sm.tick();
            tokio::time::sleep(Duration::from_millis(10)).await;
            if fx.sm.node_state().await.unwrap().role == NodeRole::Follower {
                return;
            }
        }
        panic!("candidate never reverted to follower");
    }

    #[tokio::test]
    async fn test_leader_steps_down_on_append_from_newer_leader() {
        let fx = fixture("localhost:8001", &["localhost:8002"]);
        let term = drive_to_leader(&fx, "localhost:8002").await;

        fx.sm
            .deliver(SmMessage::AppendLogs(AppendLogsMessage {
                partition: 0,
                term: term.next(),
                time: HlcTimestamp::new(1, 0),
                from: ep("localhost:8002"),
                logs: Vec::new(),
            }))
            .await
            .unwrap();

        let state = fx.sm.node_state().await.unwrap();
        assert_eq!(state.role, NodeRole::Follower);
        assert_eq!(state.term, term.next());
        assert_eq!(state.leader, Some(ep("localhost:8002")));
    }

    #[tokio::test]
    async fn test_append_from_stale_term_rejected() {
        let fx = fixture("localhost:8001", &["localhost:8002"]);
        let term = drive_to_leader(&fx, "localhost:8002").await;
        let mut stale_rx = fx.transport.register(ep("localhost:8009"));

        fx.sm
            .deliver(SmMessage::AppendLogs(AppendLogsMessage {
                partition: 0,
                term: Term(term.as_u64() - 1),
                time: HlcTimestamp::new(1, 0),
                from: ep("localhost:8009"),
                logs: Vec::new(),
            }))
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(1), stale_rx.recv()).await {
            Ok(Some(InboundMessage::CompleteAppendLogs(reply))) => {
                assert_eq!(reply.status, RaftOperationStatus::LeaderInOldTerm);
                assert_eq!(reply.committed_index, -1);
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        // Leadership is unaffected.
        assert_eq!(fx.sm.node_state().await.unwrap().role, NodeRole::Leader);
    }

    #[tokio::test]
    async fn test_follower_applies_entries_and_acknowledges() {
        let fx = fixture("localhost:8001", &["localhost:8002"]);
        let mut leader_rx = fx.transport.register(ep("localhost:8002"));

        let entry = LogEntry {
            id: LogId(1),
            term: Term(1),
            kind: RaftLogType::Proposed,
            log_type: "greeting".to_string(),
            data: Bytes::from_static(b"hi"),
            time: HlcTimestamp::new(5, 0),
        };
        fx.sm
            .deliver(SmMessage::AppendLogs(AppendLogsMessage {
                partition: 0,
                term: Term(1),
                time: HlcTimestamp::new(5, 0),
                from: ep("localhost:8002"),
                logs: vec![entry],
            }))
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(1), leader_rx.recv()).await {
            Ok(Some(InboundMessage::CompleteAppendLogs(reply))) => {
                assert_eq!(reply.status, RaftOperationStatus::Success);
                // One proposed entry applied, nothing committed yet.
                assert_eq!(reply.committed_index, 1);
                assert_eq!(reply.from, ep("localhost:8001"));
            }
            other => panic!("expected acknowledgment, got {:?}", other),
        }

        let state = fx.sm.node_state().await.unwrap();
        assert_eq!(state.leader, Some(ep("localhost:8002")));
        assert_eq!(state.term, Term(1));
    }
}
