//! Node façade: the embedder-facing surface of the replication core.
//!
//! A [`RaftNode`] hosts one replica of every partition in the process. It
//! spawns the three per-partition agents (state machine, WAL worker,
//! responder), drives their timers with a periodic CheckLeader tick, and
//! demultiplexes inbound wire messages by (kind, partition) onto state
//! machine mailboxes.

use crate::cluster::{ClusterView, Discovery};
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::hlc::{HlcClock, HlcTimestamp};
use crate::responder;
use crate::state_machine::{ReplicateOutcome, SmHandle, SmMessage, StateMachine};
use crate::store::LogStore;
use crate::ticket::TicketState;
use crate::transport::{InboundMessage, InboundReceiver, RaftTransport};
use crate::types::{Endpoint, LogId, NodeRole, NodeState, PartitionId};
use crate::wal::{WalHandle, WalWorker};
use crate::ReplicationEvents;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Per-partition agent handles.
#[derive(Clone)]
struct PartitionHandle {
    sm: SmHandle,
    wal: WalHandle,
    state_rx: watch::Receiver<NodeState>,
}

/// A replication node hosting one replica per partition.
pub struct RaftNode {
    config: Arc<RaftConfig>,
    local: Endpoint,
    clock: Arc<HlcClock>,
    store: Arc<dyn LogStore>,
    transport: Arc<dyn RaftTransport>,
    discovery: Arc<dyn Discovery>,
    events: Arc<dyn ReplicationEvents>,
    partitions: RwLock<HashMap<PartitionId, PartitionHandle>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RaftNode {
    pub fn new(
        config: RaftConfig,
        store: Arc<dyn LogStore>,
        transport: Arc<dyn RaftTransport>,
        discovery: Arc<dyn Discovery>,
        events: Arc<dyn ReplicationEvents>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| RaftError::Config { reason: e.to_string() })?;

        let local = config.local_endpoint();
        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self {
            config: Arc::new(config),
            local,
            clock: Arc::new(HlcClock::new()),
            store,
            transport,
            discovery,
            events,
            partitions: RwLock::new(HashMap::new()),
            shutdown_tx,
        })
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Join the cluster: register with discovery, spawn one replica per
    /// partition, and start the tick and inbound-demux loops.
    ///
    /// `inbound` is the receiver the transport server side feeds; for the
    /// in-memory transport it comes from `InMemoryTransport::register`.
    pub async fn join_cluster(&self, inbound: InboundReceiver) -> Result<()> {
        self.discovery.register(&self.local).await?;
        let nodes = self.discovery.nodes().await?;

        {
            let mut partitions = self.partitions.write();
            if !partitions.is_empty() {
                return Err(RaftError::Internal {
                    reason: "join_cluster called twice".to_string(),
                });
            }

            for partition in 0..self.config.max_partitions {
                let wal = WalWorker::spawn(
                    partition,
                    self.store.clone(),
                    self.events.clone(),
                    self.shutdown_tx.subscribe(),
                );
                let resp = responder::spawn(
                    partition,
                    self.transport.clone(),
                    self.shutdown_tx.subscribe(),
                );
                let cluster = ClusterView::new(self.local.clone(), nodes.clone());
                let (sm, state_rx) = StateMachine::spawn(
                    partition,
                    self.config.clone(),
                    cluster,
                    self.clock.clone(),
                    wal.clone(),
                    resp,
                    self.shutdown_tx.subscribe(),
                );

                partitions.insert(partition, PartitionHandle { sm, wal, state_rx });
            }
        }

        self.spawn_tick_loop();
        self.spawn_demux_loop(inbound);

        tracing::info!(
            endpoint = %self.local,
            partitions = self.config.max_partitions,
            "joined cluster"
        );
        Ok(())
    }

    /// Re-read discovery and push the refreshed peer list to every
    /// partition.
    pub async fn update_nodes(&self) -> Result<()> {
        let nodes = self.discovery.nodes().await?;
        let handles: Vec<PartitionHandle> = self.partitions.read().values().cloned().collect();
        for handle in handles {
            handle.sm.update_nodes(nodes.clone()).await?;
        }
        Ok(())
    }

    /// Whether this node currently leads the partition. Asks the state
    /// machine, so the answer is as fresh as the mailbox.
    pub async fn am_i_leader(&self, partition: PartitionId) -> Result<bool> {
        let state = self.handle(partition)?.sm.node_state().await?;
        Ok(state.role == NodeRole::Leader)
    }

    /// Non-blocking leadership check against the last published state;
    /// may be stale by one transition.
    pub fn am_i_leader_quick(&self, partition: PartitionId) -> Result<bool> {
        let handle = self.handle(partition)?;
        let is_leader = handle.state_rx.borrow().role == NodeRole::Leader;
        Ok(is_leader)
    }

    /// Current election state of the partition.
    pub async fn node_state(&self, partition: PartitionId) -> Result<NodeState> {
        self.handle(partition)?.sm.node_state().await
    }

    /// Replicate a single entry. Returns the wire status and, on success,
    /// the ticket key to poll via [`ticket_state`].
    ///
    /// [`ticket_state`]: RaftNode::ticket_state
    pub async fn replicate_logs(
        &self,
        partition: PartitionId,
        log_type: impl Into<String>,
        data: Bytes,
    ) -> Result<ReplicateOutcome> {
        self.replicate_logs_batch(partition, vec![(log_type.into(), data)])
            .await
    }

    /// Replicate a batch of entries under a single ticket.
    pub async fn replicate_logs_batch(
        &self,
        partition: PartitionId,
        entries: Vec<(String, Bytes)>,
    ) -> Result<ReplicateOutcome> {
        self.handle(partition)?.sm.replicate(entries).await
    }

    /// Replicate a checkpoint marker bounding future recovery replay.
    pub async fn replicate_checkpoint(&self, partition: PartitionId) -> Result<ReplicateOutcome> {
        self.handle(partition)?.sm.replicate_checkpoint().await
    }

    /// Poll a proposal ticket: `NotFound` (never seen or reaped),
    /// `Proposed` (pending quorum), or `Committed`, plus the highest id in
    /// the batch.
    pub async fn ticket_state(
        &self,
        partition: PartitionId,
        ticket: HlcTimestamp,
    ) -> Result<(TicketState, LogId)> {
        self.handle(partition)?.sm.ticket_state(ticket).await
    }

    /// Highest log id durably persisted for the partition.
    pub async fn max_log(&self, partition: PartitionId) -> Result<LogId> {
        self.handle(partition)?.wal.get_max_log().await
    }

    /// Stop every agent and background loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn handle(&self, partition: PartitionId) -> Result<PartitionHandle> {
        self.partitions
            .read()
            .get(&partition)
            .cloned()
            .ok_or(RaftError::UnknownPartition { partition })
    }

    fn spawn_tick_loop(&self) {
        let handles: Vec<SmHandle> = self
            .partitions
            .read()
            .values()
            .map(|h| h.sm.clone())
            .collect();
        let interval = self.config.check_leader_interval();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for sm in &handles {
                            sm.tick();
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_demux_loop(&self, mut inbound: InboundReceiver) {
        let handles: HashMap<PartitionId, SmHandle> = self
            .partitions
            .read()
            .iter()
            .map(|(p, h)| (*p, h.sm.clone()))
            .collect();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = inbound.recv() => {
                        let Some(message) = message else { break };
                        let (partition, sm_message) = match message {
                            InboundMessage::RequestVotes(m) => (m.partition, SmMessage::RequestVotes(m)),
                            InboundMessage::Vote(m) => (m.partition, SmMessage::Vote(m)),
                            InboundMessage::AppendLogs(m) => (m.partition, SmMessage::AppendLogs(m)),
                            InboundMessage::CompleteAppendLogs(m) => {
                                (m.partition, SmMessage::CompleteAppendLogs(m))
                            }
                        };

                        match handles.get(&partition) {
                            Some(sm) => {
                                if sm.deliver(sm_message).await.is_err() {
                                    tracing::debug!(partition, "dropping inbound message, partition unavailable");
                                }
                            }
                            None => {
                                tracing::warn!(partition, "inbound message for unknown partition");
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}
