//! Transport abstraction for inter-node messages.
//!
//! The wire transport is an external collaborator: implementations carry
//! the four message kinds between nodes (HTTP/JSON, binary RPC, ...).
//! All sends are fire-and-forget from the core's perspective: replies
//! travel as reverse messages (a `Vote` answers `RequestVotes`, a
//! `CompleteAppendLogs` answers `AppendLogs`), so the trait methods return
//! no payload.
//!
//! Inbound messages are handed to the node as [`InboundMessage`] values
//! and demultiplexed by (kind, partition) onto state-machine mailboxes.

use crate::error::{RaftError, Result};
use crate::types::{
    AppendLogsMessage, CompleteAppendLogsMessage, Endpoint, RequestVotesMessage, VoteMessage,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An inbound wire message awaiting demultiplexing.
#[derive(Debug)]
pub enum InboundMessage {
    RequestVotes(RequestVotesMessage),
    Vote(VoteMessage),
    AppendLogs(AppendLogsMessage),
    CompleteAppendLogs(CompleteAppendLogsMessage),
}

/// Sender half of a node's inbound mailbox; the transport server side
/// pushes received messages here.
pub type InboundSender = mpsc::Sender<InboundMessage>;

/// Receiver half of a node's inbound mailbox; consumed by the node's
/// demux loop.
pub type InboundReceiver = mpsc::Receiver<InboundMessage>;

/// Transport for outbound messages.
///
/// Implementations own connection management, serialization, and
/// per-message timeouts. Errors are surfaced to the responder, which logs
/// and drops them; the election state machine never blocks on a send.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_votes(&self, target: &Endpoint, request: RequestVotesMessage) -> Result<()>;

    async fn vote(&self, target: &Endpoint, request: VoteMessage) -> Result<()>;

    async fn append_logs(&self, target: &Endpoint, request: AppendLogsMessage) -> Result<()>;

    async fn complete_append_logs(
        &self,
        target: &Endpoint,
        request: CompleteAppendLogsMessage,
    ) -> Result<()>;
}

/// In-memory transport for multi-node tests in one process.
///
/// A shared registry maps endpoints to inbound mailboxes. Every node in a
/// test cluster holds a clone of the same transport and registers its own
/// endpoint to receive messages.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    registry: Arc<RwLock<HashMap<Endpoint, InboundSender>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint and return the receiver its node should drain.
    pub fn register(&self, endpoint: Endpoint) -> InboundReceiver {
        let (tx, rx) = mpsc::channel(1024);
        self.registry.write().insert(endpoint, tx);
        rx
    }

    /// Drop an endpoint from the registry. Subsequent sends to it fail
    /// like an unreachable host.
    pub fn disconnect(&self, endpoint: &Endpoint) {
        self.registry.write().remove(endpoint);
    }

    async fn deliver(&self, target: &Endpoint, message: InboundMessage) -> Result<()> {
        let sender = self
            .registry
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| RaftError::Transport {
                target: target.clone(),
                reason: "endpoint not registered".to_string(),
            })?;

        sender.send(message).await.map_err(|_| RaftError::Transport {
            target: target.clone(),
            reason: "inbound mailbox closed".to_string(),
        })
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_votes(&self, target: &Endpoint, request: RequestVotesMessage) -> Result<()> {
        self.deliver(target, InboundMessage::RequestVotes(request))
            .await
    }

    async fn vote(&self, target: &Endpoint, request: VoteMessage) -> Result<()> {
        self.deliver(target, InboundMessage::Vote(request)).await
    }

    async fn append_logs(&self, target: &Endpoint, request: AppendLogsMessage) -> Result<()> {
        self.deliver(target, InboundMessage::AppendLogs(request))
            .await
    }

    async fn complete_append_logs(
        &self,
        target: &Endpoint,
        request: CompleteAppendLogsMessage,
    ) -> Result<()> {
        self.deliver(target, InboundMessage::CompleteAppendLogs(request))
            .await
    }
}
