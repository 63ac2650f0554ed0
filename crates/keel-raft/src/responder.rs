//! Responder: the outbound send actor.
//!
//! The responder owns no Raft state. It exists solely to keep the state
//! machine off the network I/O path: the state machine enqueues a send
//! request and moves on, and the responder performs the transport call.
//! Failures are logged and dropped: an unreachable peer simply never
//! acknowledges, which the CheckLeader timers eventually resolve.

use crate::transport::RaftTransport;
use crate::types::{
    AppendLogsMessage, CompleteAppendLogsMessage, Endpoint, PartitionId, RequestVotesMessage,
    VoteMessage,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const MAILBOX_CAPACITY: usize = 1024;

/// An outbound send request.
#[derive(Debug)]
pub enum OutboundMessage {
    RequestVotes {
        target: Endpoint,
        request: RequestVotesMessage,
    },
    Vote {
        target: Endpoint,
        request: VoteMessage,
    },
    AppendLogs {
        target: Endpoint,
        request: AppendLogsMessage,
    },
    CompleteAppendLogs {
        target: Endpoint,
        request: CompleteAppendLogsMessage,
    },
}

/// Handle for enqueueing outbound sends.
#[derive(Clone)]
pub struct ResponderHandle {
    tx: mpsc::Sender<OutboundMessage>,
}

impl ResponderHandle {
    /// Enqueue a send. If the responder is gone (shutdown), the message is
    /// silently dropped, matching the failure semantics of the wire.
    pub async fn post(&self, message: OutboundMessage) {
        if self.tx.send(message).await.is_err() {
            tracing::debug!("responder mailbox closed, dropping outbound message");
        }
    }
}

/// Spawn a responder for one partition.
pub fn spawn(
    partition: PartitionId,
    transport: Arc<dyn RaftTransport>,
    mut shutdown: broadcast::Receiver<()>,
) -> ResponderHandle {
    let (tx, mut rx) = mpsc::channel(MAILBOX_CAPACITY);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = rx.recv() => {
                    match message {
                        Some(message) => send(partition, transport.as_ref(), message).await,
                        None => break,
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!(partition, "responder shutting down");
                    break;
                }
            }
        }
    });

    ResponderHandle { tx }
}

async fn send(partition: PartitionId, transport: &dyn RaftTransport, message: OutboundMessage) {
    let result = match &message {
        OutboundMessage::RequestVotes { target, request } => {
            transport.request_votes(target, request.clone()).await
        }
        OutboundMessage::Vote { target, request } => transport.vote(target, request.clone()).await,
        OutboundMessage::AppendLogs { target, request } => {
            transport.append_logs(target, request.clone()).await
        }
        OutboundMessage::CompleteAppendLogs { target, request } => {
            transport.complete_append_logs(target, request.clone()).await
        }
    };

    if let Err(e) = result {
        let target = match &message {
            OutboundMessage::RequestVotes { target, .. }
            | OutboundMessage::Vote { target, .. }
            | OutboundMessage::AppendLogs { target, .. }
            | OutboundMessage::CompleteAppendLogs { target, .. } => target,
        };
        tracing::warn!(partition, target = %target, error = %e, "outbound send failed, dropping");
    }
}
