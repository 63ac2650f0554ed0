//! Write-ahead log worker: the single writer for a partition's durable log.
//!
//! The worker owns the partition's `propose_index` (next id to assign) and
//! `commit_index` (next id to commit) and serializes every read and write
//! to the log store through its mailbox. The state machine talks to it via
//! [`WalHandle`]; requests that need an answer carry a oneshot reply
//! channel.
//!
//! Invariant: `propose_index >= commit_index` at all times; after recovery
//! the two are equal.

use crate::error::{RaftError, Result};
use crate::hlc::HlcTimestamp;
use crate::store::LogStore;
use crate::types::{LogEntry, LogId, PartitionId, Term};
use crate::ReplicationEvents;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Mailbox capacity for WAL workers.
const MAILBOX_CAPACITY: usize = 256;

/// Requests consumed by the WAL worker.
enum WalRequest {
    /// Replay the durable log, restoring committed state. Runs at most
    /// once; later calls answer with the current commit index.
    Recover {
        reply: oneshot::Sender<Result<LogId>>,
    },
    GetMaxLog {
        reply: oneshot::Sender<Result<LogId>>,
    },
    GetCurrentTerm {
        reply: oneshot::Sender<Result<Term>>,
    },
    /// Leader path: assign ids and durably append a proposed batch.
    Propose {
        term: Term,
        time: HlcTimestamp,
        logs: Vec<LogEntry>,
        reply: oneshot::Sender<Result<(LogId, Vec<LogEntry>)>>,
    },
    /// Leader path: durably flip a proposed batch to committed.
    Commit {
        logs: Vec<LogEntry>,
        reply: oneshot::Sender<Result<LogId>>,
    },
    /// Follower path: apply a replicated batch under strict id sequencing.
    ProposeOrCommit {
        time: HlcTimestamp,
        logs: Vec<LogEntry>,
        reply: oneshot::Sender<Result<Option<LogId>>>,
    },
    GetRange {
        from: LogId,
        reply: oneshot::Sender<Result<Vec<LogEntry>>>,
    },
}

/// Handle for sending requests to a partition's WAL worker.
#[derive(Clone)]
pub struct WalHandle {
    partition: PartitionId,
    tx: mpsc::Sender<WalRequest>,
}

impl WalHandle {
    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> WalRequest,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| RaftError::PartitionUnavailable {
                partition: self.partition,
                reason: "WAL worker mailbox closed".to_string(),
            })?;
        reply_rx.await.map_err(|_| RaftError::PartitionUnavailable {
            partition: self.partition,
            reason: "WAL worker dropped reply".to_string(),
        })?
    }

    pub async fn recover(&self) -> Result<LogId> {
        self.ask(|reply| WalRequest::Recover { reply }).await
    }

    pub async fn get_max_log(&self) -> Result<LogId> {
        self.ask(|reply| WalRequest::GetMaxLog { reply }).await
    }

    pub async fn get_current_term(&self) -> Result<Term> {
        self.ask(|reply| WalRequest::GetCurrentTerm { reply }).await
    }

    /// Returns the post-batch propose index and the batch with assigned ids.
    pub async fn propose(
        &self,
        term: Term,
        time: HlcTimestamp,
        logs: Vec<LogEntry>,
    ) -> Result<(LogId, Vec<LogEntry>)> {
        self.ask(|reply| WalRequest::Propose {
            term,
            time,
            logs,
            reply,
        })
        .await
    }

    /// Returns the post-batch commit index.
    pub async fn commit(&self, logs: Vec<LogEntry>) -> Result<LogId> {
        self.ask(|reply| WalRequest::Commit { logs, reply }).await
    }

    /// Returns the resulting commit index, or `None` when the whole batch
    /// was rejected as out of sequence.
    pub async fn propose_or_commit(
        &self,
        time: HlcTimestamp,
        logs: Vec<LogEntry>,
    ) -> Result<Option<LogId>> {
        self.ask(|reply| WalRequest::ProposeOrCommit { time, logs, reply })
            .await
    }

    /// Entries with `id >= from` in ascending order.
    pub async fn get_range(&self, from: LogId) -> Result<Vec<LogEntry>> {
        self.ask(|reply| WalRequest::GetRange { from, reply }).await
    }
}

/// The WAL worker actor.
pub struct WalWorker {
    partition: PartitionId,
    store: Arc<dyn LogStore>,
    events: Arc<dyn ReplicationEvents>,
    /// Next id to assign on proposal.
    propose_index: LogId,
    /// Next id to commit.
    commit_index: LogId,
    recovered: bool,
}

impl WalWorker {
    /// Spawn the worker task for a partition and return its handle.
    pub fn spawn(
        partition: PartitionId,
        store: Arc<dyn LogStore>,
        events: Arc<dyn ReplicationEvents>,
        shutdown: broadcast::Receiver<()>,
    ) -> WalHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let worker = WalWorker {
            partition,
            store,
            events,
            propose_index: LogId(1),
            commit_index: LogId(1),
            recovered: false,
        };
        tokio::spawn(worker.run(rx, shutdown));
        WalHandle { partition, tx }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<WalRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                request = rx.recv() => {
                    match request {
                        Some(request) => self.handle(request).await,
                        None => break,
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!(partition = self.partition, "WAL worker shutting down");
                    break;
                }
            }
        }
    }

    async fn handle(&mut self, request: WalRequest) {
        match request {
            WalRequest::Recover { reply } => {
                let _ = reply.send(self.recover().await);
            }
            WalRequest::GetMaxLog { reply } => {
                let result = self.store.get_max_log(self.partition).await;
                let _ = reply.send(result.map_err(Into::into));
            }
            WalRequest::GetCurrentTerm { reply } => {
                let result = self.store.get_current_term(self.partition).await;
                let _ = reply.send(result.map_err(Into::into));
            }
            WalRequest::Propose {
                term,
                time,
                logs,
                reply,
            } => {
                let _ = reply.send(self.propose(term, time, logs).await);
            }
            WalRequest::Commit { logs, reply } => {
                let _ = reply.send(self.commit(logs).await);
            }
            WalRequest::ProposeOrCommit { time, logs, reply } => {
                let _ = reply.send(self.propose_or_commit(time, logs).await);
            }
            WalRequest::GetRange { from, reply } => {
                let result = self.store.read_logs_range(self.partition, from).await;
                let _ = reply.send(result.map_err(Into::into));
            }
        }
    }

    /// Replay the durable log.
    ///
    /// Committed entries advance both indices past themselves and fire the
    /// restored callback; proposed entries were never acknowledged by a
    /// quorum and are skipped (the leader of the current term will re-send
    /// them if they survived elsewhere).
    async fn recover(&mut self) -> Result<LogId> {
        if self.recovered {
            return Ok(self.commit_index);
        }

        let logs = self.store.read_logs(self.partition).await?;
        if logs.is_empty() {
            let max = self.store.get_max_log(self.partition).await?;
            self.commit_index = max.next();
            self.propose_index = max.next();
        } else {
            // read_logs starts just past the last committed checkpoint, so
            // the first id in the scan is the replay base.
            let base = logs[0].id;
            self.commit_index = base;
            self.propose_index = base;

            for log in &logs {
                if !log.kind.is_committed() {
                    continue;
                }
                self.commit_index = log.id.next();
                self.propose_index = log.id.next();

                if !self.events.replication_restored(&log.log_type, &log.data) {
                    self.events.replication_error(log);
                }
            }
        }

        self.recovered = true;
        tracing::info!(
            partition = self.partition,
            commit_index = %self.commit_index,
            "WAL recovery complete"
        );
        Ok(self.commit_index)
    }

    async fn propose(
        &mut self,
        term: Term,
        time: HlcTimestamp,
        logs: Vec<LogEntry>,
    ) -> Result<(LogId, Vec<LogEntry>)> {
        let mut assigned = Vec::with_capacity(logs.len());
        for mut log in logs {
            log.id = self.propose_index;
            log.term = term;
            log.time = time;
            log.kind = if log.kind.is_checkpoint() {
                crate::types::RaftLogType::ProposedCheckpoint
            } else {
                crate::types::RaftLogType::Proposed
            };

            self.store.propose(self.partition, &log).await?;
            self.propose_index = self.propose_index.next();
            assigned.push(log);
        }
        Ok((self.propose_index, assigned))
    }

    async fn commit(&mut self, logs: Vec<LogEntry>) -> Result<LogId> {
        for mut log in logs {
            log.kind = log.kind.committed_form();
            self.store.commit(self.partition, &log).await?;
            self.commit_index = log.id.next();
        }
        Ok(self.commit_index)
    }

    /// Apply a replicated batch on the follower path.
    ///
    /// Entries are validated in id order against a simulated cursor pair:
    /// a proposed entry must land exactly at the propose index and a
    /// committed entry exactly at the commit index; anything else is
    /// skipped (already applied, or a gap the next rewound round will
    /// fill). Returns `None` when nothing in the batch was applicable.
    async fn propose_or_commit(
        &mut self,
        time: HlcTimestamp,
        mut logs: Vec<LogEntry>,
    ) -> Result<Option<LogId>> {
        logs.sort_by_key(|l| l.id);

        let mut sim_propose = self.propose_index;
        let mut sim_commit = self.commit_index;
        let mut accepted = Vec::new();

        for log in logs {
            if log.kind.is_committed() {
                if log.id == sim_commit {
                    sim_commit = log.id.next();
                    sim_propose = sim_propose.max(log.id.next());
                    accepted.push(log);
                }
            } else if log.id == sim_propose {
                sim_propose = log.id.next();
                accepted.push(log);
            }
        }

        if accepted.is_empty() {
            return Ok(None);
        }

        for mut log in accepted {
            log.time = time;
            if log.kind.is_committed() {
                self.store.commit(self.partition, &log).await?;
                self.commit_index = log.id.next();
                self.propose_index = self.propose_index.max(log.id.next());

                if !self.events.replication_received(&log.log_type, &log.data) {
                    self.events.replication_error(&log);
                }
            } else {
                self.store.propose(self.partition, &log).await?;
                self.propose_index = log.id.next();
            }
        }

        Ok(Some(self.commit_index))
    }
}
