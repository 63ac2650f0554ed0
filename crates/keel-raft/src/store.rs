//! Durable log store interface and the in-memory reference implementation.
//!
//! A log store holds one ordered record stream per partition, keyed by
//! `(partition, id)` with primary-key uniqueness. The Proposed→Committed
//! transition is recorded by writing a superseding record at the same key;
//! readers always observe the latest record per id.

use crate::types::{LogEntry, LogId, PartitionId, RaftLogType, Term};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;

/// Log store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Corrupted record in partition {partition}: {reason}")]
    Corrupted { partition: PartitionId, reason: String },

    #[error("Encoding error: {reason}")]
    Encoding { reason: String },
}

/// Result alias for log store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable, per-partition ordered log storage.
///
/// `propose` and `commit` must be synchronous-durable: when they return,
/// the record survives a crash. All per-partition calls are serialized by
/// the partition's WAL worker, but a single store instance is shared
/// across partitions and must tolerate concurrent calls for different
/// partitions.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// All entries for the partition in ascending id order, starting after
    /// the highest committed checkpoint (recovery's resumption point).
    async fn read_logs(&self, partition: PartitionId) -> StoreResult<Vec<LogEntry>>;

    /// Entries with `id >= start_id` in ascending id order.
    async fn read_logs_range(
        &self,
        partition: PartitionId,
        start_id: LogId,
    ) -> StoreResult<Vec<LogEntry>>;

    /// Durably record a proposed entry.
    async fn propose(&self, partition: PartitionId, log: &LogEntry) -> StoreResult<()>;

    /// Durably record the committed form of an entry, superseding the
    /// proposed record at the same id.
    async fn commit(&self, partition: PartitionId, log: &LogEntry) -> StoreResult<()>;

    /// Highest id persisted for the partition (0 when empty).
    async fn get_max_log(&self, partition: PartitionId) -> StoreResult<LogId>;

    /// Highest term persisted for the partition (0 when empty).
    async fn get_current_term(&self, partition: PartitionId) -> StoreResult<Term>;

    /// Whether any record exists at `(partition, id)`.
    async fn exists(&self, partition: PartitionId, id: LogId) -> StoreResult<bool>;
}

/// In-memory log store for tests and ephemeral deployments.
///
/// Same visibility semantics as a durable store (latest record per id
/// wins) without the durability.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    entries: RwLock<BTreeMap<(PartitionId, u64), LogEntry>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn highest_committed_checkpoint(
        entries: &BTreeMap<(PartitionId, u64), LogEntry>,
        partition: PartitionId,
    ) -> u64 {
        entries
            .range((partition, 0)..=(partition, u64::MAX))
            .filter(|(_, e)| e.kind == RaftLogType::CommittedCheckpoint)
            .map(|((_, id), _)| *id)
            .max()
            .unwrap_or(0)
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn read_logs(&self, partition: PartitionId) -> StoreResult<Vec<LogEntry>> {
        let entries = self.entries.read();
        let checkpoint = Self::highest_committed_checkpoint(&entries, partition);
        Ok(entries
            .range((partition, checkpoint + 1)..=(partition, u64::MAX))
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn read_logs_range(
        &self,
        partition: PartitionId,
        start_id: LogId,
    ) -> StoreResult<Vec<LogEntry>> {
        let entries = self.entries.read();
        Ok(entries
            .range((partition, start_id.as_u64())..=(partition, u64::MAX))
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn propose(&self, partition: PartitionId, log: &LogEntry) -> StoreResult<()> {
        self.entries
            .write()
            .insert((partition, log.id.as_u64()), log.clone());
        Ok(())
    }

    async fn commit(&self, partition: PartitionId, log: &LogEntry) -> StoreResult<()> {
        self.entries
            .write()
            .insert((partition, log.id.as_u64()), log.clone());
        Ok(())
    }

    async fn get_max_log(&self, partition: PartitionId) -> StoreResult<LogId> {
        let entries = self.entries.read();
        Ok(entries
            .range((partition, 0)..=(partition, u64::MAX))
            .next_back()
            .map(|((_, id), _)| LogId(*id))
            .unwrap_or(LogId::ZERO))
    }

    async fn get_current_term(&self, partition: PartitionId) -> StoreResult<Term> {
        let entries = self.entries.read();
        Ok(entries
            .range((partition, 0)..=(partition, u64::MAX))
            .map(|(_, e)| e.term)
            .max()
            .unwrap_or(Term::ZERO))
    }

    async fn exists(&self, partition: PartitionId, id: LogId) -> StoreResult<bool> {
        Ok(self
            .entries
            .read()
            .contains_key(&(partition, id.as_u64())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::HlcTimestamp;
    use bytes::Bytes;

    fn entry(id: u64, term: u64, kind: RaftLogType) -> LogEntry {
        LogEntry {
            id: LogId(id),
            term: Term(term),
            kind,
            log_type: "test".to_string(),
            data: Bytes::from_static(b"payload"),
            time: HlcTimestamp::default(),
        }
    }

    #[tokio::test]
    async fn test_commit_supersedes_propose() {
        let store = MemoryLogStore::new();
        store.propose(0, &entry(1, 1, RaftLogType::Proposed)).await.unwrap();
        store.commit(0, &entry(1, 1, RaftLogType::Committed)).await.unwrap();

        let logs = store.read_logs(0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, RaftLogType::Committed);
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let store = MemoryLogStore::new();
        store.propose(0, &entry(1, 1, RaftLogType::Proposed)).await.unwrap();
        store.propose(1, &entry(1, 2, RaftLogType::Proposed)).await.unwrap();

        assert_eq!(store.get_max_log(0).await.unwrap(), LogId(1));
        assert_eq!(store.get_max_log(1).await.unwrap(), LogId(1));
        assert_eq!(store.get_current_term(0).await.unwrap(), Term(1));
        assert_eq!(store.get_current_term(1).await.unwrap(), Term(2));
        assert_eq!(store.get_max_log(2).await.unwrap(), LogId::ZERO);
    }

    #[tokio::test]
    async fn test_read_logs_resumes_after_committed_checkpoint() {
        let store = MemoryLogStore::new();
        store.commit(0, &entry(1, 1, RaftLogType::Committed)).await.unwrap();
        store.commit(0, &entry(2, 1, RaftLogType::CommittedCheckpoint)).await.unwrap();
        store.commit(0, &entry(3, 1, RaftLogType::Committed)).await.unwrap();
        // A merely proposed checkpoint never bounds replay.
        store.propose(0, &entry(4, 1, RaftLogType::ProposedCheckpoint)).await.unwrap();

        let logs = store.read_logs(0).await.unwrap();
        let ids: Vec<u64> = logs.iter().map(|l| l.id.as_u64()).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_range_and_exists() {
        let store = MemoryLogStore::new();
        for id in 1..=5 {
            store.propose(0, &entry(id, 1, RaftLogType::Proposed)).await.unwrap();
        }

        let range = store.read_logs_range(0, LogId(3)).await.unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].id, LogId(3));

        assert!(store.exists(0, LogId(5)).await.unwrap());
        assert!(!store.exists(0, LogId(6)).await.unwrap());
    }
}
