//! File-backed log store.
//!
//! One append-only record file per partition (`partition-<id>.wal`). The
//! Proposed→Committed transition is a superseding append at the same id;
//! an in-memory index rebuilt on open resolves the latest record per id.
//!
//! Durability: every `propose`/`commit` returns only after the record is
//! flushed and fsynced. On open, a torn or corrupt tail is truncated away
//! and everything before it is kept.

use crate::record::{self, RecordError};
use async_trait::async_trait;
use keel_raft::{LogEntry, LogId, LogStore, PartitionId, RaftLogType, StoreError, StoreResult, Term};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Durable log store over per-partition append-only files.
pub struct FileLogStore {
    dir: PathBuf,
    partitions: RwLock<HashMap<PartitionId, Arc<Mutex<PartitionFile>>>>,
}

struct PartitionFile {
    file: File,
    /// Latest record per id.
    index: BTreeMap<u64, LogEntry>,
    max_term: Term,
}

impl FileLogStore {
    /// Open a store rooted at `dir`, creating the directory if needed and
    /// replaying every existing partition file.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut partitions = HashMap::new();
        for dir_entry in std::fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            if let Some(partition) = partition_id_from_path(&path) {
                let state = PartitionFile::open(partition, &path)?;
                partitions.insert(partition, Arc::new(Mutex::new(state)));
            }
        }

        Ok(Self {
            dir,
            partitions: RwLock::new(partitions),
        })
    }

    fn partition(&self, partition: PartitionId) -> StoreResult<Arc<Mutex<PartitionFile>>> {
        if let Some(state) = self.partitions.read().get(&partition) {
            return Ok(state.clone());
        }

        let mut partitions = self.partitions.write();
        // Lost the race to another caller: reuse theirs.
        if let Some(state) = partitions.get(&partition) {
            return Ok(state.clone());
        }

        let path = self.dir.join(format!("partition-{}.wal", partition));
        let state = Arc::new(Mutex::new(PartitionFile::open(partition, &path)?));
        partitions.insert(partition, state.clone());
        Ok(state)
    }

    fn append(&self, partition: PartitionId, log: &LogEntry) -> StoreResult<()> {
        let state = self.partition(partition)?;
        let mut state = state.lock();

        let frame = record::encode(log).map_err(|e| map_record_error(partition, e))?;
        state.file.write_all(&frame)?;
        state.file.sync_data()?;

        state.index.insert(log.id.as_u64(), log.clone());
        state.max_term = state.max_term.max(log.term);
        Ok(())
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn read_logs(&self, partition: PartitionId) -> StoreResult<Vec<LogEntry>> {
        let state = self.partition(partition)?;
        let state = state.lock();

        let checkpoint = state
            .index
            .iter()
            .filter(|(_, e)| e.kind == RaftLogType::CommittedCheckpoint)
            .map(|(id, _)| *id)
            .max()
            .unwrap_or(0);

        Ok(state
            .index
            .range(checkpoint + 1..)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn read_logs_range(
        &self,
        partition: PartitionId,
        start_id: LogId,
    ) -> StoreResult<Vec<LogEntry>> {
        let state = self.partition(partition)?;
        let state = state.lock();
        Ok(state
            .index
            .range(start_id.as_u64()..)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn propose(&self, partition: PartitionId, log: &LogEntry) -> StoreResult<()> {
        self.append(partition, log)
    }

    async fn commit(&self, partition: PartitionId, log: &LogEntry) -> StoreResult<()> {
        self.append(partition, log)
    }

    async fn get_max_log(&self, partition: PartitionId) -> StoreResult<LogId> {
        let state = self.partition(partition)?;
        let state = state.lock();
        Ok(state
            .index
            .keys()
            .next_back()
            .map(|id| LogId(*id))
            .unwrap_or(LogId::ZERO))
    }

    async fn get_current_term(&self, partition: PartitionId) -> StoreResult<Term> {
        let state = self.partition(partition)?;
        let max_term = state.lock().max_term;
        Ok(max_term)
    }

    async fn exists(&self, partition: PartitionId, id: LogId) -> StoreResult<bool> {
        let state = self.partition(partition)?;
        let exists = state.lock().index.contains_key(&id.as_u64());
        Ok(exists)
    }
}

impl PartitionFile {
    fn open(partition: PartitionId, path: &Path) -> StoreResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let mut index = BTreeMap::new();
        let mut max_term = Term::ZERO;
        let mut offset = 0usize;

        while offset < contents.len() {
            match record::decode(&contents[offset..]) {
                Ok((entry, consumed)) => {
                    max_term = max_term.max(entry.term);
                    index.insert(entry.id.as_u64(), entry);
                    offset += consumed;
                }
                Err(RecordError::Truncated) => {
                    tracing::warn!(
                        partition,
                        offset,
                        "torn record at tail, truncating partition file"
                    );
                    truncate_to(&file, path, offset)?;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        partition,
                        offset,
                        error = %e,
                        "corrupt record, truncating partition file from here"
                    );
                    truncate_to(&file, path, offset)?;
                    break;
                }
            }
        }

        Ok(Self {
            file,
            index,
            max_term,
        })
    }
}

fn truncate_to(file: &File, path: &Path, len: usize) -> StoreResult<()> {
    file.set_len(len as u64)?;
    file.sync_data()?;
    tracing::info!(path = %path.display(), len, "partition file truncated");
    Ok(())
}

fn partition_id_from_path(path: &Path) -> Option<PartitionId> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix("partition-")?.strip_suffix(".wal")?;
    id.parse().ok()
}

fn map_record_error(partition: PartitionId, e: RecordError) -> StoreError {
    match e {
        RecordError::Io(source) => StoreError::Io { source },
        RecordError::Encoding(e) => StoreError::Encoding {
            reason: e.to_string(),
        },
        other => StoreError::Corrupted {
            partition,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use keel_raft::HlcTimestamp;
    use tempfile::TempDir;

    fn entry(id: u64, term: u64, kind: RaftLogType) -> LogEntry {
        LogEntry {
            id: LogId(id),
            term: Term(term),
            kind,
            log_type: "test".to_string(),
            data: Bytes::from_static(b"payload"),
            time: HlcTimestamp::new(10, 0),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::open(dir.path()).unwrap();

        store.propose(0, &entry(1, 1, RaftLogType::Proposed)).await.unwrap();
        store.propose(0, &entry(2, 1, RaftLogType::Proposed)).await.unwrap();

        let logs = store.read_logs(0).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(store.get_max_log(0).await.unwrap(), LogId(2));
        assert_eq!(store.get_current_term(0).await.unwrap(), Term(1));
    }

    #[tokio::test]
    async fn test_commit_record_supersedes_proposed() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::open(dir.path()).unwrap();

        store.propose(0, &entry(1, 1, RaftLogType::Proposed)).await.unwrap();
        store.commit(0, &entry(1, 1, RaftLogType::Committed)).await.unwrap();

        let logs = store.read_logs(0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, RaftLogType::Committed);
    }

    #[tokio::test]
    async fn test_reopen_preserves_entries() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileLogStore::open(dir.path()).unwrap();
            store.propose(0, &entry(1, 2, RaftLogType::Proposed)).await.unwrap();
            store.commit(0, &entry(1, 2, RaftLogType::Committed)).await.unwrap();
            store.propose(1, &entry(1, 3, RaftLogType::Proposed)).await.unwrap();
        }

        let store = FileLogStore::open(dir.path()).unwrap();
        let logs = store.read_logs(0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, RaftLogType::Committed);
        assert_eq!(store.get_current_term(0).await.unwrap(), Term(2));
        assert_eq!(store.get_current_term(1).await.unwrap(), Term(3));
        assert!(store.exists(1, LogId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileLogStore::open(dir.path()).unwrap();
            store.propose(0, &entry(1, 1, RaftLogType::Proposed)).await.unwrap();
            store.propose(0, &entry(2, 1, RaftLogType::Proposed)).await.unwrap();
        }

        // Tear the last record.
        let path = dir.path().join("partition-0.wal");
        let contents = std::fs::read(&path).unwrap();
        std::fs::write(&path, &contents[..contents.len() - 5]).unwrap();

        let store = FileLogStore::open(dir.path()).unwrap();
        let logs = store.read_logs(0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, LogId(1));

        // The store keeps working after truncation.
        store.propose(0, &entry(2, 1, RaftLogType::Proposed)).await.unwrap();
        assert_eq!(store.get_max_log(0).await.unwrap(), LogId(2));
    }

    #[tokio::test]
    async fn test_corrupt_record_drops_the_tail() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileLogStore::open(dir.path()).unwrap();
            store.propose(0, &entry(1, 1, RaftLogType::Proposed)).await.unwrap();
            store.propose(0, &entry(2, 1, RaftLogType::Proposed)).await.unwrap();
        }

        // Flip a byte inside the second record's payload.
        let path = dir.path().join("partition-0.wal");
        let mut contents = std::fs::read(&path).unwrap();
        let last = contents.len() - 1;
        contents[last] ^= 0xff;
        std::fs::write(&path, &contents).unwrap();

        let store = FileLogStore::open(dir.path()).unwrap();
        let logs = store.read_logs(0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, LogId(1));
    }

    #[tokio::test]
    async fn test_read_logs_resumes_after_committed_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::open(dir.path()).unwrap();

        store.commit(0, &entry(1, 1, RaftLogType::Committed)).await.unwrap();
        store.commit(0, &entry(2, 1, RaftLogType::CommittedCheckpoint)).await.unwrap();
        store.commit(0, &entry(3, 1, RaftLogType::Committed)).await.unwrap();

        let logs = store.read_logs(0).await.unwrap();
        let ids: Vec<u64> = logs.iter().map(|l| l.id.as_u64()).collect();
        assert_eq!(ids, vec![3]);

        // Range reads are unaffected by the checkpoint bound.
        let all = store.read_logs_range(0, LogId(1)).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
