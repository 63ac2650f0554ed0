//! Restart and recovery scenarios against the file-backed store.

use bytes::Bytes;
use keel_raft::{
    InMemoryTransport, LogEntry, LogId, LogStore, RaftConfig, RaftLogType, RaftNode,
    RaftOperationStatus, ReplicationEvents, StaticDiscovery, TicketState,
};
use keel_wal::FileLogStore;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingEvents {
    received: Mutex<Vec<(String, Bytes)>>,
    restored: Mutex<Vec<(String, Bytes)>>,
}

impl ReplicationEvents for RecordingEvents {
    fn replication_received(&self, log_type: &str, data: &Bytes) -> bool {
        self.received.lock().push((log_type.to_string(), data.clone()));
        true
    }

    fn replication_restored(&self, log_type: &str, data: &Bytes) -> bool {
        self.restored.lock().push((log_type.to_string(), data.clone()));
        true
    }

    fn replication_error(&self, _log: &LogEntry) {}
}

struct TestNode {
    node: Arc<RaftNode>,
    store: Arc<FileLogStore>,
    events: Arc<RecordingEvents>,
}

fn fast_config(port: u16) -> RaftConfig {
    RaftConfig {
        host: "localhost".to_string(),
        port,
        max_partitions: 1,
        start_election_timeout_ms: 100,
        end_election_timeout_ms: 250,
        start_election_timeout_increment_ms: 50,
        end_election_timeout_increment_ms: 150,
        heartbeat_interval_ms: 40,
        voting_timeout_ms: 300,
        check_leader_interval_ms: 20,
        ..RaftConfig::default()
    }
}

async fn start_node(
    port: u16,
    dir: &Path,
    transport: &InMemoryTransport,
    discovery: &Arc<StaticDiscovery>,
) -> TestNode {
    let store = Arc::new(FileLogStore::open(dir).unwrap());
    let events = Arc::new(RecordingEvents::default());
    let node = Arc::new(
        RaftNode::new(
            fast_config(port),
            store.clone(),
            Arc::new(transport.clone()),
            discovery.clone(),
            events.clone(),
        )
        .unwrap(),
    );

    let inbound = transport.register(node.local_endpoint().clone());
    node.join_cluster(inbound).await.unwrap();

    TestNode { node, store, events }
}

async fn start_pair(dir_a: &Path, dir_b: &Path) -> (TestNode, TestNode) {
    let transport = InMemoryTransport::new();
    let discovery = Arc::new(StaticDiscovery::new());

    let a = start_node(9001, dir_a, &transport, &discovery).await;
    let b = start_node(9002, dir_b, &transport, &discovery).await;
    a.node.update_nodes().await.unwrap();
    b.node.update_nodes().await.unwrap();
    (a, b)
}

async fn await_leader<'a>(a: &'a TestNode, b: &'a TestNode) -> (&'a TestNode, &'a TestNode) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if a.node.am_i_leader(0).await.unwrap() {
            return (a, b);
        }
        if b.node.am_i_leader(0).await.unwrap() {
            return (b, a);
        }
        assert!(tokio::time::Instant::now() < deadline, "no leader elected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Replicate one entry and wait until it is committed on the leader and
/// durably committed in the follower's store.
async fn replicate_and_settle(leader: &TestNode, follower: &TestNode, log_type: &str, data: &[u8]) {
    let (status, ticket) = leader
        .node
        .replicate_logs(0, log_type, Bytes::copy_from_slice(data))
        .await
        .unwrap();
    assert_eq!(status, RaftOperationStatus::Success);
    let ticket = ticket.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (state, _) = leader.node.ticket_state(0, ticket).await.unwrap();
        if state == TicketState::Committed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "ticket never committed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Wait for the commit record to land durably on the follower.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let committed_everywhere = follower
            .store
            .read_logs_range(0, LogId(1))
            .await
            .unwrap()
            .iter()
            .filter(|e| e.log_type == log_type)
            .any(|e| e.kind.is_committed());
        if committed_everywhere {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "follower never persisted the commit"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn restart_replays_committed_entries_exactly_once() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    // First lifetime: elect, replicate, commit everywhere, shut down.
    {
        let (a, b) = start_pair(dir_a.path(), dir_b.path()).await;
        let (leader, follower) = await_leader(&a, &b).await;
        replicate_and_settle(leader, follower, "Greeting", b"hi").await;

        assert_eq!(
            follower.events.received.lock().clone(),
            vec![("Greeting".to_string(), Bytes::from_static(b"hi"))]
        );

        a.node.shutdown();
        b.node.shutdown();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Second lifetime against the same directories.
    let (a, b) = start_pair(dir_a.path(), dir_b.path()).await;

    // Recovery replays the committed entry on both nodes, exactly once.
    for n in [&a, &b] {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if !n.events.restored.lock().is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "restore never fired");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    for n in [&a, &b] {
        assert_eq!(
            n.events.restored.lock().clone(),
            vec![("Greeting".to_string(), Bytes::from_static(b"hi"))]
        );
    }

    // After recovery the propose index resumes at commit index: the next
    // replicated entry lands at id 2.
    let (leader, _follower) = await_leader(&a, &b).await;
    let (status, ticket) = leader
        .node
        .replicate_logs(0, "Followup", Bytes::from_static(b"again"))
        .await
        .unwrap();
    assert_eq!(status, RaftOperationStatus::Success);
    let ticket = ticket.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (state, max_id) = leader.node.ticket_state(0, ticket).await.unwrap();
        if state == TicketState::Committed {
            assert_eq!(max_id, LogId(2));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "followup never committed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    a.node.shutdown();
    b.node.shutdown();
}

#[tokio::test]
async fn checkpoint_bounds_restart_replay() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    {
        let (a, b) = start_pair(dir_a.path(), dir_b.path()).await;
        let (leader, follower) = await_leader(&a, &b).await;

        replicate_and_settle(leader, follower, "before", b"1").await;

        // Checkpoint, then one more entry after it.
        let (status, ticket) = leader.node.replicate_checkpoint(0).await.unwrap();
        assert_eq!(status, RaftOperationStatus::Success);
        let ticket = ticket.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let (state, _) = leader.node.ticket_state(0, ticket).await.unwrap();
            if state == TicketState::Committed {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "checkpoint never committed");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        replicate_and_settle(leader, follower, "after", b"2").await;

        // Make sure the checkpoint commit also landed durably on the
        // follower before shutdown.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let checkpointed = follower
                .store
                .read_logs_range(0, LogId(1))
                .await
                .unwrap()
                .iter()
                .any(|e| e.kind == RaftLogType::CommittedCheckpoint);
            if checkpointed {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "checkpoint commit never reached the follower"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        a.node.shutdown();
        b.node.shutdown();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (a, b) = start_pair(dir_a.path(), dir_b.path()).await;

    // Replay resumes after the checkpoint: only the "after" entry is
    // restored, on both nodes.
    for n in [&a, &b] {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if !n.events.restored.lock().is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "restore never fired");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    for n in [&a, &b] {
        assert_eq!(
            n.events.restored.lock().clone(),
            vec![("after".to_string(), Bytes::from_static(b"2"))]
        );
    }

    a.node.shutdown();
    b.node.shutdown();
}
