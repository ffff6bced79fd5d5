//! Multi-node behaviour over an in-process network.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;
use crate::config::{ConflictPolicy, NodeConfig, PeerConfig, SyncTable};
use crate::error::{Error, Result};
use crate::models::{
    AccessResult, ConflictKind, EventType, NewAccessLog, NewUser, SyncStatus, User, UserPatch,
    UserStatus,
};
use crate::node::GateNode;

/// Nodes reachable by ordinal; an isolated node can neither reach nor be reached.
#[derive(Clone)]
struct Network {
    from: u32,
    nodes: Arc<HashMap<u32, GateNode>>,
    isolated: Arc<Mutex<HashSet<u32>>>,
}

impl Network {
    fn reach(&self, peer: &PeerConfig) -> Result<&GateNode> {
        let isolated = self
            .isolated
            .lock()
            .map_err(|_| Error::Transport("network lock poisoned".to_string()))?;
        if isolated.contains(&self.from) || isolated.contains(&peer.ordinal) {
            return Err(Error::Transport(format!("peer {} unreachable", peer.ordinal)));
        }
        self.nodes
            .get(&peer.ordinal)
            .ok_or_else(|| Error::Transport(format!("no node {}", peer.ordinal)))
    }
}

impl PeerTransport for Network {
    async fn node_info(&self, peer: &PeerConfig) -> Result<NodeInfo> {
        Ok(self.reach(peer)?.node_info())
    }

    async fn pull(&self, peer: &PeerConfig, request: &PullRequest) -> Result<PullResponse> {
        self.reach(peer)?.serve_pull(request)
    }

    async fn push(&self, peer: &PeerConfig, request: &PushRequest) -> Result<PushResponse> {
        self.reach(peer)?.serve_push(request)
    }
}

struct Cluster {
    isolated: Arc<Mutex<HashSet<u32>>>,
    engines: Vec<Arc<SyncEngine<Network>>>,
}

impl Cluster {
    fn new(node_count: u32, policy: ConflictPolicy) -> Self {
        Self::with_configs(node_count, |config| config.with_conflict_policy(policy))
    }

    fn with_configs(node_count: u32, adjust: impl Fn(NodeConfig) -> NodeConfig) -> Self {
        let mut nodes = HashMap::new();
        for ordinal in 1..=node_count {
            let peers = (1..=node_count)
                .filter(|peer| *peer != ordinal)
                .map(|peer| PeerConfig {
                    ordinal: peer,
                    url: format!("http://node-{peer}:8080"),
                })
                .collect();
            let config = adjust(NodeConfig::new(ordinal, node_count).unwrap().with_peers(peers));
            nodes.insert(ordinal, GateNode::open_in_memory(config).unwrap());
        }

        let nodes = Arc::new(nodes);
        let isolated = Arc::new(Mutex::new(HashSet::new()));
        let engines = (1..=node_count)
            .map(|ordinal| {
                let network = Network {
                    from: ordinal,
                    nodes: Arc::clone(&nodes),
                    isolated: Arc::clone(&isolated),
                };
                Arc::new(SyncEngine::new(nodes[&ordinal].clone(), network))
            })
            .collect();
        Self { isolated, engines }
    }

    fn node(&self, ordinal: u32) -> &GateNode {
        self.engines[ordinal as usize - 1].node()
    }

    fn engine(&self, ordinal: u32) -> &Arc<SyncEngine<Network>> {
        &self.engines[ordinal as usize - 1]
    }

    fn isolate(&self, ordinal: u32) {
        self.isolated.lock().unwrap().insert(ordinal);
    }

    fn heal(&self) {
        self.isolated.lock().unwrap().clear();
    }

    /// Every node runs one cycle against every peer.
    async fn round(&self) -> Vec<PeerSyncReport> {
        let mut reports = Vec::new();
        for engine in &self.engines {
            reports.extend(engine.run_all().await);
        }
        reports
    }

    fn users_everywhere(&self, id: i64) -> Vec<User> {
        self.engines
            .iter()
            .map(|engine| engine.node().user(id).unwrap().unwrap())
            .collect()
    }
}

fn assert_converged(users: &[User]) {
    let first = &users[0];
    for other in &users[1..] {
        assert!(
            first.same_content(other),
            "content diverged: {first:?} vs {other:?}"
        );
        assert_eq!(first.version, other.version, "versions diverged for user {}", first.id);
    }
}

#[tokio::test]
async fn inserts_from_two_nodes_never_collide_and_replicate() {
    let cluster = Cluster::new(2, ConflictPolicy::LastWriterWins);
    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(
            cluster
                .node(1)
                .recorder()
                .create_user(NewUser::new(format!("A-{n}")))
                .unwrap()
                .id,
        );
        ids.push(
            cluster
                .node(2)
                .recorder()
                .create_user(NewUser::new(format!("B-{n}")))
                .unwrap()
                .id,
        );
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);

    let reports = cluster.round().await;
    assert!(reports.iter().all(PeerSyncReport::is_success));

    for ordinal in 1..=2 {
        let users = cluster.node(ordinal).users(50, 0).unwrap();
        assert_eq!(users.len(), 6);
        for user in users {
            let owner = if user.id % 2 == 1 { 1 } else { 2 };
            assert_eq!(user.node_id, owner);
        }
    }
    assert!(cluster
        .node(1)
        .resolver()
        .list_conflicts(false, 10)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn concurrent_status_updates_converge_to_version_three() {
    let cluster = Cluster::new(2, ConflictPolicy::LastWriterWins);
    let user = cluster
        .node(1)
        .recorder()
        .create_user(NewUser::new("TAG-U").with_name("U"))
        .unwrap();
    assert_eq!(user.id, 1);
    cluster.round().await;
    assert_eq!(cluster.node(2).user(1).unwrap().unwrap().version, 1);

    cluster.isolate(2);
    let on_a = cluster
        .node(1)
        .recorder()
        .update_user(1, &UserPatch::status(UserStatus::In))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let on_b = cluster
        .node(2)
        .recorder()
        .update_user(1, &UserPatch::status(UserStatus::Out))
        .unwrap();
    assert_eq!((on_a.version, on_b.version), (2, 2));

    cluster.heal();
    cluster.round().await;

    let users = cluster.users_everywhere(1);
    assert_converged(&users);
    assert_eq!(users[0].version, 3);
    assert_eq!(users[0].status, UserStatus::Out);

    for ordinal in 1..=2 {
        let conflicts = cluster.node(ordinal).resolver().list_conflicts(false, 10).unwrap();
        assert_eq!(conflicts.len(), 1, "node {ordinal}");
        assert_eq!(conflicts[0].kind, ConflictKind::UpdateConflict);
        assert!(conflicts[0].resolved);
    }

    // a further round is quiet
    cluster.round().await;
    assert_eq!(cluster.users_everywhere(1)[0].version, 3);
}

#[tokio::test]
async fn disconnected_peer_receives_every_log_exactly_once() {
    let cluster = Cluster::new(2, ConflictPolicy::LastWriterWins);
    cluster.isolate(2);

    for booth in 1..=5 {
        cluster
            .node(1)
            .recorder()
            .append_log(NewAccessLog::new(
                EventType::Denied,
                AccessResult::Fail,
                1,
                booth,
            ))
            .unwrap();
    }
    for _ in 0..30 {
        let reports = cluster.engine(1).run_all().await;
        assert!(!reports[0].is_success());
    }
    assert!(cluster.node(2).logs(10, 0).unwrap().is_empty());
    assert_eq!(cluster.node(1).queue().pending_count(SyncTable::Logs).unwrap(), 5);

    cluster.heal();
    cluster.round().await;
    cluster.round().await;

    let received = cluster.node(2).logs(10, 0).unwrap();
    assert_eq!(received.len(), 5);
    assert!(received.iter().all(|log| log.synced && log.node_id == 1));

    let origin = cluster.node(1).logs(10, 0).unwrap();
    assert!(origin.iter().all(|log| log.synced && log.sync_timestamp.is_some()));
    assert_eq!(cluster.node(1).queue().pending_count(SyncTable::Logs).unwrap(), 0);
}

#[tokio::test]
async fn metadata_goes_success_failed_success() {
    let cluster = Cluster::new(2, ConflictPolicy::LastWriterWins);
    let engine = cluster.engine(1);
    let status = || {
        engine
            .node()
            .metadata()
            .status(2, SyncTable::Users)
            .unwrap()
            .unwrap()
    };

    engine.run_cycle(2).await.unwrap();
    let first = status();
    assert_eq!(first.status, SyncStatus::Success);
    assert_eq!(first.error_message, None);

    cluster.isolate(2);
    let report = engine.run_cycle(2).await.unwrap();
    assert!(!report.is_success());
    let second = status();
    assert_eq!(second.status, SyncStatus::Failed);
    assert!(second.error_message.unwrap().contains("unreachable"));
    assert_eq!(second.last_sync_at, first.last_sync_at);

    cluster.heal();
    engine.run_cycle(2).await.unwrap();
    let third = status();
    assert_eq!(third.status, SyncStatus::Success);
    assert_eq!(third.error_message, None);

    assert_eq!(
        engine
            .node()
            .metadata()
            .list_status()
            .unwrap()
            .iter()
            .filter(|row| row.metadata.node_id == 2)
            .count(),
        2
    );
}

#[tokio::test]
async fn replayed_push_does_not_change_state() {
    let cluster = Cluster::new(2, ConflictPolicy::LastWriterWins);
    let user = cluster
        .node(2)
        .recorder()
        .create_user(NewUser::new("TAG-R"))
        .unwrap();
    cluster
        .node(2)
        .recorder()
        .update_user(user.id, &UserPatch::status(UserStatus::In))
        .unwrap();

    let entries: Vec<_> = cluster
        .node(2)
        .queue()
        .pending_for_peer(SyncTable::Users, 1, 10)
        .unwrap()
        .iter()
        .map(|entry| entry.to_envelope(2))
        .collect();
    let request = PushRequest {
        origin: 2,
        table: SyncTable::Users,
        pull_cursor: 0,
        entries,
    };

    let first = cluster.node(1).serve_push(&request).unwrap();
    assert_eq!(first.applied, 2);
    let after_first = cluster.node(1).user(user.id).unwrap().unwrap();

    let second = cluster.node(1).serve_push(&request).unwrap();
    assert_eq!(second.duplicates, 2);
    assert_eq!(second.acked, first.acked);
    assert_eq!(cluster.node(1).user(user.id).unwrap().unwrap(), after_first);
}

#[tokio::test]
async fn three_nodes_converge_after_partitions() {
    let cluster = Cluster::new(3, ConflictPolicy::LastWriterWins);
    let shared = cluster
        .node(3)
        .recorder()
        .create_user(NewUser::new("TAG-S").with_name("Shared"))
        .unwrap();
    cluster.round().await;

    cluster.isolate(1);
    cluster
        .node(1)
        .recorder()
        .update_user(shared.id, &UserPatch::status(UserStatus::In))
        .unwrap();
    cluster
        .node(2)
        .recorder()
        .update_user(
            shared.id,
            &UserPatch {
                last_gate_id: Some(4),
                ..UserPatch::default()
            },
        )
        .unwrap();
    cluster.round().await;

    cluster.isolate(3);
    cluster
        .node(3)
        .recorder()
        .update_user(shared.id, &UserPatch::status(UserStatus::Banned))
        .unwrap();
    cluster
        .node(2)
        .recorder()
        .create_user(NewUser::new("TAG-T"))
        .unwrap();
    cluster.round().await;

    cluster.heal();
    cluster.round().await;
    cluster.round().await;

    assert_converged(&cluster.users_everywhere(shared.id));
    for ordinal in 1..=3 {
        assert_eq!(cluster.node(ordinal).users(10, 0).unwrap().len(), 2);
        for table in SyncTable::ALL {
            assert_eq!(
                cluster.node(ordinal).queue().pending_count(table).unwrap(),
                0,
                "node {ordinal} still has {table} changes queued"
            );
        }
    }
}

#[tokio::test]
async fn conflicting_enrolments_leave_an_open_conflict_on_both_nodes() {
    let cluster = Cluster::new(2, ConflictPolicy::LastWriterWins);
    cluster.isolate(1);
    let local = cluster
        .node(1)
        .recorder()
        .create_user(NewUser::new("TAG-D").with_name("Alice"))
        .unwrap();
    let remote = cluster
        .node(2)
        .recorder()
        .create_user(NewUser::new("TAG-D").with_name("Bob"))
        .unwrap();
    cluster.heal();
    cluster.round().await;

    for (ordinal, kept) in [(1, &local), (2, &remote)] {
        let node = cluster.node(ordinal);
        let holder = node.user_by_tag("TAG-D").unwrap().unwrap();
        assert_eq!(holder.id, kept.id);

        let open = node.resolver().list_conflicts(true, 10).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, ConflictKind::InsertDuplicate);
    }
}

#[tokio::test]
async fn same_person_enrolled_twice_merges_onto_one_row() {
    let cluster = Cluster::new(2, ConflictPolicy::LastWriterWins);
    cluster.isolate(1);
    let enrol = |ordinal| {
        cluster
            .node(ordinal)
            .recorder()
            .create_user(NewUser::new("TAG-M").with_name("Same").with_nic("1V"))
            .unwrap()
    };
    let first = enrol(1);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = enrol(2);
    cluster.heal();
    cluster.round().await;
    cluster.round().await;

    let holders: Vec<User> = (1..=2)
        .map(|ordinal| cluster.node(ordinal).user_by_tag("TAG-M").unwrap().unwrap())
        .collect();
    assert_eq!(holders[0].id, first.id);
    assert_eq!(holders[1].id, first.id);
    assert_converged(&cluster.users_everywhere(first.id));

    let retired = cluster.users_everywhere(second.id);
    assert_converged(&retired);
    assert!(retired[0].is_deleted);
    for ordinal in 1..=2 {
        let node = cluster.node(ordinal);
        assert_eq!(node.users(10, 0).unwrap().len(), 1);
        let conflicts = node.resolver().list_conflicts(false, 10).unwrap();
        assert_eq!(conflicts.len(), 1, "node {ordinal}");
        assert!(conflicts[0].resolved);
    }

    // later writes to the surviving row flow both ways
    cluster
        .node(2)
        .recorder()
        .update_user(first.id, &UserPatch::status(UserStatus::In))
        .unwrap();
    cluster.round().await;

    let users = cluster.users_everywhere(first.id);
    assert_converged(&users);
    assert_eq!(users[0].status, UserStatus::In);
    assert_eq!(
        cluster.node(1).resolver().list_conflicts(false, 10).unwrap().len(),
        1
    );
}

#[tokio::test]
async fn bootstrap_rejects_a_peer_with_another_cluster_size() {
    let cluster = Cluster::with_configs(2, |config| config);
    cluster.engine(1).bootstrap().await.unwrap();

    let impostor = GateNode::open_in_memory(NodeConfig::new(2, 3).unwrap()).unwrap();
    let mut nodes = HashMap::new();
    nodes.insert(2, impostor);
    let network = Network {
        from: 1,
        nodes: Arc::new(nodes),
        isolated: Arc::new(Mutex::new(HashSet::new())),
    };
    let engine = SyncEngine::new(cluster.node(1).clone(), network);
    let err = engine.bootstrap().await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn bootstrap_skips_unreachable_peers() {
    let cluster = Cluster::new(2, ConflictPolicy::LastWriterWins);
    cluster.isolate(2);
    cluster.engine(1).bootstrap().await.unwrap();
}

#[tokio::test]
async fn trigger_for_unknown_peer_is_not_found() {
    let cluster = Cluster::new(2, ConflictPolicy::LastWriterWins);
    let err = cluster.engine(1).trigger(Some(7)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
