//! End-to-end cluster scenarios over the in-memory transport.
//!
//! These drive whole servers (main loop, replication, snapshots) through
//! the same code paths a deployed node uses, with the network swapped for
//! the partitionable in-memory fabric.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bleepraft::config::RaftConfig;
use bleepraft::kv::KvStateMachine;
use bleepraft::membership::{Configuration, Membership, PeerSet};
use bleepraft::message::{
    AppendEntriesRequest, ApplyRequest, ApplyResponse, LogBody, LogEntry, LogMeta, Peer,
};
use bleepraft::server::{Server, ServerCoreOptions};
use bleepraft::snapshot::SnapshotProvider;
use bleepraft::state::Role;
use bleepraft::storage::memory::{MemoryLogProvider, MemorySnapshotStore, MemoryStableStore};
use bleepraft::transport::memory::MemoryNetwork;
use bleepraft::{LogProvider, Transport};

fn fast_config() -> RaftConfig {
    RaftConfig {
        election_timeout_ms: 150,
        follower_timeout_ms: 150,
        heartbeat_interval_ms: 25,
        timer_random_ratio: 0.5,
        snapshot_threshold: 1024,
        max_append_batch: 16,
        rpc_timeout_ms: 250,
        bootstrap: true,
    }
}

fn endpoint_of(id: &str) -> String {
    format!("mem://{id}")
}

struct Node {
    id: String,
    endpoint: String,
    server: Arc<Server>,
    kv: Arc<KvStateMachine>,
    log: Arc<MemoryLogProvider>,
    snapshots: Arc<MemorySnapshotStore>,
}

impl Node {
    fn peer(&self) -> Peer {
        Peer::new(self.id.clone(), self.endpoint.clone())
    }
}

async fn start_node(
    network: &Arc<MemoryNetwork>,
    id: &str,
    config: RaftConfig,
    seed: Option<LogEntry>,
) -> Node {
    let endpoint = endpoint_of(id);
    let transport = network.transport(&endpoint);
    let log = Arc::new(MemoryLogProvider::new());
    if let Some(entry) = seed {
        log.append(vec![entry]).unwrap();
    }
    let kv = Arc::new(KvStateMachine::new());
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let server = Server::new(
        ServerCoreOptions {
            id: id.to_string(),
            log: log.clone(),
            stable: Arc::new(MemoryStableStore::new()),
            snapshots: snapshots.clone(),
            state_machine: kv.clone(),
            transport,
        },
        config,
    )
    .unwrap();

    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });

    Node {
        id: id.to_string(),
        endpoint,
        server,
        kv,
        log,
        snapshots,
    }
}

struct Cluster {
    network: Arc<MemoryNetwork>,
    nodes: Vec<Node>,
}

impl Cluster {
    /// Start `ids` as a restored cluster: every log pre-seeded with the
    /// same initial configuration entry at index 1.
    async fn start(ids: &[&str], config: RaftConfig) -> Cluster {
        let network = MemoryNetwork::new();
        let peers: Vec<Peer> = ids.iter().map(|id| Peer::new(*id, endpoint_of(id))).collect();
        let configuration = Configuration::new(Membership::Stable(PeerSet::new(peers)), 1);
        let seed = LogEntry {
            index: 1,
            term: 0,
            body: LogBody::configuration(&configuration).unwrap(),
        };
        let mut nodes = Vec::new();
        for id in ids {
            nodes.push(start_node(&network, id, config.clone(), Some(seed.clone())).await);
        }
        Cluster { network, nodes }
    }

    fn node(&self, id: &str) -> &Node {
        self.nodes.iter().find(|n| n.id == id).expect("unknown node")
    }

    /// Wait until one node leads and every connected node agrees on it.
    async fn wait_for_leader(&self) -> &Node {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let leaders: Vec<&Node> = self
                .nodes
                .iter()
                .filter(|n| n.server.role() == Role::Leader)
                .collect();
            if leaders.len() == 1 {
                return leaders[0];
            }
            if Instant::now() > deadline {
                panic!("no single leader emerged");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Apply a command, retrying through leadership changes.
    async fn apply_anywhere(&self, command: &str) -> LogMeta {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let leader = self.wait_for_leader().await;
            match leader.server.apply_command(command).await {
                Ok(meta) => return meta,
                Err(err) => {
                    if Instant::now() > deadline {
                        panic!("apply of {command} kept failing: {err}");
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        }
    }
}

async fn wait_for(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// -- Scenarios ----------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_bootstraps_and_applies() {
    let network = MemoryNetwork::new();
    let node = start_node(&network, "a", fast_config(), None).await;

    wait_for("leadership", Duration::from_secs(3), || {
        node.server.role() == Role::Leader
    })
    .await;

    // Index 1 is the bootstrap configuration entry; the first command lands
    // at index 2 under the first elected term.
    let meta = node.server.apply_command("x=1").await.unwrap();
    assert_eq!(meta, LogMeta { index: 2, term: 1 });

    wait_for("command application", Duration::from_secs(3), || {
        node.kv.value("x") == Some(b"1".to_vec())
    })
    .await;

    let states = node.server.states();
    assert_eq!(states.role, "leader");
    assert_eq!(states.commit_index, 2);
    assert_eq!(states.last_log_index, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_election_and_replication() {
    let cluster = Cluster::start(&["a", "b", "c"], fast_config()).await;
    let leader_id = cluster.wait_for_leader().await.id.clone();

    // Every follower learns who leads.
    wait_for("leader agreement", Duration::from_secs(3), || {
        cluster
            .nodes
            .iter()
            .all(|n| n.server.leader().map(|p| p.id) == Some(leader_id.clone()))
    })
    .await;

    // A write addressed directly to a follower is refused with the hint.
    let follower = cluster.nodes.iter().find(|n| n.id != leader_id).unwrap();
    let probe = cluster.network.transport("mem://probe");
    let response = probe
        .apply_log(
            &follower.peer(),
            ApplyRequest {
                body: LogBody::command(b"x=1".to_vec()),
            },
        )
        .await
        .unwrap();
    match response {
        ApplyResponse::Error(message) => {
            assert!(message.contains("not the cluster leader"));
            // The refusal names the leader for the caller's next attempt.
            assert!(
                message.contains(&format!("current leader is {leader_id}")),
                "error did not carry the leader hint: {message}"
            );
        }
        other => panic!("expected a NotLeader error, got {other:?}"),
    }

    // The follower's own apply entrypoint proxies to the leader.
    follower.server.apply_command("set/k/v").await.unwrap();

    wait_for("replication to all nodes", Duration::from_secs(3), || {
        cluster
            .nodes
            .iter()
            .all(|n| n.kv.value("k") == Some(b"v".to_vec()))
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitioned_follower_converges_after_heal() {
    let cluster = Cluster::start(&["a", "b", "c"], fast_config()).await;
    cluster.wait_for_leader().await;
    cluster.apply_anywhere("a=1").await;
    wait_for("initial replication", Duration::from_secs(3), || {
        cluster.nodes.iter().all(|n| n.kv.value("a").is_some())
    })
    .await;

    // Cut one follower off; it will campaign in vain and inflate its term.
    let leader_id = cluster.wait_for_leader().await.id.clone();
    let isolated = cluster
        .nodes
        .iter()
        .find(|n| n.id != leader_id)
        .unwrap()
        .id
        .clone();
    cluster.network.isolate(&endpoint_of(&isolated));

    cluster.apply_anywhere("b=2").await;
    let connected: Vec<&Node> = cluster.nodes.iter().filter(|n| n.id != isolated).collect();
    wait_for("majority replication", Duration::from_secs(3), || {
        connected.iter().all(|n| n.kv.value("b").is_some())
    })
    .await;
    assert!(cluster.node(&isolated).kv.value("b").is_none());

    // Let the isolated node time out a few times before reconnecting.
    tokio::time::sleep(Duration::from_millis(500)).await;
    cluster.network.rejoin(&endpoint_of(&isolated));

    // Its higher term forces a re-election, after which its log converges.
    cluster.apply_anywhere("c=3").await;
    wait_for("full convergence", Duration::from_secs(5), || {
        cluster.nodes.iter().all(|n| {
            n.kv.value("a").is_some() && n.kv.value("b").is_some() && n.kv.value("c").is_some()
        })
    })
    .await;

    wait_for("log convergence", Duration::from_secs(3), || {
        let first = cluster.nodes[0].server.states().last_log_index;
        cluster
            .nodes
            .iter()
            .all(|n| n.server.states().last_log_index == first)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joint_consensus_replaces_a_member() {
    let cluster = Cluster::start(&["a", "b", "c"], fast_config()).await;
    cluster.wait_for_leader().await;
    cluster.apply_anywhere("x=1").await;

    // Start d blank, waiting to be contacted.
    let mut join_config = fast_config();
    join_config.bootstrap = false;
    let d = start_node(&cluster.network, "d", join_config, None).await;

    // Transition {a, b, c} -> {a, b, d} through joint consensus.
    let target = PeerSet::new(vec![
        Peer::new("a", endpoint_of("a")),
        Peer::new("b", endpoint_of("b")),
        Peer::new("d", endpoint_of("d")),
    ]);
    let leader = cluster.wait_for_leader().await;
    leader.server.change_membership(target).await.unwrap();

    // The transition settles once the post-transition configuration is
    // committed on the members that remain.
    wait_for("final configuration", Duration::from_secs(5), || {
        ["a", "b"].iter().all(|id| {
            let committed = cluster.node(id).server.committed_membership();
            !committed.is_joint() && committed.contains("d") && !committed.contains("c")
        })
    })
    .await;

    // The decommissioned node goes dark.
    cluster.network.isolate(&endpoint_of("c"));

    cluster.apply_anywhere("y=2").await;
    wait_for("replication to the new set", Duration::from_secs(5), || {
        cluster.node("a").kv.value("y").is_some()
            && cluster.node("b").kv.value("y").is_some()
            && d.kv.value("y").is_some()
    })
    .await;
    assert!(cluster.node("c").kv.value("y").is_none());
    assert!(d.server.committed_membership().contains("d"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_peer_is_caught_up_with_a_snapshot() {
    let mut config = fast_config();
    config.snapshot_threshold = 5;

    let network = MemoryNetwork::new();
    let a = start_node(&network, "a", config.clone(), None).await;
    wait_for("leadership", Duration::from_secs(3), || {
        a.server.role() == Role::Leader
    })
    .await;

    for i in 0..10 {
        a.server
            .apply_command(format!("k{i}={i}"))
            .await
            .unwrap();
    }
    wait_for("all commands applied", Duration::from_secs(3), || {
        a.kv.value("k9").is_some()
    })
    .await;

    // The scheduler crosses the threshold, captures, and trims the prefix.
    wait_for("snapshot capture", Duration::from_secs(5), || {
        a.snapshots.latest().unwrap().is_some()
    })
    .await;
    wait_for("log compaction", Duration::from_secs(5), || {
        a.log.first_index().unwrap() > 1
    })
    .await;
    let snapshot_index = a.snapshots.latest().unwrap().unwrap().index;

    // A blank joiner cannot be served from the log alone any more.
    let mut join_config = config.clone();
    join_config.bootstrap = false;
    let f = start_node(&network, "f", join_config, None).await;

    let target = PeerSet::new(vec![
        Peer::new("a", endpoint_of("a")),
        Peer::new("f", endpoint_of("f")),
    ]);
    a.server.change_membership(target).await.unwrap();

    wait_for("snapshot install and catch-up", Duration::from_secs(10), || {
        f.kv.value("k9").is_some()
    })
    .await;
    // The joiner never saw the compacted prefix; its log starts past the
    // snapshot index.
    assert!(f.log.first_index().unwrap() > snapshot_index);
    let (applied, _) = f.kv.applied();
    assert!(applied >= snapshot_index);

    a.server.apply_command("post=1").await.unwrap();
    wait_for("replication after install", Duration::from_secs(5), || {
        f.kv.value("post").is_some()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_steps_down_when_shown_a_higher_term() {
    let cluster = Cluster::start(&["a", "b", "c"], fast_config()).await;
    let leader = cluster.wait_for_leader().await;
    let leader_id = leader.id.clone();
    let term = leader.server.states().current_term;
    let usurper = cluster.nodes.iter().find(|n| n.id != leader_id).unwrap();

    let probe = cluster.network.transport("mem://probe");
    let response = probe
        .append_entries(
            &leader.peer(),
            AppendEntriesRequest {
                term: term + 5,
                leader_id: usurper.id.clone(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            },
        )
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.term, term + 5);

    let old_leader = cluster.node(&leader_id);
    wait_for("stepdown", Duration::from_secs(3), || {
        old_leader.server.role() == Role::Follower
            && old_leader.server.states().current_term >= term + 5
    })
    .await;
    assert_eq!(
        old_leader.server.leader().map(|p| p.id),
        Some(usurper.id.clone())
    );
}
