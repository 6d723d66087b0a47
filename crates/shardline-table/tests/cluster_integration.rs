//! Table manager cluster integration tests.
//!
//! Runs several table managers in one process over the mailbox transport,
//! each publishing into a shared cluster directory, with in-memory (or
//! tempfile-backed) redb record stores.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Once};
use std::time::Duration;

use shardline_cluster::{MailboxManager, Transport};
use shardline_core::{
    DatabaseId, Durability, Epoch, ManagerConfig, MemberId, PeerId, ServerId, ShardConfig,
    SindexConfig, TableBasicConfig, TableConfig, TableConfigAndShards, TableId, TableShardScheme,
    WriteAckConfig,
};
use shardline_state::TableStore;
use shardline_table::{
    TableDirectory, TableManager, TableManagerDeps, TablePersistence, initial_table_state,
    request_set_config, request_status, spawn_bcard_publisher,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ── Tracing setup ────────────────────────────────────────────────

static TRACING_INIT: Once = Once::new();

/// Controlled by `RUST_LOG` (e.g. `RUST_LOG=shardline_table=debug`).
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── Harness ──────────────────────────────────────────────────────

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.raft.heartbeat_interval_ms = 50;
    config.raft.election_timeout_min_ms = 150;
    config.raft.election_timeout_max_ms = 300;
    config.raft.rpc_timeout_ms = 500;
    config.leader.set_config_timeout_ms = 5_000;
    config
}

fn table_config(name: &str, servers: &[ServerId]) -> TableConfigAndShards {
    TableConfigAndShards {
        config: TableConfig {
            basic: TableBasicConfig {
                name: name.to_string(),
                database: DatabaseId::nil(),
                primary_key: "id".to_string(),
            },
            shards: vec![ShardConfig {
                replicas: servers.iter().copied().collect(),
                nonvoting_replicas: BTreeSet::new(),
                primary_replica: servers[0],
            }],
            sindexes: BTreeMap::new(),
            write_ack_config: WriteAckConfig::Majority,
            durability: Durability::Hard,
        },
        shard_scheme: TableShardScheme::default(),
    }
}

struct Node {
    peer: PeerId,
    mailboxes: MailboxManager,
    manager: TableManager,
    _publisher: JoinHandle<()>,
}

struct Cluster {
    transport: Transport,
    directory: Arc<TableDirectory>,
    table_id: TableId,
    epoch: Epoch,
    servers: Vec<ServerId>,
    nodes: Vec<Node>,
}

impl Cluster {
    async fn start(size: usize) -> Self {
        Self::start_with(size, fast_config()).await
    }

    async fn start_with(size: usize, config: ManagerConfig) -> Self {
        init_tracing();
        let transport = Transport::new();
        let directory = Arc::new(TableDirectory::new());
        let table_id = TableId::new_random();
        let epoch = Epoch::now();
        let servers: Vec<ServerId> = (0..size).map(|_| ServerId::new_random()).collect();
        let members: Vec<MemberId> = (0..size).map(|_| MemberId::new_random()).collect();

        // Every founder starts from the same state, contract ids included.
        let founders: BTreeSet<MemberId> = members.iter().copied().collect();
        let initial = initial_table_state(table_config("users", &servers), &founders);

        let mut nodes = Vec::new();
        for (server, member) in servers.iter().zip(&members) {
            let peer = PeerId::new_random();
            let mailboxes = MailboxManager::new(&transport, peer);
            let store = TableStore::open_in_memory().unwrap();
            let deps = TableManagerDeps::new(mailboxes.clone(), Arc::clone(&directory), Arc::new(store))
                .with_config(config.clone());
            let manager =
                TableManager::new(*server, table_id, epoch, *member, initial.clone(), deps)
                    .await
                    .unwrap();
            let publisher = spawn_bcard_publisher(
                Arc::clone(&directory),
                peer,
                table_id,
                manager.business_card(),
            );
            nodes.push(Node {
                peer,
                mailboxes,
                manager,
                _publisher: publisher,
            });
        }

        Self {
            transport,
            directory,
            table_id,
            epoch,
            servers,
            nodes,
        }
    }

    /// Index of the single node advertising a leader card.
    fn leader_index(&self) -> Option<usize> {
        let leaders: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.manager.business_card().borrow().leader.is_some())
            .map(|(i, _)| i)
            .collect();
        match leaders.as_slice() {
            [one] => Some(*one),
            _ => None,
        }
    }

    async fn wait_for_leader(&self) -> usize {
        wait_until(|| {
            self.leader_index()
                .is_some_and(|i| self.directory_leader_card(i).is_some())
        })
        .await;
        self.leader_index().unwrap()
    }

    fn directory_leader_card(&self, index: usize) -> Option<shardline_table::LeaderBcard> {
        self.directory
            .get(&(self.nodes[index].peer, self.table_id))
            .and_then(|card| card.leader)
    }

    fn follower_index(&self, leader: usize) -> usize {
        (leader + 1) % self.nodes.len()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Leader card ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_members_advertise_exactly_one_leader() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;

    assert!(cluster.nodes[leader].manager.is_ready());
    assert!(cluster.nodes[leader].manager.has_leader_role());
    for (i, node) in cluster.nodes.iter().enumerate() {
        if i != leader {
            assert!(!node.manager.has_leader_role());
            assert!(node.manager.business_card().borrow().leader.is_none());
        }
    }

    // Every member sees every other as a consensus peer.
    wait_until(|| {
        cluster
            .nodes
            .iter()
            .all(|n| n.manager.directories().raft.len() == 3)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_card_routes_acks_to_every_member() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;

    wait_until(|| {
        cluster
            .nodes
            .iter()
            .all(|n| n.manager.directories().acks.len() == 1)
    })
    .await;
    wait_until(|| cluster.nodes[leader].manager.leader_converged()).await;

    let acks = cluster.nodes[leader].manager.leader_acks().unwrap();
    let committed = cluster.nodes[leader].manager.committed_state();
    for contract_id in committed.state.contracts.keys() {
        let by_server = &acks[contract_id];
        let servers: BTreeSet<ServerId> = by_server.keys().copied().collect();
        assert_eq!(servers, cluster.servers.iter().copied().collect());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn losing_the_leader_moves_the_card() {
    let mut cluster = Cluster::start(3).await;
    let old_leader = cluster.wait_for_leader().await;

    let gone = cluster.nodes.remove(old_leader);
    cluster.transport.disconnect(gone.peer);
    let gone_peer = gone.peer;
    drop(gone);

    // The departed manager's entry is withdrawn and a survivor takes over.
    wait_until(|| !cluster.directory.contains_key(&(gone_peer, cluster.table_id))).await;
    let new_leader = cluster.wait_for_leader().await;
    assert!(cluster.nodes[new_leader].manager.has_leader_role());
    for node in &cluster.nodes {
        assert!(!node.manager.directories().raft.contains_key(&gone_peer));
        assert!(!node.manager.directories().execution.contains_key(&gone_peer));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_follower_drops_out_of_leader_acks() {
    let mut cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;
    wait_until(|| cluster.nodes[leader].manager.leader_converged()).await;

    let follower = cluster.follower_index(leader);
    let crashed_server = cluster.servers[follower];
    let crashed = cluster.nodes.remove(follower);
    let leader = if follower < leader { leader - 1 } else { leader };

    // No destructor runs on a crash, so nothing is withdrawn cleanly.
    cluster.transport.disconnect(crashed.peer);
    std::mem::forget(crashed);

    wait_until(|| {
        cluster.nodes[leader]
            .manager
            .leader_acks()
            .is_some_and(|acks| acks.values().all(|by_server| !by_server.contains_key(&crashed_server)))
    })
    .await;
    assert!(!cluster.nodes[leader].manager.leader_converged());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitioned_leader_answers_set_config_empty_after_timeout() {
    let mut config = fast_config();
    config.leader.set_config_timeout_ms = 500;
    let cluster = Cluster::start_with(3, config).await;
    let leader = cluster.wait_for_leader().await;
    let leader_card = cluster.directory_leader_card(leader).unwrap();
    for (i, node) in cluster.nodes.iter().enumerate() {
        if i != leader {
            cluster.transport.isolate(node.peer);
        }
    }

    // Without a quorum the proposal can never commit.
    let started = tokio::time::Instant::now();
    let reply = request_set_config(
        &cluster.nodes[leader].mailboxes,
        &leader_card,
        table_config("people", &cluster.servers),
        &CancellationToken::new(),
    )
    .await;
    let elapsed = started.elapsed();

    assert!(reply.is_none());
    assert!(elapsed >= Duration::from_millis(450), "replied after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "replied after {elapsed:?}");
    assert_eq!(
        cluster.nodes[leader].manager.committed_state().state.config.config.basic.name,
        "users"
    );
    assert_eq!(cluster.nodes[leader].manager.metrics().set_config_failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn losing_leadership_answers_pending_set_config_and_retracts_card() {
    let mut config = fast_config();
    config.leader.set_config_timeout_ms = 60_000;
    let cluster = Cluster::start_with(3, config).await;
    let leader = cluster.wait_for_leader().await;
    let leader_card = cluster.directory_leader_card(leader).unwrap();
    let old_leader = &cluster.nodes[leader];

    let original = leader_card.uuid;
    let followers: Vec<PeerId> = cluster
        .nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != leader)
        .map(|(_, n)| n.peer)
        .collect();
    for peer in &followers {
        cluster.transport.isolate(*peer);
    }

    let mailboxes = old_leader.mailboxes.clone();
    let servers = cluster.servers.clone();
    let pending = tokio::spawn(async move {
        request_set_config(
            &mailboxes,
            &leader_card,
            table_config("people", &servers),
            &CancellationToken::new(),
        )
        .await
    });

    // Isolated followers keep campaigning and move to higher terms; once
    // healed they force the old leader to step down.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!pending.is_finished());
    for peer in &followers {
        cluster.transport.heal(*peer);
    }

    let reply = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(reply.is_none());

    // The manager is still alive; the role it was running is gone from its card.
    wait_until(|| {
        old_leader.manager.business_card().borrow().leader.as_ref().map(|l| l.uuid) != Some(original)
    })
    .await;
    let metrics = old_leader.manager.metrics();
    assert!(metrics.leader_roles_destroyed >= 1);
    assert_eq!(metrics.set_config_committed, 0);

    cluster.wait_for_leader().await;
}

// ── set_config ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_config_commits_and_renames_everywhere() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;
    let leader_card = cluster.directory_leader_card(leader).unwrap();
    let caller = &cluster.nodes[cluster.follower_index(leader)];

    let renamed = table_config("people", &cluster.servers);
    let timestamp = request_set_config(
        &caller.mailboxes,
        &leader_card,
        renamed.clone(),
        &CancellationToken::new(),
    )
    .await
    .expect("set_config should commit");

    assert_eq!(timestamp.epoch, cluster.epoch);
    let committed = cluster.nodes[leader].manager.committed_state();
    assert_eq!(committed.state.config, renamed);
    assert_eq!(committed.log_index, timestamp.log_index);

    wait_until(|| {
        cluster.nodes.iter().all(|n| {
            let card = n.manager.business_card().borrow().clone();
            card.name == "people" && card.timestamp.log_index == timestamp.log_index
        })
    })
    .await;

    let leader_metrics = cluster.nodes[leader].manager.metrics();
    assert_eq!(leader_metrics.set_config_committed, 1);
    assert_eq!(leader_metrics.set_config_failed, 0);
    assert!(leader_metrics.leader_roles_created >= 1);
    for node in &cluster.nodes {
        let metrics = node.manager.metrics();
        assert!(metrics.bcard_republications >= 1);
        assert!(metrics.commits_observed >= 1);
        assert!(metrics.directory_changes >= 1);
        assert!(metrics.execution_updates >= 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_without_rename_leaves_cards_alone() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;
    let leader_card = cluster.directory_leader_card(leader).unwrap();

    let mut cards: Vec<_> = cluster
        .nodes
        .iter()
        .map(|n| n.manager.business_card())
        .collect();
    let before: Vec<_> = cards.iter_mut().map(|c| c.borrow_and_update().clone()).collect();

    let mut with_index = table_config("users", &cluster.servers);
    with_index.config.sindexes.insert(
        "by_age".to_string(),
        SindexConfig {
            func: "row.age".to_string(),
            multi: false,
            geo: false,
        },
    );
    let timestamp = request_set_config(
        &cluster.nodes[leader].mailboxes,
        &leader_card,
        with_index,
        &CancellationToken::new(),
    )
    .await
    .expect("set_config should commit");

    // Give followers time to apply the commit too.
    wait_until(|| {
        cluster
            .nodes
            .iter()
            .all(|n| n.manager.committed_state().log_index >= timestamp.log_index)
    })
    .await;
    for (card, before) in cards.iter_mut().zip(&before) {
        assert!(!card.has_changed().unwrap());
        assert_eq!(card.borrow().timestamp, before.timestamp);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_config_gets_an_empty_reply() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;
    let leader_card = cluster.directory_leader_card(leader).unwrap();
    let before = cluster.nodes[leader].manager.committed_state();

    let mut invalid = table_config("users", &cluster.servers);
    invalid.config.shards.clear();
    let reply = request_set_config(
        &cluster.nodes[0].mailboxes,
        &leader_card,
        invalid,
        &CancellationToken::new(),
    )
    .await;

    assert!(reply.is_none());
    assert_eq!(cluster.nodes[leader].manager.committed_state().state, before.state);
    assert_eq!(cluster.nodes[leader].manager.metrics().set_config_failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_set_config_gets_no_reply_and_commits_nothing() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;
    let leader_card = cluster.directory_leader_card(leader).unwrap();
    let before = cluster.nodes[leader].manager.committed_state();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let reply = request_set_config(
        &cluster.nodes[0].mailboxes,
        &leader_card,
        table_config("people", &cluster.servers),
        &cancel,
    )
    .await;
    assert!(reply.is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        cluster.nodes[leader].manager.committed_state().state.config.config.basic.name,
        before.state.config.config.basic.name
    );
}

// ── get_status ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_status_locally_and_remotely() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;
    let leader_card = cluster.directory_leader_card(leader).unwrap();

    let mut with_index = table_config("users", &cluster.servers);
    with_index.config.sindexes.insert(
        "by_email".to_string(),
        SindexConfig {
            func: "row.email".to_string(),
            multi: false,
            geo: false,
        },
    );
    let timestamp = request_set_config(
        &cluster.nodes[leader].mailboxes,
        &leader_card,
        with_index,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let target = cluster.follower_index(leader);
    wait_until(|| cluster.nodes[target].manager.committed_state().log_index >= timestamp.log_index)
        .await;

    let local = cluster.nodes[target]
        .manager
        .get_status(&CancellationToken::new())
        .await
        .unwrap();
    assert!(local.contains_key("by_email"));

    let card = cluster.nodes[target].manager.business_card().borrow().clone();
    let remote = request_status(&cluster.nodes[leader].mailboxes, &card, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(remote.keys().collect::<Vec<_>>(), vec!["by_email"]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(cluster.nodes[target].manager.get_status(&cancel).await.is_err());
    assert!(request_status(&cluster.nodes[leader].mailboxes, &card, &cancel).await.is_none());
}

// ── Epochs ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn other_epoch_is_not_a_consensus_peer() {
    let cluster = Cluster::start(3).await;
    cluster.wait_for_leader().await;

    // A stale incarnation of the same table on a fourth peer.
    let peer = PeerId::new_random();
    let mailboxes = MailboxManager::new(&cluster.transport, peer);
    let server = ServerId::new_random();
    let member = MemberId::new_random();
    let stale = TableManager::new(
        server,
        cluster.table_id,
        Epoch::now(),
        member,
        initial_table_state(table_config("users", &[server]), &BTreeSet::from([member])),
        TableManagerDeps::new(
            mailboxes,
            Arc::clone(&cluster.directory),
            Arc::new(TableStore::open_in_memory().unwrap()),
        )
        .with_config(fast_config()),
    )
    .await
    .unwrap();
    let _publisher = spawn_bcard_publisher(
        Arc::clone(&cluster.directory),
        peer,
        cluster.table_id,
        stale.business_card(),
    );

    wait_until(|| {
        cluster
            .nodes
            .iter()
            .all(|n| n.manager.directories().execution.len() == 4)
    })
    .await;
    // The stale incarnation runs its own leader role. Its leader card still
    // reaches the ack directory; acks it receives name contracts it does
    // not hold.
    wait_until(|| {
        cluster
            .nodes
            .iter()
            .all(|n| n.manager.directories().acks.contains_key(&peer))
    })
    .await;
    let leader = cluster.wait_for_leader().await;
    for node in &cluster.nodes {
        assert_eq!(node.manager.directories().raft.len(), 3);
        assert!(!node.manager.directories().raft.contains_key(&peer));
        assert_eq!(node.manager.directories().acks.len(), 2);
    }
    wait_until(|| cluster.nodes[leader].manager.leader_converged()).await;
}

// ── Identity and persistence ─────────────────────────────────────

#[tokio::test]
async fn nil_member_or_unset_epoch_is_rejected() {
    init_tracing();
    let transport = Transport::new();
    let server = ServerId::new_random();
    let member = MemberId::new_random();
    let deps = TableManagerDeps::new(
        MailboxManager::new(&transport, PeerId::new_random()),
        Arc::new(TableDirectory::new()),
        Arc::new(TableStore::open_in_memory().unwrap()),
    );
    let initial = initial_table_state(table_config("users", &[server]), &BTreeSet::from([member]));

    let nil_member = TableManager::new(
        server,
        TableId::new_random(),
        Epoch::now(),
        MemberId::nil(),
        initial.clone(),
        deps.clone(),
    )
    .await;
    assert!(matches!(nil_member, Err(shardline_table::TableError::InvalidIdentity(_))));

    let unset_epoch = TableManager::new(
        server,
        TableId::new_random(),
        Epoch::unset(),
        member,
        initial,
        deps,
    )
    .await;
    assert!(matches!(unset_epoch, Err(shardline_table::TableError::InvalidIdentity(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarted_manager_recovers_committed_config() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = TableStore::open(&dir.path().join("tables.redb")).unwrap();
    let transport = Transport::new();
    let directory = Arc::new(TableDirectory::new());
    let table_id = TableId::new_random();
    let epoch = Epoch::now();
    let server = ServerId::new_random();
    let member = MemberId::new_random();

    let committed_at = {
        let peer = PeerId::new_random();
        let mailboxes = MailboxManager::new(&transport, peer);
        let manager = TableManager::new(
            server,
            table_id,
            epoch,
            member,
            initial_table_state(table_config("users", &[server]), &BTreeSet::from([member])),
            TableManagerDeps::new(mailboxes.clone(), Arc::clone(&directory), Arc::new(store.clone()))
                .with_config(fast_config()),
        )
        .await
        .unwrap();

        let mut card = manager.business_card();
        let leader = tokio::time::timeout(WAIT, card.wait_for(|c| c.leader.is_some()))
            .await
            .unwrap()
            .unwrap()
            .leader
            .unwrap();
        let timestamp = request_set_config(
            &mailboxes,
            &leader,
            table_config("orders", &[server]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        manager.shutdown().await.unwrap();
        timestamp
    };

    let record = store.read_table(table_id).await.unwrap().unwrap();
    assert_eq!(record.epoch(), epoch);
    assert_eq!(record.member_id(), member);

    let restarted = TableManager::new(
        server,
        table_id,
        record.epoch(),
        record.member_id(),
        record.into_raft_state(),
        TableManagerDeps::new(
            MailboxManager::new(&transport, PeerId::new_random()),
            directory,
            Arc::new(store),
        )
        .with_config(fast_config()),
    )
    .await
    .unwrap();

    let committed = restarted.committed_state();
    assert_eq!(committed.state.config.config.basic.name, "orders");
    assert!(committed.log_index >= committed_at.log_index);
    assert_eq!(restarted.business_card().borrow().name, "orders");
}
