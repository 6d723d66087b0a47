//! The per-table manager.
//!
//! Owns one consensus member and everything hanging off its committed
//! state: the contract executor, the index runtime, the minidir readers and
//! writers that route execution bcards and acks, and the business card this
//! member advertises. Three subscriptions keep it current: the cluster-wide
//! directory, the committed state, and leadership readiness.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use shardline_cluster::{
    Directory, Mailbox, MailboxManager, MinidirReadManager, MinidirWriteManager, View,
};
use shardline_core::{
    CommittedState, Epoch, ManagerConfig, MemberId, PeerId, ServerId, TableConfig,
    TableConfigAndShards, TableId, TableRaftState, TableTimestamp,
};
use shardline_raft::{RaftMember, RaftPersistentState};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bcard::{GetStatusRequest, TableManagerBcard};
use crate::coordinator::ContractAcks;
use crate::directories::PeerDirectories;
use crate::error::{TableError, TableResult};
use crate::executor::{
    AckKey, AckingExecutorFactory, ContractAck, ContractExecutor, ExecutionBcard, ExecutionKey,
    ExecutorFactory,
};
use crate::leader::{LeaderContext, LeaderRole, LeaderSlot, spawn_leader_slot};
use crate::perfmon::{PerfmonCollection, PerfmonMembership, TableMetrics, TableMetricsSnapshot};
use crate::persistence::{TablePersistence, TableStorage};
use crate::sindex::{IndexRuntime, IndexRuntimeFactory, SindexManagerFactory, SindexStatusMap};

/// The cluster-wide directory every table manager publishes into.
pub type TableDirectory = Directory<(PeerId, TableId), TableManagerBcard>;

/// Collaborators a table manager is built from.
#[derive(Clone)]
pub struct TableManagerDeps {
    pub mailboxes: MailboxManager,
    pub directory: Arc<TableDirectory>,
    pub persistence: Arc<dyn TablePersistence>,
    pub executor_factory: Arc<dyn ExecutorFactory>,
    pub index_factory: Arc<dyn IndexRuntimeFactory>,
    pub perfmon: PerfmonCollection,
    pub config: ManagerConfig,
}

impl TableManagerDeps {
    /// Deps with the acking executor, the sindex manager and default config.
    pub fn new(
        mailboxes: MailboxManager,
        directory: Arc<TableDirectory>,
        persistence: Arc<dyn TablePersistence>,
    ) -> Self {
        Self {
            mailboxes,
            directory,
            persistence,
            executor_factory: Arc::new(AckingExecutorFactory),
            index_factory: Arc::new(SindexManagerFactory),
            perfmon: PerfmonCollection::new(),
            config: ManagerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_executor_factory(mut self, factory: Arc<dyn ExecutorFactory>) -> Self {
        self.executor_factory = factory;
        self
    }

    pub fn with_index_factory(mut self, factory: Arc<dyn IndexRuntimeFactory>) -> Self {
        self.index_factory = factory;
        self
    }

    /// Register the manager's counters in a shared collection.
    pub fn with_perfmon(mut self, perfmon: PerfmonCollection) -> Self {
        self.perfmon = perfmon;
        self
    }
}

pub struct TableManager {
    table_id: TableId,
    epoch: Epoch,
    member_id: MemberId,
    storage: Arc<TableStorage>,
    directories: Arc<PeerDirectories>,
    bcard: Arc<watch::Sender<TableManagerBcard>>,
    leader: Arc<Mutex<LeaderSlot<LeaderRole>>>,
    leader_worker: JoinHandle<()>,
    subscriptions: Vec<JoinHandle<()>>,
    sindexes: Arc<dyn IndexRuntime>,
    _get_status_mailbox: Mailbox<GetStatusRequest>,
    _contract_ack_write_manager: MinidirWriteManager<AckKey, ContractAck>,
    _execution_bcard_write_manager: MinidirWriteManager<ExecutionKey, ExecutionBcard>,
    _contract_executor: Box<dyn ContractExecutor>,
    _execution_bcard_read_manager: MinidirReadManager<ExecutionKey, ExecutionBcard>,
    raft: RaftMember,
    metrics: Arc<TableMetrics>,
    _perfmon: PerfmonMembership,
}

impl TableManager {
    /// Build the manager for `table_id` on this server and start it.
    ///
    /// `initial_state` is either a freshly made record for a new table or
    /// the record last written through `write_persistent_state`.
    pub async fn new(
        server_id: ServerId,
        table_id: TableId,
        epoch: Epoch,
        member_id: MemberId,
        initial_state: RaftPersistentState,
        deps: TableManagerDeps,
    ) -> TableResult<Self> {
        if member_id.is_nil() {
            return Err(TableError::InvalidIdentity("member id is nil"));
        }
        if epoch.is_unset() {
            return Err(TableError::InvalidIdentity("epoch is unset"));
        }

        let perfmon = deps.perfmon.register(table_id);
        let metrics = perfmon.metrics();
        let mailboxes = &deps.mailboxes;
        let directories = Arc::new(PeerDirectories::new(table_id, epoch));
        let storage = Arc::new(TableStorage::new(
            table_id,
            epoch,
            member_id,
            Arc::clone(&deps.persistence),
        ));

        let raft = RaftMember::start(
            member_id,
            mailboxes,
            directories.raft.watch(),
            storage.clone(),
            initial_state,
            &deps.config.raft,
        )
        .await?;

        let execution_bcard_read_manager = MinidirReadManager::new(mailboxes);
        let committed_view = View::new(raft.committed_state(), |c: &CommittedState| c.state.clone());
        let contract_executor = deps.executor_factory.build(
            server_id,
            mailboxes,
            committed_view.clone(),
            execution_bcard_read_manager.values(),
            Arc::clone(&metrics),
        );
        let execution_bcard_write_manager = MinidirWriteManager::new(
            mailboxes,
            contract_executor.local_execution_bcards(),
            directories.execution.watch(),
        );
        let contract_ack_write_manager = MinidirWriteManager::new(
            mailboxes,
            contract_executor.acks(),
            directories.acks.watch(),
        );

        let sindexes = deps.index_factory.build(
            committed_view.subview(|s: &TableRaftState| -> TableConfig { s.config.config.clone() }),
        );
        let get_status_mailbox = {
            let runtime = Arc::clone(&sindexes);
            let replier = mailboxes.clone();
            Mailbox::new(mailboxes, move |cancel, req: GetStatusRequest| {
                let runtime = Arc::clone(&runtime);
                let replier = replier.clone();
                async move {
                    if let Some(status) = runtime.get_status(&cancel).await {
                        replier.send(&req.reply, status);
                    }
                }
            })
        };

        let initial_bcard = {
            let committed_rx = raft.committed_state();
            let committed = committed_rx.borrow();
            let config = &committed.state.config.config.basic;
            TableManagerBcard {
                timestamp: TableTimestamp {
                    epoch,
                    log_index: committed.log_index,
                },
                database: config.database,
                name: config.name.clone(),
                primary_key: config.primary_key.clone(),
                raft_member_id: member_id,
                raft_business_card: raft.business_card(),
                execution_bcard_minidir_bcard: execution_bcard_read_manager.bcard(),
                get_status_mailbox: get_status_mailbox.address(),
                server_id,
                leader: None,
            }
        };
        let (bcard_tx, _bcard_rx) = watch::channel(initial_bcard);
        let bcard = Arc::new(bcard_tx);

        let leader_ctx = LeaderContext {
            table_id,
            epoch,
            mailboxes: mailboxes.clone(),
            proposer: raft.proposer(),
            bcard: Arc::clone(&bcard),
            set_config_timeout: deps.config.leader.set_config_timeout(),
            metrics: Arc::clone(&metrics),
        };
        let leader = Arc::new(Mutex::new(LeaderSlot::new(move || LeaderRole::new(&leader_ctx))));
        let (leader_tx, leader_worker) = spawn_leader_slot(Arc::clone(&leader));

        let subscriptions = vec![
            tokio::spawn(follow_directory(
                Arc::clone(&deps.directory),
                Arc::clone(&directories),
                Arc::clone(&metrics),
            )),
            tokio::spawn(follow_committed(
                raft.committed_state(),
                Arc::clone(&bcard),
                Arc::clone(&metrics),
            )),
            tokio::spawn(follow_readiness(raft.readiness_for_change(), leader_tx)),
        ];

        info!(%table_id, %epoch, %member_id, %server_id, "table manager started");
        Ok(Self {
            table_id,
            epoch,
            member_id,
            storage,
            directories,
            bcard,
            leader,
            leader_worker,
            subscriptions,
            sindexes,
            _get_status_mailbox: get_status_mailbox,
            _contract_ack_write_manager: contract_ack_write_manager,
            _execution_bcard_write_manager: execution_bcard_write_manager,
            _contract_executor: contract_executor,
            _execution_bcard_read_manager: execution_bcard_read_manager,
            raft,
            metrics,
            _perfmon: perfmon,
        })
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    /// The published business card; fires on every republication.
    pub fn business_card(&self) -> watch::Receiver<TableManagerBcard> {
        self.bcard.subscribe()
    }

    pub fn committed_state(&self) -> CommittedState {
        self.raft.committed_state().borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.raft.readiness_for_change().borrow()
    }

    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.raft.readiness_for_change()
    }

    pub fn has_leader_role(&self) -> bool {
        self.leader.lock().current().is_some()
    }

    /// Acks collected by the leader role, if this manager has one.
    pub fn leader_acks(&self) -> Option<ContractAcks> {
        self.leader.lock().current().map(|l| l.coordinator().acks())
    }

    /// Whether the leader role has seen every replica ack the committed
    /// contracts. False when there is no leader role.
    pub fn leader_converged(&self) -> bool {
        self.leader
            .lock()
            .current()
            .is_some_and(|l| l.coordinator().is_converged())
    }

    pub fn directories(&self) -> &PeerDirectories {
        &self.directories
    }

    pub fn metrics(&self) -> TableMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Status of this table's secondary indexes.
    pub async fn get_status(&self, cancel: &CancellationToken) -> TableResult<SindexStatusMap> {
        self.sindexes
            .get_status(cancel)
            .await
            .ok_or(TableError::Cancelled)
    }

    /// Durably store `raft_state` tagged with this manager's identity.
    pub async fn write_persistent_state(
        &self,
        raft_state: &RaftPersistentState,
        cancel: &CancellationToken,
    ) -> TableResult<()> {
        self.storage.write(raft_state, cancel).await
    }

    /// Retract the leader role and wait for the consensus member to stop.
    pub async fn shutdown(self) -> TableResult<()> {
        for task in &self.subscriptions {
            task.abort();
        }
        self.leader_worker.abort();
        self.leader.lock().apply(false);
        self.raft.shutdown().await?;
        Ok(())
    }
}

impl Drop for TableManager {
    fn drop(&mut self) {
        for task in &self.subscriptions {
            task.abort();
        }
        self.leader_worker.abort();
        self.leader.lock().apply(false);
        info!(table_id = %self.table_id, member_id = %self.member_id, "table manager stopped");
    }
}

async fn follow_directory(
    directory: Arc<TableDirectory>,
    directories: Arc<PeerDirectories>,
    metrics: Arc<TableMetrics>,
) {
    let mut changes = directory.subscribe();
    while let Some(((peer, table_id), bcard)) = changes.next().await {
        if table_id == directories.table_id() {
            metrics.record_directory_change();
        }
        directories.on_directory_change(peer, table_id, bcard.as_ref());
    }
}

async fn follow_committed(
    mut committed: watch::Receiver<CommittedState>,
    bcard: Arc<watch::Sender<TableManagerBcard>>,
    metrics: Arc<TableMetrics>,
) {
    let mut first = true;
    loop {
        {
            let current = committed.borrow_and_update();
            if !first {
                metrics.record_commit();
            }
            if refresh_bcard(&bcard, &current) {
                metrics.record_republication();
                debug!(log_index = current.log_index, "business card republished");
            }
        }
        first = false;
        if committed.changed().await.is_err() {
            break;
        }
    }
}

async fn follow_readiness(mut readiness: watch::Receiver<bool>, leader: mpsc::UnboundedSender<bool>) {
    loop {
        let ready = *readiness.borrow_and_update();
        if leader.send(ready).is_err() {
            break;
        }
        if readiness.changed().await.is_err() {
            break;
        }
    }
}

/// Bring the card's name and database in line with the committed config.
/// Commits that change neither leave the card, and its watchers, alone.
pub(crate) fn refresh_bcard(
    bcard: &watch::Sender<TableManagerBcard>,
    committed: &CommittedState,
) -> bool {
    let basic = &committed.state.config.config.basic;
    bcard.send_if_modified(|card| {
        if card.name == basic.name && card.database == basic.database {
            return false;
        }
        card.timestamp.log_index = committed.log_index;
        card.name = basic.name.clone();
        card.database = basic.database;
        true
    })
}

/// The state a brand-new table starts from: `config` with fresh contracts,
/// founded by `members`.
pub fn initial_table_state(
    config: TableConfigAndShards,
    members: &BTreeSet<MemberId>,
) -> RaftPersistentState {
    RaftPersistentState::make_initial(TableRaftState::new(config), members)
}

#[cfg(test)]
mod tests {
    use shardline_core::DatabaseId;

    use super::*;
    use crate::test_util::{committed, dummy_bcard};

    #[tokio::test]
    async fn unchanged_name_and_database_do_not_republish() {
        let epoch = Epoch::now();
        let state = committed("users", 3);
        let mut card = dummy_bcard(epoch);
        card.name = "users".to_string();
        card.database = state.state.config.config.basic.database;
        card.timestamp.log_index = 3;
        let (tx, mut rx) = watch::channel(card);
        rx.borrow_and_update();

        let later = CommittedState {
            log_index: 9,
            ..state
        };
        assert!(!refresh_bcard(&tx, &later));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(rx.borrow().timestamp.log_index, 3);
    }

    #[tokio::test]
    async fn rename_republishes_with_commit_index() {
        let epoch = Epoch::now();
        let mut card = dummy_bcard(epoch);
        card.name = "users".to_string();
        let (tx, mut rx) = watch::channel(card);
        rx.borrow_and_update();

        assert!(refresh_bcard(&tx, &committed("people", 7)));
        assert!(rx.has_changed().unwrap());
        let card = rx.borrow_and_update().clone();
        assert_eq!(card.name, "people");
        assert_eq!(card.timestamp.log_index, 7);
        assert_eq!(card.timestamp.epoch, epoch);
    }

    #[tokio::test]
    async fn database_move_republishes() {
        let epoch = Epoch::now();
        let mut state = committed("users", 4);
        let mut card = dummy_bcard(epoch);
        card.name = "users".to_string();
        card.database = state.state.config.config.basic.database;
        let (tx, _rx) = watch::channel(card);

        state.state.config.config.basic.database = DatabaseId::new_random();
        assert!(refresh_bcard(&tx, &state));
        assert_eq!(tx.borrow().database, state.state.config.config.basic.database);
    }
}
