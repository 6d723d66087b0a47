//! Contract execution.
//!
//! The executor turns the committed contract set into local work. It
//! publishes one execution bcard per contract this server takes part in
//! (read by every peer) and one ack per contract (read by the leader).
//! `AckingExecutor` stands in for real shard execution: it performs no
//! storage work, but its acks reflect which replicas of each contract have
//! announced themselves, which is what the coordinator waits on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shardline_cluster::{MailboxManager, MinidirValues, View};
use shardline_core::{CommittedState, ContractId, ServerId, TableRaftState};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::perfmon::TableMetrics;

pub type ExecutionKey = (ServerId, ContractId);
pub type AckKey = (ServerId, ContractId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionRole {
    Primary,
    Secondary,
    Nonvoting,
}

/// Announces that a server is executing a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionBcard {
    pub shard: usize,
    pub role: ExecutionRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    /// Primary still missing execution bcards from some replicas.
    PrimaryNeedReplicas,
    PrimaryReady,
    SecondaryNeedPrimary,
    SecondaryStreaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAck {
    pub shard: usize,
    pub state: AckState,
}

impl ContractAck {
    pub fn is_ready(&self) -> bool {
        matches!(self.state, AckState::PrimaryReady | AckState::SecondaryStreaming)
    }
}

pub trait ContractExecutor: Send + Sync {
    /// Execution bcards for the contracts this server takes part in.
    fn local_execution_bcards(&self) -> watch::Receiver<BTreeMap<ExecutionKey, ExecutionBcard>>;

    /// Acks for the current leader's coordinator.
    fn acks(&self) -> watch::Receiver<BTreeMap<AckKey, ContractAck>>;
}

pub trait ExecutorFactory: Send + Sync + 'static {
    fn build(
        &self,
        server_id: ServerId,
        mailboxes: &MailboxManager,
        committed: View<CommittedState, TableRaftState>,
        remote_bcards: watch::Receiver<MinidirValues<ExecutionKey, ExecutionBcard>>,
        metrics: Arc<TableMetrics>,
    ) -> Box<dyn ContractExecutor>;
}

/// Builds `AckingExecutor`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckingExecutorFactory;

impl ExecutorFactory for AckingExecutorFactory {
    fn build(
        &self,
        server_id: ServerId,
        _mailboxes: &MailboxManager,
        committed: View<CommittedState, TableRaftState>,
        remote_bcards: watch::Receiver<MinidirValues<ExecutionKey, ExecutionBcard>>,
        metrics: Arc<TableMetrics>,
    ) -> Box<dyn ContractExecutor> {
        Box::new(AckingExecutor::new(server_id, committed, remote_bcards, metrics))
    }
}

pub struct AckingExecutor {
    bcards: watch::Receiver<BTreeMap<ExecutionKey, ExecutionBcard>>,
    acks: watch::Receiver<BTreeMap<AckKey, ContractAck>>,
    task: JoinHandle<()>,
}

impl AckingExecutor {
    pub fn new(
        server_id: ServerId,
        mut committed: View<CommittedState, TableRaftState>,
        mut remote_bcards: watch::Receiver<MinidirValues<ExecutionKey, ExecutionBcard>>,
        metrics: Arc<TableMetrics>,
    ) -> Self {
        let (bcards_tx, bcards) = watch::channel(BTreeMap::new());
        let (acks_tx, acks) = watch::channel(BTreeMap::new());

        let task = tokio::spawn(async move {
            loop {
                let state = committed.get_and_update();
                let remote = remote_bcards.borrow_and_update().clone();
                let (local, local_acks) = execute(server_id, &state, &remote);
                if replace_if_changed(&bcards_tx, local) | replace_if_changed(&acks_tx, local_acks) {
                    metrics.record_execution_update();
                    debug!(%server_id, contracts = state.contracts.len(), "execution state updated");
                }
                tokio::select! {
                    alive = committed.changed() => if !alive { break },
                    changed = remote_bcards.changed() => if changed.is_err() { break },
                }
            }
        });

        Self { bcards, acks, task }
    }
}

impl ContractExecutor for AckingExecutor {
    fn local_execution_bcards(&self) -> watch::Receiver<BTreeMap<ExecutionKey, ExecutionBcard>> {
        self.bcards.clone()
    }

    fn acks(&self) -> watch::Receiver<BTreeMap<AckKey, ContractAck>> {
        self.acks.clone()
    }
}

impl Drop for AckingExecutor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn replace_if_changed<T: PartialEq>(tx: &watch::Sender<T>, next: T) -> bool {
    tx.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    })
}

/// Local bcards and acks for `server_id` given the committed contracts and
/// the execution bcards announced so far.
fn execute(
    server_id: ServerId,
    state: &TableRaftState,
    remote: &MinidirValues<ExecutionKey, ExecutionBcard>,
) -> (
    BTreeMap<ExecutionKey, ExecutionBcard>,
    BTreeMap<AckKey, ContractAck>,
) {
    let mut bcards = BTreeMap::new();
    let mut acks = BTreeMap::new();

    for (contract_id, (shard, contract)) in &state.contracts {
        if !contract.involves(&server_id) {
            continue;
        }
        let role = if contract.primary == Some(server_id) {
            ExecutionRole::Primary
        } else if contract.voters.contains(&server_id) {
            ExecutionRole::Secondary
        } else {
            ExecutionRole::Nonvoting
        };
        bcards.insert((server_id, *contract_id), ExecutionBcard { shard: *shard, role });

        let announced: BTreeSet<ServerId> = remote
            .keys()
            .filter(|(_, (_, cid))| cid == contract_id)
            .map(|(_, (server, _))| *server)
            .collect();
        let ack_state = match role {
            ExecutionRole::Primary if contract.replicas.is_subset(&announced) => AckState::PrimaryReady,
            ExecutionRole::Primary => AckState::PrimaryNeedReplicas,
            _ if contract.primary.is_some_and(|p| announced.contains(&p)) => {
                AckState::SecondaryStreaming
            }
            _ => AckState::SecondaryNeedPrimary,
        };
        acks.insert(
            (server_id, *contract_id),
            ContractAck {
                shard: *shard,
                state: ack_state,
            },
        );
    }

    (bcards, acks)
}
