//! Leader-side coordination of configuration changes.

use std::collections::BTreeMap;

use shardline_cluster::MinidirValues;
use shardline_core::{ContractId, LogIndex, ServerId, TableConfigAndShards};
use shardline_raft::{Proposer, TableChange};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::executor::{AckKey, ContractAck};

/// Acks grouped by contract, then by the server that sent them.
pub type ContractAcks = BTreeMap<ContractId, BTreeMap<ServerId, ContractAck>>;

pub struct Coordinator {
    proposer: Proposer,
    acks: watch::Receiver<MinidirValues<AckKey, ContractAck>>,
}

impl Coordinator {
    pub fn new(proposer: Proposer, acks: watch::Receiver<MinidirValues<AckKey, ContractAck>>) -> Self {
        Self { proposer, acks }
    }

    /// Apply `mutate` to the committed config and propose the result.
    ///
    /// Shards whose replica assignment is unchanged keep their contract;
    /// the rest get fresh ones. Returns the commit's log index, or `None`
    /// if the new config is invalid or the proposal did not commit.
    pub async fn change_config(
        &self,
        mutate: impl FnOnce(&mut TableConfigAndShards),
        cancel: &CancellationToken,
    ) -> Option<LogIndex> {
        let current = self.proposer.committed_state().state;
        let mut config = current.config.clone();
        mutate(&mut config);

        if let Err(e) = config.validate() {
            warn!(error = %e, "rejecting invalid table config");
            return None;
        }

        let change = TableChange::set_config(&current, config);
        let result = self.proposer.propose_change(change, cancel).await;
        debug!(?result, "config change proposal finished");
        result
    }

    pub fn acks(&self) -> ContractAcks {
        let mut grouped = ContractAcks::new();
        for ((_, (server, contract)), ack) in self.acks.borrow().iter() {
            grouped.entry(*contract).or_default().insert(*server, *ack);
        }
        grouped
    }

    /// True once every replica of every committed contract acked ready.
    pub fn is_converged(&self) -> bool {
        let acks = self.acks();
        let committed = self.proposer.committed_state();
        committed.state.contracts.iter().all(|(contract_id, (_, contract))| {
            let Some(by_server) = acks.get(contract_id) else {
                return false;
            };
            contract
                .replicas
                .iter()
                .all(|server| by_server.get(server).is_some_and(ContractAck::is_ready))
        })
    }
}
