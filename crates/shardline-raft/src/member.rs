//! One table's consensus member.
//!
//! Owns the openraft instance, serves inbound Raft RPCs from its mailbox,
//! and exposes the three things the rest of the table needs: the committed
//! state, whether this member may currently propose, and a way to propose.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use openraft::ServerState;
use shardline_cluster::{Mailbox, MailboxManager};
use shardline_core::{CommittedState, LogIndex, MemberId, RaftSettings};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConsensusError, ConsensusResult};
use crate::log_store::LogStore;
use crate::network::{NetworkFactory, RaftBcard, RaftPeers, RaftRpc};
use crate::persistent::{RaftPersistentState, RaftStorageInterface};
use crate::state_machine::StateMachine;
use crate::store::RaftStore;
use crate::typ::{TableChange, TableRaft};

pub struct RaftMember {
    member_id: MemberId,
    raft: Arc<TableRaft>,
    store: RaftStore,
    readiness: watch::Receiver<bool>,
    readiness_task: JoinHandle<()>,
    rpc_mailbox: Mailbox<RaftRpc>,
    stopped: AtomicBool,
}

impl RaftMember {
    /// Start the member from its last persisted record.
    ///
    /// A member that has never run and carries founding voters bootstraps
    /// the group; every founding member does this with the same voter set,
    /// so whichever call lands first wins and the others are ignored.
    pub async fn start(
        member_id: MemberId,
        mailboxes: &MailboxManager,
        peers: watch::Receiver<RaftPeers>,
        storage: Arc<dyn RaftStorageInterface>,
        initial: RaftPersistentState,
        settings: &RaftSettings,
    ) -> ConsensusResult<Self> {
        let bootstrap = (initial.is_pristine() && !initial.initial_members.is_empty())
            .then(|| initial.initial_members.clone());
        let store = RaftStore::new(initial, storage);

        let raft_config = openraft::Config {
            cluster_name: "shardline-table".to_string(),
            heartbeat_interval: settings.heartbeat_interval_ms,
            election_timeout_min: settings.election_timeout_min_ms,
            election_timeout_max: settings.election_timeout_max_ms,
            ..Default::default()
        }
        .validate()
        .map_err(|e| ConsensusError::Config(e.to_string()))?;

        let network = NetworkFactory::new(mailboxes.clone(), peers, settings.rpc_timeout());
        let raft = openraft::Raft::new(
            member_id.raft_node_id(),
            Arc::new(raft_config),
            network,
            LogStore::new(store.clone()),
            StateMachine::new(store.clone()),
        )
        .await
        .map_err(|e| ConsensusError::Fatal(e.to_string()))?;
        let raft = Arc::new(raft);

        if let Some(members) = bootstrap {
            if let Err(e) = raft.initialize(members).await {
                // NotAllowed means another founder got there first.
                debug!(%member_id, error = %e, "raft initialize skipped");
            }
        }

        let server = Arc::clone(&raft);
        let rpc_mailbox = Mailbox::new(mailboxes, move |_cancel, rpc: RaftRpc| {
            let raft = Arc::clone(&server);
            async move { serve_rpc(&raft, rpc).await }
        });

        let (readiness_tx, readiness) = watch::channel(false);
        let readiness_task = tokio::spawn(track_readiness(Arc::clone(&raft), readiness_tx));

        info!(%member_id, raft_id = member_id.raft_node_id(), "consensus member started");
        Ok(Self {
            member_id,
            raft,
            store,
            readiness,
            readiness_task,
            rpc_mailbox,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn business_card(&self) -> RaftBcard {
        RaftBcard {
            rpc_mailbox: self.rpc_mailbox.address(),
        }
    }

    /// Fires on every commit, including ones that change nothing visible.
    pub fn committed_state(&self) -> watch::Receiver<CommittedState> {
        self.store.committed()
    }

    /// True while this member is leader and may propose changes.
    pub fn readiness_for_change(&self) -> watch::Receiver<bool> {
        self.readiness.clone()
    }

    pub fn proposer(&self) -> Proposer {
        Proposer {
            raft: Arc::clone(&self.raft),
            committed: self.store.committed(),
        }
    }

    pub fn raft(&self) -> &TableRaft {
        &self.raft
    }

    /// Stop the member and wait for its core to exit. Later calls, and the
    /// drop that follows, do nothing.
    pub async fn shutdown(&self) -> ConsensusResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.readiness_task.abort();
        self.raft
            .shutdown()
            .await
            .map_err(|e| ConsensusError::Fatal(e.to_string()))?;
        info!(member_id = %self.member_id, "consensus member stopped");
        Ok(())
    }
}

impl Drop for RaftMember {
    fn drop(&mut self) {
        self.readiness_task.abort();
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let raft = Arc::clone(&self.raft);
            let member_id = self.member_id;
            handle.spawn(async move {
                if let Err(e) = raft.shutdown().await {
                    warn!(%member_id, error = %e, "raft shutdown failed");
                }
            });
        }
    }
}

/// Cloneable handle for proposing changes to the member's log.
#[derive(Clone)]
pub struct Proposer {
    raft: Arc<TableRaft>,
    committed: watch::Receiver<CommittedState>,
}

impl Proposer {
    pub fn committed_state(&self) -> CommittedState {
        self.committed.borrow().clone()
    }

    /// Propose `change` and wait for it to commit.
    ///
    /// Returns the log index it committed at, or `None` if this member is
    /// not leader, the proposal was lost, or `cancel` fired first. Once a
    /// proposal is submitted, cancelling stops the wait but cannot retract
    /// the entry.
    pub async fn propose_change(
        &self,
        change: TableChange,
        cancel: &CancellationToken,
    ) -> Option<LogIndex> {
        if cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.raft.client_write(change) => match result {
                Ok(resp) => Some(resp.log_id.index),
                Err(e) => {
                    debug!(error = %e, "proposal not committed");
                    None
                }
            },
        }
    }
}

async fn serve_rpc(raft: &TableRaft, rpc: RaftRpc) {
    match rpc {
        RaftRpc::AppendEntries(req, reply) => {
            let _ = reply.send(raft.append_entries(req).await);
        }
        RaftRpc::Vote(req, reply) => {
            let _ = reply.send(raft.vote(req).await);
        }
        RaftRpc::InstallSnapshot(req, reply) => {
            let _ = reply.send(raft.install_snapshot(req).await);
        }
    }
}

async fn track_readiness(raft: Arc<TableRaft>, readiness: watch::Sender<bool>) {
    let mut metrics = raft.metrics();
    loop {
        let ready = {
            let m = metrics.borrow_and_update();
            m.state == ServerState::Leader && m.current_leader == Some(m.id)
        };
        readiness.send_if_modified(|current| {
            if *current == ready {
                false
            } else {
                *current = ready;
                true
            }
        });
        if metrics.changed().await.is_err() {
            break;
        }
    }
    readiness.send_if_modified(|current| std::mem::replace(current, false));
}
