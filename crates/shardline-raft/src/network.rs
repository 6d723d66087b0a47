//! Raft network layer over the cluster mailbox transport.
//!
//! Implements `RaftNetworkFactory` and `RaftNetwork` so that openraft
//! can reach the other members of the table. A target node id is resolved
//! on every RPC through the consensus-peer directory, so a member that
//! restarts with a new mailbox is picked up without reconnecting.

use std::collections::BTreeMap;
use std::time::Duration;

use openraft::BasicNode;
use openraft::error::{InstallSnapshotError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};
use shardline_cluster::{Address, MailboxManager};
use shardline_core::{MemberId, PeerId};
use tokio::sync::{oneshot, watch};
use tracing::debug;

use crate::typ::TypeConfig;

type Reply<T, E> = oneshot::Sender<Result<T, E>>;

/// A Raft RPC together with the channel its answer goes back on.
pub enum RaftRpc {
    AppendEntries(
        AppendEntriesRequest<TypeConfig>,
        Reply<AppendEntriesResponse<u64>, RaftError<u64>>,
    ),
    Vote(VoteRequest<u64>, Reply<VoteResponse<u64>, RaftError<u64>>),
    InstallSnapshot(
        InstallSnapshotRequest<TypeConfig>,
        Reply<InstallSnapshotResponse<u64>, RaftError<u64, InstallSnapshotError>>,
    ),
}

/// How to reach a consensus member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftBcard {
    pub rpc_mailbox: Address<RaftRpc>,
}

/// Consensus-peer directory contents: peer → (member id, card).
pub type RaftPeers = BTreeMap<PeerId, (MemberId, RaftBcard)>;

/// Factory that creates per-member connections.
pub struct NetworkFactory {
    mailboxes: MailboxManager,
    peers: watch::Receiver<RaftPeers>,
    rpc_timeout: Duration,
}

impl NetworkFactory {
    pub fn new(
        mailboxes: MailboxManager,
        peers: watch::Receiver<RaftPeers>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            mailboxes,
            peers,
            rpc_timeout,
        }
    }
}

/// A single member connection.
pub struct NetworkConnection {
    target: u64,
    mailboxes: MailboxManager,
    peers: watch::Receiver<RaftPeers>,
    rpc_timeout: Duration,
}

impl NetworkConnection {
    fn mk_unreachable<E: std::error::Error>(target: u64, msg: &str) -> RPCError<u64, BasicNode, E> {
        RPCError::Unreachable(Unreachable::new(&std::io::Error::other(format!(
            "raft rpc to node {target}: {msg}",
        ))))
    }

    fn resolve(&self) -> Option<Address<RaftRpc>> {
        self.peers
            .borrow()
            .values()
            .find(|(member, _)| member.raft_node_id() == self.target)
            .map(|(_, bcard)| bcard.rpc_mailbox)
    }

    async fn send<T, E>(
        &self,
        make_rpc: impl FnOnce(Reply<T, E>) -> RaftRpc,
    ) -> Result<T, RPCError<u64, BasicNode, E>>
    where
        E: std::error::Error,
    {
        let target = self.target;
        let addr = self
            .resolve()
            .ok_or_else(|| Self::mk_unreachable(target, "not in consensus-peer directory"))?;

        let (tx, rx) = oneshot::channel();
        if !self.mailboxes.send(&addr, make_rpc(tx)) {
            return Err(Self::mk_unreachable(target, "mailbox is gone"));
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(Ok(resp))) => Ok(resp),
            Ok(Ok(Err(e))) => Err(RPCError::RemoteError(RemoteError::new(target, e))),
            Ok(Err(_)) => Err(Self::mk_unreachable(target, "dropped without reply")),
            Err(_) => Err(Self::mk_unreachable(target, "timed out")),
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        debug!(target, member = %node.addr, "creating raft network connection");
        NetworkConnection {
            target,
            mailboxes: self.mailboxes.clone(),
            peers: self.peers.clone(),
            rpc_timeout: self.rpc_timeout,
        }
    }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.send(|reply| RaftRpc::AppendEntries(rpc, reply)).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        self.send(|reply| RaftRpc::InstallSnapshot(rpc, reply)).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.send(|reply| RaftRpc::Vote(rpc, reply)).await
    }
}
