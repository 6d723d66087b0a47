//! The three peer directories a table manager derives from the
//! cluster-wide directory.

use shardline_cluster::{Directory, MinidirBcard};
use shardline_core::{Epoch, MemberId, PeerId, ServerId, TableId};
use shardline_raft::RaftBcard;
use tracing::debug;
use uuid::Uuid;

use crate::bcard::TableManagerBcard;
use crate::executor::{AckKey, ContractAck, ExecutionBcard, ExecutionKey};

pub type ExecutionMinidirBcard = MinidirBcard<ExecutionKey, ExecutionBcard>;
pub type AckMinidirBcard = MinidirBcard<AckKey, ContractAck>;

pub struct PeerDirectories {
    table_id: TableId,
    epoch: Epoch,
    /// Consensus peers of this incarnation of the table.
    pub raft: Directory<PeerId, (MemberId, RaftBcard)>,
    /// Where to send execution bcards: every peer hosting the table.
    pub execution: Directory<PeerId, (ServerId, ExecutionMinidirBcard)>,
    /// Where to send acks: whichever peer currently runs a leader role.
    pub acks: Directory<PeerId, (Uuid, AckMinidirBcard)>,
}

impl PeerDirectories {
    pub fn new(table_id: TableId, epoch: Epoch) -> Self {
        Self {
            table_id,
            epoch,
            raft: Directory::new(),
            execution: Directory::new(),
            acks: Directory::new(),
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Fold one cluster-directory change into the three peer directories.
    pub fn on_directory_change(
        &self,
        peer: PeerId,
        table_id: TableId,
        bcard: Option<&TableManagerBcard>,
    ) {
        if table_id != self.table_id {
            return;
        }

        match bcard {
            Some(b) if b.timestamp.epoch == self.epoch => {
                self.raft.set_key(peer, (b.raft_member_id, b.raft_business_card));
            }
            Some(b) => {
                debug!(%peer, theirs = %b.timestamp.epoch, ours = %self.epoch, "ignoring peer from another epoch");
                self.raft.delete_key(&peer);
            }
            None => {
                self.raft.delete_key(&peer);
            }
        }

        match bcard {
            Some(b) => {
                self.execution
                    .set_key(peer, (b.server_id, b.execution_bcard_minidir_bcard));
            }
            None => {
                self.execution.delete_key(&peer);
            }
        }

        match bcard.and_then(|b| b.leader) {
            Some(leader) => {
                self.acks
                    .set_key(peer, (leader.uuid, leader.contract_ack_minidir_bcard));
            }
            None => {
                self.acks.delete_key(&peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use shardline_core::Epoch;

    use super::*;
    use crate::test_util::{dummy_bcard, dummy_leader};

    #[tokio::test]
    async fn same_epoch_populates_all_but_ack_directory() {
        let table_id = TableId::new_random();
        let epoch = Epoch::now();
        let dirs = PeerDirectories::new(table_id, epoch);
        let peer = PeerId::new_random();
        let bcard = dummy_bcard(epoch);

        dirs.on_directory_change(peer, table_id, Some(&bcard));
        assert_eq!(
            dirs.raft.get(&peer),
            Some((bcard.raft_member_id, bcard.raft_business_card))
        );
        assert_eq!(dirs.execution.get(&peer).map(|(s, _)| s), Some(bcard.server_id));
        assert!(dirs.acks.is_empty());
    }

    #[tokio::test]
    async fn other_epoch_never_enters_raft_directory() {
        let table_id = TableId::new_random();
        let ours = Epoch::now();
        let dirs = PeerDirectories::new(table_id, ours);
        let peer = PeerId::new_random();

        dirs.on_directory_change(peer, table_id, Some(&dummy_bcard(ours)));
        assert!(dirs.raft.contains_key(&peer));

        let theirs = Epoch::now();
        assert_ne!(theirs, ours);
        dirs.on_directory_change(peer, table_id, Some(&dummy_bcard(theirs)));
        assert!(!dirs.raft.contains_key(&peer));
        // Execution routing does not care about the epoch.
        assert!(dirs.execution.contains_key(&peer));
    }

    #[tokio::test]
    async fn other_tables_are_ignored() {
        let epoch = Epoch::now();
        let dirs = PeerDirectories::new(TableId::new_random(), epoch);
        dirs.on_directory_change(PeerId::new_random(), TableId::new_random(), Some(&dummy_bcard(epoch)));
        assert!(dirs.raft.is_empty());
        assert!(dirs.execution.is_empty());
    }

    #[tokio::test]
    async fn leader_card_routes_acks_and_withdrawal_clears_everything() {
        let table_id = TableId::new_random();
        let epoch = Epoch::now();
        let dirs = PeerDirectories::new(table_id, epoch);
        let peer = PeerId::new_random();
        let mut bcard = dummy_bcard(epoch);
        let leader = dummy_leader();
        bcard.leader = Some(leader);

        dirs.on_directory_change(peer, table_id, Some(&bcard));
        assert_eq!(dirs.acks.get(&peer).map(|(uuid, _)| uuid), Some(leader.uuid));

        dirs.on_directory_change(peer, table_id, None);
        assert!(dirs.raft.is_empty());
        assert!(dirs.execution.is_empty());
        assert!(dirs.acks.is_empty());
    }

    #[tokio::test]
    async fn repeated_card_does_not_notify() {
        let table_id = TableId::new_random();
        let epoch = Epoch::now();
        let dirs = PeerDirectories::new(table_id, epoch);
        let peer = PeerId::new_random();
        let bcard = dummy_bcard(epoch);
        dirs.on_directory_change(peer, table_id, Some(&bcard));

        let mut raft = dirs.raft.watch();
        let mut execution = dirs.execution.watch();
        raft.borrow_and_update();
        execution.borrow_and_update();

        dirs.on_directory_change(peer, table_id, Some(&bcard));
        assert!(!raft.has_changed().unwrap());
        assert!(!execution.has_changed().unwrap());
    }
}
