//! Fixtures shared by unit tests.

use std::collections::{BTreeMap, BTreeSet};

use shardline_cluster::{Mailbox, MailboxManager, MinidirReadManager, Transport};
use shardline_core::{
    CommittedState, DatabaseId, Durability, Epoch, LogIndex, MemberId, PeerId, ServerId,
    ShardConfig, TableBasicConfig, TableConfig, TableConfigAndShards, TableRaftState,
    TableShardScheme, TableTimestamp, WriteAckConfig,
};
use shardline_raft::RaftBcard;
use uuid::Uuid;

use crate::bcard::{LeaderBcard, TableManagerBcard};

pub(crate) fn sample_config(name: &str, servers: &[ServerId]) -> TableConfigAndShards {
    TableConfigAndShards {
        config: TableConfig {
            basic: TableBasicConfig {
                name: name.to_string(),
                database: DatabaseId::nil(),
                primary_key: "id".to_string(),
            },
            shards: vec![ShardConfig {
                replicas: servers.iter().copied().collect::<BTreeSet<_>>(),
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

pub(crate) fn committed(name: &str, log_index: LogIndex) -> CommittedState {
    CommittedState {
        state: TableRaftState::new(sample_config(name, &[ServerId::new_random()])),
        log_index,
    }
}

fn scratch_mailboxes() -> MailboxManager {
    MailboxManager::new(&Transport::new(), PeerId::new_random())
}

/// A card whose addresses point at mailboxes that no longer exist.
/// Needs a tokio runtime.
pub(crate) fn dummy_bcard(epoch: Epoch) -> TableManagerBcard {
    let mailboxes = scratch_mailboxes();
    let raft = Mailbox::new(&mailboxes, |_cancel, _msg: shardline_raft::RaftRpc| async {});
    let status = Mailbox::new(&mailboxes, |_cancel, _msg: crate::bcard::GetStatusRequest| async {});
    TableManagerBcard {
        timestamp: TableTimestamp {
            epoch,
            log_index: 0,
        },
        database: DatabaseId::nil(),
        name: "users".to_string(),
        primary_key: "id".to_string(),
        raft_member_id: MemberId::new_random(),
        raft_business_card: RaftBcard {
            rpc_mailbox: raft.address(),
        },
        execution_bcard_minidir_bcard: MinidirReadManager::new(&mailboxes).bcard(),
        get_status_mailbox: status.address(),
        server_id: ServerId::new_random(),
        leader: None,
    }
}

/// Needs a tokio runtime.
pub(crate) fn dummy_leader() -> LeaderBcard {
    let mailboxes = scratch_mailboxes();
    let set_config = Mailbox::new(&mailboxes, |_cancel, _msg: crate::bcard::SetConfigRequest| async {});
    LeaderBcard {
        uuid: Uuid::new_v4(),
        set_config_mailbox: set_config.address(),
        contract_ack_minidir_bcard: MinidirReadManager::new(&mailboxes).bcard(),
    }
}
