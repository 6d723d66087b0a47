//! Calling a table manager from elsewhere in the cluster.

use shardline_cluster::{MailboxManager, call};
use shardline_core::{TableConfigAndShards, TableTimestamp};
use tokio_util::sync::CancellationToken;

use crate::bcard::{GetStatusRequest, LeaderBcard, SetConfigRequest, TableManagerBcard};
use crate::sindex::SindexStatusMap;

/// Ask the manager behind `bcard` for its index status.
///
/// `None` if the manager is gone or `cancel` fired before it answered.
pub async fn request_status(
    mailboxes: &MailboxManager,
    bcard: &TableManagerBcard,
    cancel: &CancellationToken,
) -> Option<SindexStatusMap> {
    call(
        mailboxes,
        &bcard.get_status_mailbox,
        |reply| GetStatusRequest { reply },
        cancel,
    )
    .await
}

/// Ask `leader` to replace the table config with `config`.
///
/// Returns the timestamp the change committed at. `None` covers every way
/// it can fail to: rejection, leadership loss, timeout, no leader left to
/// answer, or `cancel` firing first.
pub async fn request_set_config(
    mailboxes: &MailboxManager,
    leader: &LeaderBcard,
    config: TableConfigAndShards,
    cancel: &CancellationToken,
) -> Option<TableTimestamp> {
    call(
        mailboxes,
        &leader.set_config_mailbox,
        |reply| SetConfigRequest { config, reply },
        cancel,
    )
    .await
    .flatten()
}
