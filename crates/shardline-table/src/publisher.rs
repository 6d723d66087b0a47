//! Copies a manager's business card into the cluster-wide directory.

use std::sync::Arc;

use shardline_core::{PeerId, TableId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bcard::TableManagerBcard;
use crate::manager::TableDirectory;

/// Publish every republication of `bcard` under `(peer, table_id)`.
///
/// When the manager goes away the entry is withdrawn.
pub fn spawn_bcard_publisher(
    directory: Arc<TableDirectory>,
    peer: PeerId,
    table_id: TableId,
    mut bcard: watch::Receiver<TableManagerBcard>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let card = bcard.borrow_and_update().clone();
            if directory.set_key((peer, table_id), card) {
                debug!(%peer, %table_id, "business card published");
            }
            if bcard.changed().await.is_err() {
                break;
            }
        }
        directory.delete_key(&(peer, table_id));
        debug!(%peer, %table_id, "business card withdrawn");
    })
}
