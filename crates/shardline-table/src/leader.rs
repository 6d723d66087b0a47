//! The transient leader role.
//!
//! A `LeaderRole` exists only while this member is the ready consensus
//! leader. It hosts the set-config endpoint and the ack reader, and
//! advertises both through a leader card on the manager's business card.
//! The `LeaderSlot` creates and destroys it in the order readiness flips
//! arrive, so at most one exists at a time.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shardline_cluster::{Mailbox, MailboxManager, MinidirReadManager};
use shardline_core::{Epoch, TableId, TableTimestamp};
use shardline_raft::Proposer;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bcard::{LeaderBcard, SetConfigRequest, TableManagerBcard};
use crate::coordinator::Coordinator;
use crate::executor::{AckKey, ContractAck};
use crate::perfmon::TableMetrics;

/// What a leader role needs from its table manager.
#[derive(Clone)]
pub(crate) struct LeaderContext {
    pub(crate) table_id: TableId,
    pub(crate) epoch: Epoch,
    pub(crate) mailboxes: MailboxManager,
    pub(crate) proposer: Proposer,
    pub(crate) bcard: Arc<watch::Sender<TableManagerBcard>>,
    pub(crate) set_config_timeout: Duration,
    pub(crate) metrics: Arc<TableMetrics>,
}

pub(crate) struct LeaderRole {
    uuid: Uuid,
    table_id: TableId,
    bcard: Arc<watch::Sender<TableManagerBcard>>,
    coordinator: Arc<Coordinator>,
    metrics: Arc<TableMetrics>,
    /// Fires when leadership is lost; in-flight set-config calls reply empty.
    lost: CancellationToken,
    _set_config_mailbox: Mailbox<SetConfigRequest>,
    _ack_reader: MinidirReadManager<AckKey, ContractAck>,
}

impl LeaderRole {
    pub(crate) fn new(ctx: &LeaderContext) -> Self {
        let ack_reader = MinidirReadManager::new(&ctx.mailboxes);
        let coordinator = Arc::new(Coordinator::new(ctx.proposer.clone(), ack_reader.values()));
        let lost = CancellationToken::new();

        let handler = SetConfigHandler {
            epoch: ctx.epoch,
            mailboxes: ctx.mailboxes.clone(),
            coordinator: Arc::clone(&coordinator),
            lost: lost.clone(),
            timeout: ctx.set_config_timeout,
            metrics: Arc::clone(&ctx.metrics),
        };
        let set_config_mailbox = Mailbox::new(&ctx.mailboxes, move |cancel, req: SetConfigRequest| {
            let handler = handler.clone();
            async move { handler.on_set_config(cancel, req).await }
        });

        let leader = LeaderBcard {
            uuid: Uuid::new_v4(),
            set_config_mailbox: set_config_mailbox.address(),
            contract_ack_minidir_bcard: ack_reader.bcard(),
        };
        ctx.bcard.send_modify(|bcard| bcard.leader = Some(leader));
        ctx.metrics.record_leader_created();
        info!(table_id = %ctx.table_id, leader = %leader.uuid, "leader role created");

        Self {
            uuid: leader.uuid,
            table_id: ctx.table_id,
            bcard: Arc::clone(&ctx.bcard),
            coordinator,
            metrics: Arc::clone(&ctx.metrics),
            lost,
            _set_config_mailbox: set_config_mailbox,
            _ack_reader: ack_reader,
        }
    }

    pub(crate) fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }
}

impl Drop for LeaderRole {
    fn drop(&mut self) {
        // Retract the card before anything it points at goes away.
        self.bcard
            .send_if_modified(|bcard| bcard.leader.take().is_some());
        self.lost.cancel();
        self.metrics.record_leader_destroyed();
        info!(table_id = %self.table_id, leader = %self.uuid, "leader role destroyed");
    }
}

#[derive(Clone)]
struct SetConfigHandler {
    epoch: Epoch,
    mailboxes: MailboxManager,
    coordinator: Arc<Coordinator>,
    lost: CancellationToken,
    timeout: Duration,
    metrics: Arc<TableMetrics>,
}

impl SetConfigHandler {
    async fn on_set_config(&self, cancel: CancellationToken, req: SetConfigRequest) {
        let SetConfigRequest { config, reply } = req;
        let change = self.coordinator.change_config(|current| *current = config, &cancel);

        let result = tokio::select! {
            biased;
            _ = self.lost.cancelled() => {
                debug!("leadership lost during set_config");
                None
            }
            _ = cancel.cancelled() => return,
            outcome = tokio::time::timeout(self.timeout, change) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout = ?self.timeout, "set_config timed out");
                    None
                }
            },
        };

        self.metrics.record_set_config(result.is_some());
        let timestamp = result.map(|log_index| TableTimestamp {
            epoch: self.epoch,
            log_index,
        });
        self.mailboxes.send(&reply, timestamp);
    }
}

/// Holds at most one leader, created and destroyed as readiness flips.
pub(crate) struct LeaderSlot<L> {
    current: Option<L>,
    create: Box<dyn Fn() -> L + Send>,
}

impl<L> LeaderSlot<L> {
    pub(crate) fn new(create: impl Fn() -> L + Send + 'static) -> Self {
        Self {
            current: None,
            create: Box::new(create),
        }
    }

    /// Returns true if a leader was created or destroyed.
    pub(crate) fn apply(&mut self, ready: bool) -> bool {
        match (ready, self.current.is_some()) {
            (true, false) => {
                self.current = Some((self.create)());
                true
            }
            (false, true) => {
                self.current = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn current(&self) -> Option<&L> {
        self.current.as_ref()
    }
}

/// Run `slot` behind a FIFO queue drained by a single worker.
pub(crate) fn spawn_leader_slot<L: Send + 'static>(
    slot: Arc<Mutex<LeaderSlot<L>>>,
) -> (mpsc::UnboundedSender<bool>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
    let worker = tokio::spawn(async move {
        while let Some(ready) = rx.recv().await {
            slot.lock().apply(ready);
        }
    });
    (tx, worker)
}
