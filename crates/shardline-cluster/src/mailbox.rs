//! In-process mailbox transport.
//!
//! A `Transport` is the shared switchboard for every peer running in the
//! process. Each peer talks through its own `MailboxManager`, which can
//! register mailboxes and send to any `Address` in the transport. Delivery
//! is reliable and FIFO per (sender, mailbox) pair; a message sent to an
//! address whose mailbox is gone is dropped, exactly as if the remote
//! process had gone away. A peer can be isolated and later healed to model
//! a partition, or disconnected for good to model a crash.

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shardline_core::PeerId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Typed address of a mailbox accepting messages of type `T`.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Address<T> {
    pub peer: PeerId,
    pub mailbox: Uuid,
    #[serde(skip)]
    _msg: PhantomData<fn() -> T>,
}

impl<T> Address<T> {
    fn new(peer: PeerId, mailbox: Uuid) -> Self {
        Self {
            peer,
            mailbox,
            _msg: PhantomData,
        }
    }
}

impl<T> Clone for Address<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Address<T> {}

impl<T> PartialEq for Address<T> {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer && self.mailbox == other.mailbox
    }
}

impl<T> Eq for Address<T> {}

impl<T> Hash for Address<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer.hash(state);
        self.mailbox.hash(state);
    }
}

impl<T> fmt::Debug for Address<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("peer", &self.peer)
            .field("mailbox", &self.mailbox)
            .finish()
    }
}

type Endpoints = HashMap<(PeerId, Uuid), Box<dyn Any + Send + Sync>>;

/// Process-wide message switchboard shared by every `MailboxManager`.
#[derive(Clone)]
pub struct Transport {
    endpoints: Arc<RwLock<Endpoints>>,
    /// Peers cut off from every other peer until healed.
    isolated: Arc<RwLock<HashSet<PeerId>>>,
    /// Peers that have gone away for good.
    departed: Arc<watch::Sender<BTreeSet<PeerId>>>,
}

impl Default for Transport {
    fn default() -> Self {
        let (departed, _rx) = watch::channel(BTreeSet::new());
        Self {
            endpoints: Arc::default(),
            isolated: Arc::default(),
            departed: Arc::new(departed),
        }
    }
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every mailbox registered by `peer`, as if its process died.
    /// The peer can no longer send, and watchers of `departed` learn of it.
    pub fn disconnect(&self, peer: PeerId) {
        self.endpoints.write().retain(|(p, _), _| *p != peer);
        self.departed.send_if_modified(|departed| departed.insert(peer));
        debug!(%peer, "peer disconnected from transport");
    }

    /// Peers that have disconnected.
    pub fn departed(&self) -> watch::Receiver<BTreeSet<PeerId>> {
        self.departed.subscribe()
    }

    /// Stop delivering messages between `peer` and any other peer. Its
    /// mailboxes stay registered and messages it sends to itself still
    /// arrive.
    pub fn isolate(&self, peer: PeerId) {
        self.isolated.write().insert(peer);
        debug!(%peer, "peer isolated");
    }

    pub fn heal(&self, peer: PeerId) {
        self.isolated.write().remove(&peer);
        debug!(%peer, "peer healed");
    }

    fn can_deliver(&self, from: PeerId, to: PeerId) -> bool {
        if self.departed.borrow().contains(&from) {
            return false;
        }
        if from == to {
            return true;
        }
        let isolated = self.isolated.read();
        !isolated.contains(&from) && !isolated.contains(&to)
    }
}

/// Removes its endpoint from the transport when dropped.
struct Registration {
    transport: Transport,
    key: (PeerId, Uuid),
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.transport.endpoints.write().remove(&self.key);
    }
}

/// A single peer's handle onto the transport.
#[derive(Clone)]
pub struct MailboxManager {
    peer: PeerId,
    transport: Transport,
}

impl MailboxManager {
    pub fn new(transport: &Transport, peer: PeerId) -> Self {
        Self {
            peer,
            transport: transport.clone(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Peers that have disconnected from the transport.
    pub fn departed_peers(&self) -> watch::Receiver<BTreeSet<PeerId>> {
        self.transport.departed()
    }

    fn register<T: Send + 'static>(&self) -> (Address<T>, mpsc::UnboundedReceiver<T>, Registration) {
        let (tx, rx) = mpsc::unbounded_channel::<T>();
        let key = (self.peer, Uuid::new_v4());
        self.transport.endpoints.write().insert(key, Box::new(tx));
        let registration = Registration {
            transport: self.transport.clone(),
            key,
        };
        (Address::new(key.0, key.1), rx, registration)
    }

    /// Deliver `msg` to `addr`. Returns false if no such mailbox exists.
    pub fn send<T: Send + 'static>(&self, addr: &Address<T>, msg: T) -> bool {
        if !self.transport.can_deliver(self.peer, addr.peer) {
            debug!(from = %self.peer, to = %addr.peer, "peer unreachable, dropping message");
            return false;
        }
        let endpoints = self.transport.endpoints.read();
        let Some(endpoint) = endpoints.get(&(addr.peer, addr.mailbox)) else {
            debug!(from = %self.peer, to = %addr.peer, mailbox = %addr.mailbox, "dropping message to dead mailbox");
            return false;
        };
        match endpoint.downcast_ref::<mpsc::UnboundedSender<T>>() {
            Some(tx) => tx.send(msg).is_ok(),
            None => {
                warn!(to = %addr.peer, mailbox = %addr.mailbox, "message type does not match mailbox");
                false
            }
        }
    }
}

/// Send a request built around a one-shot reply address and wait for the
/// reply.
///
/// Returns `None` if the target mailbox does not exist, if the target never
/// replies before `cancel` fires, or if `cancel` has already fired.
pub async fn call<Req, Resp>(
    manager: &MailboxManager,
    addr: &Address<Req>,
    make_request: impl FnOnce(Address<Resp>) -> Req,
    cancel: &CancellationToken,
) -> Option<Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    if cancel.is_cancelled() {
        return None;
    }
    let (reply_addr, mut rx, _registration) = manager.register::<Resp>();
    if !manager.send(addr, make_request(reply_addr)) {
        return None;
    }
    tokio::select! {
        _ = cancel.cancelled() => None,
        reply = rx.recv() => reply,
    }
}

/// A registered mailbox that runs `handler` for every delivered message.
///
/// Each handler invocation receives a cancellation token that fires when
/// the mailbox is dropped, so in-flight work can stop early.
pub struct Mailbox<T> {
    address: Address<T>,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    _registration: Registration,
}

impl<T: Send + 'static> Mailbox<T> {
    /// Mailbox whose handler invocations run concurrently, one task each.
    pub fn new<F, Fut>(manager: &MailboxManager, handler: F) -> Self
    where
        F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (address, mut rx, registration) = manager.register::<T>();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let dispatcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            tokio::spawn(handler(token.child_token(), msg));
                        }
                        None => break,
                    },
                }
            }
        });
        Self {
            address,
            cancel,
            dispatcher,
            _registration: registration,
        }
    }

    /// Mailbox whose handler runs inline, so messages are processed one at
    /// a time in delivery order.
    pub fn new_ordered<F, Fut>(manager: &MailboxManager, handler: F) -> Self
    where
        F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (address, mut rx, registration) = manager.register::<T>();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let dispatcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => handler(token.child_token(), msg).await,
                        None => break,
                    },
                }
            }
        });
        Self {
            address,
            cancel,
            dispatcher,
            _registration: registration,
        }
    }
}

impl<T> Mailbox<T> {
    pub fn address(&self) -> Address<T> {
        self.address
    }
}

impl<T> Drop for Mailbox<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.dispatcher.abort();
    }
}
