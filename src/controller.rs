//! Request/reply pairing over one physical channel.
//!
//! Every exchange is registered as a [`MessageWaitingDef`] before it is sent.
//! The connector's receive task hands each complete inbound frame to
//! [`Controller::dispatch`], which fills the matching record and wakes its
//! waiter. Frames matching no sent record are stale and dropped.
//!
//! | Controller | Channel | Send gate | Matching |
//! |------------|---------|-----------|----------|
//! | [`FifoController`] | half duplex | one message at a time | send order |
//! | [`MatchController`] | full duplex | none | correlation key, FIFO fallback |
//! | [`NoResponseController`] | fire and forget | one message at a time | none |

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::ChannelSettings;

/// Extracts the correlation key of a frame, e.g. the Modbus/TCP transaction id
pub type KeyFn = Arc<dyn Fn(&[u8]) -> Option<u32> + Send + Sync>;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// In-flight exchange record
#[derive(Debug)]
pub struct MessageWaitingDef {
    id: u64,
    key: Option<u32>,
    send_message: Vec<u8>,
    sent: AtomicBool,
    receive_message: Mutex<Option<Vec<u8>>>,
    received: Notify,
}

impl MessageWaitingDef {
    fn new(send_message: &[u8], key: Option<u32>) -> Self {
        Self {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            key,
            send_message: send_message.to_vec(),
            sent: AtomicBool::new(false),
            receive_message: Mutex::new(None),
            received: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> Option<u32> {
        self.key
    }

    pub fn send_message(&self) -> &[u8] {
        &self.send_message
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    /// Mark the message as on the wire, it may now be matched by replies
    pub fn mark_sent(&self) {
        self.sent.store(true, Ordering::Release);
    }

    /// Store the reply and wake the waiter; false if a reply is already stored
    fn fulfil(&self, message: Vec<u8>) -> bool {
        let mut slot = self.receive_message.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(message);
        drop(slot);
        self.received.notify_one();
        true
    }

    /// Wait until a reply is stored and take it
    pub async fn wait_reply(&self) -> Vec<u8> {
        loop {
            let message = self.receive_message.lock().take();
            if let Some(message) = message {
                return message;
            }
            self.received.notified().await;
        }
    }
}

/// Permission to write one message; released on drop
#[derive(Debug, Default)]
pub struct SendPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Pairs outbound messages with inbound frames
#[async_trait]
pub trait Controller: Send + Sync {
    /// Register an exchange; `None` when the channel is saturated
    fn add_message(&self, message: &[u8]) -> Option<Arc<MessageWaitingDef>>;

    /// Wait until `def` may be written
    async fn acquire_send(&self, def: &Arc<MessageWaitingDef>) -> SendPermit;

    /// Route an inbound frame to its record; false when the frame is stale
    fn dispatch(&self, frame: Vec<u8>) -> bool;

    /// Purge a record that timed out or was abandoned
    fn force_remove_waiting_message(&self, def: &MessageWaitingDef);

    /// Drop every pending record, used when the channel closes
    fn clear(&self);

    /// Whether sent messages expect a physical reply
    fn waits_for_reply(&self) -> bool {
        true
    }

    fn pending_count(&self) -> usize;

    /// Frames dropped because no sent record matched them
    fn stale_frames(&self) -> u64;
}

/// Shared pending table with the FIFO matching rule
struct PendingTable {
    pending: Mutex<VecDeque<Arc<MessageWaitingDef>>>,
    max_pending: usize,
    stale: AtomicU64,
}

impl PendingTable {
    fn new(max_pending: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            max_pending,
            stale: AtomicU64::new(0),
        }
    }

    fn add(&self, message: &[u8], key: Option<u32>) -> Option<Arc<MessageWaitingDef>> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending {
            return None;
        }
        let def = Arc::new(MessageWaitingDef::new(message, key));
        pending.push_back(def.clone());
        Some(def)
    }

    fn take_where<F>(&self, predicate: F) -> Option<Arc<MessageWaitingDef>>
    where
        F: Fn(&MessageWaitingDef) -> bool,
    {
        let mut pending = self.pending.lock();
        let index = pending.iter().position(|def| predicate(def))?;
        pending.remove(index)
    }

    fn deliver(&self, def: Option<Arc<MessageWaitingDef>>, frame: Vec<u8>) -> bool {
        let delivered = match def {
            Some(def) => def.fulfil(frame),
            None => false,
        };
        if !delivered {
            let stale = self.stale.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Dropped stale frame, {} so far", stale);
        }
        delivered
    }

    fn remove(&self, def: &MessageWaitingDef) {
        self.pending.lock().retain(|pending| pending.id != def.id);
    }

    fn clear(&self) {
        self.pending.lock().clear();
    }

    fn len(&self) -> usize {
        self.pending.lock().len()
    }

    fn stale(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }
}

/// Half-duplex controller: one message on the wire, replies in send order
///
/// A reply arriving after its request timed out is paired with the next
/// pending request, since frames carry no correlation key.
pub struct FifoController {
    table: PendingTable,
    gate: Arc<Semaphore>,
}

impl FifoController {
    pub fn new(max_pending: usize) -> Self {
        Self {
            table: PendingTable::new(max_pending),
            gate: Arc::new(Semaphore::new(1)),
        }
    }
}

#[async_trait]
impl Controller for FifoController {
    fn add_message(&self, message: &[u8]) -> Option<Arc<MessageWaitingDef>> {
        self.table.add(message, None)
    }

    async fn acquire_send(&self, _def: &Arc<MessageWaitingDef>) -> SendPermit {
        // the gate is never closed, acquisition cannot fail
        let permit = self.gate.clone().acquire_owned().await.ok();
        SendPermit { _permit: permit }
    }

    fn dispatch(&self, frame: Vec<u8>) -> bool {
        let def = self.table.take_where(|def| def.is_sent());
        self.table.deliver(def, frame)
    }

    fn force_remove_waiting_message(&self, def: &MessageWaitingDef) {
        self.table.remove(def);
    }

    fn clear(&self) {
        self.table.clear();
    }

    fn pending_count(&self) -> usize {
        self.table.len()
    }

    fn stale_frames(&self) -> u64 {
        self.table.stale()
    }
}

/// Full-duplex controller: many messages in flight, matched by key
pub struct MatchController {
    table: PendingTable,
    key_fn: KeyFn,
}

impl MatchController {
    pub fn new(max_pending: usize, key_fn: KeyFn) -> Self {
        Self {
            table: PendingTable::new(max_pending),
            key_fn,
        }
    }
}

#[async_trait]
impl Controller for MatchController {
    fn add_message(&self, message: &[u8]) -> Option<Arc<MessageWaitingDef>> {
        self.table.add(message, (self.key_fn)(message))
    }

    async fn acquire_send(&self, _def: &Arc<MessageWaitingDef>) -> SendPermit {
        SendPermit::default()
    }

    fn dispatch(&self, frame: Vec<u8>) -> bool {
        let def = match (self.key_fn)(&frame) {
            Some(key) => self
                .table
                .take_where(|def| def.is_sent() && def.key() == Some(key)),
            None => self.table.take_where(|def| def.is_sent()),
        };
        self.table.deliver(def, frame)
    }

    fn force_remove_waiting_message(&self, def: &MessageWaitingDef) {
        self.table.remove(def);
    }

    fn clear(&self) {
        self.table.clear();
    }

    fn pending_count(&self) -> usize {
        self.table.len()
    }

    fn stale_frames(&self) -> u64 {
        self.table.stale()
    }
}

/// Controller for devices that never answer
///
/// Sends are serialized; the connector sleeps for the configured interval
/// instead of waiting and reports an empty reply.
pub struct NoResponseController {
    table: PendingTable,
    gate: Arc<Semaphore>,
}

impl NoResponseController {
    pub fn new(max_pending: usize) -> Self {
        Self {
            table: PendingTable::new(max_pending),
            gate: Arc::new(Semaphore::new(1)),
        }
    }
}

#[async_trait]
impl Controller for NoResponseController {
    fn add_message(&self, message: &[u8]) -> Option<Arc<MessageWaitingDef>> {
        self.table.add(message, None)
    }

    async fn acquire_send(&self, _def: &Arc<MessageWaitingDef>) -> SendPermit {
        let permit = self.gate.clone().acquire_owned().await.ok();
        SendPermit { _permit: permit }
    }

    fn dispatch(&self, frame: Vec<u8>) -> bool {
        self.table.deliver(None, frame)
    }

    fn force_remove_waiting_message(&self, def: &MessageWaitingDef) {
        self.table.remove(def);
    }

    fn clear(&self) {
        self.table.clear();
    }

    fn waits_for_reply(&self) -> bool {
        false
    }

    fn pending_count(&self) -> usize {
        self.table.len()
    }

    fn stale_frames(&self) -> u64 {
        self.table.stale()
    }
}

/// Pick the controller matching a channel's duplex mode and reply behaviour
pub fn select_controller(
    settings: &ChannelSettings,
    expects_reply: bool,
    key_fn: Option<KeyFn>,
) -> Arc<dyn Controller> {
    match (expects_reply, settings.full_duplex, key_fn) {
        (false, _, _) => Arc::new(NoResponseController::new(settings.max_pending)),
        (true, true, Some(key_fn)) => Arc::new(MatchController::new(settings.max_pending, key_fn)),
        (true, true, None) => Arc::new(MatchController::new(
            settings.max_pending,
            Arc::new(|_: &[u8]| None),
        )),
        (true, false, _) => Arc::new(FifoController::new(settings.max_pending)),
    }
}
