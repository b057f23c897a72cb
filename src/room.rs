//! Per-document room: relay, broadcast and the close/drain path.
//!
//! A room owns one document's authoritative CRDT state, the set of
//! attached connections and the presence table. It moves through
//! Created → Active → Draining → Destroyed:
//!
//! ```text
//! resolve(name) ── Created ── first subscribe ── Active
//!                                                  │ last close
//!                                                  ▼
//!                              Destroyed ◄── Draining (write_state)
//!                                   ▲              │ new subscribe
//!                                   │              ▼
//!                              release()       Active again
//! ```
//!
//! The room holds a [`yrs::Doc`] by composition and subscribes to its
//! update notification, so an applied change fans out to every attached
//! connection no matter where it came from — a peer, the content
//! initializer or local code. Sync step1/step2 exchanges are answered
//! to the origin connection only and never broadcast.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::ReadTxn;

use crate::awareness::AwarenessTracker;
use crate::connection::{Connection, DEFAULT_OUTBOUND_CAPACITY};
use crate::persistence::{
    Debouncer, Persistence, PersistenceError, DEFAULT_DEBOUNCE_MAX_WAIT, DEFAULT_DEBOUNCE_WAIT,
};
use crate::protocol::{Message, ProtocolError, SyncMessage};
use crate::registry::DocumentRegistry;

/// Observer for faults the room swallows instead of crashing on.
pub type ErrorObserver = Arc<dyn Fn(&str, &RoomError) + Send + Sync>;

/// Side-effect callback fired (debounced) whenever a document changes.
pub type UpdateCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Async hook run once per room to seed default content.
pub type ContentInitializer = Arc<dyn Fn(String, yrs::Doc) -> BoxFuture<'static, ()> + Send + Sync>;

/// Room construction parameters, fixed for the registry's lifetime.
#[derive(Clone)]
pub struct RoomOptions {
    /// CRDT garbage collection. Disable when keeping snapshots.
    pub gc: bool,
    /// Outbound frame queue capacity per connection.
    pub outbound_capacity: usize,
    /// Quiet period for the update side-effect callback.
    pub debounce_wait: Duration,
    /// Hard cap on how long a burst can postpone the callback.
    pub debounce_max_wait: Duration,
    /// Durability hooks (None = in-memory only).
    pub persistence: Option<Arc<dyn Persistence>>,
    /// Seeds default content into a fresh room.
    pub content_initializer: Option<ContentInitializer>,
    /// Debounced document-changed callback.
    pub on_update: Option<UpdateCallback>,
    /// Receives every swallowed room fault.
    pub on_error: Option<ErrorObserver>,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            gc: true,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            debounce_wait: DEFAULT_DEBOUNCE_WAIT,
            debounce_max_wait: DEFAULT_DEBOUNCE_MAX_WAIT,
            persistence: None,
            content_initializer: None,
            on_update: None,
            on_error: None,
        }
    }
}

/// Faults a room isolates: logged, reported, never fatal to the process.
#[derive(Debug)]
pub enum RoomError {
    /// Malformed wire envelope or presence block.
    Decode(ProtocolError),
    /// Sync body that the document collaborator could not parse.
    InvalidUpdate(String),
    /// The document collaborator rejected a parsed update.
    Apply(String),
    /// A durability hook failed.
    Persistence(PersistenceError),
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "Decode failed: {e}"),
            Self::InvalidUpdate(e) => write!(f, "Invalid update payload: {e}"),
            Self::Apply(e) => write!(f, "Update rejected: {e}"),
            Self::Persistence(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RoomError {}

impl From<ProtocolError> for RoomError {
    fn from(e: ProtocolError) -> Self {
        Self::Decode(e)
    }
}

impl From<PersistenceError> for RoomError {
    fn from(e: PersistenceError) -> Self {
        Self::Persistence(e)
    }
}

/// Connection set plus the broadcast path.
///
/// Shared with the doc's update observer, which runs inside the commit
/// of whichever transaction applied the change, so it only takes these
/// short std locks and never the room lock.
struct Fanout {
    name: String,
    connections: StdMutex<HashMap<Uuid, Connection>>,
    /// Connections whose queue rejected a frame; swept by the next
    /// handler and closed like any liveness failure.
    dead: StdMutex<Vec<Uuid>>,
    debouncer: Debouncer,
    on_update: Option<UpdateCallback>,
}

impl Fanout {
    fn insert(&self, id: Uuid, conn: Connection) {
        self.connections.lock().unwrap().insert(id, conn);
    }

    fn remove(&self, id: &Uuid) -> bool {
        self.connections.lock().unwrap().remove(id).is_some()
    }

    fn is_empty(&self) -> bool {
        self.connections.lock().unwrap().is_empty()
    }

    fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Queue `frame` to one connection, marking it dead on failure.
    fn send_to(&self, id: &Uuid, frame: Vec<u8>) {
        let conns = self.connections.lock().unwrap();
        if let Some(conn) = conns.get(id) {
            if let Err(e) = conn.try_send(frame) {
                log::debug!("Send to connection {id} in room {} failed: {e}", self.name);
                self.dead.lock().unwrap().push(*id);
            }
        }
    }

    /// Queue `frame` to every connection, marking failures dead.
    fn broadcast(&self, frame: &[u8]) {
        let conns = self.connections.lock().unwrap();
        let mut dead = self.dead.lock().unwrap();
        for (id, conn) in conns.iter() {
            if let Err(e) = conn.try_send(frame.to_vec()) {
                log::debug!("Broadcast to connection {id} in room {} failed: {e}", self.name);
                dead.push(*id);
            }
        }
    }

    fn take_dead(&self) -> Vec<Uuid> {
        std::mem::take(&mut *self.dead.lock().unwrap())
    }

    /// Uniform document-changed notification: fan the update out and
    /// kick the debounced side-effect callback.
    fn document_changed(&self, update: &[u8]) {
        let frame = Message::Sync(SyncMessage::Update(update.to_vec())).encode();
        self.broadcast(&frame);

        if let Some(on_update) = &self.on_update {
            let on_update = on_update.clone();
            let name = self.name.clone();
            self.debouncer.trigger(move || on_update(&name));
        }
    }
}

/// State mutated only under the room lock.
struct RoomState {
    awareness: AwarenessTracker,
    draining: bool,
}

/// One named collaborative document and everything attached to it.
pub struct DocumentRoom {
    name: String,
    doc: yrs::Doc,
    state: Mutex<RoomState>,
    fanout: Arc<Fanout>,
    persistence: Option<Arc<dyn Persistence>>,
    on_error: Option<ErrorObserver>,
    outbound_capacity: usize,
    registry: Weak<DocumentRegistry>,
    weak_self: Weak<DocumentRoom>,
    /// Keeps the doc's update observer registered for the room's life.
    update_sub: StdMutex<Option<yrs::Subscription>>,
}

impl DocumentRoom {
    /// Construct a room and wire the doc's update observer. Called by
    /// the registry only, which guarantees one room per name.
    pub(crate) fn new(
        name: &str,
        options: &RoomOptions,
        registry: Weak<DocumentRegistry>,
    ) -> Arc<Self> {
        let doc = yrs::Doc::with_options(yrs::Options {
            skip_gc: !options.gc,
            ..yrs::Options::default()
        });

        let fanout = Arc::new(Fanout {
            name: name.to_string(),
            connections: StdMutex::new(HashMap::new()),
            dead: StdMutex::new(Vec::new()),
            debouncer: Debouncer::new(options.debounce_wait, options.debounce_max_wait),
            on_update: options.on_update.clone(),
        });

        let room = Arc::new_cyclic(|weak| Self {
            name: name.to_string(),
            doc,
            state: Mutex::new(RoomState {
                awareness: AwarenessTracker::new(),
                draining: false,
            }),
            fanout: fanout.clone(),
            persistence: options.persistence.clone(),
            on_error: options.on_error.clone(),
            outbound_capacity: options.outbound_capacity,
            registry,
            weak_self: weak.clone(),
            update_sub: StdMutex::new(None),
        });

        match room.doc.observe_update_v1(move |_txn, event| {
            fanout.document_changed(&event.update);
        }) {
            Ok(sub) => *room.update_sub.lock().unwrap() = Some(sub),
            Err(e) => log::error!("Room {name}: failed to observe doc updates: {e}"),
        }

        log::debug!("Room {name} created");
        room
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The authoritative document. Cloning the handle shares the
    /// underlying store, which is how persistence hooks reach it.
    pub fn doc(&self) -> &yrs::Doc {
        &self.doc
    }

    pub fn connection_count(&self) -> usize {
        self.fanout.len()
    }

    /// True when no connection is attached; the registry's release
    /// guard reads this at the moment of removal.
    pub fn is_empty(&self) -> bool {
        self.fanout.is_empty()
    }

    /// Attach a connection and send it catch-up.
    ///
    /// The connection joins the broadcast path first, then receives one
    /// sync step1 built from the current state and, if anyone is
    /// present, one awareness snapshot. A broadcast racing the catch-up
    /// duplicates harmlessly into the idempotent merge.
    pub async fn subscribe(&self) -> (Uuid, mpsc::Receiver<Vec<u8>>) {
        let (conn, rx) = Connection::channel(self.outbound_capacity);
        let conn_id = Uuid::new_v4();

        let drain = {
            let mut state = self.state.lock().await;
            self.fanout.insert(conn_id, conn);
            // A join during a pending drain resurrects the room
            state.draining = false;

            let sv = {
                let txn = yrs::Transact::transact(&self.doc);
                txn.state_vector().encode_v1()
            };
            self.fanout
                .send_to(&conn_id, Message::Sync(SyncMessage::Step1(sv)).encode());

            if let Some(snapshot) = state.awareness.snapshot_update() {
                self.fanout
                    .send_to(&conn_id, Message::Awareness(snapshot).encode());
            }

            self.sweep_locked(&mut state)
        };
        if drain {
            self.drain().await;
        }

        log::debug!("Connection {conn_id} joined room {}", self.name);
        (conn_id, rx)
    }

    /// Relay one wire frame from `conn_id`.
    ///
    /// Faults are logged and reported, never fatal: a malformed frame
    /// leaves the connection open and every other room untouched.
    pub async fn handle_message(&self, conn_id: Uuid, bytes: &[u8]) {
        let drain = {
            let mut state = self.state.lock().await;

            match Message::decode(bytes) {
                Ok(Message::Sync(SyncMessage::Step1(sv))) => self.answer_step1(conn_id, &sv),
                Ok(Message::Sync(SyncMessage::Step2(update)))
                | Ok(Message::Sync(SyncMessage::Update(update))) => self.apply_update(&update),
                Ok(Message::Awareness(block)) => {
                    self.apply_awareness(&mut state, Some(conn_id), &block)
                }
                Err(e) => self.report(RoomError::Decode(e)),
            }

            self.sweep_locked(&mut state)
        };
        if drain {
            self.drain().await;
        }
    }

    /// Detach a connection, tombstoning every client id it controlled.
    ///
    /// Idempotent: closing an unknown or already-closed connection is a
    /// no-op. When the last connection leaves, the room drains — the
    /// durable write runs and, if nobody re-joined meanwhile, the room
    /// is released from the registry and its state dropped.
    pub async fn close_connection(&self, conn_id: Uuid) {
        let drain = {
            let mut state = self.state.lock().await;
            if !self.remove_locked(&mut state, conn_id) {
                return;
            }
            self.sweep_locked(&mut state)
        };
        if drain {
            self.drain().await;
        }
    }

    /// Reply to a state-vector request. Origin connection only.
    fn answer_step1(&self, conn_id: Uuid, sv: &[u8]) {
        let remote = match yrs::StateVector::decode_v1(sv) {
            Ok(remote) => remote,
            Err(e) => return self.report(RoomError::InvalidUpdate(e.to_string())),
        };
        let diff = {
            let txn = yrs::Transact::transact(&self.doc);
            txn.encode_diff_v1(&remote)
        };
        self.fanout
            .send_to(&conn_id, Message::Sync(SyncMessage::Step2(diff)).encode());
    }

    /// Apply an incoming update. The doc's observer broadcasts it to
    /// every connection when the transaction commits.
    fn apply_update(&self, update: &[u8]) {
        let update = match yrs::Update::decode_v1(update) {
            Ok(update) => update,
            Err(e) => return self.report(RoomError::InvalidUpdate(e.to_string())),
        };
        let mut txn = yrs::Transact::transact_mut(&self.doc);
        if let Err(e) = txn.apply_update(update) {
            self.report(RoomError::Apply(e.to_string()));
        }
    }

    /// Apply a presence block and broadcast the resulting delta to all
    /// connections, the originator included.
    fn apply_awareness(&self, state: &mut RoomState, origin: Option<Uuid>, block: &[u8]) {
        match state.awareness.apply(origin, block) {
            Ok(change) if !change.is_empty() => {
                let update = state.awareness.encode_update(&change.all_clients());
                self.fanout.broadcast(&Message::Awareness(update).encode());
            }
            Ok(_) => {}
            Err(e) => self.report(RoomError::Decode(e)),
        }
    }

    /// Remove one connection under the lock. Returns whether it was
    /// actually attached.
    fn remove_locked(&self, state: &mut RoomState, conn_id: Uuid) -> bool {
        if !self.fanout.remove(&conn_id) {
            return false;
        }
        let controlled = state.awareness.release_connection(&conn_id);
        if !controlled.is_empty() {
            let change = state.awareness.remove_clients(&controlled);
            if !change.is_empty() {
                let update = state.awareness.encode_update(&change.removed);
                self.fanout.broadcast(&Message::Awareness(update).encode());
            }
        }
        log::debug!("Connection {conn_id} left room {}", self.name);
        true
    }

    /// Close every connection whose queue rejected a frame, then decide
    /// whether the room just emptied and should drain. Closing can kill
    /// further queues (the removal broadcast), hence the loop.
    fn sweep_locked(&self, state: &mut RoomState) -> bool {
        loop {
            let dead = self.fanout.take_dead();
            if dead.is_empty() {
                break;
            }
            for id in dead {
                self.remove_locked(state, id);
            }
        }

        if self.fanout.is_empty() && !state.draining {
            state.draining = true;
            true
        } else {
            false
        }
    }

    /// Drain path: flush durable state, then release the room.
    ///
    /// The write runs outside the room lock; connections arriving
    /// meanwhile repopulate the room and the release guard declines,
    /// so a resurrected room is never destroyed under new clients. A
    /// failed write keeps the room registered with its state intact.
    async fn drain(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.write_state(&self.name, &self.doc).await {
                self.report(RoomError::Persistence(e));
                self.state.lock().await.draining = false;
                return;
            }
            log::info!("Room {}: state persisted on drain", self.name);
        }

        self.fanout.debouncer.cancel();
        let released = match (self.registry.upgrade(), self.weak_self.upgrade()) {
            (Some(registry), Some(room)) => registry.release(&self.name, &room).await,
            _ => false,
        };
        if released {
            log::info!("Room {} released (empty)", self.name);
        } else {
            log::debug!("Room {}: release declined, room resurrected", self.name);
            self.state.lock().await.draining = false;
        }
    }

    pub(crate) fn report(&self, err: RoomError) {
        log::warn!("Room {}: {err}", self.name);
        if let Some(observer) = &self.on_error {
            observer(&self.name, &err);
        }
    }
}
