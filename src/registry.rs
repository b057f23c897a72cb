//! Process-wide document name → room mapping.
//!
//! The registry is the only cross-room shared state: an owned,
//! lifecycle-scoped object created with the server, never a global.
//! `resolve` is atomic get-or-create (concurrent resolves of one unseen
//! name observe the same instance); `release` removes a room only while
//! it is still the registered instance AND still empty, so a drain
//! racing a fresh join can never tear a live room down. Transports
//! attach through `subscribe`, which re-verifies registration after the
//! attach so a release sneaking between resolve and attach cannot
//! strand a connection on an unregistered room.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::room::{DocumentRoom, RoomError, RoomOptions};

/// Name → room map with get-or-create semantics.
pub struct DocumentRegistry {
    rooms: RwLock<HashMap<String, Arc<DocumentRoom>>>,
    options: RoomOptions,
}

impl DocumentRegistry {
    pub fn new(options: RoomOptions) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            options,
        })
    }

    /// Return the room for `name`, constructing and registering it on
    /// first reference.
    ///
    /// Construction spawns the persistence `bind_state` hook and the
    /// content initializer; the room relays before either resolves, so
    /// early updates simply land on the fresh state.
    pub async fn resolve(self: &Arc<Self>, name: &str) -> Arc<DocumentRoom> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }

        let room = DocumentRoom::new(name, &self.options, Arc::downgrade(self));
        rooms.insert(name.to_string(), room.clone());
        log::info!("Room {name} registered");

        self.spawn_hydration(&room);
        room
    }

    /// Resolve `name` and attach a connection to it atomically.
    ///
    /// `resolve` followed by a bare [`DocumentRoom::subscribe`] has a
    /// gap: the room's last connection can close meanwhile, the drain
    /// releases the still-empty room, and the late subscriber strands
    /// on an instance the registry no longer knows — the next resolve
    /// would mint a second room for the same name. After attaching,
    /// this re-checks that the room is still the registered instance;
    /// once our connection is in its set no release can pass the
    /// emptiness guard, so a successful check is stable. On a stale
    /// instance the connection is detached and the whole step retried.
    pub async fn subscribe(
        self: &Arc<Self>,
        name: &str,
    ) -> (Arc<DocumentRoom>, Uuid, mpsc::Receiver<Vec<u8>>) {
        loop {
            let room = self.resolve(name).await;
            let (conn_id, rx) = room.subscribe().await;

            let registered = {
                let rooms = self.rooms.read().await;
                rooms.get(name).is_some_and(|r| Arc::ptr_eq(r, &room))
            };
            if registered {
                return (room, conn_id, rx);
            }

            log::debug!("Room {name} released mid-attach, retrying");
            room.close_connection(conn_id).await;
        }
    }

    /// Remove `room` from the map iff it is still the registered entry
    /// for its name and has no connections. Returns whether removal
    /// happened; a declined release means the room was resurrected (or
    /// already replaced) and must keep living.
    pub(crate) async fn release(&self, name: &str, room: &Arc<DocumentRoom>) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get(name) {
            Some(existing) if Arc::ptr_eq(existing, room) && room.is_empty() => {
                rooms.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Number of registered rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Names of every registered room.
    pub async fn document_names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.rooms.read().await.contains_key(name)
    }

    /// Run `bind_state` then the content initializer off the relay
    /// path. Hydration order puts seeded defaults on top of restored
    /// state.
    fn spawn_hydration(&self, room: &Arc<DocumentRoom>) {
        let persistence = self.options.persistence.clone();
        let initializer = self.options.content_initializer.clone();
        if persistence.is_none() && initializer.is_none() {
            return;
        }

        let room = room.clone();
        tokio::spawn(async move {
            if let Some(persistence) = persistence {
                if let Err(e) = persistence.bind_state(room.name(), room.doc()).await {
                    log::error!("Room {}: bind_state failed: {e}", room.name());
                    room.report(RoomError::Persistence(e));
                }
            }
            if let Some(initializer) = initializer {
                initializer(room.name().to_string(), room.doc().clone()).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_creates_room() {
        let registry = DocumentRegistry::new(RoomOptions::default());
        let room = registry.resolve("doc1").await;
        assert_eq!(room.name(), "doc1");
        assert_eq!(registry.room_count().await, 1);
        assert!(registry.contains("doc1").await);
    }

    #[tokio::test]
    async fn test_resolve_returns_same_instance() {
        let registry = DocumentRegistry::new(RoomOptions::default());
        let first = registry.resolve("doc1").await;
        let second = registry.resolve("doc1").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_resolve_concurrent_single_winner() {
        let registry = DocumentRegistry::new(RoomOptions::default());
        let a = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve("doc1").await })
        };
        let b = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve("doc1").await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_resolve_distinct_names() {
        let registry = DocumentRegistry::new(RoomOptions::default());
        let a = registry.resolve("doc1").await;
        let b = registry.resolve("doc2").await;
        assert!(!Arc::ptr_eq(&a, &b));

        let mut names = registry.document_names().await;
        names.sort();
        assert_eq!(names, vec!["doc1", "doc2"]);
    }

    #[tokio::test]
    async fn test_release_requires_empty() {
        let registry = DocumentRegistry::new(RoomOptions::default());
        let room = registry.resolve("doc1").await;
        let (_conn, _rx) = room.subscribe().await;

        assert!(!registry.release("doc1", &room).await);
        assert!(registry.contains("doc1").await);
    }

    #[tokio::test]
    async fn test_release_empty_room() {
        let registry = DocumentRegistry::new(RoomOptions::default());
        let room = registry.resolve("doc1").await;

        assert!(registry.release("doc1", &room).await);
        assert!(!registry.contains("doc1").await);
        // Second release finds nothing to remove
        assert!(!registry.release("doc1", &room).await);
    }

    #[tokio::test]
    async fn test_release_declines_for_stale_instance() {
        let registry = DocumentRegistry::new(RoomOptions::default());
        let old = registry.resolve("doc1").await;
        assert!(registry.release("doc1", &old).await);

        // A fresh room now owns the name; the stale handle cannot
        // release it.
        let fresh = registry.resolve("doc1").await;
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(!registry.release("doc1", &old).await);
        assert!(registry.contains("doc1").await);
    }

    #[tokio::test]
    async fn test_subscribe_lands_on_registered_room() {
        let registry = DocumentRegistry::new(RoomOptions::default());

        // An earlier client empties its room and the drain releases it
        let old = registry.resolve("doc1").await;
        let (conn, _rx) = old.subscribe().await;
        old.close_connection(conn).await;
        assert!(!registry.contains("doc1").await);

        // A client arriving now must end up on the instance the
        // registry knows, never stranded on the released one
        let (room, conn, _rx) = registry.subscribe("doc1").await;
        assert!(!Arc::ptr_eq(&room, &old));
        let registered = registry.resolve("doc1").await;
        assert!(Arc::ptr_eq(&room, &registered));
        assert_eq!(registered.connection_count(), 1);

        room.close_connection(conn).await;
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_and_close_single_room() {
        let registry = DocumentRegistry::new(RoomOptions::default());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (room, conn, _rx) = registry.subscribe("doc1").await;
                room.close_connection(conn).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Every interleaving of attach, close and release converges to
        // no room at all, never a duplicate for the name
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_last_close_releases_room() {
        let registry = DocumentRegistry::new(RoomOptions::default());
        let room = registry.resolve("doc1").await;

        let (conn, _rx) = room.subscribe().await;
        assert_eq!(registry.room_count().await, 1);

        room.close_connection(conn).await;
        assert_eq!(registry.room_count().await, 0);

        // A later resolve constructs a fresh room
        let fresh = registry.resolve("doc1").await;
        assert!(!Arc::ptr_eq(&room, &fresh));
    }
}
