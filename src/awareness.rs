//! Ephemeral presence tracking for one document room.
//!
//! Every collaborating actor announces an opaque state blob under a
//! numeric client id; blobs come and go with the actors and are never
//! persisted. The tracker is the room's authority on who is present:
//!
//! ```text
//! awareness payload (any connection)
//!       │
//!       ▼
//! AwarenessTracker::apply()        version-gated upsert/tombstone
//!       │
//!       ▼
//! AwarenessChange { added, updated, removed }
//!       │
//!       ▼
//! encode_update(change ids)        minimal diff, broadcast to room
//! ```
//!
//! Versions are strictly monotonic per client id, so replayed or
//! out-of-order payloads cannot resurrect a presence that was already
//! removed.
//!
//! Block format: `varint count`, then per entry `varint client_id ++
//! varint version ++ u8 flag ++ varbytes state` (state only when the
//! flag marks the entry present).
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::protocol::{
    read_u8, read_var_bytes, read_var_u64, write_var_bytes, write_var_u64, ProtocolError,
};

/// Identifies one collaborating actor's ephemeral presence.
pub type ClientId = u64;

/// Entry flag: the client is gone, only the version survives.
const FLAG_TOMBSTONE: u8 = 0;
/// Entry flag: a state blob follows.
const FLAG_PRESENT: u8 = 1;

/// One presence entry. A `None` state is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AwarenessEntry {
    state: Option<Vec<u8>>,
    version: u32,
}

/// Delta produced by a successful `apply` or `remove_clients` call.
///
/// The room broadcasts `encode_update` over these ids instead of the
/// full table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    /// True when nothing changed and no broadcast is needed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every id touched by this change, in added/updated/removed order.
    pub fn all_clients(&self) -> Vec<ClientId> {
        let mut ids =
            Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        ids.extend_from_slice(&self.added);
        ids.extend_from_slice(&self.updated);
        ids.extend_from_slice(&self.removed);
        ids
    }
}

/// Per-document table of ephemeral presence entries.
pub struct AwarenessTracker {
    /// Client id → (state blob, version). Tombstones keep the version.
    entries: HashMap<ClientId, AwarenessEntry>,
    /// Connection → client ids it introduced and still owns.
    controlled: HashMap<Uuid, HashSet<ClientId>>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            controlled: HashMap::new(),
        }
    }

    /// Apply a decoded presence block from `origin`.
    ///
    /// Entries whose version is not strictly greater than the stored one
    /// are ignored. Newly present ids join the origin connection's
    /// controlled set; ids it explicitly removes leave it. A tombstone
    /// for a never-seen client records the version but yields no delta.
    pub fn apply(
        &mut self,
        origin: Option<Uuid>,
        payload: &[u8],
    ) -> Result<AwarenessChange, ProtocolError> {
        let mut pos = 0;
        let count = read_var_u64(payload, &mut pos)?;
        let mut change = AwarenessChange::default();

        for _ in 0..count {
            let client_id = read_var_u64(payload, &mut pos)?;
            let version = read_var_u64(payload, &mut pos)?;
            let version = u32::try_from(version).map_err(|_| ProtocolError::VarIntTooLarge)?;
            let state = match read_u8(payload, &mut pos)? {
                FLAG_TOMBSTONE => None,
                FLAG_PRESENT => Some(read_var_bytes(payload, &mut pos)?.to_vec()),
                other => return Err(ProtocolError::InvalidFlag(other)),
            };

            // Stale or replayed entry
            if let Some(entry) = self.entries.get(&client_id) {
                if version <= entry.version {
                    continue;
                }
            }

            let was_present = self
                .entries
                .get(&client_id)
                .is_some_and(|e| e.state.is_some());
            let is_present = state.is_some();
            self.entries.insert(client_id, AwarenessEntry { state, version });

            match (was_present, is_present) {
                (false, true) => {
                    change.added.push(client_id);
                    if let Some(conn) = origin {
                        self.controlled.entry(conn).or_default().insert(client_id);
                    }
                }
                (true, true) => change.updated.push(client_id),
                (true, false) => {
                    change.removed.push(client_id);
                    if let Some(conn) = origin {
                        if let Some(owned) = self.controlled.get_mut(&conn) {
                            owned.remove(&client_id);
                        }
                    }
                }
                (false, false) => {}
            }
        }

        Ok(change)
    }

    /// Tombstone each id with an incremented version.
    ///
    /// Ids never seen are skipped; ids already tombstoned get a version
    /// bump but no second removal delta.
    pub fn remove_clients(&mut self, ids: &[ClientId]) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for &id in ids {
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.state.take().is_some() {
                    change.removed.push(id);
                }
                entry.version += 1;
            }
        }
        change
    }

    /// Take ownership of every id `conn` controls, clearing its record.
    ///
    /// Returned sorted so close-path broadcasts are deterministic.
    pub fn release_connection(&mut self, conn: &Uuid) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .controlled
            .remove(conn)
            .map(|owned| owned.into_iter().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Ids currently controlled by `conn`, sorted.
    pub fn controlled_by(&self, conn: &Uuid) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .controlled
            .get(conn)
            .map(|owned| owned.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Encoded block of every present entry, or `None` if nobody is here.
    ///
    /// Sent once to a newly joined connection as presence catch-up.
    pub fn snapshot_update(&self) -> Option<Vec<u8>> {
        let mut ids: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state.is_some())
            .map(|(id, _)| *id)
            .collect();
        if ids.is_empty() {
            return None;
        }
        ids.sort_unstable();
        Some(self.encode_update(&ids))
    }

    /// Encoded block covering exactly `ids` (present or tombstoned).
    ///
    /// Ids without a table entry are skipped.
    pub fn encode_update(&self, ids: &[ClientId]) -> Vec<u8> {
        let found: Vec<(ClientId, &AwarenessEntry)> = ids
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| (*id, e)))
            .collect();

        let mut out = Vec::new();
        write_var_u64(&mut out, found.len() as u64);
        for (id, entry) in found {
            write_var_u64(&mut out, id);
            write_var_u64(&mut out, u64::from(entry.version));
            match &entry.state {
                Some(state) => {
                    out.push(FLAG_PRESENT);
                    write_var_bytes(&mut out, state);
                }
                None => out.push(FLAG_TOMBSTONE),
            }
        }
        out
    }

    /// Number of present (non-tombstoned) entries.
    pub fn present_count(&self) -> usize {
        self.entries.values().filter(|e| e.state.is_some()).count()
    }

    /// Stored state blob for `id`, if present.
    pub fn state_of(&self, id: ClientId) -> Option<&[u8]> {
        self.entries.get(&id).and_then(|e| e.state.as_deref())
    }

    /// Stored version for `id`, tombstoned or not.
    pub fn version_of(&self, id: ClientId) -> Option<u32> {
        self.entries.get(&id).map(|e| e.version)
    }
}

impl Default for AwarenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a presence block from raw (id, version, state) tuples.
///
/// Test and client-side helper; the server side always re-encodes from
/// its own table.
pub fn encode_entries(entries: &[(ClientId, u32, Option<&[u8]>)]) -> Vec<u8> {
    let mut out = Vec::new();
    write_var_u64(&mut out, entries.len() as u64);
    for (id, version, state) in entries {
        write_var_u64(&mut out, *id);
        write_var_u64(&mut out, u64::from(*version));
        match state {
            Some(state) => {
                out.push(FLAG_PRESENT);
                write_var_bytes(&mut out, state);
            }
            None => out.push(FLAG_TOMBSTONE),
        }
    }
    out
}
