//! Rooms and the registry that owns them.
//!
//! ```text
//! Registry ── RwLock<HashMap<room id, Arc<Mutex<Room>>>>
//!                                      │
//!                                      ├── participants (insertion order)
//!                                      ├── properties
//!                                      └── contents
//! ```
//!
//! Each room is its own exclusive-access domain: everything that touches a
//! room, its participants or their caches runs with the room's mutex held.
//! Different rooms never wait on each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::category::{outbound_merge_rule, MergeRule, TypeRegistry};
use crate::content::ContentStore;
use crate::participant::{ConnectionHandle, Participant};
use crate::protocol::{types, Message};

/// Send counter wrap point; divisible by every period from 1 to 24.
pub const SEND_COUNT_WRAP: u64 = 2 * 3 * 5 * 7 * 11 * 13 * 17 * 19 * 23;

#[derive(Debug)]
pub struct Room {
    pub id: String,
    /// Logical clock, advanced once per range request.
    pub tick: u64,
    pub participants: IndexMap<String, Participant>,
    pub properties: BTreeMap<String, String>,
    pub contents: ContentStore,
    /// Set once the registry has dropped this room.
    pub(crate) disposed: bool,
    pub(crate) types: Arc<TypeRegistry>,
}

impl Room {
    pub fn new(id: impl Into<String>, types: Arc<TypeRegistry>) -> Self {
        let id = id.into();
        log::info!("Room {id} created");
        Self {
            id,
            tick: 1,
            participants: IndexMap::new(),
            properties: BTreeMap::new(),
            contents: ContentStore::new(),
            disposed: false,
            types,
        }
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Look up a participant, creating it on first reference.
    ///
    /// A participant whose connection has gone away is rebound to `connection`.
    pub fn participant_or_insert(
        &mut self,
        id: &str,
        connection: &ConnectionHandle,
    ) -> &mut Participant {
        let room_id = &self.id;
        let participant = self.participants.entry(id.to_string()).or_insert_with(|| {
            log::info!("Participant {id} joined room {room_id}");
            Participant::new(id, connection.clone())
        });
        if participant.connection.id() != connection.id() && participant.connection.is_closed() {
            log::info!(
                "Participant {id} rebound from connection {} to {}",
                participant.connection.id(),
                connection.id()
            );
            participant.connection = connection.clone();
        }
        participant
    }

    /// Queue a message for one participant using the type's merge rule.
    pub fn enqueue_to(&mut self, participant_id: &str, msg: Message) -> bool {
        let rule = outbound_merge_rule(&self.types, &msg.t);
        match self.participants.get_mut(participant_id) {
            Some(p) => {
                p.enqueue(msg, rule);
                true
            }
            None => false,
        }
    }

    /// Queue a message for every participant except `from`.
    pub fn broadcast(&mut self, from: &str, msg: &Message) -> usize {
        let rule = outbound_merge_rule(&self.types, &msg.t);
        let mut count = 0;
        for p in self.participants.values_mut().filter(|p| p.id != from) {
            p.enqueue(msg.clone(), rule);
            count += 1;
        }
        count
    }

    /// Apply `[key, value|null]` pairs; `null` deletes the key.
    pub fn apply_properties(&mut self, pairs: &[(String, Option<String>)]) {
        for (key, value) in pairs {
            match value {
                Some(value) => {
                    self.properties.insert(key.clone(), value.clone());
                }
                None => {
                    self.properties.remove(key);
                }
            }
        }
    }

    /// All properties as one outbound message, if there are any.
    pub fn properties_message(&self) -> Option<Message> {
        if self.properties.is_empty() {
            return None;
        }
        let pairs: Vec<(&String, &String)> = self.properties.iter().collect();
        Message::with_json(types::ROOM_PROP, "", &pairs).ok()
    }

    /// Remove a participant and tear down what it leaves behind.
    ///
    /// Screen/camera contents it owns are removed through the normal content
    /// removal path so everyone is told. Remaining participants that had it
    /// cached get an out notice. When the room empties, every non-wallpaper
    /// content is dropped.
    pub fn on_participant_left(&mut self, participant_id: &str) -> Option<Participant> {
        if !self.participants.contains_key(participant_id) {
            return None;
        }

        let owned = self.contents.owned_by(participant_id);
        if !owned.is_empty() {
            self.remove_contents(&owned, participant_id);
        }

        let departed = self.participants.shift_remove(participant_id)?;
        let id = [departed.id.as_str()];
        let out_notice = |t: &str| Message::with_json(t, "", &id).ok();
        let participant_out = out_notice(types::PARTICIPANT_OUT);
        let mouse_out = out_notice(types::MOUSE_OUT);

        let registry = &self.types;
        for remaining in self.participants.values_mut() {
            let (had_pose, had_pointer) = remaining.sent.forget_participant(&departed.id);
            if had_pose {
                if let Some(msg) = &participant_out {
                    remaining.enqueue(msg.clone(), MergeRule::StringArray);
                }
            }
            if had_pointer {
                if let Some(msg) = &mouse_out {
                    remaining.enqueue(msg.clone(), MergeRule::StringArray);
                }
            }
            // Queued state from the leaver would arrive after its out notice.
            remaining
                .outbox
                .retain(|m| m.p != departed.id || !registry.is_participant_state(&m.t));
        }
        log::info!("Participant {participant_id} left room {}", self.id);

        if self.participants.is_empty() {
            let dropped = self.contents.retain_wallpapers();
            log::info!(
                "Room {} closed ({dropped} contents dropped, {} wallpapers kept)",
                self.id,
                self.contents.len()
            );
        }
        Some(departed)
    }

    /// Departure triggered by a connection closing.
    ///
    /// Only applies if the participant is still bound to that connection.
    pub fn depart_connection(&mut self, participant_id: &str, connection_id: u64) -> Option<Participant> {
        let bound = self
            .participants
            .get(participant_id)
            .is_some_and(|p| p.connection.id() == connection_id);
        if bound {
            self.on_participant_left(participant_id)
        } else {
            None
        }
    }

    /// Flush every participant due on this send count.
    pub fn flush_due(&mut self, send_count: u64) -> usize {
        let mut sent = 0;
        for p in self.participants.values_mut() {
            if send_count % u64::from(p.period.max(1)) != 0 {
                continue;
            }
            match p.flush() {
                Ok(n) => sent += n,
                Err(e) => log::warn!("Room {}: flush to {} failed, queue dropped: {e}", self.id, p.id),
            }
        }
        sent
    }

    /// Participants with no inbound traffic for longer than `timeout`.
    pub fn stale_participants(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.participants
            .values()
            .filter(|p| p.is_stale(now, timeout))
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Nothing left worth keeping.
    pub fn is_disposable(&self) -> bool {
        self.participants.is_empty() && self.contents.is_empty()
    }
}

/// Owns every room. Constructed once and shared by reference.
pub struct Registry {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    types: Arc<TypeRegistry>,
}

impl Registry {
    pub fn new(types: TypeRegistry) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            types: Arc::new(types),
        }
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Get or create the room for `room_id`.
    pub async fn get_or_create_room(&self, room_id: &str) -> Arc<Mutex<Room>> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Room::new(room_id, self.types.clone()))))
            .clone()
    }

    /// Lock a live room, creating it if needed.
    ///
    /// Retries if the room was disposed between lookup and lock.
    pub async fn lock_room(&self, room_id: &str) -> OwnedMutexGuard<Room> {
        loop {
            let guard = self.get_or_create_room(room_id).await.lock_owned().await;
            if !guard.disposed {
                return guard;
            }
        }
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Drop a room that has nothing left in it.
    pub async fn remove_if_disposable(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id).cloned() else {
            return false;
        };
        let mut room = room.lock().await;
        if !room.is_disposable() {
            return false;
        }
        room.disposed = true;
        rooms.remove(room_id);
        log::info!("Room {room_id} removed (empty)");
        true
    }

    /// Snapshot of every room handle.
    pub async fn rooms(&self) -> Vec<Arc<Mutex<Room>>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Flush every room's due participants.
    pub async fn flush_all(&self, send_count: u64) -> usize {
        let mut sent = 0;
        for room in self.rooms().await {
            sent += room.lock().await.flush_due(send_count);
        }
        sent
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(TypeRegistry::default())
    }
}
