//! Shared content (screens, cameras, images, wallpapers) and its lifecycle.
//!
//! Each content carries two change ticks:
//! - `time_update` moves on every update;
//! - `time_update_info` moves only when the descriptive fields change, so
//!   payload churn (moving, resizing, new URL) never forces an info resync.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::category::MergeRule;
use crate::geometry::{Aabb, Pose, Vec2};
use crate::participant::{ContentSent, Participant};
use crate::protocol::{types, Message, ProtocolError};
use crate::room::Room;

/// Fields that make up a content's descriptive info.
pub const INFO_FIELDS: [&str; 6] = ["id", "name", "ownerName", "color", "textColor", "type"];

/// Content types whose ids are namespaced by their owner (`{owner}_{…}`).
pub const OWNED_TYPES: [&str; 2] = ["screen", "camera"];

#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub id: String,
    /// The content object as the client sent it.
    pub value: Map<String, Value>,
    pub bounds: Aabb,
    pub time_update: u64,
    pub time_update_info: u64,
}

impl Content {
    /// Build from a client content object. Ticks start at zero.
    pub fn from_json(value: Value) -> Result<Self, ProtocolError> {
        let invalid = |reason: &str| ProtocolError::InvalidPayload {
            msg_type: types::CONTENT_UPDATE_REQUEST.to_string(),
            reason: reason.to_string(),
        };
        let Value::Object(value) = value else {
            return Err(invalid("content is not an object"));
        };
        let id = match value.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => return Err(invalid("content has no id")),
        };

        let origin = value
            .get("pose")
            .and_then(Pose::from_json)
            .map_or(Vec2::ZERO, |p| p.position);
        let size = value.get("size").and_then(Vec2::from_json).unwrap_or(Vec2::ZERO);

        Ok(Self {
            id,
            bounds: Aabb::from_rect(origin.x, origin.y, size.x, size.y),
            value,
            time_update: 0,
            time_update_info: 0,
        })
    }

    /// The descriptive subset of the content object.
    pub fn info(&self) -> Value {
        let info: Map<String, Value> = INFO_FIELDS
            .iter()
            .filter_map(|k| self.value.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect();
        Value::Object(info)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.value.clone())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.value.get("type").and_then(Value::as_str)
    }

    /// Survives the room emptying.
    pub fn is_wallpaper(&self) -> bool {
        self.value.get("wallpaper").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Owning participant for screen/camera shares.
    pub fn owner(&self) -> Option<&str> {
        if !self.content_type().is_some_and(|t| OWNED_TYPES.contains(&t)) {
            return None;
        }
        self.id.split_once('_').map(|(owner, _)| owner)
    }
}

/// A room's contents, in insertion order.
#[derive(Debug, Default)]
pub struct ContentStore {
    contents: IndexMap<String, Content>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a content, stamping its ticks.
    pub fn upsert(&mut self, mut incoming: Content, tick: u64) -> &Content {
        incoming.time_update = tick;
        incoming.time_update_info = match self.contents.get(&incoming.id) {
            Some(stored) if stored.info() == incoming.info() => stored.time_update_info,
            _ => tick,
        };
        let id = incoming.id.clone();
        self.contents.insert(id.clone(), incoming);
        &self.contents[id.as_str()]
    }

    pub fn remove(&mut self, id: &str) -> Option<Content> {
        self.contents.shift_remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Content> {
        self.contents.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Content> {
        self.contents.values()
    }

    /// Ids of contents owned by `participant_id`.
    pub fn owned_by(&self, participant_id: &str) -> Vec<String> {
        self.contents
            .values()
            .filter(|c| c.owner() == Some(participant_id))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Drop everything except wallpapers; returns how many were dropped.
    pub fn retain_wallpapers(&mut self) -> usize {
        let before = self.contents.len();
        self.contents.retain(|_, c| c.is_wallpaper());
        before - self.contents.len()
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

impl Room {
    /// Apply a content update request from `from`.
    ///
    /// Malformed elements are skipped. The sender's own caches are marked
    /// current so the update is never echoed back to it.
    pub fn update_contents(&mut self, from: &str, values: Vec<Value>) -> usize {
        let tick = self.tick;
        let mut updated = Vec::new();
        for value in values {
            match Content::from_json(value) {
                Ok(content) => {
                    let stored = self.contents.upsert(content, tick);
                    updated.push((
                        stored.id.clone(),
                        ContentSent {
                            tick: stored.time_update,
                            bounds: stored.bounds,
                        },
                        stored.time_update_info,
                    ));
                }
                Err(e) => log::warn!("Room {}: skipping content from {from}: {e}", self.id),
            }
        }

        if let Some(sender) = self.participants.get_mut(from) {
            for (id, sent, info_tick) in &updated {
                sender.sent.contents.insert(id.clone(), *sent);
                sender.sent.content_infos.insert(id.clone(), *info_tick);
            }
        }
        log::trace!("Room {}: {} contents updated by {from}", self.id, updated.len());
        updated.len()
    }

    /// Remove contents and tell everyone but `from`.
    ///
    /// Every participant's caches and not-yet-flushed content batches are
    /// scrubbed of the removed ids first, so a removed id is never delivered
    /// after its removal. Unknown ids are ignored.
    pub fn remove_contents(&mut self, ids: &[String], from: &str) -> Vec<String> {
        let removed: Vec<String> = ids
            .iter()
            .filter(|id| self.contents.remove(id).is_some())
            .cloned()
            .collect();
        if removed.is_empty() {
            return removed;
        }

        let refs: Vec<&str> = removed.iter().map(String::as_str).collect();
        let notice = match Message::with_json(types::CONTENT_REMOVE_REQUEST, "", &removed) {
            Ok(msg) => Some(msg),
            Err(e) => {
                log::error!("Room {}: cannot encode removal notice: {e}", self.id);
                None
            }
        };

        for participant in self.participants.values_mut() {
            scrub_content(participant, &refs);
            if participant.id != from {
                if let Some(notice) = &notice {
                    participant.enqueue(notice.clone(), MergeRule::StringArray);
                }
            }
        }
        log::debug!("Room {}: {from} removed contents {removed:?}", self.id);
        removed
    }

    /// Full content objects for the given ids, skipping unknown ones.
    pub fn contents_by_id(&self, ids: &[String]) -> Vec<Value> {
        ids.iter()
            .filter_map(|id| self.contents.get(id))
            .map(Content::to_json)
            .collect()
    }
}

fn scrub_content(participant: &mut Participant, ids: &[&str]) {
    for id in ids {
        participant.sent.forget_content(id);
    }
    participant
        .outbox
        .scrub(types::CONTENT_UPDATE_REQUEST, MergeRule::ObjectArray, ids);
    participant
        .outbox
        .scrub(types::CONTENT_INFO_UPDATE, MergeRule::ObjectArray, ids);
    participant.outbox.scrub(types::CONTENT_OUT, MergeRule::StringArray, ids);
}
