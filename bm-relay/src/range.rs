//! Spatial interest engine.
//!
//! A range request compares what the requester was last told (its sent
//! caches) with what is currently inside its interest range, and queues:
//! - state for entities that entered range or changed since last delivery;
//! - one `*_out` notice per entity kind naming entities that left range.
//!
//! The out notices are queued every cycle, empty or not.
//!
//! Change detection runs on the room tick. The tick advances once at the
//! start of every cycle and a cache records the entity's own change tick,
//! so an update landing in the same tick as a delivery is still picked up
//! by the next cycle. Equal ticks mean "already sent".

use std::mem;

use serde_json::Value;

use crate::category::{outbound_merge_rule, MergeRule, TypeRegistry};
use crate::content::Content;
use crate::geometry::InterestRange;
use crate::outbox::Outbox;
use crate::participant::{ContentSent, Participant, PointSent, SentCaches};
use crate::protocol::{types, Message};
use crate::room::Room;

/// What one range cycle delivered to the requester.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RangeReport {
    /// Room tick the cycle ran at.
    pub tick: u64,
    pub participants_in: Vec<String>,
    pub participants_out: Vec<String>,
    pub pointers_in: Vec<String>,
    pub pointers_out: Vec<String>,
    pub contents_in: Vec<String>,
    pub contents_out: Vec<String>,
}

/// Run one range cycle for `requester`.
///
/// Returns `None` if the requester is not in the room.
pub fn request_range(room: &mut Room, requester: &str, range: &InterestRange) -> Option<RangeReport> {
    if !room.participants.contains_key(requester) {
        return None;
    }
    room.tick += 1;
    let tick = room.tick;

    // Detach the requester's caches so the rest of the room can be read freely.
    let (mut sent, mut outbox) = {
        let p = room.participants.get_mut(requester)?;
        (mem::take(&mut p.sent), mem::take(&mut p.outbox))
    };

    let others: Vec<&Participant> = room
        .participants
        .values()
        .filter(|p| p.id != requester)
        .collect();
    let mut scan = Scan {
        range,
        types: room.types(),
        sent: &mut sent,
        outbox: &mut outbox,
        report: RangeReport {
            tick,
            ..RangeReport::default()
        },
    };
    scan.participants(others.iter().copied());
    scan.pointers(others.iter().copied());
    scan.contents(room.contents.iter());
    scan.emit_out_notices();
    let report = scan.report;

    if let Some(p) = room.participants.get_mut(requester) {
        p.sent = sent;
        p.outbox = outbox;
    }
    log::trace!(
        "Room {} tick {tick}: range for {requester}: {} in / {} out participants, {} in / {} out contents",
        room.id,
        report.participants_in.len(),
        report.participants_out.len(),
        report.contents_in.len(),
        report.contents_out.len()
    );
    Some(report)
}

/// Queue the states of `targets` (every other participant if `None`) that
/// the requester has not been sent yet, and mark the caches current.
///
/// Unknown ids and the requester itself are skipped.
pub fn request_participant_states(room: &mut Room, requester: &str, targets: Option<&[String]>) -> usize {
    let Some(mut sent) = room.participants.get_mut(requester).map(|p| mem::take(&mut p.sent)) else {
        return 0;
    };
    let wanted = |id: &str| id != requester && targets.map_or(true, |t| t.iter().any(|w| w == id));

    let mut messages = Vec::new();
    for p in room.participants.values().filter(|p| wanted(&p.id)) {
        let cached = sent.participants.get(&p.id).map(|s| s.tick);
        messages.extend(p.states_since(cached));
        let tick = p.latest_state_tick().max(cached.unwrap_or(0));
        sent.participants.insert(
            p.id.clone(),
            PointSent {
                tick,
                position: p.pose.map(|pose| pose.position),
            },
        );
    }

    let count = messages.len();
    let types = room.types.clone();
    if let Some(p) = room.participants.get_mut(requester) {
        p.sent = sent;
        for msg in messages {
            let rule = outbound_merge_rule(&types, &msg.t);
            p.enqueue(msg, rule);
        }
    }
    count
}

struct Scan<'a> {
    range: &'a InterestRange,
    types: &'a TypeRegistry,
    sent: &'a mut SentCaches,
    outbox: &'a mut Outbox,
    report: RangeReport,
}

impl Scan<'_> {
    fn enqueue(&mut self, msg: Message) {
        let rule = outbound_merge_rule(self.types, &msg.t);
        self.outbox.push(msg, rule);
    }

    fn participants<'p>(&mut self, others: impl Iterator<Item = &'p Participant>) {
        let mut stale = Vec::new();
        for p in others {
            let position = p.pose.map(|pose| pose.position);
            let in_range = p.on_stage || position.is_some_and(|pos| self.range.contains_point(&pos));

            if !in_range {
                let Some(cached) = self.sent.participants.get(&p.id) else {
                    continue;
                };
                // Current geometry unknown: cannot confirm the exit.
                if position.is_none() {
                    continue;
                }
                let left = cached
                    .position
                    .map_or(true, |pos| self.range.contains_point(&pos));
                if left {
                    stale.push(p);
                }
                continue;
            }

            let cached = self.sent.participants.get(&p.id).map(|s| s.tick);
            let latest = p.latest_state_tick();
            if cached.is_some_and(|t| latest <= t) {
                continue;
            }
            for msg in p.states_since(cached) {
                self.enqueue(msg);
            }
            self.sent.participants.insert(
                p.id.clone(),
                PointSent {
                    tick: latest.max(cached.unwrap_or(0)),
                    position,
                },
            );
            self.outbox
                .scrub(types::PARTICIPANT_OUT, MergeRule::StringArray, &[p.id.as_str()]);
            self.report.participants_in.push(p.id.clone());
        }

        let registry = self.types;
        for p in stale {
            self.sent.participants.remove(&p.id);
            let id = p.id.as_str();
            // Only range-delivered state; routed messages and the pointer stay.
            self.outbox.retain(|m| {
                m.p != id || m.t == types::PARTICIPANT_MOUSE || !registry.is_participant_state(&m.t)
            });
            self.report.participants_out.push(p.id.clone());
        }
    }

    fn pointers<'p>(&mut self, others: impl Iterator<Item = &'p Participant>) {
        for p in others {
            let Some(pointer) = &p.pointer else {
                // No pointer known: keep whatever is cached.
                continue;
            };

            if !self.range.contains_point(&pointer.position) {
                let left = self
                    .sent
                    .pointers
                    .get(&p.id)
                    .and_then(|s| s.position)
                    .map_or(false, |pos| self.range.contains_point(&pos));
                if left {
                    self.sent.pointers.remove(&p.id);
                    let id = p.id.as_str();
                    self.outbox
                        .retain(|m| !(m.t == types::PARTICIPANT_MOUSE && m.p == id));
                    self.report.pointers_out.push(p.id.clone());
                }
                continue;
            }

            if self.sent.pointers.get(&p.id).is_some_and(|s| pointer.tick <= s.tick) {
                continue;
            }
            self.enqueue(Message::new(types::PARTICIPANT_MOUSE, p.id.as_str(), pointer.value.as_str()));
            self.sent.pointers.insert(
                p.id.clone(),
                PointSent {
                    tick: pointer.tick,
                    position: Some(pointer.position),
                },
            );
            self.outbox
                .scrub(types::MOUSE_OUT, MergeRule::StringArray, &[p.id.as_str()]);
            self.report.pointers_in.push(p.id.clone());
        }
    }

    fn contents<'c>(&mut self, contents: impl Iterator<Item = &'c Content>) {
        let mut updates: Vec<Value> = Vec::new();
        let mut infos: Vec<Value> = Vec::new();

        for content in contents {
            if !self.range.overlaps(&content.bounds) {
                let left = self
                    .sent
                    .contents
                    .get(&content.id)
                    .is_some_and(|s| self.range.overlaps(&s.bounds));
                if left {
                    self.sent.forget_content(&content.id);
                    let id = [content.id.as_str()];
                    self.outbox
                        .scrub(types::CONTENT_UPDATE_REQUEST, MergeRule::ObjectArray, &id);
                    self.outbox
                        .scrub(types::CONTENT_INFO_UPDATE, MergeRule::ObjectArray, &id);
                    self.report.contents_out.push(content.id.clone());
                }
                continue;
            }

            let mut delivered = false;
            if !self
                .sent
                .contents
                .get(&content.id)
                .is_some_and(|s| content.time_update <= s.tick)
            {
                updates.push(content.to_json());
                self.sent.contents.insert(
                    content.id.clone(),
                    ContentSent {
                        tick: content.time_update,
                        bounds: content.bounds,
                    },
                );
                delivered = true;
            }
            if !self
                .sent
                .content_infos
                .get(&content.id)
                .is_some_and(|t| content.time_update_info <= *t)
            {
                infos.push(content.info());
                self.sent
                    .content_infos
                    .insert(content.id.clone(), content.time_update_info);
                delivered = true;
            }
            if delivered {
                self.outbox
                    .scrub(types::CONTENT_OUT, MergeRule::StringArray, &[content.id.as_str()]);
                self.report.contents_in.push(content.id.clone());
            }
        }

        for (msg_type, values) in [
            (types::CONTENT_UPDATE_REQUEST, updates),
            (types::CONTENT_INFO_UPDATE, infos),
        ] {
            if values.is_empty() {
                continue;
            }
            match Message::with_json(msg_type, "", &values) {
                Ok(msg) => self.outbox.push(msg, MergeRule::ObjectArray),
                Err(e) => log::error!("Cannot encode {msg_type} batch: {e}"),
            }
        }
    }

    fn emit_out_notices(&mut self) {
        let notices = [
            (types::PARTICIPANT_OUT, &self.report.participants_out),
            (types::MOUSE_OUT, &self.report.pointers_out),
            (types::CONTENT_OUT, &self.report.contents_out),
        ];
        for (msg_type, ids) in notices {
            match Message::with_json(msg_type, "", ids) {
                Ok(msg) => self.outbox.push(msg, MergeRule::StringArray),
                Err(e) => log::error!("Cannot encode {msg_type} notice: {e}"),
            }
        }
    }
}

/// Parse the `[visible, audible]` payload of a range request.
pub fn parse_range(msg: &Message) -> Option<InterestRange> {
    let value: Value = serde_json::from_str(&msg.v).ok()?;
    InterestRange::from_json(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::TypeRegistry;
    use crate::geometry::{Aabb, Circle, Pose, Vec2};
    use crate::participant::{ConnectionHandle, Outbound, Pointer};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn room_with(ids: &[&str]) -> (Room, Vec<UnboundedReceiver<Outbound>>) {
        let mut room = Room::new("r", Arc::new(TypeRegistry::default()));
        let mut receivers = Vec::new();
        for (n, id) in ids.iter().enumerate() {
            let (handle, rx) = ConnectionHandle::channel(n as u64);
            room.participant_or_insert(id, &handle);
            receivers.push(rx);
        }
        (room, receivers)
    }

    fn set_pose(room: &mut Room, id: &str, x: f64, y: f64) {
        let tick = room.tick;
        let p = room.participants.get_mut(id).unwrap();
        p.pose = Some(Pose {
            position: Vec2::new(x, y),
            orientation: 0.0,
        });
        p.record_state(types::PARTICIPANT_POSE, &json!([x, y]).to_string(), tick);
    }

    fn set_pointer(room: &mut Room, id: &str, x: f64, y: f64) {
        let tick = room.tick;
        room.participants.get_mut(id).unwrap().pointer = Some(Pointer {
            position: Vec2::new(x, y),
            value: json!([x, y]).to_string(),
            tick,
        });
    }

    fn visible(l: f64, t: f64, r: f64, b: f64) -> InterestRange {
        InterestRange {
            visible: Some(Aabb::from_corners(l, t, r, b)),
            audible: None,
        }
    }

    fn drain(room: &mut Room, id: &str) -> Vec<Message> {
        room.participants.get_mut(id).unwrap().outbox.drain()
    }

    fn out_ids(batch: &[Message], msg_type: &str) -> Vec<String> {
        let msg = batch.iter().find(|m| m.t == msg_type).unwrap();
        serde_json::from_str(&msg.v).unwrap()
    }

    #[test]
    fn test_unknown_requester() {
        let (mut room, _rx) = room_with(&["a"]);
        assert!(request_range(&mut room, "ghost", &visible(0.0, 0.0, 1.0, 1.0)).is_none());
        assert_eq!(room.tick, 1);
    }

    #[test]
    fn test_tick_advances_each_cycle() {
        let (mut room, _rx) = room_with(&["a"]);
        let range = visible(0.0, 0.0, 1.0, 1.0);
        assert_eq!(request_range(&mut room, "a", &range).unwrap().tick, 2);
        assert_eq!(request_range(&mut room, "a", &range).unwrap().tick, 3);
    }

    #[test]
    fn test_participant_entry_and_exit() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        let range = visible(0.0, 0.0, 10.0, 10.0);
        set_pose(&mut room, "b", 5.0, 5.0);

        let report = request_range(&mut room, "a", &range).unwrap();
        assert_eq!(report.participants_in, vec!["b"]);
        let batch = drain(&mut room, "a");
        let pose = batch.iter().find(|m| m.t == types::PARTICIPANT_POSE).unwrap();
        assert_eq!(pose.p, "b");
        assert_eq!(pose.v, "[5.0,5.0]");

        // Unchanged: delivered exactly once.
        let report = request_range(&mut room, "a", &range).unwrap();
        assert!(report.participants_in.is_empty());
        let batch = drain(&mut room, "a");
        assert!(batch.iter().all(|m| m.t != types::PARTICIPANT_POSE));

        set_pose(&mut room, "b", 50.0, 50.0);
        let report = request_range(&mut room, "a", &range).unwrap();
        assert_eq!(report.participants_out, vec!["b"]);
        let batch = drain(&mut room, "a");
        assert_eq!(out_ids(&batch, types::PARTICIPANT_OUT), vec!["b"]);
        assert!(batch.iter().all(|m| m.t != types::PARTICIPANT_POSE));

        // Gone and out of range: nothing more.
        let report = request_range(&mut room, "a", &range).unwrap();
        assert!(report.participants_out.is_empty());
        assert!(report.participants_in.is_empty());

        // Re-entry is delivered again.
        set_pose(&mut room, "b", 1.0, 1.0);
        let report = request_range(&mut room, "a", &range).unwrap();
        assert_eq!(report.participants_in, vec!["b"]);
    }

    #[test]
    fn test_out_notices_always_emitted() {
        let (mut room, _rx) = room_with(&["a"]);
        request_range(&mut room, "a", &visible(0.0, 0.0, 1.0, 1.0)).unwrap();
        let batch = drain(&mut room, "a");
        for t in [types::PARTICIPANT_OUT, types::MOUSE_OUT, types::CONTENT_OUT] {
            assert!(out_ids(&batch, t).is_empty(), "{t} missing or non-empty");
        }
    }

    #[test]
    fn test_update_during_delivery_tick_is_not_lost() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        let range = visible(0.0, 0.0, 10.0, 10.0);
        set_pose(&mut room, "b", 1.0, 1.0);
        request_range(&mut room, "a", &range).unwrap();
        drain(&mut room, "a");

        // Same tick as the delivery above.
        set_pose(&mut room, "b", 2.0, 2.0);
        let report = request_range(&mut room, "a", &range).unwrap();
        assert_eq!(report.participants_in, vec!["b"]);
    }

    #[test]
    fn test_on_stage_always_in_range() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        let tick = room.tick;
        let b = room.participants.get_mut("b").unwrap();
        b.on_stage = true;
        b.record_state(types::PARTICIPANT_ON_STAGE, "true", tick);

        let report = request_range(&mut room, "a", &visible(100.0, 100.0, 101.0, 101.0)).unwrap();
        assert_eq!(report.participants_in, vec!["b"]);
    }

    #[test]
    fn test_leaving_stage_without_pose_keeps_cache() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        let range = visible(0.0, 0.0, 10.0, 10.0);
        let tick = room.tick;
        let b = room.participants.get_mut("b").unwrap();
        b.on_stage = true;
        b.record_state(types::PARTICIPANT_ON_STAGE, "true", tick);
        request_range(&mut room, "a", &range).unwrap();

        room.participants.get_mut("b").unwrap().on_stage = false;
        let report = request_range(&mut room, "a", &range).unwrap();
        assert!(report.participants_out.is_empty());
        assert!(room.participants["a"].sent.participants.contains_key("b"));
    }

    #[test]
    fn test_leaving_stage_with_far_pose_goes_out() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        let range = visible(0.0, 0.0, 10.0, 10.0);
        let tick = room.tick;
        let b = room.participants.get_mut("b").unwrap();
        b.on_stage = true;
        b.record_state(types::PARTICIPANT_ON_STAGE, "true", tick);
        request_range(&mut room, "a", &range).unwrap();

        room.participants.get_mut("b").unwrap().on_stage = false;
        set_pose(&mut room, "b", 500.0, 500.0);
        let report = request_range(&mut room, "a", &range).unwrap();
        assert_eq!(report.participants_out, vec!["b"]);
    }

    #[test]
    fn test_requester_panning_away_keeps_cache() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        set_pose(&mut room, "b", 5.0, 5.0);
        request_range(&mut room, "a", &visible(0.0, 0.0, 10.0, 10.0)).unwrap();

        // Recorded position is outside the new range too: no exit confirmed.
        let report = request_range(&mut room, "a", &visible(100.0, 100.0, 110.0, 110.0)).unwrap();
        assert!(report.participants_out.is_empty());
        assert!(room.participants["a"].sent.participants.contains_key("b"));
    }

    #[test]
    fn test_audible_circle_qualifies() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        set_pose(&mut room, "b", 103.0, 104.0);
        let range = InterestRange::from_json(&json!([[0, 0, 10, 10], [100, 100, 5]])).unwrap();
        let report = request_range(&mut room, "a", &range).unwrap();
        assert_eq!(report.participants_in, vec!["b"]);
    }

    #[test]
    fn test_pointer_entry_and_exit() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        let range = visible(0.0, 0.0, 10.0, 10.0);
        set_pointer(&mut room, "b", 3.0, 3.0);

        let report = request_range(&mut room, "a", &range).unwrap();
        assert_eq!(report.pointers_in, vec!["b"]);
        let batch = drain(&mut room, "a");
        let mm = batch.iter().find(|m| m.t == types::PARTICIPANT_MOUSE).unwrap();
        assert_eq!((mm.p.as_str(), mm.v.as_str()), ("b", "[3.0,3.0]"));

        assert!(request_range(&mut room, "a", &range).unwrap().pointers_in.is_empty());

        set_pointer(&mut room, "b", 30.0, 30.0);
        let report = request_range(&mut room, "a", &range).unwrap();
        assert_eq!(report.pointers_out, vec!["b"]);
        let batch = drain(&mut room, "a");
        assert_eq!(out_ids(&batch, types::MOUSE_OUT), vec!["b"]);
    }

    #[test]
    fn test_content_info_resent_only_on_info_change() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        let range = visible(0.0, 0.0, 10.0, 10.0);
        room.update_contents(
            "b",
            vec![json!({"id": "c1", "name": "x", "url": "u1", "pose": [0, 0], "size": [5, 5]})],
        );

        request_range(&mut room, "a", &range).unwrap();
        let batch = drain(&mut room, "a");
        assert!(batch.iter().any(|m| m.t == types::CONTENT_UPDATE_REQUEST));
        assert!(batch.iter().any(|m| m.t == types::CONTENT_INFO_UPDATE));

        // Payload-only change.
        room.update_contents(
            "b",
            vec![json!({"id": "c1", "name": "x", "url": "u2", "pose": [0, 0], "size": [5, 5]})],
        );
        request_range(&mut room, "a", &range).unwrap();
        let batch = drain(&mut room, "a");
        let update = batch.iter().find(|m| m.t == types::CONTENT_UPDATE_REQUEST).unwrap();
        assert!(update.v.contains("u2"));
        assert!(batch.iter().all(|m| m.t != types::CONTENT_INFO_UPDATE));

        // Descriptive change.
        room.update_contents(
            "b",
            vec![json!({"id": "c1", "name": "y", "url": "u2", "pose": [0, 0], "size": [5, 5]})],
        );
        request_range(&mut room, "a", &range).unwrap();
        let batch = drain(&mut room, "a");
        let info = batch.iter().find(|m| m.t == types::CONTENT_INFO_UPDATE).unwrap();
        let info: Value = serde_json::from_str(&info.v).unwrap();
        assert_eq!(info, json!([{"id": "c1", "name": "y"}]));
    }

    #[test]
    fn test_content_sender_not_echoed() {
        let (mut room, _rx) = room_with(&["a"]);
        room.update_contents("a", vec![json!({"id": "c1", "pose": [1, 1], "size": [1, 1]})]);
        let report = request_range(&mut room, "a", &visible(0.0, 0.0, 10.0, 10.0)).unwrap();
        assert!(report.contents_in.is_empty());
    }

    #[test]
    fn test_content_moving_out() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        let range = visible(0.0, 0.0, 10.0, 10.0);
        room.update_contents("b", vec![json!({"id": "c1", "pose": [1, 1], "size": [2, 2]})]);
        request_range(&mut room, "a", &range).unwrap();
        drain(&mut room, "a");

        room.update_contents("b", vec![json!({"id": "c1", "pose": [80, 80], "size": [2, 2]})]);
        let report = request_range(&mut room, "a", &range).unwrap();
        assert_eq!(report.contents_out, vec!["c1"]);
        let batch = drain(&mut room, "a");
        assert_eq!(out_ids(&batch, types::CONTENT_OUT), vec!["c1"]);
        assert!(!room.participants["a"].sent.contents.contains_key("c1"));
        assert!(!room.participants["a"].sent.content_infos.contains_key("c1"));
    }

    #[test]
    fn test_removed_content_not_delivered_again() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        let range = visible(0.0, 0.0, 10.0, 10.0);
        room.update_contents("a", vec![json!({"id": "c1", "pose": [0, 0], "size": [10, 10]})]);
        request_range(&mut room, "b", &range).unwrap();
        room.remove_contents(&["c1".to_string()], "a");

        let batch = drain(&mut room, "b");
        assert!(batch.iter().all(|m| m.t != types::CONTENT_UPDATE_REQUEST));
        assert!(batch.iter().any(|m| m.t == types::CONTENT_REMOVE_REQUEST));

        let report = request_range(&mut room, "b", &range).unwrap();
        assert!(report.contents_in.is_empty());
        assert!(report.contents_out.is_empty());
    }

    #[test]
    fn test_request_participant_states() {
        let (mut room, _rx) = room_with(&["a", "b", "c"]);
        set_pose(&mut room, "b", 500.0, 500.0);
        let tick = room.tick;
        room.participants
            .get_mut("c")
            .unwrap()
            .record_state(types::PARTICIPANT_INFO, "{}", tick);

        assert_eq!(request_participant_states(&mut room, "a", None), 2);
        let a = &room.participants["a"];
        assert_eq!(a.outbox.len(), 2);
        assert!(a.sent.participants.contains_key("b"));

        // Already current: neither a second request nor a range cycle adds anything.
        assert_eq!(request_participant_states(&mut room, "a", None), 0);
        let report = request_range(&mut room, "a", &visible(400.0, 400.0, 600.0, 600.0)).unwrap();
        assert!(report.participants_in.is_empty());
    }

    #[test]
    fn test_request_participant_states_for_targets() {
        let (mut room, _rx) = room_with(&["a", "b", "c"]);
        set_pose(&mut room, "b", 1.0, 1.0);
        set_pose(&mut room, "c", 2.0, 2.0);

        let targets = vec!["c".to_string(), "a".to_string(), "ghost".to_string()];
        assert_eq!(request_participant_states(&mut room, "a", Some(&targets)), 1);
        let batch = drain(&mut room, "a");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].p, "c");
        assert!(!room.participants["a"].sent.participants.contains_key("b"));
    }

    #[test]
    fn test_exit_keeps_routed_stored_messages() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        let range = visible(0.0, 0.0, 10.0, 10.0);
        set_pose(&mut room, "b", 5.0, 5.0);
        request_range(&mut room, "a", &range).unwrap();
        drain(&mut room, "a");

        let tick = room.tick;
        room.participants
            .get_mut("b")
            .unwrap()
            .record_state(types::AFK_CHANGED, "true", tick);
        room.broadcast("b", &Message::new(types::AFK_CHANGED, "b", "true"));
        room.broadcast("b", &Message::new(types::CHAT_MESSAGE, "b", "\"hi\""));
        room.participants
            .get_mut("a")
            .unwrap()
            .enqueue(Message::new(types::PARTICIPANT_POSE, "b", "[5,5]"), MergeRule::Replace);

        set_pose(&mut room, "b", 50.0, 50.0);
        let report = request_range(&mut room, "a", &range).unwrap();
        assert_eq!(report.participants_out, vec!["b"]);

        let batch = drain(&mut room, "a");
        assert!(batch.iter().any(|m| m.t == types::AFK_CHANGED && m.p == "b"));
        assert!(batch.iter().any(|m| m.t == types::CHAT_MESSAGE));
        assert!(batch.iter().all(|m| m.t != types::PARTICIPANT_POSE));
    }

    #[test]
    fn test_negative_content_size_against_audible_circle() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        room.update_contents(
            "b",
            vec![json!({"id": "c1", "pose": [10, 10], "size": [-5, 4]})],
        );
        let near = InterestRange {
            visible: None,
            audible: Some(Circle {
                center: Vec2::new(7.0, 12.0),
                radius: 1.0,
            }),
        };
        let far = InterestRange {
            visible: None,
            audible: Some(Circle {
                center: Vec2::new(0.0, 0.0),
                radius: 3.0,
            }),
        };

        assert!(request_range(&mut room, "a", &far).unwrap().contents_in.is_empty());
        assert_eq!(request_range(&mut room, "a", &near).unwrap().contents_in, vec!["c1"]);
        assert!(room.participants["a"].sent.contents.contains_key("c1"));
    }

    #[test]
    fn test_degenerate_geometry() {
        let (mut room, _rx) = room_with(&["a", "b"]);
        room.update_contents(
            "b",
            vec![
                json!({"id": "dot", "pose": [3, 3], "size": [0, 0]}),
                json!({"id": "flipped", "pose": [9, 9], "size": [-4, -4]}),
            ],
        );
        set_pose(&mut room, "b", 2.0, 2.0);

        // A negative radius matches nothing.
        let nothing = InterestRange::from_json(&json!([[], [2, 2, -1]])).unwrap();
        let report = request_range(&mut room, "a", &nothing).unwrap();
        assert!(report.participants_in.is_empty());
        assert!(report.contents_in.is_empty());

        // Inverted rectangle: normalised, so everything above is inside.
        let range = InterestRange::from_json(&json!([[10, 10, 0, 0], [2, 2, -1]])).unwrap();
        let report = request_range(&mut room, "a", &range).unwrap();
        assert_eq!(report.contents_in, vec!["dot", "flipped"]);
        assert_eq!(report.participants_in, vec!["b"]);

        set_pose(&mut room, "b", 50.0, 50.0);
        room.update_contents(
            "b",
            vec![
                json!({"id": "dot", "pose": [80, 80], "size": [0, 0]}),
                json!({"id": "flipped", "pose": [90, 90], "size": [-4, -4]}),
            ],
        );
        let report = request_range(&mut room, "a", &range).unwrap();
        assert_eq!(report.participants_out, vec!["b"]);
        assert_eq!(report.contents_out, vec!["dot", "flipped"]);
    }

    #[test]
    fn test_parse_range() {
        let msg = Message::new(types::REQUEST_RANGE, "a", "[[0,0,10,10],[5,5,3]]");
        let range = parse_range(&msg).unwrap();
        assert!(range.visible.is_some());
        assert!(range.audible.is_some());
        assert!(parse_range(&Message::new(types::REQUEST_RANGE, "a", "nope")).is_none());
    }
}
