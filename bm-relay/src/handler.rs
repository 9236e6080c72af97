//! Inbound message dispatch.
//!
//! One entry point, [`handle_message`], called with the room locked. The
//! message's category (from the room's [`TypeRegistry`]) picks the handler:
//!
//! | Category | Effect |
//! |---|---|
//! | Instant / Accumulating | routed to `d`, or to everyone but the sender |
//! | Stored | saved as the sender's latest value, then routed |
//! | Participant state | recorded on the sender only, delivered by range |
//! | Special | dedicated handler below |

use std::time::Instant;

use serde_json::Value;

use crate::category::{MessageCategory, Special, StateKind};
use crate::config::ServerConfig;
use crate::geometry::{Pose, Vec2};
use crate::participant::{ConnectionHandle, Participant, Pointer, CLOSE_NORMAL};
use crate::protocol::{types, Message, ProtocolError};
use crate::range::{parse_range, request_participant_states, request_range};
use crate::room::Room;

/// Apply one inbound message to its room.
///
/// The sender is created on first reference and its liveness timestamp is
/// refreshed even if the message itself is then rejected. An error means
/// the message was dropped.
pub fn handle_message(
    room: &mut Room,
    msg: Message,
    connection: &ConnectionHandle,
    config: &ServerConfig,
    now: Instant,
) -> Result<(), ProtocolError> {
    room.participant_or_insert(&msg.p, connection).touch(now);

    let Some(category) = room.types().classify(&msg.t) else {
        log::warn!("Room {}: unknown message type '{}' from {}", room.id, msg.t, msg.p);
        return Err(ProtocolError::UnknownType(msg.t));
    };
    log::trace!("Room {}: {} from {} ({category:?})", room.id, msg.t, msg.p);

    match category {
        MessageCategory::Instant | MessageCategory::Accumulating(_) => {
            route(room, msg);
        }
        MessageCategory::Stored => {
            let tick = room.tick;
            let sender = room.participant_or_insert(&msg.p, connection);
            sender.record_state(&msg.t, &msg.v, tick);
            sender.stored_messages.insert(msg.t.clone(), msg.clone());
            route(room, msg);
        }
        MessageCategory::ParticipantState(kind) => {
            let tick = room.tick;
            let sender = room.participant_or_insert(&msg.p, connection);
            record_participant_state(sender, kind, &msg, tick)?;
        }
        MessageCategory::Special(special) => {
            handle_special(room, special, msg, connection, config)?;
        }
    }
    Ok(())
}

/// Queue for the destination, or for every other participant.
fn route(room: &mut Room, msg: Message) {
    match msg.d.as_deref() {
        Some(to) if !to.is_empty() => {
            if to == msg.p {
                return;
            }
            let to = to.to_string();
            if !room.enqueue_to(&to, msg) {
                log::debug!("Room {}: destination {to} not present", room.id);
            }
        }
        _ => {
            let from = msg.p.clone();
            room.broadcast(&from, &msg);
        }
    }
}

fn record_participant_state(
    sender: &mut Participant,
    kind: StateKind,
    msg: &Message,
    tick: u64,
) -> Result<(), ProtocolError> {
    let invalid = |reason: &str| ProtocolError::InvalidPayload {
        msg_type: msg.t.clone(),
        reason: reason.to_string(),
    };
    match kind {
        StateKind::Generic => {}
        StateKind::Pose => {
            let pose = Pose::parse(&msg.v).ok_or_else(|| invalid("not a pose"))?;
            sender.pose = Some(pose);
        }
        StateKind::Pointer => {
            let value: Value = msg.payload()?;
            let position = Vec2::from_json(&value).ok_or_else(|| invalid("not a position"))?;
            sender.pointer = Some(Pointer {
                position,
                value: msg.v.clone(),
                tick,
            });
            // Pointers are delivered from `pointer`, not the state map.
            return Ok(());
        }
        StateKind::OnStage => {
            sender.on_stage = msg.payload::<bool>()?;
        }
    }
    sender.record_state(&msg.t, &msg.v, tick);
    Ok(())
}

fn handle_special(
    room: &mut Room,
    special: Special,
    msg: Message,
    connection: &ConnectionHandle,
    config: &ServerConfig,
) -> Result<(), ProtocolError> {
    match special {
        Special::Request => {
            let mut replay: Vec<Message> = room
                .participants
                .values()
                .filter(|p| p.id != msg.p)
                .flat_map(|p| p.stored_messages.values().cloned())
                .collect();
            replay.extend(room.properties_message());
            log::debug!("Room {}: replaying {} messages to {}", room.id, replay.len(), msg.p);
            for stored in replay {
                room.enqueue_to(&msg.p, stored);
            }
        }

        Special::RequestTo => {
            let targets: Vec<String> = msg.payload()?;
            for target in targets.iter().filter(|t| **t != msg.p) {
                let Some(to) = room.participants.get(target) else {
                    continue;
                };
                if to.states.contains_key(types::PARTICIPANT_INFO) {
                    let stored: Vec<Message> = to.stored_messages.values().cloned().collect();
                    for m in stored {
                        room.enqueue_to(&msg.p, m);
                    }
                } else {
                    log::debug!("Room {}: no info for {target}, asking it to publish", room.id);
                    room.enqueue_to(target, Message::new(types::REQUEST_TO, "", ""));
                }
            }
        }

        Special::RequestRange => {
            let range = parse_range(&msg).ok_or_else(|| ProtocolError::InvalidPayload {
                msg_type: msg.t.clone(),
                reason: "expected [[l,t,r,b],[x,y,radius]]".to_string(),
            })?;
            request_range(room, &msg.p, &range);
        }

        Special::RequestParticipantStates => {
            let targets: Option<Vec<String>> = if msg.v.is_empty() {
                None
            } else {
                Some(msg.payload()?)
            };
            let n = request_participant_states(room, &msg.p, targets.as_deref());
            log::debug!("Room {}: pushed {n} participant states to {}", room.id, msg.p);
        }

        Special::SetPeriod => {
            let period_ms: f64 = msg.payload()?;
            let sender = room.participant_or_insert(&msg.p, connection);
            sender.set_period(period_ms, config.flush_interval(), config.min_period);
            log::debug!("Participant {} flush period set to {}", sender.id, sender.period);
        }

        Special::ParticipantLeft => {
            let target = serde_json::from_str::<String>(&msg.v)
                .ok()
                .or_else(|| (!msg.v.is_empty()).then(|| msg.v.clone()))
                .unwrap_or_else(|| msg.p.clone());
            if let Some(departed) = room.on_participant_left(&target) {
                departed.connection.close(CLOSE_NORMAL, "left");
            }
        }

        Special::ContentUpdate => {
            let values: Vec<Value> = msg.payload()?;
            room.update_contents(&msg.p, values);
        }

        Special::ContentUpdateById => {
            let ids: Vec<String> = msg.payload()?;
            let found = room.contents_by_id(&ids);
            if !found.is_empty() {
                let reply = Message::with_json(types::CONTENT_UPDATE_REQUEST, "", &found)?;
                room.enqueue_to(&msg.p, reply);
            }
        }

        Special::ContentRemove => {
            let ids: Vec<String> = msg.payload()?;
            room.remove_contents(&ids, &msg.p);
        }

        Special::RoomProperty => {
            let pairs: Vec<(String, Option<String>)> = msg.payload()?;
            room.apply_properties(&pairs);
            log::debug!("Room {}: {} properties changed by {}", room.id, pairs.len(), msg.p);
            room.broadcast(&msg.p.clone(), &msg);
        }
    }
    Ok(())
}
