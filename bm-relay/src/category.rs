//! Message taxonomy.
//!
//! Every type name maps to exactly one [`MessageCategory`]. The table is
//! filled once at start-up and can be extended with new stored, instant or
//! accumulating types without touching the dispatch code.

use std::collections::HashMap;

use crate::protocol::types;

/// How a queued message absorbs a newer one with the same (type, source).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// The newer message replaces the queued one.
    Replace,
    /// JSON array of objects, upserted by their `id` field.
    ObjectArray,
    /// JSON array of strings, upserted by value.
    StringArray,
    /// JSON array of `[key, value]` pairs, upserted by key.
    PairArray,
}

/// Control messages with a dedicated handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    Request,
    RequestTo,
    RequestRange,
    RequestParticipantStates,
    SetPeriod,
    ParticipantLeft,
    ContentUpdate,
    ContentUpdateById,
    ContentRemove,
    RoomProperty,
}

/// Participant-state types that also update cached participant fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Generic,
    Pose,
    Pointer,
    OnStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    /// Forwarded only.
    Instant,
    /// Forwarded and saved as the sender's latest value for replay.
    Stored,
    /// Forwarded; merges element-wise in outbound queues.
    Accumulating(MergeRule),
    /// Recorded on the sender, delivered by range requests.
    ParticipantState(StateKind),
    Special(Special),
}

impl MessageCategory {
    /// Merge rule applied when this type meets itself in an outbound queue.
    pub fn merge_rule(&self) -> MergeRule {
        match self {
            MessageCategory::Accumulating(rule) => *rule,
            _ => MergeRule::Replace,
        }
    }
}

/// Type name → category lookup.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    categories: HashMap<String, MessageCategory>,
}

impl TypeRegistry {
    /// An empty registry (every type is unknown).
    pub fn empty() -> Self {
        Self {
            categories: HashMap::new(),
        }
    }

    /// Register a type. A later registration of the same name wins.
    pub fn register(&mut self, name: impl Into<String>, category: MessageCategory) {
        self.categories.insert(name.into(), category);
    }

    pub fn classify(&self, name: &str) -> Option<MessageCategory> {
        self.categories.get(name).copied()
    }

    /// Merge rule for a type; unknown types replace.
    pub fn merge_rule(&self, name: &str) -> MergeRule {
        self.classify(name)
            .map_or(MergeRule::Replace, |c| c.merge_rule())
    }

    /// Recorded on the sender and delivered by range, never routed.
    pub fn is_participant_state(&self, name: &str) -> bool {
        matches!(self.classify(name), Some(MessageCategory::ParticipantState(_)))
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        use MessageCategory as C;

        let mut registry = Self::empty();

        for name in [
            types::CHAT_MESSAGE,
            types::PARTICIPANT_TRACKLIMITS,
            types::YARN_PHONE,
            types::CALL_REMOTE,
        ] {
            registry.register(name, C::Instant);
        }
        registry.register(
            types::LEFT_CONTENT_REMOVE_REQUEST,
            C::Accumulating(MergeRule::StringArray),
        );

        for name in [
            types::PARTICIPANT_INFO,
            types::PARTICIPANT_TRACKSTATES,
            types::AFK_CHANGED,
            types::MAIN_SCREEN_CARRIER,
            types::MY_CONTENT,
        ] {
            registry.register(name, C::Stored);
        }

        registry.register(types::PARTICIPANT_PHYSICS, C::ParticipantState(StateKind::Generic));
        registry.register(types::PARTICIPANT_POSE, C::ParticipantState(StateKind::Pose));
        registry.register(types::PARTICIPANT_MOUSE, C::ParticipantState(StateKind::Pointer));
        registry.register(types::PARTICIPANT_ON_STAGE, C::ParticipantState(StateKind::OnStage));

        // Server-generated only; registered for their merge rules.
        registry.register(types::CONTENT_INFO_UPDATE, C::Accumulating(MergeRule::ObjectArray));
        registry.register(types::PARTICIPANT_OUT, C::Accumulating(MergeRule::StringArray));
        registry.register(types::MOUSE_OUT, C::Accumulating(MergeRule::StringArray));
        registry.register(types::CONTENT_OUT, C::Accumulating(MergeRule::StringArray));

        registry.register(types::REQUEST, C::Special(Special::Request));
        registry.register(types::REQUEST_TO, C::Special(Special::RequestTo));
        registry.register(types::REQUEST_RANGE, C::Special(Special::RequestRange));
        registry.register(
            types::REQUEST_PARTICIPANT_STATES,
            C::Special(Special::RequestParticipantStates),
        );
        registry.register(types::SET_PERIOD, C::Special(Special::SetPeriod));
        registry.register(types::PARTICIPANT_LEFT, C::Special(Special::ParticipantLeft));
        registry.register(types::CONTENT_UPDATE_REQUEST, C::Special(Special::ContentUpdate));
        registry.register(
            types::CONTENT_UPDATE_REQUEST_BY_ID,
            C::Special(Special::ContentUpdateById),
        );
        registry.register(types::CONTENT_REMOVE_REQUEST, C::Special(Special::ContentRemove));
        registry.register(types::ROOM_PROP, C::Special(Special::RoomProperty));

        registry
    }
}

/// Output merge rules for special types whose replies accumulate.
///
/// `content_update`, `content_remove` and `room_prop` are requests on the way
/// in but batches of elements on the way out.
pub fn outbound_merge_rule(registry: &TypeRegistry, name: &str) -> MergeRule {
    match name {
        types::CONTENT_UPDATE_REQUEST => MergeRule::ObjectArray,
        types::CONTENT_REMOVE_REQUEST => MergeRule::StringArray,
        types::ROOM_PROP => MergeRule::PairArray,
        _ => registry.merge_rule(name),
    }
}
