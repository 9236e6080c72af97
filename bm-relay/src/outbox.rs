//! Per-recipient outbound queue with merge-on-enqueue.
//!
//! The queue holds at most one entry per (type, source). A newer message for
//! an occupied slot is merged into it according to the type's [`MergeRule`]:
//! plain types are overwritten, accumulating types upsert array elements so
//! the entry keeps the order in which elements first appeared.

use serde_json::Value;

use crate::category::MergeRule;
use crate::protocol::Message;

#[derive(Debug, Default, Clone)]
pub struct Outbox {
    pending: Vec<Message>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message, merging it into an existing entry for the same (type, source).
    pub fn push(&mut self, msg: Message, rule: MergeRule) {
        let Some(idx) = self
            .pending
            .iter()
            .position(|m| m.t == msg.t && m.p == msg.p)
        else {
            self.pending.push(msg);
            return;
        };
        let found = &mut self.pending[idx];

        if rule == MergeRule::Replace {
            *found = msg;
            return;
        }

        match (parse_array(&found.v), parse_array(&msg.v)) {
            (Some(mut queued), Some(incoming)) => {
                upsert(&mut queued, incoming, rule);
                found.v = Value::Array(queued).to_string();
            }
            _ => {
                log::debug!("Non-array payload for accumulating type '{}', replacing", msg.t);
                *found = msg;
            }
        }
    }

    /// Remove elements keyed by `ids` from queued entries of type `msg_type`.
    ///
    /// Entries left empty are dropped.
    pub fn scrub(&mut self, msg_type: &str, rule: MergeRule, ids: &[&str]) {
        if ids.is_empty() || rule == MergeRule::Replace {
            return;
        }
        self.pending.retain_mut(|m| {
            if m.t != msg_type {
                return true;
            }
            let Some(mut values) = parse_array(&m.v) else {
                return true;
            };
            let before = values.len();
            values.retain(|v| {
                element_key(v, rule)
                    .and_then(Value::as_str)
                    .map_or(true, |key| !ids.contains(&key))
            });
            if values.len() == before {
                return true;
            }
            if values.is_empty() {
                return false;
            }
            m.v = Value::Array(values).to_string();
            true
        });
    }

    /// Keep only queued messages matching `keep`.
    pub fn retain(&mut self, keep: impl FnMut(&Message) -> bool) {
        self.pending.retain(keep);
    }

    /// Take every pending message, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.pending.iter()
    }

    /// Find the queued entry for (type, source).
    pub fn find(&self, msg_type: &str, source: &str) -> Option<&Message> {
        self.pending.iter().find(|m| m.t == msg_type && m.p == source)
    }
}

fn parse_array(text: &str) -> Option<Vec<Value>> {
    match serde_json::from_str(text) {
        Ok(Value::Array(values)) => Some(values),
        _ => None,
    }
}

fn element_key(value: &Value, rule: MergeRule) -> Option<&Value> {
    match rule {
        MergeRule::ObjectArray => value.get("id"),
        MergeRule::StringArray => Some(value),
        MergeRule::PairArray => value.get(0),
        MergeRule::Replace => None,
    }
}

/// Replace elements with a matching key in place, append the rest.
fn upsert(queued: &mut Vec<Value>, incoming: Vec<Value>, rule: MergeRule) {
    for value in incoming {
        let slot = element_key(&value, rule)
            .and_then(|key| queued.iter().position(|q| element_key(q, rule) == Some(key)));
        match slot {
            Some(idx) => queued[idx] = value,
            None => queued.push(value),
        }
    }
}
