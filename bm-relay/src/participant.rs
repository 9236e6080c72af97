//! Participant state held by the relay.
//!
//! A participant is only ever touched while its room is locked, so nothing
//! here synchronises on its own.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::category::MergeRule;
use crate::error::{RelayError, Result};
use crate::geometry::{Aabb, Pose, Vec2};
use crate::outbox::Outbox;
use crate::protocol::{encode_batch, Message};

/// WebSocket close code for an explicit leave.
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code for a liveness eviction.
pub const CLOSE_TIMEOUT: u16 = 4000;

/// Flush period a participant starts with, in flush ticks.
pub const DEFAULT_PERIOD: u32 = 2;

/// Frames handed to a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// One encoded message batch.
    Batch(String),
    /// Close the socket with a code and reason.
    Close { code: u16, reason: String },
}

/// Opaque handle to a participant's transport connection.
///
/// Sending never blocks; the writer task owns the socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(id: u64, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, tx }
    }

    /// Create a handle together with the receiving end of its channel.
    pub fn channel(id: u64) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn send_batch(&self, text: String) -> Result<()> {
        self.tx
            .send(Outbound::Batch(text))
            .map_err(|_| RelayError::ConnectionClosed(self.id))
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let frame = Outbound::Close {
            code,
            reason: reason.into(),
        };
        if self.tx.send(frame).is_err() {
            log::debug!("Connection {} already gone, close skipped", self.id);
        }
    }
}

/// One recorded participant-state value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantState {
    pub value: String,
    /// Room tick of the last update.
    pub tick: u64,
}

/// Latest pointer position and the message value that carried it.
#[derive(Debug, Clone, PartialEq)]
pub struct Pointer {
    pub position: Vec2,
    pub value: String,
    pub tick: u64,
}

/// What a participant was last told about a remote participant or pointer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSent {
    pub tick: u64,
    /// Position at delivery time; `None` for an on-stage participant without a pose.
    pub position: Option<Vec2>,
}

/// What a participant was last told about a content's payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentSent {
    pub tick: u64,
    pub bounds: Aabb,
}

/// Per-recipient record of delivered remote state, keyed by entity id.
#[derive(Debug, Default, Clone)]
pub struct SentCaches {
    pub participants: HashMap<String, PointSent>,
    pub pointers: HashMap<String, PointSent>,
    pub contents: HashMap<String, ContentSent>,
    /// Content id → `time_update_info` delivered.
    pub content_infos: HashMap<String, u64>,
}

impl SentCaches {
    /// Forget everything about a remote participant.
    pub fn forget_participant(&mut self, id: &str) -> (bool, bool) {
        (
            self.participants.remove(id).is_some(),
            self.pointers.remove(id).is_some(),
        )
    }

    /// Forget everything about a content.
    pub fn forget_content(&mut self, id: &str) {
        self.contents.remove(id);
        self.content_infos.remove(id);
    }
}

#[derive(Debug)]
pub struct Participant {
    pub id: String,
    pub connection: ConnectionHandle,
    /// Always in range for everyone.
    pub on_stage: bool,
    pub pose: Option<Pose>,
    pub pointer: Option<Pointer>,
    /// Latest message per stored type, replayed on full-state requests.
    pub stored_messages: BTreeMap<String, Message>,
    /// Latest value per state type, delivered by range.
    pub states: BTreeMap<String, ParticipantState>,
    pub outbox: Outbox,
    pub sent: SentCaches,
    pub last_receive: Instant,
    /// Flush every `period` flush ticks.
    pub period: u32,
}

impl Participant {
    pub fn new(id: impl Into<String>, connection: ConnectionHandle) -> Self {
        Self {
            id: id.into(),
            connection,
            on_stage: false,
            pose: None,
            pointer: None,
            stored_messages: BTreeMap::new(),
            states: BTreeMap::new(),
            outbox: Outbox::new(),
            sent: SentCaches::default(),
            last_receive: Instant::now(),
            period: DEFAULT_PERIOD,
        }
    }

    pub fn enqueue(&mut self, msg: Message, rule: MergeRule) {
        self.outbox.push(msg, rule);
    }

    pub fn record_state(&mut self, msg_type: &str, value: &str, tick: u64) {
        self.states.insert(
            msg_type.to_string(),
            ParticipantState {
                value: value.to_string(),
                tick,
            },
        );
    }

    /// Highest tick among recorded states.
    pub fn latest_state_tick(&self) -> u64 {
        self.states.values().map(|s| s.tick).max().unwrap_or(0)
    }

    /// States changed after `since` as outbound messages from this participant.
    pub fn states_since(&self, since: Option<u64>) -> Vec<Message> {
        self.states
            .iter()
            .filter(|(_, s)| since.map_or(true, |t| s.tick > t))
            .map(|(t, s)| Message::new(t.as_str(), self.id.as_str(), s.value.as_str()))
            .collect()
    }

    /// Apply a client-requested flush period given in milliseconds.
    ///
    /// Non-positive or non-finite requests are ignored.
    pub fn set_period(&mut self, period_ms: f64, flush_interval: Duration, min_period: u32) {
        if !period_ms.is_finite() || period_ms <= 0.0 {
            return;
        }
        let tick_ms = flush_interval.as_millis().max(1) as f64;
        let ticks = (period_ms / tick_ms).round();
        self.period = (ticks.min(u32::MAX as f64) as u32).max(min_period.max(1));
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_receive = now;
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_receive) > timeout
    }

    /// Send the whole pending queue as one batch and clear it.
    ///
    /// The queue is cleared even if the send fails; returns the number of
    /// messages handed to the transport.
    pub fn flush(&mut self) -> Result<usize> {
        if self.outbox.is_empty() {
            return Ok(0);
        }
        let batch = self.outbox.drain();
        let text = encode_batch(&batch)?;
        self.connection.send_batch(text)?;
        Ok(batch.len())
    }
}
