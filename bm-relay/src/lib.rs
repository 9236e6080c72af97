//! # bm-relay: Spatial message relay for multi-room collaboration
//!
//! Participants connect over WebSocket, publish pose/state/content updates
//! into a room, and receive only what falls inside their interest range.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON batches    ┌──────────────────────────────┐
//! │ Client      │ ◄───────────────► │ RelayServer                  │
//! │ (per user)  │    WebSocket      │  ├── Registry ── Room (Mutex)│
//! └─────────────┘                   │  ├── flush task              │
//!                                   │  └── liveness task           │
//!                                   └──────────────┬───────────────┘
//!                                                  │
//!                         ┌────────────────────────┼─────────────┐
//!                         ▼                        ▼             ▼
//!                    Participant              ContentStore   properties
//!                    (outbox, sent caches)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire message, batch codec, type names
//! - [`category`]: Message taxonomy and merge rules
//! - [`outbox`]: Per-recipient queue with merge-on-enqueue
//! - [`room`]: Rooms, participant departure, the room registry
//! - [`content`]: Shared content store
//! - [`range`]: Spatial interest engine (delta sync by range)
//! - [`handler`]: Inbound dispatch by category
//! - [`liveness`]: Timeout-based eviction
//! - [`server`]: WebSocket server

pub mod category;
pub mod config;
pub mod content;
pub mod error;
pub mod geometry;
pub mod handler;
pub mod liveness;
pub mod outbox;
pub mod participant;
pub mod protocol;
pub mod range;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use category::{MergeRule, MessageCategory, TypeRegistry};
pub use config::ServerConfig;
pub use error::{RelayError, Result};
pub use geometry::{Aabb, Circle, InterestRange, Pose, Vec2};
pub use protocol::{decode_batch, encode_batch, types, Message, ProtocolError};
pub use room::{Registry, Room};
pub use server::{RelayServer, RelayStats};
