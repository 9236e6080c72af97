//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── flush task (every flush_interval_ms)
//!             ├── reader task ── Room ──┤
//! Client B ──┘        │       (Mutex)   └── liveness task (every check interval)
//!                     │
//!                     └── writer task ◄── ConnectionHandle (mpsc)
//! ```
//!
//! Each connection has:
//! - a reader loop that decodes batches and applies them to the room;
//! - a writer task that owns the socket sink and drains the connection's
//!   outbound channel, so flushing never waits on the network.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::category::TypeRegistry;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::handler::handle_message;
use crate::liveness::LivenessMonitor;
use crate::participant::{ConnectionHandle, Outbound};
use crate::protocol::decode_batch;
use crate::room::{Registry, SEND_COUNT_WRAP};

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Messages applied to a room
    pub total_messages: u64,
    /// Malformed, invalid or rejected messages
    pub dropped_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub evicted_participants: u64,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    stats: Arc<RwLock<RelayStats>>,
    next_connection_id: Arc<AtomicU64>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_types(config, TypeRegistry::default())
    }

    /// Create with a custom message type table.
    pub fn with_types(config: ServerConfig, types: TypeRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::new(types)),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr());
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if self.config.tls {
            log::warn!("TLS is not terminated by the relay; serving plain WebSocket");
        }
        let background = [self.spawn_flush_task(), self.spawn_liveness_task()];
        let result = self.accept_loop(listener).await;
        for task in background {
            task.abort();
        }
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            log::debug!("New TCP connection {connection_id} from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, connection_id, registry, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Drive every participant's flush on the global tick.
    fn spawn_flush_task(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let period = self.config.flush_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut send_count: u64 = 0;
            loop {
                ticker.tick().await;
                let sent = registry.flush_all(send_count).await;
                if sent > 0 {
                    log::trace!("Flush tick {send_count}: {sent} messages sent");
                }
                send_count = (send_count + 1) % SEND_COUNT_WRAP;
            }
        })
    }

    fn spawn_liveness_task(&self) -> JoinHandle<()> {
        let monitor = LivenessMonitor::from_config(self.registry.clone(), &self.config);
        let registry = self.registry.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = monitor.sweep(Instant::now()).await;
                if evicted.is_empty() {
                    continue;
                }
                let room_count = registry.room_count().await;
                let mut s = stats.write().await;
                s.evicted_participants += evicted.len() as u64;
                s.active_rooms = room_count;
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        connection_id: u64,
        registry: Arc<Registry>,
        stats: Arc<RwLock<RelayStats>>,
        config: ServerConfig,
    ) -> Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection {connection_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (handle, mut outbound_rx) = ConnectionHandle::channel(connection_id);
        let writer = tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Batch(text) => {
                        if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                            log::debug!("Write to connection {connection_id} failed: {e}");
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = ws_sender.send(WsMessage::Close(Some(frame))).await {
                            log::debug!("Close of connection {connection_id} failed: {e}");
                        }
                        break;
                    }
                }
            }
        });

        // (room, participant) pairs this connection has spoken for
        let mut joined: HashSet<(String, String)> = HashSet::new();

        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    let (applied, dropped) =
                        Self::apply_frame(text.as_str(), &registry, &handle, &config, &mut joined).await;
                    let mut s = stats.write().await;
                    s.total_bytes += text.len() as u64;
                    s.total_messages += applied;
                    s.dropped_messages += dropped;
                }
                Ok(WsMessage::Binary(data)) => {
                    log::debug!("Ignoring {} byte binary frame from {addr}", data.len());
                }
                Ok(WsMessage::Close(frame)) => {
                    log::info!("Connection {connection_id} closed from {addr}: {frame:?}");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
            }
        }

        // Cleanup: depart every participant still bound to this connection
        for (room_id, participant_id) in &joined {
            if let Some(room) = registry.get(room_id).await {
                let departed = room.lock().await.depart_connection(participant_id, connection_id);
                if departed.is_some() {
                    log::info!("Participant {participant_id} left room {room_id} (connection closed)");
                }
            }
            registry.remove_if_disposable(room_id).await;
        }
        writer.abort();

        let room_count = registry.room_count().await;
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = room_count;
        Ok(())
    }

    /// Apply one text frame; returns (applied, dropped) message counts.
    async fn apply_frame(
        text: &str,
        registry: &Registry,
        handle: &ConnectionHandle,
        config: &ServerConfig,
        joined: &mut HashSet<(String, String)>,
    ) -> (u64, u64) {
        let batch = match decode_batch(text) {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("Dropping malformed frame on connection {}: {e}", handle.id());
                return (0, 1);
            }
        };

        let (mut applied, mut dropped) = (0, 0);
        for msg in batch {
            if let Err(e) = msg.validate() {
                log::warn!("Dropping invalid message on connection {}: {e}", handle.id());
                dropped += 1;
                continue;
            }
            let key = (msg.r.clone(), msg.p.clone());
            let result = {
                let mut room = registry.lock_room(&key.0).await;
                handle_message(&mut room, msg, handle, config, Instant::now())
            };
            joined.insert(key);
            match result {
                Ok(()) => applied += 1,
                Err(e) => {
                    log::warn!("Dropping message on connection {}: {e}", handle.id());
                    dropped += 1;
                }
            }
        }
        (applied, dropped)
    }

    /// Get server statistics.
    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> String {
        self.config.bind_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}
