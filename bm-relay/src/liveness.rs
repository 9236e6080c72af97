//! Liveness monitor.
//!
//! Evicts participants that have sent nothing for longer than the timeout.
//! Eviction closes the connection with [`CLOSE_TIMEOUT`] and then takes the
//! same departure path as an explicit leave, so owned content is torn down
//! and empty rooms are cleaned up even when a client vanishes silently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::participant::CLOSE_TIMEOUT;
use crate::room::Registry;

/// One participant removed by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub room_id: String,
    pub participant_id: String,
}

pub struct LivenessMonitor {
    registry: Arc<Registry>,
    interval: Duration,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<Registry>, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            timeout,
        }
    }

    pub fn from_config(registry: Arc<Registry>, config: &ServerConfig) -> Self {
        Self::new(
            registry,
            config.liveness_check_interval(),
            config.liveness_timeout(),
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Evict every participant silent since before `now - timeout`.
    pub async fn sweep(&self, now: Instant) -> Vec<Eviction> {
        let mut evicted = Vec::new();
        for room in self.registry.rooms().await {
            let room_id = {
                let mut room = room.lock().await;
                if room.disposed {
                    continue;
                }
                for pid in room.stale_participants(now, self.timeout) {
                    let Some(departed) = room.on_participant_left(&pid) else {
                        continue;
                    };
                    log::warn!(
                        "Participant {pid} in room {} timed out after {:?}, evicting",
                        room.id,
                        now.saturating_duration_since(departed.last_receive)
                    );
                    departed.connection.close(CLOSE_TIMEOUT, "timeout");
                    evicted.push(Eviction {
                        room_id: room.id.clone(),
                        participant_id: pid,
                    });
                }
                room.id.clone()
            };
            self.registry.remove_if_disposable(&room_id).await;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::{ConnectionHandle, Outbound};
    use serde_json::json;

    fn monitor(registry: &Arc<Registry>) -> LivenessMonitor {
        LivenessMonitor::new(registry.clone(), Duration::from_secs(1), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_stale() {
        let registry = Arc::new(Registry::default());
        let (fresh, _rx_fresh) = ConnectionHandle::channel(1);
        let (stale, mut rx_stale) = ConnectionHandle::channel(2);
        let start = Instant::now();
        {
            let mut room = registry.lock_room("r").await;
            room.participant_or_insert("fresh", &fresh).touch(start + Duration::from_secs(15));
            room.participant_or_insert("stale", &stale).touch(start);
        }

        let evicted = monitor(&registry).sweep(start + Duration::from_secs(20)).await;
        assert_eq!(
            evicted,
            vec![Eviction {
                room_id: "r".into(),
                participant_id: "stale".into()
            }]
        );
        assert_eq!(
            rx_stale.try_recv().unwrap(),
            Outbound::Close {
                code: CLOSE_TIMEOUT,
                reason: "timeout".into()
            }
        );

        let room = registry.get("r").await.unwrap();
        let room = room.lock().await;
        assert!(room.participants.contains_key("fresh"));
        assert!(!room.participants.contains_key("stale"));
    }

    #[tokio::test]
    async fn test_eviction_tears_down_content_and_room() {
        let registry = Arc::new(Registry::default());
        let (handle, _rx) = ConnectionHandle::channel(1);
        let start = Instant::now();
        {
            let mut room = registry.lock_room("r").await;
            room.participant_or_insert("a", &handle).touch(start);
            room.update_contents("a", vec![json!({"id": "a_screen", "type": "screen"})]);
        }

        let evicted = monitor(&registry).sweep(start + Duration::from_secs(11)).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_nothing_stale() {
        let registry = Arc::new(Registry::default());
        let (handle, _rx) = ConnectionHandle::channel(1);
        let start = Instant::now();
        registry
            .lock_room("r")
            .await
            .participant_or_insert("a", &handle)
            .touch(start);

        assert!(monitor(&registry).sweep(start + Duration::from_secs(5)).await.is_empty());
        assert_eq!(registry.room_count().await, 1);
    }
}
