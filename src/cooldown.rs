//! Per-channel trigger cooldown

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Gates re-activation of a channel within a cooldown window
///
/// Check and update happen under a single lock, so two near-simultaneous
/// triggers (e.g. voice wake + text wake) can never both be accepted.
#[derive(Debug, Clone)]
pub struct CooldownRegistry {
    cooldown: Duration,
    last_trigger: Arc<Mutex<HashMap<String, Instant>>>,
}

impl CooldownRegistry {
    /// Create a registry with the given minimum interval between triggers per channel
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_trigger: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Configured cooldown
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Accept a trigger at `now` if the channel is out of cooldown
    ///
    /// Records `now` and returns true when accepted; returns false and leaves
    /// state untouched when rejected. Channels never seen before are eligible.
    pub fn try_trigger(&self, channel_id: &str, now: Instant) -> bool {
        let mut map = self.last_trigger.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(last) = map.get(channel_id) {
            if now.saturating_duration_since(*last) < self.cooldown {
                tracing::debug!(channel_id, "trigger rejected by cooldown");
                return false;
            }
        }

        map.insert(channel_id.to_string(), now);
        true
    }

    /// Time left before the channel can trigger again
    #[must_use]
    pub fn remaining(&self, channel_id: &str, now: Instant) -> Duration {
        let map = self.last_trigger.lock().unwrap_or_else(|e| e.into_inner());
        map.get(channel_id).map_or(Duration::ZERO, |last| {
            self.cooldown
                .saturating_sub(now.saturating_duration_since(*last))
        })
    }

    /// Forget a channel (reset or teardown)
    pub fn clear(&self, channel_id: &str) {
        self.last_trigger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel_id);
    }
}
