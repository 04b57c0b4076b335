//! Per-channel session state
//!
//! A session exists from a channel's first interaction until it is reset,
//! left, or evicted for idleness. Each incarnation carries its own
//! cancellation token and generation number, so a turn started under an old
//! incarnation can never clear flags on its replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::pipeline::PipelineState;

/// State tracked for one text channel and its paired voice connection
#[derive(Debug, Clone)]
pub struct ChannelSession {
    pub channel_id: String,
    pub state: PipelineState,
    pub voice_connected: bool,
    pub recording: bool,
    pub processing: bool,
    pub last_activity: Instant,
    /// End of an on-demand listen window, if one is open
    pub listen_until: Option<Instant>,
    pub generation: u64,
    pub cancel: CancellationToken,
}

impl ChannelSession {
    fn new(channel_id: &str, now: Instant, generation: u64) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            state: PipelineState::Idle,
            voice_connected: false,
            recording: false,
            processing: false,
            last_activity: now,
            listen_until: None,
            generation,
            cancel: CancellationToken::new(),
        }
    }

    /// Whether the session has been untouched for at least `horizon`
    ///
    /// Sessions holding a voice connection or running a turn are never idle.
    #[must_use]
    pub fn is_idle(&self, now: Instant, horizon: Duration) -> bool {
        !self.processing
            && !self.voice_connected
            && now.saturating_duration_since(self.last_activity) >= horizon
    }
}

/// Handle for one in-flight turn
#[derive(Debug, Clone)]
pub struct TurnGuard {
    pub channel_id: String,
    pub generation: u64,
    pub cancel: CancellationToken,
}

/// Result of claiming a channel for a captured utterance
#[derive(Debug)]
pub enum Claim {
    Granted(TurnGuard),
    /// Another turn is running
    Busy,
    /// The capturing session was left, reset, or replaced
    Stale,
}

/// All live sessions, keyed by channel id
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, ChannelSession>>>,
    next_generation: Arc<AtomicU64>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn with_session<T>(
        &self,
        channel_id: &str,
        now: Instant,
        f: impl FnOnce(&mut ChannelSession) -> T,
    ) -> T {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions.entry(channel_id.to_string()).or_insert_with(|| {
            tracing::debug!(channel_id, "session created");
            ChannelSession::new(channel_id, now, self.generation())
        });
        session.last_activity = now;
        f(session)
    }

    /// Owned copy of a session
    #[must_use]
    pub fn get(&self, channel_id: &str) -> Option<ChannelSession> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel_id)
            .cloned()
    }

    /// Current state, `Idle` for unknown channels
    #[must_use]
    pub fn state(&self, channel_id: &str) -> PipelineState {
        self.get(channel_id).map_or(PipelineState::Idle, |s| s.state)
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no sessions are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record activity, creating the session if needed, and arm it if idle
    pub fn touch(&self, channel_id: &str, now: Instant) -> ChannelSession {
        self.with_session(channel_id, now, |session| {
            if session.state == PipelineState::Idle {
                session.state = PipelineState::Listening;
            }
            session.clone()
        })
    }

    /// Mark the voice connection as established
    ///
    /// Returns false if it already was.
    pub fn connect_voice(&self, channel_id: &str, now: Instant) -> bool {
        self.with_session(channel_id, now, |session| {
            let newly = !session.voice_connected;
            session.voice_connected = true;
            if !session.processing {
                session.state = PipelineState::Listening;
            }
            newly
        })
    }

    /// Whether the channel has a voice connection
    #[must_use]
    pub fn voice_connected(&self, channel_id: &str) -> bool {
        self.get(channel_id).is_some_and(|s| s.voice_connected)
    }

    /// Set the state if the session exists and `generation` is current
    pub fn set_state(&self, channel_id: &str, generation: u64, state: PipelineState) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.get_mut(channel_id) {
            if session.generation == generation {
                tracing::trace!(channel_id, from = %session.state, to = %state, "state change");
                session.state = state;
            }
        }
    }

    /// Record whether a capture is running; returns the session generation
    pub fn set_recording(&self, channel_id: &str, recording: bool, now: Instant) -> u64 {
        self.with_session(channel_id, now, |session| {
            session.recording = recording;
            if !session.processing {
                session.state = if recording {
                    PipelineState::Capturing
                } else {
                    PipelineState::Listening
                };
            }
            session.generation
        })
    }

    /// Claim the channel for a turn
    ///
    /// Returns `None` when another turn is already running there.
    pub fn try_begin(
        &self,
        channel_id: &str,
        state: PipelineState,
        now: Instant,
    ) -> Option<TurnGuard> {
        self.with_session(channel_id, now, |session| {
            if session.processing {
                return None;
            }
            session.processing = true;
            session.state = state;
            Some(TurnGuard {
                channel_id: channel_id.to_string(),
                generation: session.generation,
                cancel: session.cancel.clone(),
            })
        })
    }

    /// Claim the channel for an utterance captured under `generation`
    ///
    /// Never creates a session. A missing session, a dropped voice
    /// connection, or a newer incarnation makes the claim `Stale`.
    pub fn try_resume(
        &self,
        channel_id: &str,
        generation: u64,
        state: PipelineState,
        now: Instant,
    ) -> Claim {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(session) = sessions.get_mut(channel_id) else {
            return Claim::Stale;
        };
        if !session.voice_connected || session.generation != generation {
            return Claim::Stale;
        }
        if session.processing {
            return Claim::Busy;
        }

        session.last_activity = now;
        session.processing = true;
        session.state = state;
        Claim::Granted(TurnGuard {
            channel_id: channel_id.to_string(),
            generation,
            cancel: session.cancel.clone(),
        })
    }

    /// Release a turn and return the channel to `Listening`
    ///
    /// A guard from a replaced session is ignored.
    pub fn finish(&self, guard: &TurnGuard) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.get_mut(&guard.channel_id) {
            if session.generation == guard.generation {
                session.processing = false;
                session.state = if session.recording {
                    PipelineState::Capturing
                } else {
                    PipelineState::Listening
                };
            }
        }
    }

    /// Open an on-demand listen window ending at `until`
    pub fn open_listen_window(&self, channel_id: &str, now: Instant, until: Instant) {
        self.with_session(channel_id, now, |session| {
            session.listen_until = Some(until);
            if session.state == PipelineState::Idle {
                session.state = PipelineState::Listening;
            }
        });
    }

    /// Whether a listen window is open at `now`, without consuming it
    #[must_use]
    pub fn listen_window_open(&self, channel_id: &str, now: Instant) -> bool {
        self.get(channel_id)
            .and_then(|s| s.listen_until)
            .is_some_and(|until| now <= until)
    }

    /// Consume the listen window if it is still open at `now`
    ///
    /// An expired window is cleared and reported as closed.
    pub fn take_listen_window(&self, channel_id: &str, now: Instant) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(session) = sessions.get_mut(channel_id) else {
            return false;
        };
        session
            .listen_until
            .take()
            .is_some_and(|until| now <= until)
    }

    /// Cancel the session's in-flight work and start a fresh incarnation
    ///
    /// The voice connection flag survives. Returns false if no session existed.
    pub fn reset(&self, channel_id: &str, now: Instant) -> bool {
        let generation = self.generation();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(session) = sessions.get_mut(channel_id) else {
            return false;
        };

        session.cancel.cancel();
        let voice_connected = session.voice_connected;
        *session = ChannelSession::new(channel_id, now, generation);
        session.voice_connected = voice_connected;
        if voice_connected {
            session.state = PipelineState::Listening;
        }
        true
    }

    /// Remove the session, cancelling its in-flight work
    pub fn remove(&self, channel_id: &str) -> Option<ChannelSession> {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel_id);

        if let Some(session) = &removed {
            session.cancel.cancel();
            tracing::debug!(channel_id, "session removed");
        }
        removed
    }

    /// Channels idle for at least `horizon`
    #[must_use]
    pub fn idle_channels(&self, now: Instant, horizon: Duration) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.is_idle(now, horizon))
            .map(|s| s.channel_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_touch_arms_channel() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.state("chan"), PipelineState::Idle);

        registry.touch("chan", Instant::now());
        assert_eq!(registry.state("chan"), PipelineState::Listening);
    }

    #[test]
    fn test_second_turn_is_rejected_while_busy() {
        let registry = SessionRegistry::new();
        let now = Instant::now();

        let guard = registry
            .try_begin("chan", PipelineState::Inferring, now)
            .unwrap();
        assert!(registry
            .try_begin("chan", PipelineState::Inferring, now)
            .is_none());

        registry.finish(&guard);
        assert_eq!(registry.state("chan"), PipelineState::Listening);
        assert!(registry
            .try_begin("chan", PipelineState::Inferring, now)
            .is_some());
    }

    #[test]
    fn test_reset_cancels_and_ignores_stale_guard() {
        let registry = SessionRegistry::new();
        let now = Instant::now();
        registry.connect_voice("chan", now);

        let stale = registry
            .try_begin("chan", PipelineState::Inferring, now)
            .unwrap();
        assert!(registry.reset("chan", now));
        assert!(stale.cancel.is_cancelled());

        let fresh = registry
            .try_begin("chan", PipelineState::Inferring, now)
            .unwrap();
        registry.finish(&stale);
        assert!(registry.get("chan").unwrap().processing);
        assert!(registry.voice_connected("chan"));

        registry.finish(&fresh);
        assert!(!registry.get("chan").unwrap().processing);
    }

    #[test]
    fn test_listen_window_expires() {
        let registry = SessionRegistry::new();
        let now = Instant::now();

        registry.open_listen_window("chan", now, now + Duration::from_secs(20));
        assert!(registry.take_listen_window("chan", now + Duration::from_secs(5)));
        assert!(!registry.take_listen_window("chan", now + Duration::from_secs(6)));

        registry.open_listen_window("chan", now, now + Duration::from_secs(20));
        assert!(!registry.take_listen_window("chan", now + Duration::from_secs(21)));
    }

    #[test]
    fn test_generation_stable_across_touches() {
        let registry = SessionRegistry::new();
        let now = Instant::now();

        let first = registry.touch("chan", now).generation;
        registry.touch("other", now);
        registry.touch("chan", now);
        registry.set_recording("chan", true, now);
        assert_eq!(registry.get("chan").unwrap().generation, first);
        assert_eq!(registry.get("other").unwrap().generation, first + 1);
    }

    #[test]
    fn test_resume_rejects_missing_and_replaced_sessions() {
        let registry = SessionRegistry::new();
        let now = Instant::now();

        assert!(matches!(
            registry.try_resume("chan", 1, PipelineState::Transcribing, now),
            Claim::Stale
        ));
        assert!(registry.is_empty());

        registry.connect_voice("chan", now);
        let generation = registry.set_recording("chan", false, now);
        let Claim::Granted(guard) =
            registry.try_resume("chan", generation, PipelineState::Transcribing, now)
        else {
            panic!("current generation should be granted");
        };
        assert!(matches!(
            registry.try_resume("chan", generation, PipelineState::Transcribing, now),
            Claim::Busy
        ));
        registry.finish(&guard);

        registry.reset("chan", now);
        assert!(matches!(
            registry.try_resume("chan", generation, PipelineState::Transcribing, now),
            Claim::Stale
        ));
    }

    #[test]
    fn test_listen_window_peek_does_not_consume() {
        let registry = SessionRegistry::new();
        let now = Instant::now();

        registry.open_listen_window("chan", now, now + Duration::from_secs(20));
        assert!(registry.listen_window_open("chan", now));
        assert!(registry.take_listen_window("chan", now));
        assert!(!registry.listen_window_open("chan", now));
    }

    #[test]
    fn test_idle_channels() {
        let registry = SessionRegistry::new();
        let now = Instant::now();
        registry.touch("old", now);
        registry.touch("new", now + Duration::from_secs(50));

        let idle = registry.idle_channels(now + Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(idle, vec!["old".to_string()]);
    }

    #[test]
    fn test_remove_cancels_token() {
        let registry = SessionRegistry::new();
        let session = registry.touch("chan", Instant::now());

        registry.remove("chan");
        assert!(session.cancel.is_cancelled());
        assert!(registry.is_empty());
    }
}
