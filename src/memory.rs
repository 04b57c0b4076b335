//! Per-channel conversation memory
//!
//! Each channel keeps a bounded FIFO history of turns. Operations on one
//! channel are linearized by that channel's lock; the outer map is only held
//! long enough to find or create the entry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::llm::ChatMessage;

/// Who authored a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// One user or assistant message in a channel's history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    /// Create a user turn stamped now
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create an assistant turn stamped now
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Convert into a model prompt message
    #[must_use]
    pub fn to_message(&self) -> ChatMessage {
        match self.role {
            Role::User => ChatMessage::user(self.content.clone()),
            Role::Assistant => ChatMessage::assistant(self.content.clone()),
        }
    }
}

/// Bounded, chronologically ordered history
#[derive(Debug)]
struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    max_history: usize,
}

impl ConversationHistory {
    fn new(max_history: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_history),
            max_history,
        }
    }

    fn push(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_history {
            self.turns.pop_front();
        }
    }
}

type SharedHistory = Arc<Mutex<ConversationHistory>>;

/// Conversation memory for every channel
#[derive(Debug, Clone)]
pub struct ConversationStore {
    max_history: usize,
    channels: Arc<Mutex<HashMap<String, SharedHistory>>>,
}

impl ConversationStore {
    /// Create a store keeping at most `max_history` turns per channel
    ///
    /// A bound of zero is raised to one.
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Per-channel history bound
    #[must_use]
    pub const fn max_history(&self) -> usize {
        self.max_history
    }

    fn history(&self, channel_id: &str) -> SharedHistory {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            channels
                .entry(channel_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ConversationHistory::new(self.max_history)))),
        )
    }

    /// Append a turn, evicting the oldest turns beyond the bound
    pub fn append_turn(&self, channel_id: &str, turn: ConversationTurn) {
        let history = self.history(channel_id);
        history.lock().unwrap_or_else(|e| e.into_inner()).push(turn);
    }

    /// Commit a user turn and its reply together
    pub fn append_exchange(
        &self,
        channel_id: &str,
        user: ConversationTurn,
        assistant: ConversationTurn,
    ) {
        let history = self.history(channel_id);
        let mut history = history.lock().unwrap_or_else(|e| e.into_inner());
        history.push(user);
        history.push(assistant);
        tracing::trace!(channel_id, turns = history.turns.len(), "exchange recorded");
    }

    /// Owned copy of the channel's history, oldest first
    #[must_use]
    pub fn snapshot(&self, channel_id: &str) -> Vec<ConversationTurn> {
        let history = {
            let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            match channels.get(channel_id) {
                Some(h) => Arc::clone(h),
                None => return Vec::new(),
            }
        };

        let history = history.lock().unwrap_or_else(|e| e.into_inner());
        history.turns.iter().cloned().collect()
    }

    /// Number of turns held for a channel
    #[must_use]
    pub fn len(&self, channel_id: &str) -> usize {
        self.snapshot(channel_id).len()
    }

    /// Whether a channel has no history
    #[must_use]
    pub fn is_empty(&self, channel_id: &str) -> bool {
        self.len(channel_id) == 0
    }

    /// Forget a channel's history immediately
    pub fn reset(&self, channel_id: &str) {
        let removed = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel_id);

        // Clear in place so any holder of the old entry sees an empty history
        if let Some(history) = removed {
            history.lock().unwrap_or_else(|e| e.into_inner()).turns.clear();
        }

        tracing::debug!(channel_id, "conversation reset");
    }
}
