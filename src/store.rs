//! Shared conversation state.
//!
//! The store holds the flags the speech, pipeline and avatar components
//! coordinate on, plus the bounded conversation history. Every write goes
//! through a `watch` channel so observers are notified, and the history
//! append is a single read-modify-write on the live value.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::watch;

/// Default number of turns kept in memory.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered conversation turns with FIFO eviction past `limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationHistory {
    turns: VecDeque<Turn>,
    limit: usize,
}

impl ConversationHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(limit + 2),
            limit,
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.limit {
            self.turns.pop_front();
        }
    }

    /// The last `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Turn> {
        let start = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(start).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

/// Flags shared between the speech, pipeline and avatar components.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    pub is_listening: bool,
    /// Text currently presented to the user (answers and status messages).
    pub display_text: String,
    /// Bumped on every display text write, so repeating the same text is
    /// still observable.
    pub display_revision: u64,
    pub is_avatar_connected: bool,
    pub is_avatar_speaking: bool,
    /// Pending stop request, cleared only by the avatar session.
    pub stop_avatar_speaking: bool,
}

pub struct ConversationStore {
    state: watch::Sender<ConversationState>,
    history: watch::Sender<ConversationHistory>,
}

impl ConversationStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: watch::Sender::new(ConversationState::default()),
            history: watch::Sender::new(ConversationHistory::new(history_limit)),
        }
    }

    pub fn snapshot_state(&self) -> ConversationState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConversationState> {
        self.state.subscribe()
    }

    pub fn set_listening(&self, listening: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.is_listening != listening;
            state.is_listening = listening;
            changed
        });
    }

    /// Replaces the display text. Observers are notified even when the text
    /// is unchanged so a repeated answer is presented again.
    pub fn set_display_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.state.send_modify(|state| {
            state.display_text = text;
            state.display_revision += 1;
        });
    }

    pub fn set_avatar_connected(&self, connected: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.is_avatar_connected != connected;
            state.is_avatar_connected = connected;
            changed
        });
    }

    pub fn set_avatar_speaking(&self, speaking: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.is_avatar_speaking != speaking;
            state.is_avatar_speaking = speaking;
            changed
        });
    }

    /// Raises the stop-speaking flag. Returns `true` only for the call that
    /// moved it from lowered to raised; repeated requests coalesce.
    pub fn request_stop_speaking(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.stop_avatar_speaking {
                return false;
            }
            state.stop_avatar_speaking = true;
            true
        })
    }

    /// Lowers the stop-speaking flag and the speaking flag together.
    /// Returns whether a request was pending.
    pub fn consume_stop_request(&self) -> bool {
        let mut pending = false;
        self.state.send_if_modified(|state| {
            pending = state.stop_avatar_speaking;
            if !pending {
                return false;
            }
            state.stop_avatar_speaking = false;
            state.is_avatar_speaking = false;
            true
        });
        pending
    }

    /// Copy of the history as it is right now.
    pub fn history_snapshot(&self) -> ConversationHistory {
        self.history.borrow().clone()
    }

    pub fn subscribe_history(&self) -> watch::Receiver<ConversationHistory> {
        self.history.subscribe()
    }

    /// Appends a user/assistant exchange to the live history in one
    /// transition, evicting the oldest turns past the limit.
    pub fn append_exchange(&self, user: impl Into<String>, assistant: impl Into<String>) {
        let user = Turn::user(user);
        let assistant = Turn::assistant(assistant);
        self.history.send_modify(|history| {
            history.push(user);
            history.push(assistant);
        });
    }

    pub fn clear_history(&self) {
        self.history.send_modify(ConversationHistory::clear);
    }

    pub fn history_limit(&self) -> usize {
        self.history.borrow().limit()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
