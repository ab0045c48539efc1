//! Chat History Store
//!
//! Time-windowed in-memory chat log replayed to new listeners. Every call
//! prunes first, so nothing older than the retention window is ever
//! returned.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

use crate::models::ChatMessage;

#[derive(Debug)]
pub struct ChatHistory {
    messages: VecDeque<ChatMessage>,
    retention: chrono::Duration,
    max_messages: usize,
}

impl ChatHistory {
    pub fn new(retention: Duration, max_messages: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
            max_messages,
        }
    }

    /// Load previously persisted messages, oldest first.
    pub fn seed(&mut self, messages: Vec<ChatMessage>, now: DateTime<Utc>) {
        for msg in messages {
            self.push(msg);
        }
        self.prune(now);
    }

    pub fn append(&mut self, message: ChatMessage, now: DateTime<Utc>) {
        self.prune(now);
        self.push(message);
    }

    /// Messages inside the retention window, oldest first.
    pub fn history(&mut self, now: DateTime<Utc>) -> Vec<ChatMessage> {
        self.prune(now);
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn push(&mut self, message: ChatMessage) {
        self.messages.push_back(message);
        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return;
        };
        // Arrival order, not timestamp order, so check every entry
        self.messages.retain(|m| m.timestamp >= cutoff);
    }
}
