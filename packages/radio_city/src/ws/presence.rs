//! Presence Broadcaster
//!
//! Snapshot construction plus the trailing-edge debounce that coalesces
//! bursts of presence changes into one broadcast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::protocol::{PresenceUser, ServerMessage};
use super::registry::Connection;

pub const ANONYMOUS_NICKNAME: &str = "Anonymous";

/// Single re-armable deadline. Each trigger pushes the deadline to
/// `now + delay`; it fires once when reached with no newer trigger.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn trigger(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarm and return true if the deadline has passed.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Who is listening, as shown to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub listeners: usize,
    pub users: Vec<PresenceUser>,
}

impl PresenceSnapshot {
    /// Named users are de-duplicated by nickname, keeping the most recently
    /// active connection. Anonymous entries pad the list so its length
    /// matches the connection count.
    pub fn build(connections: &[Connection], now: DateTime<Utc>) -> Self {
        let mut named: HashMap<&str, &Connection> = HashMap::new();
        for conn in connections {
            let Some(nickname) = conn.nickname.as_deref() else {
                continue;
            };
            named
                .entry(nickname)
                .and_modify(|existing| {
                    if conn.last_activity > existing.last_activity {
                        *existing = conn;
                    }
                })
                .or_insert(conn);
        }

        let mut users: Vec<PresenceUser> = named
            .into_iter()
            .map(|(nickname, conn)| PresenceUser {
                nickname: nickname.to_string(),
                last_seen: conn.last_activity.timestamp_millis(),
                color: conn.color.clone(),
            })
            .collect();
        users.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.nickname.cmp(&b.nickname))
        });

        let anonymous = connections.len().saturating_sub(users.len());
        users.extend((0..anonymous).map(|_| PresenceUser {
            nickname: ANONYMOUS_NICKNAME.to_string(),
            last_seen: now.timestamp_millis(),
            color: None,
        }));

        Self {
            listeners: connections.len(),
            users,
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Listeners {
            listeners: self.listeners,
            users: self.users.clone(),
        }
    }
}
