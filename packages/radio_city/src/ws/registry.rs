//! Connection Registry
//!
//! The set of live listener connections. Owned by the gateway actor, so
//! none of this is shared or locked.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

pub type ConnectionId = String;

/// A frame queued for one connection's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized JSON message
    Text(String),
    Ping,
    /// Close the socket and stop writing
    Close,
}

/// One listener session.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub sender: mpsc::Sender<Outbound>,
    pub nickname: Option<String>,
    pub color: Option<String>,
    pub last_pong: Instant,
    pub last_activity: DateTime<Utc>,
}

/// Result of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queue full, message dropped
    Dropped,
    /// Receiver gone; the connection has been removed
    Closed,
    /// No such connection
    Missing,
}

#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns false if the id is already present.
    pub fn add(
        &mut self,
        id: ConnectionId,
        sender: mpsc::Sender<Outbound>,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> bool {
        if self.connections.contains_key(&id) {
            return false;
        }
        self.connections.insert(
            id.clone(),
            Connection {
                id,
                sender,
                nickname: None,
                color: None,
                last_pong: now,
                last_activity: wall,
            },
        );
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Connection> {
        self.connections.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn touch_pong(&mut self, id: &str, now: Instant) -> bool {
        match self.connections.get_mut(id) {
            Some(conn) => {
                conn.last_pong = now;
                true
            }
            None => false,
        }
    }

    pub fn touch_activity(&mut self, id: &str, wall: DateTime<Utc>) -> bool {
        match self.connections.get_mut(id) {
            Some(conn) => {
                conn.last_activity = wall;
                true
            }
            None => false,
        }
    }

    /// Returns true when the nickname actually changed.
    pub fn set_nickname(&mut self, id: &str, nickname: &str) -> bool {
        match self.connections.get_mut(id) {
            Some(conn) if conn.nickname.as_deref() != Some(nickname) => {
                conn.nickname = Some(nickname.to_string());
                true
            }
            _ => false,
        }
    }

    /// Returns true when the colour actually changed.
    pub fn set_color(&mut self, id: &str, color: Option<String>) -> bool {
        match self.connections.get_mut(id) {
            Some(conn) if conn.color != color => {
                conn.color = color;
                true
            }
            _ => false,
        }
    }

    /// Copy of every connection.
    pub fn all(&self) -> Vec<Connection> {
        self.connections.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().cloned().collect()
    }

    /// Remove and return every connection whose last pong is more than
    /// `timeout` before `now`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<Connection> {
        let expired: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| now.saturating_duration_since(c.last_pong) > timeout)
            .map(|c| c.id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.connections.remove(id))
            .collect()
    }

    /// Queue a frame without waiting. A closed receiver removes the
    /// connection.
    pub fn try_send(&mut self, id: &str, frame: Outbound) -> SendOutcome {
        let Some(conn) = self.connections.get(id) else {
            return SendOutcome::Missing;
        };
        match conn.sender.try_send(frame) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(TrySendError::Closed(_)) => {
                self.connections.remove(id);
                SendOutcome::Closed
            }
        }
    }
}
