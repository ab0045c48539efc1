//! WebSocket Protocol Types
//!
//! Message types exchanged with listeners over `/api/ws`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::models::ChatMessage;

pub const MAX_NICKNAME_CHARS: usize = 32;
pub const MAX_CHAT_CHARS: usize = 500;

static COLOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#(?:[0-9a-fA-F]{3}|[0-9a-fA-F]{6})$").expect("colour pattern is valid")
});

/// Why an inbound frame was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("nickname must be 1-32 characters")]
    Nickname,

    #[error("chat text must be 1-500 characters")]
    Text,

    #[error("invalid colour {0:?}")]
    Color(String),
}

/// Wire form, before validation.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawClientMessage {
    Join {
        nickname: String,
    },
    Chat {
        nickname: String,
        text: String,
    },
    ColorUpdate {
        nickname: String,
        #[serde(default)]
        color: Option<String>,
    },
}

/// Messages sent FROM a listener TO the server, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Join {
        nickname: String,
    },
    Chat {
        nickname: String,
        text: String,
    },
    ColorUpdate {
        nickname: String,
        color: Option<String>,
    },
    /// Anything that failed to decode or validate. Dropped by the gateway.
    Unknown,
}

impl ClientMessage {
    /// Decode and validate one text frame.
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let raw: RawClientMessage =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        match raw {
            RawClientMessage::Join { nickname } => Ok(Self::Join {
                nickname: validate_nickname(&nickname)?,
            }),
            RawClientMessage::Chat { nickname, text } => Ok(Self::Chat {
                nickname: validate_nickname(&nickname)?,
                text: validate_text(&text)?,
            }),
            RawClientMessage::ColorUpdate { nickname, color } => Ok(Self::ColorUpdate {
                nickname: validate_nickname(&nickname)?,
                color: color.map(validate_color).transpose()?,
            }),
        }
    }

    /// Like [`ClientMessage::parse`] but folds every failure into `Unknown`.
    pub fn decode(text: &str) -> Self {
        Self::parse(text).unwrap_or(Self::Unknown)
    }
}

fn validate_nickname(nickname: &str) -> Result<String, DecodeError> {
    let trimmed = nickname.trim();
    let chars = trimmed.chars().count();
    if chars == 0 || chars > MAX_NICKNAME_CHARS {
        return Err(DecodeError::Nickname);
    }
    Ok(trimmed.to_string())
}

fn validate_text(text: &str) -> Result<String, DecodeError> {
    let trimmed = text.trim();
    let chars = trimmed.chars().count();
    if chars == 0 || chars > MAX_CHAT_CHARS {
        return Err(DecodeError::Text);
    }
    Ok(trimmed.to_string())
}

fn validate_color(color: String) -> Result<String, DecodeError> {
    if COLOR_RE.is_match(&color) {
        Ok(color.to_ascii_lowercase())
    } else {
        Err(DecodeError::Color(color))
    }
}

/// One entry of a presence snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub nickname: String,
    /// Epoch milliseconds of the user's last activity
    pub last_seen: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Messages sent FROM the server TO listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Chat {
        nickname: String,
        text: String,
        /// Epoch milliseconds
        timestamp: i64,
    },
    Listeners {
        listeners: usize,
        users: Vec<PresenceUser>,
    },
}

impl From<&ChatMessage> for ServerMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self::Chat {
            nickname: msg.nickname.clone(),
            text: msg.text.clone(),
            timestamp: msg.timestamp.timestamp_millis(),
        }
    }
}
