use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One chat line from a listener. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub uuid: String,
    pub nickname: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(nickname: String, text: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            nickname,
            text,
            timestamp,
        }
    }
}
