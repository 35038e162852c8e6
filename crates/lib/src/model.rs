//! Chat and message records shared by the registry, the persistent store and the send pipeline.
//!
//! Dates are `DateTime<Utc>` in memory and ISO-8601 strings on disk. Epoch milliseconds are
//! accepted on read for blobs written by the mobile app.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Title every chat starts with until the first user message names it.
pub const SENTINEL_TITLE: &str = "New Chat";

/// Default number of characters kept when deriving a title from the first user message.
pub const DEFAULT_TITLE_MAX_CHARS: usize = 30;

/// Appended to a derived title when the message was longer than the limit.
pub const TITLE_ELLIPSIS: &str = "...";

/// Longest user input accepted by the send pipeline, in characters.
pub const MAX_INPUT_CHARS: usize = 4000;

pub type ChatId = String;
pub type MessageId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed message. Never edited after it has been appended to a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// A conversation bound to one provider/model pair for its whole life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub title: String,
    #[serde(alias = "provider")]
    pub provider_id: String,
    #[serde(alias = "model")]
    pub model_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("chat-{}", uuid::Uuid::new_v4()),
            title: SENTINEL_TITLE.to_string(),
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_sentinel_title(&self) -> bool {
        self.title == SENTINEL_TITLE
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append a message, keeping timestamps non-decreasing and bumping `updated_at`.
    /// Derives the title from the first user message while the title is still the sentinel.
    pub(crate) fn push_message(&mut self, mut message: Message, title_max_chars: usize) {
        if let Some(last) = self.messages.last() {
            if message.timestamp < last.timestamp {
                message.timestamp = last.timestamp;
            }
        }
        if self.has_sentinel_title() && message.role == Role::User {
            self.title = derive_title(&message.content, title_max_chars);
        }
        self.updated_at = Utc::now().max(message.timestamp);
        self.messages.push(message);
    }
}

/// ISO-8601 on write; ISO-8601 or epoch milliseconds on read.
mod timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(DateTime<Utc>),
        Millis(i64),
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Text(t) => Ok(t),
            Repr::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", ms))),
        }
    }
}

/// First `max_chars` characters of `content`, plus an ellipsis when it was cut.
pub fn derive_title(content: &str, max_chars: usize) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}{}", head, TITLE_ELLIPSIS)
    } else {
        head
    }
}
