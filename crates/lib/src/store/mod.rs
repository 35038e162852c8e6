//! Durable persistence for chats, credentials and preferences.
//!
//! Each logical collection is one JSON blob under its own namespace, written whole
//! (read-modify-write). Collections are independent: a corrupt chat blob never affects the
//! credentials and vice versa.

mod backend;
mod collection;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use collection::{legacy_state, Collection, Versioned, CURRENT_VERSION};

/// Namespace of the chat list and active-chat pointer.
pub const CHATS_NAMESPACE: &str = "chats";
/// Namespace of the providerId → API key map.
pub const API_KEYS_NAMESPACE: &str = "api-keys";
/// Namespace of UI preference flags.
pub const PREFERENCES_NAMESPACE: &str = "preferences";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unsupported collection version {0}")]
    UnsupportedVersion(u64),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage task failed: {0}")]
    Task(String),
}
