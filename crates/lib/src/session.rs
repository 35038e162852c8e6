//! Session registry: the in-memory, authoritative list of chats and the active-chat pointer.
//!
//! Chats are kept newest-first by creation time and are never re-sorted afterwards. Every
//! mutation writes the whole list through to the `chats` collection; writes are best-effort
//! (failures are logged, the in-memory state stays authoritative).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::model::{Chat, ChatId, Message};
use crate::store::{legacy_state, Collection, StorageBackend, Versioned, CHATS_NAMESPACE};

/// Persisted form of the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    #[serde(default)]
    pub chats: Vec<Chat>,
    #[serde(default)]
    pub active_chat: Option<ChatId>,
}

impl Versioned for ChatSnapshot {
    /// Older blobs are a bare array of chats with no active pointer, or the persist wrapper
    /// around `{"chats", "activeChat"}`.
    fn from_legacy(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let value = legacy_state(value);
        if value.is_array() {
            return Ok(Self {
                chats: serde_json::from_value(value)?,
                active_chat: None,
            });
        }
        serde_json::from_value(value)
    }
}

/// Change notifications for views that mirror the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    ChatCreated(ChatId),
    MessageAdded { chat_id: ChatId, message_id: String },
    TitleChanged { chat_id: ChatId, title: String },
    ChatDeleted(ChatId),
    ActiveChanged(Option<ChatId>),
}

struct RegistryState {
    chats: Vec<Chat>,
    active: Option<ChatId>,
    revision: u64,
}

impl RegistryState {
    fn position(&self, chat_id: &str) -> Option<usize> {
        self.chats.iter().position(|c| c.id == chat_id)
    }

    fn snapshot(&mut self) -> (u64, ChatSnapshot) {
        self.revision += 1;
        (
            self.revision,
            ChatSnapshot {
                chats: self.chats.clone(),
                active_chat: self.active.clone(),
            },
        )
    }
}

pub struct ChatRegistry {
    state: RwLock<RegistryState>,
    collection: Collection<ChatSnapshot>,
    title_max_chars: usize,
    events: broadcast::Sender<RegistryEvent>,
}

impl ChatRegistry {
    /// Restore the registry from `backend`. A missing or corrupt blob starts empty.
    pub async fn load(backend: Arc<dyn StorageBackend>, title_max_chars: usize) -> Self {
        let collection = Collection::new(backend, CHATS_NAMESPACE);
        let mut snapshot: ChatSnapshot = collection.load().await;
        if let Some(active) = snapshot.active_chat.as_deref() {
            if !snapshot.chats.iter().any(|c| c.id == active) {
                log::warn!("registry: dropping active pointer to missing chat {}", active);
                snapshot.active_chat = None;
            }
        }
        log::info!("registry: loaded {} chats", snapshot.chats.len());
        let (events, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(RegistryState {
                chats: snapshot.chats,
                active: snapshot.active_chat,
                revision: 0,
            }),
            collection,
            title_max_chars,
            events,
        }
    }

    pub fn title_max_chars(&self) -> usize {
        self.title_max_chars
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    async fn persist(&self, revision: u64, snapshot: ChatSnapshot) {
        self.collection.save_best_effort(revision, &snapshot).await;
    }

    /// Create an empty chat at the head of the list and make it active.
    pub async fn create_chat(
        &self,
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> ChatId {
        let chat = Chat::new(provider_id, model_id);
        let id = chat.id.clone();
        let (revision, snapshot) = {
            let mut g = self.state.write().await;
            g.chats.insert(0, chat);
            g.active = Some(id.clone());
            g.snapshot()
        };
        log::info!("registry: created chat {}", id);
        self.persist(revision, snapshot).await;
        self.notify(RegistryEvent::ChatCreated(id.clone()));
        self.notify(RegistryEvent::ActiveChanged(Some(id.clone())));
        id
    }

    /// Append `message` to a chat. Unknown ids are ignored and return false.
    ///
    /// The first user message replaces the sentinel title with a prefix of its content.
    pub async fn add_message(&self, chat_id: &str, message: Message) -> bool {
        let message_id = message.id.clone();
        let (revision, snapshot, new_title) = {
            let mut g = self.state.write().await;
            let Some(index) = g.position(chat_id) else {
                log::debug!("registry: add_message to unknown chat {} ignored", chat_id);
                return false;
            };
            let chat = &mut g.chats[index];
            let was_sentinel = chat.has_sentinel_title();
            chat.push_message(message, self.title_max_chars);
            let new_title = if was_sentinel && !chat.has_sentinel_title() {
                Some(chat.title.clone())
            } else {
                None
            };
            let (revision, snapshot) = g.snapshot();
            (revision, snapshot, new_title)
        };
        self.persist(revision, snapshot).await;
        self.notify(RegistryEvent::MessageAdded {
            chat_id: chat_id.to_string(),
            message_id,
        });
        if let Some(title) = new_title {
            self.notify(RegistryEvent::TitleChanged {
                chat_id: chat_id.to_string(),
                title,
            });
        }
        true
    }

    /// Overwrite a chat's title. Unknown ids are ignored and return false.
    pub async fn update_title(&self, chat_id: &str, title: impl Into<String>) -> bool {
        let title = title.into();
        let (revision, snapshot) = {
            let mut g = self.state.write().await;
            let Some(index) = g.position(chat_id) else {
                return false;
            };
            g.chats[index].title = title.clone();
            g.snapshot()
        };
        self.persist(revision, snapshot).await;
        self.notify(RegistryEvent::TitleChanged {
            chat_id: chat_id.to_string(),
            title,
        });
        true
    }

    /// Remove a chat. Deleting the active chat moves the pointer to the new head, or clears it.
    pub async fn delete_chat(&self, chat_id: &str) -> bool {
        let (revision, snapshot, active_changed) = {
            let mut g = self.state.write().await;
            let Some(index) = g.position(chat_id) else {
                return false;
            };
            g.chats.remove(index);
            let active_changed = g.active.as_deref() == Some(chat_id);
            if active_changed {
                g.active = g.chats.first().map(|c| c.id.clone());
            }
            let (revision, snapshot) = g.snapshot();
            (revision, snapshot, active_changed)
        };
        log::info!("registry: deleted chat {}", chat_id);
        let new_active = snapshot.active_chat.clone();
        self.persist(revision, snapshot).await;
        self.notify(RegistryEvent::ChatDeleted(chat_id.to_string()));
        if active_changed {
            self.notify(RegistryEvent::ActiveChanged(new_active));
        }
        true
    }

    /// Point the active chat at `chat_id` (or nothing). Not persisted on its own.
    pub async fn set_active(&self, chat_id: Option<ChatId>) {
        {
            let mut g = self.state.write().await;
            if g.active == chat_id {
                return;
            }
            g.active = chat_id.clone();
        }
        self.notify(RegistryEvent::ActiveChanged(chat_id));
    }

    pub async fn active(&self) -> Option<ChatId> {
        self.state.read().await.active.clone()
    }

    /// Clone of the chat if it still exists.
    pub async fn get_chat(&self, chat_id: &str) -> Option<Chat> {
        let g = self.state.read().await;
        g.chats.iter().find(|c| c.id == chat_id).cloned()
    }

    pub async fn contains(&self, chat_id: &str) -> bool {
        self.state.read().await.position(chat_id).is_some()
    }

    /// All chats in display order (newest-created first).
    pub async fn chats(&self) -> Vec<Chat> {
        self.state.read().await.chats.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.chats.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.chats.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, SENTINEL_TITLE};
    use crate::store::MemoryBackend;

    async fn registry() -> (Arc<MemoryBackend>, ChatRegistry) {
        let backend = Arc::new(MemoryBackend::new());
        let registry = ChatRegistry::load(backend.clone(), 30).await;
        (backend, registry)
    }

    #[tokio::test]
    async fn create_chat_works_from_empty_and_sets_active() {
        let (_, registry) = registry().await;
        assert!(registry.is_empty().await);
        let id = registry.create_chat("openai", "gpt-4o").await;
        assert_eq!(registry.active().await.as_deref(), Some(id.as_str()));
        let chat = registry.get_chat(&id).await.unwrap();
        assert_eq!(chat.title, SENTINEL_TITLE);
        assert!(chat.messages.is_empty());
    }

    #[tokio::test]
    async fn title_is_derived_from_first_user_message_only() {
        let (_, registry) = registry().await;
        let id = registry.create_chat("openai", "gpt-4o").await;
        let long = "Tell me everything about the borrow checker please";
        assert!(registry.add_message(&id, Message::user(long)).await);
        let chat = registry.get_chat(&id).await.unwrap();
        assert_eq!(chat.title, "Tell me everything about the b...");

        registry.add_message(&id, Message::user("short")).await;
        let chat = registry.get_chat(&id).await.unwrap();
        assert_eq!(chat.title, "Tell me everything about the b...");
        assert_eq!(chat.messages.len(), 2);
    }

    #[tokio::test]
    async fn assistant_message_does_not_name_the_chat() {
        let (_, registry) = registry().await;
        let id = registry.create_chat("openai", "gpt-4o").await;
        registry.add_message(&id, Message::assistant("hi")).await;
        assert_eq!(registry.get_chat(&id).await.unwrap().title, SENTINEL_TITLE);
    }

    #[tokio::test]
    async fn add_message_to_unknown_chat_is_a_no_op() {
        let (backend, registry) = registry().await;
        assert!(!registry.add_message("chat-missing", Message::user("x")).await);
        assert!(backend.raw(CHATS_NAMESPACE).is_none());
    }

    #[tokio::test]
    async fn update_title_overwrites_without_derivation() {
        let (_, registry) = registry().await;
        let id = registry.create_chat("openai", "gpt-4o").await;
        assert!(registry.update_title(&id, "Renamed").await);
        registry.add_message(&id, Message::user("first question")).await;
        assert_eq!(registry.get_chat(&id).await.unwrap().title, "Renamed");
        assert!(!registry.update_title("chat-missing", "x").await);
    }

    #[tokio::test]
    async fn deleting_active_chat_repairs_pointer() {
        let (_, registry) = registry().await;
        let a = registry.create_chat("openai", "gpt-4o").await;
        let b = registry.create_chat("openai", "gpt-4o").await;
        let c = registry.create_chat("openai", "gpt-4o").await;
        assert_eq!(registry.active().await.as_deref(), Some(c.as_str()));

        registry.delete_chat(&c).await;
        assert_eq!(registry.active().await.as_deref(), Some(b.as_str()));

        registry.set_active(Some(a.clone())).await;
        registry.delete_chat(&b).await;
        assert_eq!(registry.active().await.as_deref(), Some(a.as_str()));

        registry.delete_chat(&a).await;
        assert_eq!(registry.active().await, None);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn display_order_is_creation_order_newest_first() {
        let (_, registry) = registry().await;
        let a = registry.create_chat("openai", "gpt-4o").await;
        let b = registry.create_chat("groq", "llama-3.1-8b-instant").await;
        let c = registry.create_chat("local", "gemma2:2b").await;
        registry.add_message(&a, Message::user("bump")).await;
        let ids: Vec<String> = registry.chats().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![c, b, a]);
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let (backend, registry) = registry().await;
        let a = registry.create_chat("openai", "gpt-4o").await;
        registry
            .add_message(&a, Message::user("línea uno\nline two 🚀"))
            .await;
        registry.add_message(&a, Message::assistant("ok")).await;
        let before = registry.get_chat(&a).await.unwrap();

        let reloaded = ChatRegistry::load(backend, 30).await;
        let after = reloaded.get_chat(&a).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after.messages[0].role, Role::User);
        assert_eq!(reloaded.active().await.as_deref(), Some(a.as_str()));
    }

    #[tokio::test]
    async fn legacy_array_blob_loads_without_active_chat() {
        let backend = Arc::new(MemoryBackend::new());
        let legacy = r#"[{"id":"1700000000000","title":"Old","provider":"openai","model":"gpt-4o",
            "messages":[{"id":"1","role":"user","content":"hi","timestamp":"2024-01-01T00:00:00.000Z"}],
            "createdAt":"2024-01-01T00:00:00.000Z","updatedAt":"2024-01-01T00:00:00.000Z"}]"#;
        backend.set(CHATS_NAMESPACE, legacy.to_string()).await.unwrap();
        let registry = ChatRegistry::load(backend, 30).await;
        let chats = registry.chats().await;
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].provider_id, "openai");
        assert_eq!(chats[0].messages[0].content, "hi");
        assert_eq!(registry.active().await, None);
    }

    #[tokio::test]
    async fn persist_wrapper_blob_keeps_active_chat() {
        let backend = Arc::new(MemoryBackend::new());
        let wrapped = r#"{"state":{"chats":[{"id":"1712345678901","title":"New Chat",
            "providerId":"groq","modelId":"llama-3.1-8b-instant","messages":[],
            "createdAt":1712345678901,"updatedAt":1712345678901}],
            "activeChat":"1712345678901"},"version":0}"#;
        backend.set(CHATS_NAMESPACE, wrapped.to_string()).await.unwrap();
        let registry = ChatRegistry::load(backend, 30).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.active().await.as_deref(), Some("1712345678901"));
    }

    #[tokio::test]
    async fn write_failures_keep_memory_state() {
        let (backend, registry) = registry().await;
        backend.set_fail_writes(true);
        let id = registry.create_chat("openai", "gpt-4o").await;
        assert!(registry.add_message(&id, Message::user("still here")).await);
        assert_eq!(registry.get_chat(&id).await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let (_, registry) = registry().await;
        let mut rx = registry.subscribe();
        let id = registry.create_chat("openai", "gpt-4o").await;
        assert_eq!(rx.recv().await.unwrap(), RegistryEvent::ChatCreated(id.clone()));
        assert_eq!(
            rx.recv().await.unwrap(),
            RegistryEvent::ActiveChanged(Some(id.clone()))
        );
    }
}
