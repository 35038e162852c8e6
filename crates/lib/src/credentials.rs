//! Per-provider API keys, persisted in their own collection.
//!
//! Keys are stored in plain text as a JSON map of provider id to key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::store::{legacy_state, Collection, StorageBackend, Versioned, API_KEYS_NAMESPACE};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKeys(pub BTreeMap<String, String>);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyKey {
    provider_id: String,
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyKeyList {
    api_keys: Vec<LegacyKey>,
}

impl Versioned for ApiKeys {
    /// Older blobs are a bare map, a list of `{providerId, key}` records, or the persist
    /// wrapper around `{"apiKeys": [...]}`.
    fn from_legacy(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let value = legacy_state(value);
        let list: Vec<LegacyKey> = if value.is_array() {
            serde_json::from_value(value)?
        } else if value.get("apiKeys").is_some() {
            serde_json::from_value::<LegacyKeyList>(value)?.api_keys
        } else {
            return serde_json::from_value(value);
        };
        Ok(ApiKeys(
            list.into_iter().map(|k| (k.provider_id, k.key)).collect(),
        ))
    }
}

struct KeyState {
    keys: BTreeMap<String, String>,
    revision: u64,
}

pub struct CredentialStore {
    state: RwLock<KeyState>,
    collection: Collection<ApiKeys>,
}

impl CredentialStore {
    pub async fn load(backend: Arc<dyn StorageBackend>) -> Self {
        let collection = Collection::new(backend, API_KEYS_NAMESPACE);
        let ApiKeys(mut keys) = collection.load().await;
        keys.retain(|_, v| !v.trim().is_empty());
        log::debug!("credentials: loaded keys for {} providers", keys.len());
        Self {
            state: RwLock::new(KeyState { keys, revision: 0 }),
            collection,
        }
    }

    pub async fn get(&self, provider_id: &str) -> Option<String> {
        self.state.read().await.keys.get(provider_id).cloned()
    }

    pub async fn has_key(&self, provider_id: &str) -> bool {
        self.state.read().await.keys.contains_key(provider_id)
    }

    /// Upsert the key for `provider_id`. A blank key deletes the entry instead.
    pub async fn set(&self, provider_id: &str, key: &str) {
        let key = key.trim();
        if key.is_empty() {
            self.delete(provider_id).await;
            return;
        }
        let (revision, snapshot) = {
            let mut g = self.state.write().await;
            g.keys.insert(provider_id.to_string(), key.to_string());
            g.revision += 1;
            (g.revision, ApiKeys(g.keys.clone()))
        };
        log::info!("credentials: stored key for {}", provider_id);
        self.collection.save_best_effort(revision, &snapshot).await;
    }

    /// Remove the key for `provider_id`. Returns whether one was present.
    pub async fn delete(&self, provider_id: &str) -> bool {
        let (revision, snapshot) = {
            let mut g = self.state.write().await;
            if g.keys.remove(provider_id).is_none() {
                return false;
            }
            g.revision += 1;
            (g.revision, ApiKeys(g.keys.clone()))
        };
        log::info!("credentials: removed key for {}", provider_id);
        self.collection.save_best_effort(revision, &snapshot).await;
        true
    }

    /// Provider ids that currently have a key, sorted.
    pub async fn providers_with_keys(&self) -> Vec<String> {
        self.state.read().await.keys.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    #[tokio::test]
    async fn set_get_and_reload() {
        let backend = Arc::new(MemoryBackend::new());
        let store = CredentialStore::load(backend.clone()).await;
        store.set("openai", "  sk-test  ").await;
        assert_eq!(store.get("openai").await.as_deref(), Some("sk-test"));

        let reloaded = CredentialStore::load(backend).await;
        assert_eq!(reloaded.get("openai").await.as_deref(), Some("sk-test"));
        assert_eq!(reloaded.providers_with_keys().await, vec!["openai".to_string()]);
    }

    #[tokio::test]
    async fn blank_key_deletes() {
        let backend = Arc::new(MemoryBackend::new());
        let store = CredentialStore::load(backend.clone()).await;
        store.set("groq", "gsk-1").await;
        store.set("groq", "   ").await;
        assert_eq!(store.get("groq").await, None);

        let reloaded = CredentialStore::load(backend).await;
        assert!(!reloaded.has_key("groq").await);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = CredentialStore::load(Arc::new(MemoryBackend::new())).await;
        assert!(!store.delete("openai").await);
        store.set("openai", "sk").await;
        assert!(store.delete("openai").await);
    }

    #[tokio::test]
    async fn legacy_map_is_read() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .set(API_KEYS_NAMESPACE, r#"{"anthropic":"sk-ant","xai":""}"#.to_string())
            .await
            .unwrap();
        let store = CredentialStore::load(backend).await;
        assert_eq!(store.get("anthropic").await.as_deref(), Some("sk-ant"));
        assert!(!store.has_key("xai").await);
    }

    #[tokio::test]
    async fn persist_wrapper_key_list_is_read() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .set(
                API_KEYS_NAMESPACE,
                r#"{"state":{"apiKeys":[{"providerId":"openai","key":"sk-1"},{"providerId":"groq","key":"gsk"}]},"version":0}"#
                    .to_string(),
            )
            .await
            .unwrap();
        let store = CredentialStore::load(backend).await;
        assert_eq!(
            store.providers_with_keys().await,
            vec!["groq".to_string(), "openai".to_string()]
        );
    }
}
