//! UI preference flags.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::store::{legacy_state, Collection, StorageBackend, Versioned, PREFERENCES_NAMESPACE};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceValues {
    #[serde(default, alias = "isDarkMode")]
    pub dark_mode: bool,
}

impl Versioned for PreferenceValues {
    fn from_legacy(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(legacy_state(value))
    }
}

pub struct Preferences {
    state: Mutex<(PreferenceValues, u64)>,
    collection: Collection<PreferenceValues>,
}

impl Preferences {
    pub async fn load(backend: Arc<dyn StorageBackend>) -> Self {
        let collection = Collection::new(backend, PREFERENCES_NAMESPACE);
        let values = collection.load().await;
        Self {
            state: Mutex::new((values, 0)),
            collection,
        }
    }

    pub async fn values(&self) -> PreferenceValues {
        self.state.lock().await.0.clone()
    }

    pub async fn dark_mode(&self) -> bool {
        self.state.lock().await.0.dark_mode
    }

    pub async fn set_dark_mode(&self, enabled: bool) {
        self.update(|v| v.dark_mode = enabled).await;
    }

    /// Flip dark mode and return the new value.
    pub async fn toggle_dark_mode(&self) -> bool {
        self.update(|v| v.dark_mode = !v.dark_mode).await.dark_mode
    }

    async fn update(&self, f: impl FnOnce(&mut PreferenceValues)) -> PreferenceValues {
        let (revision, values) = {
            let mut g = self.state.lock().await;
            f(&mut g.0);
            g.1 += 1;
            (g.1, g.0.clone())
        };
        self.collection.save_best_effort(revision, &values).await;
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    #[tokio::test]
    async fn dark_mode_persists() {
        let backend = Arc::new(MemoryBackend::new());
        let prefs = Preferences::load(backend.clone()).await;
        assert!(!prefs.dark_mode().await);
        assert!(prefs.toggle_dark_mode().await);

        let reloaded = Preferences::load(backend).await;
        assert!(reloaded.dark_mode().await);
        reloaded.set_dark_mode(false).await;
        assert!(!reloaded.dark_mode().await);
    }

    #[tokio::test]
    async fn legacy_theme_flag_is_read() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .set(
                PREFERENCES_NAMESPACE,
                r#"{"state":{"isDarkMode":true},"version":0}"#.to_string(),
            )
            .await
            .unwrap();
        assert!(Preferences::load(backend).await.dark_mode().await);
    }
}
