//! Local inference adapter: per-model download/load lifecycle over a [`LocalEngine`].
//!
//! A model moves NotDownloaded → Downloading(percent) → Downloaded → Loaded. At most one model
//! is loaded at a time; loading another unloads the current one first.
//!
//! Every open chat stream holds a shared lease on the loaded model. Swapping that model out
//! waits for the leases to be released, and deleting it is refused while any is held.

use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use crate::catalog::{self, ModelInfo};
use crate::llm::{same_model, CompletionMessage, DeltaStream, LlmError, LocalEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    NotDownloaded,
    /// Percent complete, 0 to 100.
    Downloading(u8),
    Downloaded,
    Loaded,
}

impl ModelState {
    pub fn is_available(&self) -> bool {
        matches!(self, ModelState::Downloaded | ModelState::Loaded)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocalModelError {
    #[error("local inference is not supported on this device")]
    Unsupported,
    #[error("model {0} is not downloaded")]
    NotDownloaded(String),
    #[error("model {0} is already downloading")]
    DownloadInProgress(String),
    #[error("no local model loaded")]
    NoModelLoaded,
    #[error("model {0} is answering a chat")]
    InUse(String),
    #[error("local engine failed: {0}")]
    Engine(#[from] LlmError),
}

/// A catalog model with its current lifecycle state.
#[derive(Debug, Clone)]
pub struct ModelStatus {
    pub info: &'static ModelInfo,
    pub state: ModelState,
}

#[derive(Default)]
struct Slots {
    states: HashMap<String, ModelState>,
    loaded: Option<String>,
}

pub struct LocalModelManager {
    engine: Arc<dyn LocalEngine>,
    slots: Mutex<Slots>,
    /// Serializes load/unload/delete so engine calls never interleave.
    lifecycle: tokio::sync::Mutex<()>,
    /// Read-held by open chat streams; write-held while the loaded model is swapped out.
    leases: Arc<RwLock<()>>,
}

/// A delta stream that keeps its model leased until it is dropped.
struct Leased {
    inner: DeltaStream,
    _lease: OwnedRwLockReadGuard<()>,
}

impl Stream for Leased {
    type Item = Result<String, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Puts a model back to NotDownloaded if its download future is dropped or fails.
struct DownloadGuard<'a> {
    slots: &'a Mutex<Slots>,
    model_id: &'a str,
    armed: bool,
}

impl Drop for DownloadGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.slots)
                .states
                .insert(self.model_id.to_string(), ModelState::NotDownloaded);
        }
    }
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

impl LocalModelManager {
    pub fn new(engine: Arc<dyn LocalEngine>) -> Self {
        Self {
            engine,
            slots: Mutex::new(Slots::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            leases: Arc::new(RwLock::new(())),
        }
    }

    fn set_state(&self, model_id: &str, state: ModelState) {
        lock(&self.slots)
            .states
            .insert(model_id.to_string(), state);
    }

    /// Whether the engine is usable here. Never errors.
    pub async fn is_supported(&self) -> bool {
        match self.engine.probe_support().await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("local: engine probe failed: {}", e);
                false
            }
        }
    }

    /// Reconcile states with the engine cache and return the downloaded model ids.
    pub async fn refresh(&self) -> Result<Vec<String>, LocalModelError> {
        let cached = self.engine.cached_models().await?;
        let mut g = lock(&self.slots);
        let mut ids: Vec<String> = catalog::local_models()
            .iter()
            .map(|m| m.id.to_string())
            .collect();
        for id in g.states.keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        let mut downloaded = Vec::new();
        for id in ids {
            let in_cache = cached.iter().any(|c| same_model(c, &id));
            let state = g.states.get(&id).copied().unwrap_or(ModelState::NotDownloaded);
            let next = match state {
                ModelState::Downloading(_) => state,
                ModelState::Loaded if in_cache => state,
                _ if in_cache => ModelState::Downloaded,
                _ => ModelState::NotDownloaded,
            };
            if next == ModelState::NotDownloaded && g.loaded.as_deref() == Some(id.as_str()) {
                g.loaded = None;
            }
            if next.is_available() {
                downloaded.push(id.clone());
            }
            g.states.insert(id, next);
        }
        Ok(downloaded)
    }

    /// Download `model_id`, reporting whole-percent progress that never goes backwards.
    ///
    /// A model that is already available reports 100 and returns. On failure the model goes
    /// back to NotDownloaded so the download can be retried.
    pub async fn download(
        &self,
        model_id: &str,
        mut on_progress: impl FnMut(u8) + Send,
    ) -> Result<(), LocalModelError> {
        {
            let mut g = lock(&self.slots);
            let current = g.states.get(model_id).copied();
            match current {
                Some(ModelState::Downloading(_)) => {
                    return Err(LocalModelError::DownloadInProgress(model_id.to_string()))
                }
                Some(s) if s.is_available() => {
                    drop(g);
                    on_progress(100);
                    return Ok(());
                }
                _ => {}
            }
            g.states
                .insert(model_id.to_string(), ModelState::Downloading(0));
        }
        let mut guard = DownloadGuard {
            slots: &self.slots,
            model_id,
            armed: true,
        };
        log::info!("local: downloading {}", model_id);

        let mut last = 0u8;
        let slots = &self.slots;
        let mut report = |percent: f64| {
            let pct = percent.clamp(0.0, 100.0).round() as u8;
            if pct <= last {
                return;
            }
            last = pct;
            lock(slots)
                .states
                .insert(model_id.to_string(), ModelState::Downloading(pct));
            on_progress(pct);
        };
        let result = self.engine.download_model(model_id, &mut report).await;
        if let Err(e) = result {
            log::warn!("local: download of {} failed: {}", model_id, e);
            return Err(e.into());
        }
        report(100.0);
        guard.armed = false;
        self.set_state(model_id, ModelState::Downloaded);
        log::info!("local: downloaded {}", model_id);
        Ok(())
    }

    /// Make `model_id` the loaded model. No-op when it already is.
    ///
    /// When another model is loaded and still streaming, waits for those streams to finish.
    pub async fn load(&self, model_id: &str) -> Result<(), LocalModelError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.load_locked(model_id).await
    }

    async fn load_locked(&self, model_id: &str) -> Result<(), LocalModelError> {
        let (state, current) = {
            let g = lock(&self.slots);
            (g.states.get(model_id).copied(), g.loaded.clone())
        };
        if current.as_deref() == Some(model_id) {
            return Ok(());
        }
        match state {
            Some(ModelState::Downloading(_)) => {
                return Err(LocalModelError::NotDownloaded(model_id.to_string()))
            }
            Some(ModelState::Downloaded) | Some(ModelState::Loaded) => {}
            _ => {
                if !self.engine.is_cached(model_id).await? {
                    return Err(LocalModelError::NotDownloaded(model_id.to_string()));
                }
            }
        }
        if let Some(previous) = current {
            log::debug!("local: waiting for chats on {} before loading {}", previous, model_id);
            let _exclusive = self.leases.write().await;
            self.unload_locked(&previous).await;
        }
        self.engine.load_model(model_id).await?;
        let mut g = lock(&self.slots);
        g.states.insert(model_id.to_string(), ModelState::Loaded);
        g.loaded = Some(model_id.to_string());
        log::info!("local: loaded {}", model_id);
        Ok(())
    }

    /// Unload `model_id` from the engine; failures are logged and the slot is freed anyway.
    async fn unload_locked(&self, model_id: &str) {
        if let Err(e) = self.engine.unload_model(model_id).await {
            log::warn!("local: unloading {} failed: {}", model_id, e);
        }
        let mut g = lock(&self.slots);
        if g.loaded.as_deref() == Some(model_id) {
            g.loaded = None;
        }
        g.states
            .insert(model_id.to_string(), ModelState::Downloaded);
    }

    /// Unload whatever model is loaded.
    pub async fn unload(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let current = lock(&self.slots).loaded.clone();
        if let Some(model_id) = current {
            let _exclusive = self.leases.write().await;
            self.unload_locked(&model_id).await;
        }
    }

    /// Remove `model_id` from the cache, unloading it first if needed. Refused while a chat is
    /// streaming from it.
    pub async fn delete(&self, model_id: &str) -> Result<(), LocalModelError> {
        let _lifecycle = self.lifecycle.lock().await;
        let (state, current) = {
            let g = lock(&self.slots);
            (g.states.get(model_id).copied(), g.loaded.clone())
        };
        if let Some(ModelState::Downloading(_)) = state {
            return Err(LocalModelError::DownloadInProgress(model_id.to_string()));
        }
        if current.as_deref() == Some(model_id) {
            let Ok(_exclusive) = self.leases.try_write() else {
                return Err(LocalModelError::InUse(model_id.to_string()));
            };
            self.unload_locked(model_id).await;
        }
        self.engine.delete_model(model_id).await?;
        self.set_state(model_id, ModelState::NotDownloaded);
        log::info!("local: deleted {}", model_id);
        Ok(())
    }

    /// Check that `model_id` can be loaded right now without downloading anything.
    pub async fn ensure_ready(&self, model_id: &str) -> Result<(), LocalModelError> {
        if !self.is_supported().await {
            return Err(LocalModelError::Unsupported);
        }
        if self.status(model_id).is_available() {
            return Ok(());
        }
        if matches!(self.status(model_id), ModelState::Downloading(_)) {
            return Err(LocalModelError::NotDownloaded(model_id.to_string()));
        }
        if self.engine.is_cached(model_id).await? {
            self.set_state(model_id, ModelState::Downloaded);
            Ok(())
        } else {
            Err(LocalModelError::NotDownloaded(model_id.to_string()))
        }
    }

    /// Stream a reply from `model_id`, which must be the loaded model.
    pub async fn chat(
        &self,
        model_id: &str,
        messages: Vec<CompletionMessage>,
    ) -> Result<DeltaStream, LocalModelError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.loaded_model().as_deref() != Some(model_id) {
            return Err(LocalModelError::NoModelLoaded);
        }
        self.stream_leased(model_id, messages).await
    }

    /// Load `model_id` if needed and stream a reply from it, with no chance for another caller
    /// to swap the model in between.
    pub async fn load_and_chat(
        &self,
        model_id: &str,
        messages: Vec<CompletionMessage>,
    ) -> Result<DeltaStream, LocalModelError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.load_locked(model_id).await?;
        self.stream_leased(model_id, messages).await
    }

    /// Caller holds `lifecycle`, so no writer is waiting and the read lease is granted at once.
    async fn stream_leased(
        &self,
        model_id: &str,
        messages: Vec<CompletionMessage>,
    ) -> Result<DeltaStream, LocalModelError> {
        let lease = self.leases.clone().read_owned().await;
        let inner = self.engine.stream_chat(model_id, messages).await?;
        Ok(Box::pin(Leased {
            inner,
            _lease: lease,
        }))
    }

    pub fn loaded_model(&self) -> Option<String> {
        lock(&self.slots).loaded.clone()
    }

    pub fn status(&self, model_id: &str) -> ModelState {
        lock(&self.slots)
            .states
            .get(model_id)
            .copied()
            .unwrap_or(ModelState::NotDownloaded)
    }

    pub fn progress(&self, model_id: &str) -> Option<u8> {
        match self.status(model_id) {
            ModelState::Downloading(p) => Some(p),
            _ => None,
        }
    }

    /// Every catalog local model with its state, in catalog order.
    pub fn statuses(&self) -> Vec<ModelStatus> {
        catalog::local_models()
            .iter()
            .map(|info| ModelStatus {
                info,
                state: self.status(info.id),
            })
            .collect()
    }
}
