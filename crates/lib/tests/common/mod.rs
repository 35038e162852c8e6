//! Shared fakes for the integration tests: scripted remote/local completion backends and
//! context builders over an in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use chatfuse::app::{AppContext, AppParts};
use chatfuse::connectivity::Connectivity;
use chatfuse::llm::{CompletionMessage, DeltaStream, LlmError, LocalEngine, RemoteCompletion};
use chatfuse::model::Role;
use chatfuse::store::{MemoryBackend, StorageBackend};
use futures_util::stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One recorded upstream call.
#[derive(Debug, Clone)]
pub struct RemoteCall {
    pub provider_id: String,
    pub model_id: String,
    pub api_key: String,
    pub messages: Vec<CompletionMessage>,
}

/// Remote provider whose replies are scripted per prompt (the last user message).
#[derive(Default)]
pub struct FakeRemote {
    replies: Mutex<HashMap<String, DeltaStream>>,
    calls: Mutex<Vec<RemoteCall>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reply to `prompt` with the given items, all available immediately.
    pub fn script(&self, prompt: &str, items: Vec<Result<String, LlmError>>) {
        self.replies
            .lock()
            .unwrap()
            .insert(prompt.to_string(), Box::pin(stream::iter(items)));
    }

    /// Reply to `prompt` with items pushed through the returned sender; dropping it ends the stream.
    pub fn gate(&self, prompt: &str) -> mpsc::UnboundedSender<Result<String, LlmError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.replies
            .lock()
            .unwrap()
            .insert(prompt.to_string(), channel_stream(rx));
        tx
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn channel_stream(rx: mpsc::UnboundedReceiver<Result<String, LlmError>>) -> DeltaStream {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

fn last_user_prompt(messages: &[CompletionMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

#[async_trait]
impl RemoteCompletion for FakeRemote {
    async fn stream_completion(
        &self,
        provider_id: &str,
        model_id: &str,
        api_key: &str,
        messages: Vec<CompletionMessage>,
    ) -> Result<DeltaStream, LlmError> {
        let prompt = last_user_prompt(&messages);
        self.calls.lock().unwrap().push(RemoteCall {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            api_key: api_key.to_string(),
            messages,
        });
        self.replies
            .lock()
            .unwrap()
            .remove(&prompt)
            .ok_or_else(|| LlmError::Upstream(format!("no scripted reply for {:?}", prompt)))
    }
}

/// Local engine with an in-memory cache. Chats get fixed deltas unless a reply was scripted
/// for the model.
pub struct FakeEngine {
    pub supported: bool,
    pub cached: Mutex<Vec<String>>,
    pub reply: Vec<String>,
    pub loads: Mutex<Vec<String>>,
    log: Mutex<Vec<String>>,
    replies: Mutex<HashMap<String, DeltaStream>>,
    load_error: Mutex<Option<String>>,
}

impl FakeEngine {
    fn build(supported: bool, models: &[&str], reply: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            supported,
            cached: Mutex::new(models.iter().map(|m| m.to_string()).collect()),
            reply,
            loads: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            load_error: Mutex::new(None),
        })
    }

    pub fn with_cached(models: &[&str]) -> Arc<Self> {
        Self::build(
            true,
            models,
            vec!["local ".to_string(), "answer".to_string()],
        )
    }

    pub fn unsupported() -> Arc<Self> {
        Self::build(false, &[], Vec::new())
    }

    /// Next chat on `model_id` yields these items.
    pub fn script(&self, model_id: &str, items: Vec<Result<String, LlmError>>) {
        self.replies
            .lock()
            .unwrap()
            .insert(model_id.to_string(), Box::pin(stream::iter(items)));
    }

    /// Next chat on `model_id` yields what is pushed through the sender until it is dropped.
    pub fn gate(&self, model_id: &str) -> mpsc::UnboundedSender<Result<String, LlmError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.replies
            .lock()
            .unwrap()
            .insert(model_id.to_string(), channel_stream(rx));
        tx
    }

    /// Every later load fails with `message`.
    pub fn fail_loads(&self, message: &str) {
        *self.load_error.lock().unwrap() = Some(message.to_string());
    }

    /// Engine calls in order: `load <id>`, `unload <id>`, `stream <id>`.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl LocalEngine for FakeEngine {
    async fn probe_support(&self) -> Result<(), LlmError> {
        if self.supported {
            Ok(())
        } else {
            Err(LlmError::Upstream("no engine".to_string()))
        }
    }

    async fn cached_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(self.cached.lock().unwrap().clone())
    }

    async fn download_model(
        &self,
        model_id: &str,
        on_progress: &mut (dyn FnMut(f64) + Send),
    ) -> Result<(), LlmError> {
        on_progress(50.0);
        self.cached.lock().unwrap().push(model_id.to_string());
        Ok(())
    }

    async fn load_model(&self, model_id: &str) -> Result<(), LlmError> {
        if let Some(message) = self.load_error.lock().unwrap().clone() {
            return Err(LlmError::Upstream(message));
        }
        self.record(format!("load {}", model_id));
        self.loads.lock().unwrap().push(model_id.to_string());
        Ok(())
    }

    async fn unload_model(&self, model_id: &str) -> Result<(), LlmError> {
        self.record(format!("unload {}", model_id));
        Ok(())
    }

    async fn delete_model(&self, model_id: &str) -> Result<(), LlmError> {
        self.cached.lock().unwrap().retain(|m| m != model_id);
        Ok(())
    }

    async fn stream_chat(
        &self,
        model_id: &str,
        _messages: Vec<CompletionMessage>,
    ) -> Result<DeltaStream, LlmError> {
        self.record(format!("stream {}", model_id));
        if let Some(reply) = self.replies.lock().unwrap().remove(model_id) {
            return Ok(reply);
        }
        let items: Vec<Result<String, LlmError>> = self.reply.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

pub async fn context_with(
    backend: Arc<dyn StorageBackend>,
    remote: Arc<FakeRemote>,
    engine: Arc<FakeEngine>,
    system_prompt: Option<&str>,
) -> AppContext {
    AppContext::with_parts(AppParts {
        backend,
        remote,
        engine,
        connectivity: Connectivity::default(),
        title_max_chars: 30,
        system_prompt: system_prompt.map(str::to_string),
    })
    .await
}

/// Context over a fresh in-memory store with no local models cached.
pub async fn memory_context(remote: Arc<FakeRemote>) -> AppContext {
    context_with(
        Arc::new(MemoryBackend::new()),
        remote,
        FakeEngine::with_cached(&[]),
        None,
    )
    .await
}

/// Poll `cond` until it holds, yielding to spawned tasks in between.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub fn temp_dir(label: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("chatfuse-{}-{}", label, uuid::Uuid::new_v4()))
}
