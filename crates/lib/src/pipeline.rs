//! Send pipeline: turns one user input into a committed user message and a streamed,
//! committed assistant reply.
//!
//! Each chat runs a single-flight state machine (Idle → Sending → Streaming → Idle). Partial
//! replies live only in the per-chat accumulator and are never written to the registry; a
//! failed or cancelled stream leaves nothing behind but the user message.

use futures_util::future::{AbortHandle, AbortRegistration, Abortable};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::catalog::{self, ProviderBinding};
use crate::connectivity::Connectivity;
use crate::credentials::CredentialStore;
use crate::llm::{CompletionMessage, DeltaStream, LlmError, RemoteCompletion};
use crate::local::{LocalModelError, LocalModelManager};
use crate::model::{ChatId, Message, Role, MAX_INPUT_CHARS};
use crate::session::ChatRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Sending,
    Streaming,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged { chat_id: ChatId, state: SendState },
    Delta { chat_id: ChatId, delta: String },
    Completed { chat_id: ChatId, message: Message },
    Warning { chat_id: ChatId, message: String },
    Failed { chat_id: ChatId, error: String },
}

#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// The assistant reply was streamed and committed.
    Completed(Message),
    /// No key for the chat's provider; a notice was committed as the assistant reply.
    MissingCredential(Message),
}

impl SendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            SendOutcome::Completed(m) | SendOutcome::MissingCredential(m) => m,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("message is empty")]
    EmptyInput,
    #[error("message is {len} characters, the limit is {max}")]
    InputTooLong { len: usize, max: usize },
    #[error("chat {0} is already waiting for a reply")]
    AlreadyInFlight(ChatId),
    #[error("chat {0} not found")]
    ChatNotFound(ChatId),
    #[error("you are offline; connect to the internet to use online models")]
    Offline,
    #[error("local model not ready: {0}")]
    LocalModelNotReady(#[source] LocalModelError),
    #[error("provider request failed: {0}")]
    Provider(#[from] LlmError),
    #[error("local model failed: {0}")]
    Local(#[source] LocalModelError),
    #[error("cancelled")]
    Cancelled,
}

/// Assistant notice committed when a remote chat has no API key.
pub fn missing_credential_notice(provider_id: &str) -> String {
    format!(
        "Please add an API key for {} in Settings to use this model.",
        catalog::provider_name(provider_id)
    )
}

struct Flight {
    state: SendState,
    text: watch::Sender<String>,
    /// Cleared once the send has passed its commit point.
    abort: Option<AbortHandle>,
    cancelled: bool,
}

enum Route {
    Remote {
        provider_id: String,
        model_id: String,
        api_key: String,
    },
    Local {
        model_id: String,
    },
}

pub struct SendPipeline {
    registry: Arc<ChatRegistry>,
    credentials: Arc<CredentialStore>,
    connectivity: Connectivity,
    local: Arc<LocalModelManager>,
    remote: Arc<dyn RemoteCompletion>,
    system_prompt: Option<String>,
    flights: Mutex<HashMap<ChatId, Flight>>,
    events: broadcast::Sender<PipelineEvent>,
}

/// Holds a chat's flight slot; dropping it returns the chat to Idle.
struct FlightGuard<'a> {
    pipeline: &'a SendPipeline,
    chat_id: ChatId,
}

impl FlightGuard<'_> {
    fn set_state(&self, state: SendState) {
        if let Some(flight) = self.pipeline.flights().get_mut(&self.chat_id) {
            flight.state = state;
        }
        self.pipeline.emit(PipelineEvent::StateChanged {
            chat_id: self.chat_id.clone(),
            state,
        });
    }

    /// From here on the send commits. Fails if a cancel already landed; after it succeeds,
    /// cancel requests are refused.
    fn commit_point(&self) -> Result<(), SendError> {
        let mut flights = self.pipeline.flights();
        match flights.get_mut(&self.chat_id) {
            Some(flight) if flight.cancelled => Err(SendError::Cancelled),
            Some(flight) => {
                flight.abort = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn publish(&self, accumulated: &str, delta: String) {
        if let Some(flight) = self.pipeline.flights().get(&self.chat_id) {
            flight.text.send_replace(accumulated.to_string());
        }
        self.pipeline.emit(PipelineEvent::Delta {
            chat_id: self.chat_id.clone(),
            delta,
        });
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.pipeline.flights().remove(&self.chat_id);
        self.pipeline.emit(PipelineEvent::StateChanged {
            chat_id: self.chat_id.clone(),
            state: SendState::Idle,
        });
    }
}

impl SendPipeline {
    pub fn new(
        registry: Arc<ChatRegistry>,
        credentials: Arc<CredentialStore>,
        connectivity: Connectivity,
        local: Arc<LocalModelManager>,
        remote: Arc<dyn RemoteCompletion>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry,
            credentials,
            connectivity,
            local,
            remote,
            system_prompt: None,
            flights: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// System message prepended to every upstream history. Blank prompts are ignored.
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    fn flights(&self) -> MutexGuard<'_, HashMap<ChatId, Flight>> {
        self.flights.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn state(&self, chat_id: &str) -> SendState {
        self.flights()
            .get(chat_id)
            .map(|f| f.state)
            .unwrap_or(SendState::Idle)
    }

    /// Reply text received so far for an in-flight chat.
    pub fn streaming_text(&self, chat_id: &str) -> Option<String> {
        self.flights().get(chat_id).map(|f| f.text.borrow().clone())
    }

    /// Follow the accumulator of an in-flight chat as it grows.
    pub fn watch_streaming(&self, chat_id: &str) -> Option<watch::Receiver<String>> {
        self.flights().get(chat_id).map(|f| f.text.subscribe())
    }

    /// Abort the in-flight send of `chat_id`. Returns false when the chat is idle or its
    /// reply is already being committed.
    pub fn cancel(&self, chat_id: &str) -> bool {
        let mut flights = self.flights();
        match flights.get_mut(chat_id) {
            Some(Flight {
                abort: Some(abort),
                cancelled,
                ..
            }) => {
                abort.abort();
                *cancelled = true;
                log::info!("pipeline: cancel requested for {}", chat_id);
                true
            }
            _ => false,
        }
    }

    /// Run [`send`](Self::send) on its own task so it outlives the caller's view of the chat.
    pub fn spawn_send(
        self: &Arc<Self>,
        chat_id: impl Into<ChatId>,
        text: impl Into<String>,
    ) -> JoinHandle<Result<SendOutcome, SendError>> {
        let this = Arc::clone(self);
        let chat_id = chat_id.into();
        let text = text.into();
        tokio::spawn(async move { this.send(&chat_id, &text).await })
    }

    /// Send `text` to the chat's provider and commit the reply.
    pub async fn send(&self, chat_id: &str, text: &str) -> Result<SendOutcome, SendError> {
        let result = self.send_inner(chat_id, text).await;
        if let Err(e) = &result {
            match e {
                SendError::Offline => {
                    log::warn!("pipeline: {} not sent, offline", chat_id);
                    self.emit(PipelineEvent::Warning {
                        chat_id: chat_id.to_string(),
                        message: e.to_string(),
                    });
                }
                SendError::Cancelled => {
                    log::info!("pipeline: send on {} cancelled", chat_id);
                }
                SendError::EmptyInput
                | SendError::InputTooLong { .. }
                | SendError::AlreadyInFlight(_) => {
                    log::debug!("pipeline: rejected input for {}: {}", chat_id, e);
                }
                _ => {
                    log::error!("pipeline: send on {} failed: {}", chat_id, e);
                    self.emit(PipelineEvent::Failed {
                        chat_id: chat_id.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        result
    }

    fn begin(&self, chat_id: &str) -> Result<(FlightGuard<'_>, AbortRegistration), SendError> {
        let (abort, registration) = AbortHandle::new_pair();
        {
            let mut flights = self.flights();
            if flights.contains_key(chat_id) {
                return Err(SendError::AlreadyInFlight(chat_id.to_string()));
            }
            let (text, _) = watch::channel(String::new());
            flights.insert(
                chat_id.to_string(),
                Flight {
                    state: SendState::Sending,
                    text,
                    abort: Some(abort),
                    cancelled: false,
                },
            );
        }
        self.emit(PipelineEvent::StateChanged {
            chat_id: chat_id.to_string(),
            state: SendState::Sending,
        });
        Ok((
            FlightGuard {
                pipeline: self,
                chat_id: chat_id.to_string(),
            },
            registration,
        ))
    }

    async fn send_inner(&self, chat_id: &str, text: &str) -> Result<SendOutcome, SendError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendError::EmptyInput);
        }
        let len = text.chars().count();
        if len > MAX_INPUT_CHARS {
            return Err(SendError::InputTooLong {
                len,
                max: MAX_INPUT_CHARS,
            });
        }
        let (flight, registration) = self.begin(chat_id)?;

        let chat = self
            .registry
            .get_chat(chat_id)
            .await
            .ok_or_else(|| SendError::ChatNotFound(chat_id.to_string()))?;

        let route = match ProviderBinding::resolve(&chat.provider_id, &chat.model_id) {
            ProviderBinding::Remote {
                provider_id,
                model_id,
            } => {
                let Some(api_key) = self.credentials.get(&provider_id).await else {
                    flight.commit_point()?;
                    return self.commit_missing_credential(chat_id, &provider_id, text).await;
                };
                if !self.connectivity.is_online() {
                    return Err(SendError::Offline);
                }
                Route::Remote {
                    provider_id,
                    model_id,
                    api_key,
                }
            }
            ProviderBinding::Local { model_id } => {
                self.local
                    .ensure_ready(&model_id)
                    .await
                    .map_err(SendError::LocalModelNotReady)?;
                Route::Local { model_id }
            }
        };

        self.commit(chat_id, Message::user(text)).await?;

        let reply = Abortable::new(self.stream_reply(chat_id, &route, &flight), registration).await;
        let reply = reply.map_err(|_| SendError::Cancelled)??;
        flight.commit_point()?;

        self.commit(chat_id, reply.clone()).await?;
        log::debug!("pipeline: committed reply {} to {}", reply.id, chat_id);
        self.emit(PipelineEvent::Completed {
            chat_id: chat_id.to_string(),
            message: reply.clone(),
        });
        Ok(SendOutcome::Completed(reply))
    }

    async fn commit(&self, chat_id: &str, message: Message) -> Result<(), SendError> {
        if self.registry.add_message(chat_id, message).await {
            Ok(())
        } else {
            Err(SendError::ChatNotFound(chat_id.to_string()))
        }
    }

    async fn commit_missing_credential(
        &self,
        chat_id: &str,
        provider_id: &str,
        text: &str,
    ) -> Result<SendOutcome, SendError> {
        log::info!("pipeline: no API key for {}", provider_id);
        self.commit(chat_id, Message::user(text)).await?;
        let notice = Message::assistant(missing_credential_notice(provider_id));
        self.commit(chat_id, notice.clone()).await?;
        self.emit(PipelineEvent::Warning {
            chat_id: chat_id.to_string(),
            message: notice.content.clone(),
        });
        Ok(SendOutcome::MissingCredential(notice))
    }

    /// Ordered history of the chat as sent upstream.
    async fn history(&self, chat_id: &str) -> Result<Vec<CompletionMessage>, SendError> {
        let chat = self
            .registry
            .get_chat(chat_id)
            .await
            .ok_or_else(|| SendError::ChatNotFound(chat_id.to_string()))?;
        let mut history = Vec::with_capacity(chat.messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            history.push(CompletionMessage::new(Role::System, prompt.clone()));
        }
        history.extend(chat.messages.iter().map(CompletionMessage::from));
        Ok(history)
    }

    /// Open the upstream stream and accumulate it into an uncommitted assistant message.
    async fn stream_reply(
        &self,
        chat_id: &str,
        route: &Route,
        flight: &FlightGuard<'_>,
    ) -> Result<Message, SendError> {
        let history = self.history(chat_id).await?;
        let mut stream: DeltaStream = match route {
            Route::Remote {
                provider_id,
                model_id,
                api_key,
            } => {
                self.remote
                    .stream_completion(provider_id, model_id, api_key, history)
                    .await?
            }
            Route::Local { model_id } => self
                .local
                .load_and_chat(model_id, history)
                .await
                .map_err(SendError::Local)?,
        };
        flight.set_state(SendState::Streaming);

        let mut accumulated = String::new();
        while let Some(item) = stream.next().await {
            let delta = item.map_err(|e| match route {
                Route::Remote { .. } => SendError::Provider(e),
                Route::Local { .. } => SendError::Local(LocalModelError::Engine(e)),
            })?;
            if delta.is_empty() {
                continue;
            }
            accumulated.push_str(&delta);
            flight.publish(&accumulated, delta);
        }
        Ok(Message::assistant(accumulated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{OllamaEngine, OpenAiCompatibleClient};
    use crate::store::{MemoryBackend, StorageBackend};

    async fn pipeline() -> SendPipeline {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let registry = Arc::new(ChatRegistry::load(backend.clone(), 30).await);
        let credentials = Arc::new(CredentialStore::load(backend).await);
        let local = Arc::new(LocalModelManager::new(Arc::new(OllamaEngine::default())));
        SendPipeline::new(
            registry,
            credentials,
            Connectivity::default(),
            local,
            Arc::new(OpenAiCompatibleClient::new(HashMap::new())),
        )
    }

    #[tokio::test]
    async fn cancel_before_commit_point_wins() {
        let pipeline = pipeline().await;
        let (flight, _registration) = pipeline.begin("chat-1").unwrap();
        assert!(pipeline.cancel("chat-1"));
        assert!(matches!(flight.commit_point(), Err(SendError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_after_commit_point_is_refused() {
        let pipeline = pipeline().await;
        let (flight, _registration) = pipeline.begin("chat-1").unwrap();
        flight.commit_point().unwrap();
        assert!(!pipeline.cancel("chat-1"));
        assert_eq!(pipeline.state("chat-1"), SendState::Sending);
        drop(flight);
        assert_eq!(pipeline.state("chat-1"), SendState::Idle);
        assert!(!pipeline.cancel("chat-1"));
    }
}
