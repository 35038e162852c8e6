//! Completion capabilities: remote OpenAI-compatible providers and a local inference engine.
//!
//! Both sides hand back a [`DeltaStream`]: a finite, single-pass stream of text deltas whose
//! last item is an error when the upstream failed part-way.

mod ollama;
mod openai;

pub use ollama::{OllamaEngine, DEFAULT_LOCAL_BASE_URL};
pub use openai::OpenAiCompatibleClient;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;

use crate::model::{Message, Role};

/// One turn of history as sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionMessage {
    pub role: Role,
    pub content: String,
}

impl CompletionMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Message> for CompletionMessage {
    fn from(m: &Message) -> Self {
        Self::new(m.role, m.content.clone())
    }
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("api error: {status} {body}")]
    Api { status: u16, body: String },
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("malformed stream chunk: {0}")]
    Malformed(String),
    #[error("unknown provider {0}")]
    UnknownProvider(String),
    #[error("stream ended before completion")]
    Truncated,
}

impl LlmError {
    pub(crate) async fn from_response(res: reqwest::Response) -> Self {
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        LlmError::Api { status, body }
    }
}

/// Streams completions from a hosted provider.
#[async_trait]
pub trait RemoteCompletion: Send + Sync {
    async fn stream_completion(
        &self,
        provider_id: &str,
        model_id: &str,
        api_key: &str,
        messages: Vec<CompletionMessage>,
    ) -> Result<DeltaStream, LlmError>;
}

/// Model lifecycle and chat against an on-device engine.
#[async_trait]
pub trait LocalEngine: Send + Sync {
    /// Ok when the engine is reachable on this device.
    async fn probe_support(&self) -> Result<(), LlmError>;

    /// Ids of models present in the engine's cache.
    async fn cached_models(&self) -> Result<Vec<String>, LlmError>;

    async fn is_cached(&self, model_id: &str) -> Result<bool, LlmError> {
        let cached = self.cached_models().await?;
        Ok(cached.iter().any(|m| same_model(m, model_id)))
    }

    /// Fetch a model into the cache, reporting percent complete.
    async fn download_model(
        &self,
        model_id: &str,
        on_progress: &mut (dyn FnMut(f64) + Send),
    ) -> Result<(), LlmError>;

    async fn load_model(&self, model_id: &str) -> Result<(), LlmError>;

    async fn unload_model(&self, model_id: &str) -> Result<(), LlmError>;

    async fn delete_model(&self, model_id: &str) -> Result<(), LlmError>;

    async fn stream_chat(
        &self,
        model_id: &str,
        messages: Vec<CompletionMessage>,
    ) -> Result<DeltaStream, LlmError>;
}

/// Model names match exactly or when one side omits the implicit `:latest` tag.
pub(crate) fn same_model(a: &str, b: &str) -> bool {
    let norm = |s: &str| {
        if s.contains(':') {
            s.to_string()
        } else {
            format!("{}:latest", s)
        }
    };
    norm(a) == norm(b)
}

/// Split a byte stream into trimmed text lines. A transport error ends the stream.
pub(crate) fn split_lines<S, B, E>(inner: S) -> impl Stream<Item = Result<String, LlmError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
    E: Into<LlmError> + Send,
{
    struct State<S> {
        inner: S,
        buffer: Vec<u8>,
        done: bool,
    }

    let state = State {
        inner,
        buffer: Vec::new(),
        done: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(i) = st.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = st.buffer.drain(..=i).collect();
                let line = String::from_utf8_lossy(&line[..i]).trim().to_string();
                return Some((Ok(line), st));
            }
            if st.done {
                if st.buffer.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut st.buffer);
                let line = String::from_utf8_lossy(&rest).trim().to_string();
                return Some((Ok(line), st));
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    st.done = true;
                    st.buffer.clear();
                    return Some((Err(e.into()), st));
                }
                None => st.done = true,
            }
        }
    })
}

/// What one wire line contributes to the delta stream.
pub(crate) enum Frame {
    Skip,
    Delta(String),
    /// Final delta, then end of stream.
    Last(String),
    Done,
}

/// Turn lines into deltas with `decode`. The first error is yielded and ends the stream.
///
/// Input that runs out before a `Last` or `Done` frame yields [`LlmError::Truncated`].
pub(crate) fn decode_frames<S, F>(lines: S, decode: F) -> DeltaStream
where
    S: Stream<Item = Result<String, LlmError>> + Send + 'static,
    F: FnMut(&str) -> Result<Frame, LlmError> + Send + 'static,
{
    let lines = Box::pin(lines);
    Box::pin(stream::unfold(
        (lines, decode, false),
        |(mut lines, mut decode, finished)| async move {
            if finished {
                return None;
            }
            loop {
                let line = match lines.next().await {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => return Some((Err(e), (lines, decode, true))),
                    None => return Some((Err(LlmError::Truncated), (lines, decode, true))),
                };
                match decode(&line) {
                    Ok(Frame::Skip) => continue,
                    Ok(Frame::Delta(d)) if d.is_empty() => continue,
                    Ok(Frame::Delta(d)) => return Some((Ok(d), (lines, decode, false))),
                    Ok(Frame::Last(d)) if d.is_empty() => return None,
                    Ok(Frame::Last(d)) => return Some((Ok(d), (lines, decode, true))),
                    Ok(Frame::Done) => return None,
                    Err(e) => return Some((Err(e), (lines, decode, true))),
                }
            }
        },
    ))
}
