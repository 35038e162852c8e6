//! Ollama HTTP engine (http://127.0.0.1:11434 by default) backing the local inference adapter.
//! Chat and pull progress are streamed as NDJSON.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

use super::{
    decode_frames, split_lines, CompletionMessage, DeltaStream, Frame, LlmError, LocalEngine,
};

pub const DEFAULT_LOCAL_BASE_URL: &str = "http://127.0.0.1:11434";

/// Client for the Ollama HTTP API.
#[derive(Clone)]
pub struct OllamaEngine {
    base_url: String,
    client: reqwest::Client,
}

impl Default for OllamaEngine {
    fn default() -> Self {
        Self::new(None)
    }
}

impl OllamaEngine {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_LOCAL_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(res: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        if res.status().is_success() {
            Ok(res)
        } else {
            Err(LlmError::from_response(res).await)
        }
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Option<Vec<TagModel>>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [CompletionMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatStreamEvent {
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct PullEvent {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

pub(crate) fn decode_chat_line(line: &str) -> Result<Frame, LlmError> {
    if line.is_empty() {
        return Ok(Frame::Skip);
    }
    let event: ChatStreamEvent =
        serde_json::from_str(line).map_err(|e| LlmError::Malformed(e.to_string()))?;
    if let Some(error) = event.error {
        return Err(LlmError::Upstream(error));
    }
    let content = event.message.map(|m| m.content).unwrap_or_default();
    if event.done {
        Ok(Frame::Last(content))
    } else {
        Ok(Frame::Delta(content))
    }
}

/// Byte counts per layer of a pull. Each layer restarts from zero, so the percent is taken
/// over every layer seen so far.
#[derive(Default)]
struct PullProgress {
    layers: HashMap<String, (u64, u64)>,
}

impl PullProgress {
    /// Record one progress line; returns the overall percent when the line carries byte counts.
    fn update(&mut self, event: &PullEvent) -> Option<f64> {
        let total = event.total.filter(|t| *t > 0)?;
        let layer = event.digest.clone().unwrap_or_default();
        let completed = event.completed.unwrap_or(0).min(total);
        self.layers.insert(layer, (completed, total));
        let (done, all) = self
            .layers
            .values()
            .fold((0u64, 0u64), |(d, a), (c, t)| (d + c, a + t));
        Some(done as f64 / all as f64 * 100.0)
    }
}

#[async_trait]
impl LocalEngine for OllamaEngine {
    async fn probe_support(&self) -> Result<(), LlmError> {
        let res = self.client.get(self.url("/api/version")).send().await?;
        Self::check(res).await.map(|_| ())
    }

    async fn cached_models(&self) -> Result<Vec<String>, LlmError> {
        let res = self.client.get(self.url("/api/tags")).send().await?;
        let data: TagsResponse = Self::check(res).await?.json().await?;
        Ok(data
            .models
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.name)
            .collect())
    }

    async fn download_model(
        &self,
        model_id: &str,
        on_progress: &mut (dyn FnMut(f64) + Send),
    ) -> Result<(), LlmError> {
        let res = self
            .client
            .post(self.url("/api/pull"))
            .json(&json!({ "model": model_id, "stream": true }))
            .send()
            .await?;
        let res = Self::check(res).await?;
        let mut lines = Box::pin(split_lines(res.bytes_stream()));
        let mut progress = PullProgress::default();
        let mut succeeded = false;
        while let Some(line) = lines.next().await {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let event: PullEvent =
                serde_json::from_str(&line).map_err(|e| LlmError::Malformed(e.to_string()))?;
            if let Some(error) = event.error {
                return Err(LlmError::Upstream(error));
            }
            if let Some(percent) = progress.update(&event) {
                on_progress(percent);
            }
            if event.status.as_deref() == Some("success") {
                succeeded = true;
            }
        }
        if succeeded {
            Ok(())
        } else {
            Err(LlmError::Upstream(format!(
                "pull of {} ended without success",
                model_id
            )))
        }
    }

    async fn load_model(&self, model_id: &str) -> Result<(), LlmError> {
        let res = self
            .client
            .post(self.url("/api/generate"))
            .json(&json!({ "model": model_id, "prompt": "", "stream": false, "keep_alive": -1 }))
            .send()
            .await?;
        Self::check(res).await.map(|_| ())
    }

    async fn unload_model(&self, model_id: &str) -> Result<(), LlmError> {
        let res = self
            .client
            .post(self.url("/api/generate"))
            .json(&json!({ "model": model_id, "prompt": "", "stream": false, "keep_alive": 0 }))
            .send()
            .await?;
        Self::check(res).await.map(|_| ())
    }

    async fn delete_model(&self, model_id: &str) -> Result<(), LlmError> {
        let res = self
            .client
            .delete(self.url("/api/delete"))
            .json(&json!({ "model": model_id }))
            .send()
            .await?;
        Self::check(res).await.map(|_| ())
    }

    async fn stream_chat(
        &self,
        model_id: &str,
        messages: Vec<CompletionMessage>,
    ) -> Result<DeltaStream, LlmError> {
        let body = ChatRequest {
            model: model_id,
            messages: &messages,
            stream: true,
        };
        log::debug!("ollama: chat model={} messages={}", model_id, messages.len());
        let res = self.client.post(self.url("/api/chat")).json(&body).send().await?;
        let res = Self::check(res).await?;
        Ok(decode_frames(split_lines(res.bytes_stream()), decode_chat_line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tests::byte_chunks;

    #[tokio::test]
    async fn ndjson_deltas_end_at_done() {
        let body = [
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Bon\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"jour\"},\"done\":false}\n{\"message\":",
            "{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
        ];
        let deltas: Vec<String> = decode_frames(split_lines(byte_chunks(&body)), decode_chat_line)
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(deltas.concat(), "Bonjour");
    }

    #[tokio::test]
    async fn body_without_done_line_is_truncated() {
        let body = ["{\"message\":{\"role\":\"assistant\",\"content\":\"Bon\"},\"done\":false}\n"];
        let out: Vec<Result<String, LlmError>> =
            decode_frames(split_lines(byte_chunks(&body)), decode_chat_line)
                .collect()
                .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_deref().unwrap(), "Bon");
        assert!(matches!(out[1], Err(LlmError::Truncated)));
    }

    #[test]
    fn error_line_is_terminal() {
        assert!(matches!(
            decode_chat_line(r#"{"error":"model not found"}"#),
            Err(LlmError::Upstream(m)) if m == "model not found"
        ));
    }

    fn pulling(digest: &str, completed: u64, total: u64) -> PullEvent {
        PullEvent {
            status: Some(format!("pulling {}", digest)),
            digest: Some(digest.to_string()),
            total: Some(total),
            completed: Some(completed),
            error: None,
        }
    }

    #[test]
    fn pull_progress_needs_totals() {
        let mut progress = PullProgress::default();
        assert_eq!(progress.update(&pulling("sha256:a", 100, 200)), Some(50.0));
        let manifest = PullEvent {
            status: Some("pulling manifest".to_string()),
            digest: None,
            total: None,
            completed: None,
            error: None,
        };
        assert_eq!(progress.update(&manifest), None);
    }

    #[test]
    fn pull_progress_spans_layers() {
        let mut progress = PullProgress::default();
        assert_eq!(progress.update(&pulling("sha256:a", 300, 300)), Some(100.0));
        // A second layer starting from zero does not reset the overall count.
        assert_eq!(progress.update(&pulling("sha256:b", 0, 100)), Some(75.0));
        assert_eq!(progress.update(&pulling("sha256:b", 100, 100)), Some(100.0));
        assert_eq!(progress.update(&pulling("sha256:a", 300, 300)), Some(100.0));
    }

    #[test]
    fn base_url_trims_trailing_slash() {
        let engine = OllamaEngine::new(Some("http://gpu-box:11434/".to_string()));
        assert_eq!(engine.base_url(), "http://gpu-box:11434");
        assert_eq!(OllamaEngine::default().base_url(), DEFAULT_LOCAL_BASE_URL);
    }
}
