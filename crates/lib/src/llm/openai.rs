//! Streaming client for OpenAI-compatible `/chat/completions` endpoints (server-sent events).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{
    decode_frames, split_lines, CompletionMessage, DeltaStream, Frame, LlmError, RemoteCompletion,
};
use crate::catalog;

/// One client for every hosted provider; the base URL is chosen per provider id.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    base_urls: HashMap<String, String>,
}

impl Default for OpenAiCompatibleClient {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl OpenAiCompatibleClient {
    /// `base_urls` overrides the catalog's default base URL for the listed providers.
    pub fn new(base_urls: HashMap<String, String>) -> Self {
        let base_urls = base_urls
            .into_iter()
            .map(|(k, v)| (k, v.trim_end_matches('/').to_string()))
            .collect();
        Self {
            client: reqwest::Client::new(),
            base_urls,
        }
    }

    pub fn base_url(&self, provider_id: &str) -> Option<String> {
        self.base_urls.get(provider_id).cloned().or_else(|| {
            catalog::provider(provider_id)
                .and_then(|p| p.base_url)
                .map(|u| u.trim_end_matches('/').to_string())
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [CompletionMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Decode one SSE line. Comments, keep-alives and other fields are skipped.
pub(crate) fn decode_sse_line(line: &str) -> Result<Frame, LlmError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(Frame::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(Frame::Skip);
    }
    if data == "[DONE]" {
        return Ok(Frame::Done);
    }
    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| LlmError::Malformed(e.to_string()))?;
    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(LlmError::Upstream(message));
    }
    let content: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.and_then(|d| d.content))
        .collect();
    Ok(Frame::Delta(content))
}

#[async_trait]
impl RemoteCompletion for OpenAiCompatibleClient {
    async fn stream_completion(
        &self,
        provider_id: &str,
        model_id: &str,
        api_key: &str,
        messages: Vec<CompletionMessage>,
    ) -> Result<DeltaStream, LlmError> {
        let base = self
            .base_url(provider_id)
            .ok_or_else(|| LlmError::UnknownProvider(provider_id.to_string()))?;
        let url = format!("{}/chat/completions", base);
        let body = ChatRequest {
            model: model_id,
            messages: &messages,
            stream: true,
        };
        log::debug!(
            "openai: POST {} model={} messages={}",
            url,
            model_id,
            messages.len()
        );
        let res = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(LlmError::from_response(res).await);
        }
        Ok(decode_frames(split_lines(res.bytes_stream()), decode_sse_line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tests::byte_chunks;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn sse_deltas_until_done() {
        let body = [
            ": keep-alive\n\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choices\":[{\"del",
            "ta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ];
        let deltas: Vec<String> = decode_frames(split_lines(byte_chunks(&body)), decode_sse_line)
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(deltas, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn malformed_chunk_is_terminal() {
        let body = [
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {oops\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
        ];
        let out: Vec<Result<String, LlmError>> =
            decode_frames(split_lines(byte_chunks(&body)), decode_sse_line)
                .collect()
                .await;
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(LlmError::Malformed(_))));
    }

    #[tokio::test]
    async fn missing_done_marker_is_an_error() {
        let body = ["data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n"];
        let out: Vec<Result<String, LlmError>> =
            decode_frames(split_lines(byte_chunks(&body)), decode_sse_line)
                .collect()
                .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_deref().unwrap(), "Hel");
        assert!(matches!(out[1], Err(LlmError::Truncated)));
    }

    #[test]
    fn error_payload_surfaces_message() {
        let err = decode_sse_line(r#"data: {"error":{"message":"rate limited"}}"#);
        assert!(matches!(err, Err(LlmError::Upstream(m)) if m == "rate limited"));
    }

    #[test]
    fn base_url_prefers_override() {
        let mut overrides = HashMap::new();
        overrides.insert("openai".to_string(), "http://proxy.local/v1/".to_string());
        let client = OpenAiCompatibleClient::new(overrides);
        assert_eq!(client.base_url("openai").as_deref(), Some("http://proxy.local/v1"));
        assert_eq!(
            client.base_url("groq").as_deref(),
            Some("https://api.groq.com/openai/v1")
        );
        assert_eq!(client.base_url("nope"), None);
        assert_eq!(client.base_url("local"), None);
    }
}
