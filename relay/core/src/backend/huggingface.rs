//! Hugging Face Backend Implementation
//!
//! Upstream backend for the Hugging Face inference router, which exposes an
//! OpenAI-compatible chat completions API.
//!
//! # API
//!
//! - `POST {base_url}/chat/completions` - chat completion, streamed as
//!   server-sent events when `"stream": true`
//! - `GET {base_url}/models` - model listing, used as a health probe
//!
//! A streamed response is a sequence of `data: {json}` lines terminated by
//! `data: [DONE]`. Each JSON chunk carries the next fragment in
//! `choices[0].delta.content`.

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::traits::{
    FragmentStream, StreamToken, UpstreamBackend, UpstreamRequest, UpstreamResponse,
    FRAGMENT_CHANNEL_CAPACITY,
};
use crate::config::UpstreamConfig;

/// One decoded server-sent event line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseEvent {
    /// A content fragment
    Fragment(String),
    /// The `[DONE]` sentinel
    Done,
    /// Upstream reported an error inside the stream
    Error(String),
}

/// Decode a single line of an SSE body
///
/// Returns `None` for blank lines, comments, non-data fields and chunks that
/// carry no content (role announcements, finish markers).
#[must_use]
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim_end_matches('\r');
    let data = line.strip_prefix("data:")?.trim_start();

    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => return Some(SseEvent::Error(format!("Malformed stream chunk: {e}"))),
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .or_else(|| error.as_str())
            .map_or_else(|| error.to_string(), str::to_string);
        return Some(SseEvent::Error(message));
    }

    value
        .pointer("/choices/0/delta/content")
        .and_then(serde_json::Value::as_str)
        .filter(|content| !content.is_empty())
        .map(|content| SseEvent::Fragment(content.to_string()))
}

/// Longest SSE line accepted before the stream is treated as broken
const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// Forward SSE fragments from an upstream body into the relay channel
///
/// Returns as soon as the stream ends, fails, or the relay drops its
/// [`FragmentStream`], which also drops `body` and its HTTP connection.
async fn pump_sse<S, B, E>(body: S, tx: mpsc::Sender<StreamToken>, model: String)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    tokio::pin!(body);
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            () = tx.closed() => {
                tracing::debug!(model = %model, "Fragment receiver dropped");
                return;
            }
            chunk = body.next() => chunk,
        };

        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                let _ = tx.send(StreamToken::Error(e.to_string())).await;
                return;
            }
            None => {
                // Body ended without [DONE]; dropping tx reports a disconnect
                tracing::warn!(model = %model, "Upstream stream ended without terminator");
                return;
            }
        };
        buffer.extend_from_slice(bytes.as_ref());

        // Only whole lines are decoded, so multi-byte chars never split
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);

            let token = match parse_sse_line(line.trim_end_matches('\n')) {
                None => continue,
                Some(SseEvent::Fragment(text)) => StreamToken::Fragment(text),
                Some(SseEvent::Done) => {
                    let _ = tx.send(StreamToken::Complete).await;
                    return;
                }
                Some(SseEvent::Error(message)) => {
                    let _ = tx.send(StreamToken::Error(message)).await;
                    return;
                }
            };

            if tx.send(token).await.is_err() {
                tracing::debug!(model = %model, "Fragment receiver dropped");
                return;
            }
        }

        if buffer.len() > MAX_SSE_LINE_BYTES {
            let message = format!(
                "Upstream line exceeds {MAX_SSE_LINE_BYTES} bytes without a newline"
            );
            let _ = tx.send(StreamToken::Error(message)).await;
            return;
        }
    }
}

/// Hugging Face router client
#[derive(Clone)]
pub struct HuggingFaceBackend {
    /// Base URL without trailing slash
    base_url: String,
    /// Bearer token
    api_key: Option<String>,
    /// Timeout for non-streaming completions
    request_timeout: Duration,
    /// HTTP client
    http_client: reqwest::Client,
}

impl HuggingFaceBackend {
    /// Create a backend from upstream configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &UpstreamConfig) -> anyhow::Result<Self> {
        // No overall timeout: streams may legitimately run for minutes
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_timeout: config.request_timeout,
            http_client,
        })
    }

    /// Get chat completions endpoint URL
    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Get models endpoint URL
    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    fn request_body(request: &UpstreamRequest) -> serde_json::Value {
        serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "stream": request.stream,
        })
    }

    fn post(&self, request: &UpstreamRequest) -> reqwest::RequestBuilder {
        let builder = self
            .http_client
            .post(self.completions_url())
            .json(&Self::request_body(request));
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl UpstreamBackend for HuggingFaceBackend {
    fn name(&self) -> &str {
        "HuggingFace"
    }

    async fn health_check(&self) -> bool {
        let mut builder = self
            .http_client
            .get(self.models_url())
            .timeout(Duration::from_secs(5));
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
            .send()
            .await
            .is_ok_and(|response| response.status().is_success())
    }

    async fn open_stream(&self, request: &UpstreamRequest) -> anyhow::Result<FragmentStream> {
        let request = request.clone().with_stream(true);
        let response = self
            .post(&request)
            .send()
            .await
            .context("Failed to reach upstream")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Upstream returned {status}: {body}");
        }

        let (tx, fragments) = FragmentStream::channel(FRAGMENT_CHANNEL_CAPACITY);
        tokio::spawn(pump_sse(response.bytes_stream(), tx, request.model));

        Ok(fragments)
    }

    async fn complete(&self, request: &UpstreamRequest) -> anyhow::Result<UpstreamResponse> {
        let start = Instant::now();
        let request = request.clone().with_stream(false);

        let response = self
            .post(&request)
            .timeout(self.request_timeout)
            .send()
            .await
            .context("Failed to reach upstream")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Upstream returned {status}: {body}");
        }

        let data: serde_json::Value = response.json().await?;

        let content = data
            .pointer("/choices/0/message/content")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_string();

        let tokens_used = data
            .pointer("/usage/completion_tokens")
            .and_then(serde_json::Value::as_u64)
            .and_then(|c| u32::try_from(c).ok());

        Ok(UpstreamResponse {
            content,
            model: request.model,
            tokens_used,
            duration_ms: u64::try_from(start.elapsed().as_millis()).ok(),
        })
    }
}
