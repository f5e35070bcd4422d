//! Upstream Backend Traits
//!
//! Trait definitions for upstream inference providers. The relay never runs
//! a model itself; it consumes a lazily produced, finite sequence of text
//! fragments from whatever backend implements [`UpstreamBackend`].
//!
//! # Design Philosophy
//!
//! Backends push [`StreamToken`]s into a bounded channel from their own
//! reader task. The relay pulls from the other end through a
//! [`FragmentStream`], one fragment at a time, so upstream is only read as
//! fast as the client is served.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::messages::ChatMessage;

/// Default capacity of a backend's fragment channel
pub const FRAGMENT_CHANNEL_CAPACITY: usize = 100;

/// Token stream events from upstream backends
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamToken {
    /// A text fragment of the completion
    Fragment(String),
    /// Upstream signalled the end of the completion
    Complete,
    /// Upstream failed mid-stream
    Error(String),
}

/// Failures observed while reading an upstream stream
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// Upstream reported an error
    #[error("Upstream stream failed: {0}")]
    Stream(String),
    /// The stream closed without an end-of-sequence signal
    #[error("Upstream stream disconnected unexpectedly")]
    Disconnected,
    /// No fragment arrived within the configured read timeout
    #[error("Upstream produced no data for {0:?}")]
    Timeout(Duration),
}

/// A request to an upstream backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamRequest {
    /// Backend-specific model identifier
    pub model: String,
    /// Conversation to complete
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Whether to stream the response
    pub stream: bool,
}

impl UpstreamRequest {
    /// Create a streaming request
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens,
            stream: true,
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Content of the most recent `user` message, if any
    #[must_use]
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

/// Response from a non-streaming upstream request
#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    /// The generated text
    pub content: String,
    /// Model that generated the response
    pub model: String,
    /// Tokens generated (if reported)
    pub tokens_used: Option<u32>,
    /// Response generation time in milliseconds
    pub duration_ms: Option<u64>,
}

/// Pull side of an upstream completion stream
///
/// Yields `Ok(Some(fragment))` per fragment, `Ok(None)` once upstream has
/// signalled completion, and `Err` on failure. After the end or a failure
/// every further call returns `Ok(None)`.
#[derive(Debug)]
pub struct FragmentStream {
    receiver: mpsc::Receiver<StreamToken>,
    finished: bool,
}

impl FragmentStream {
    /// Wrap the receiving end of a backend's token channel
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<StreamToken>) -> Self {
        Self {
            receiver,
            finished: false,
        }
    }

    /// Create a connected sender/stream pair
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<StreamToken>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }

    /// Pull the next fragment
    pub async fn next(&mut self) -> Result<Option<String>, UpstreamError> {
        if self.finished {
            return Ok(None);
        }

        match self.receiver.recv().await {
            Some(StreamToken::Fragment(text)) => Ok(Some(text)),
            Some(StreamToken::Complete) => {
                self.finish();
                Ok(None)
            }
            Some(StreamToken::Error(error)) => {
                self.finish();
                Err(UpstreamError::Stream(error))
            }
            None => {
                self.finish();
                Err(UpstreamError::Disconnected)
            }
        }
    }

    /// Whether the stream has ended (normally or not)
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stop reading and release the channel so the producer winds down
    fn finish(&mut self) {
        self.finished = true;
        self.receiver.close();
    }
}

/// Upstream backend trait
///
/// Implement this trait to relay from a different inference provider.
#[async_trait]
pub trait UpstreamBackend: Send + Sync {
    /// Get the backend name (e.g., "HuggingFace")
    fn name(&self) -> &str;

    /// Check if the backend is reachable
    async fn health_check(&self) -> bool;

    /// Open a streaming completion
    ///
    /// Errors returned here mean the stream could not be opened at all;
    /// failures after opening arrive through the [`FragmentStream`].
    async fn open_stream(&self, request: &UpstreamRequest) -> anyhow::Result<FragmentStream>;

    /// Run a completion and wait for the whole text (non-streaming)
    async fn complete(&self, request: &UpstreamRequest) -> anyhow::Result<UpstreamResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_request_builder() {
        let request = UpstreamRequest::new(
            "modelA",
            vec![
                ChatMessage::new("system", "be brief"),
                ChatMessage::user("first"),
                ChatMessage::new("assistant", "ok"),
                ChatMessage::user("second"),
            ],
            64,
        )
        .with_stream(false);

        assert_eq!(request.model, "modelA");
        assert_eq!(request.max_tokens, 64);
        assert!(!request.stream);
        assert_eq!(request.last_user_message(), Some("second"));
    }

    #[tokio::test]
    async fn test_fragment_stream_sequence() {
        let (tx, mut stream) = FragmentStream::channel(8);
        tx.send(StreamToken::Fragment("a".into())).await.unwrap();
        tx.send(StreamToken::Fragment("b".into())).await.unwrap();
        tx.send(StreamToken::Complete).await.unwrap();

        assert_eq!(stream.next().await, Ok(Some("a".to_string())));
        assert_eq!(stream.next().await, Ok(Some("b".to_string())));
        assert_eq!(stream.next().await, Ok(None));
        assert!(stream.is_finished());
        assert_eq!(stream.next().await, Ok(None));
    }

    #[tokio::test]
    async fn test_fragment_stream_error_then_end() {
        let (tx, mut stream) = FragmentStream::channel(8);
        tx.send(StreamToken::Error("rate limited".into()))
            .await
            .unwrap();

        assert_eq!(
            stream.next().await,
            Err(UpstreamError::Stream("rate limited".to_string()))
        );
        assert_eq!(stream.next().await, Ok(None));
    }

    #[tokio::test]
    async fn test_fragment_stream_disconnect_is_failure() {
        let (tx, mut stream) = FragmentStream::channel(8);
        tx.send(StreamToken::Fragment("partial".into()))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(stream.next().await, Ok(Some("partial".to_string())));
        assert_eq!(stream.next().await, Err(UpstreamError::Disconnected));
    }

    #[test]
    fn test_upstream_error_display() {
        assert!(UpstreamError::Disconnected
            .to_string()
            .contains("disconnected"));
        assert!(UpstreamError::Timeout(Duration::from_secs(3))
            .to_string()
            .contains("3s"));
    }
}
