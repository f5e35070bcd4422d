//! In-Process Transport
//!
//! Direct channel-based communication with a relay session.
//! Used by tests and by embedders that drive a session without a socket.
//!
//! # Usage
//!
//! ```ignore
//! let (source, sink, mut client) = InProcessTransport::new_pair();
//!
//! tokio::spawn(session.run(source, sink));
//!
//! client.send_text(r#"{"model_name": "...", "conservation": []}"#).await?;
//! let unit = client.recv().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::traits::{FrameSink, FrameSource, InboundFrame, TransportError};

/// Default channel capacity for in-process pairs
const DEFAULT_CAPACITY: usize = 100;

/// Session side: inbound frames from the client
pub struct InProcessSource {
    frame_rx: mpsc::Receiver<InboundFrame>,
}

/// Session side: outbound frames to the client
pub struct InProcessSink {
    text_tx: mpsc::Sender<String>,
    /// Set once the session closes the connection
    closed: Arc<AtomicBool>,
}

/// Client side of an in-process connection
pub struct InProcessTransport {
    /// Channel to send frames to the session (dropped on disconnect)
    frame_tx: Option<mpsc::Sender<InboundFrame>>,
    /// Channel to receive frames from the session
    text_rx: mpsc::Receiver<String>,
    /// Set once the session closes the connection
    closed: Arc<AtomicBool>,
}

impl InProcessTransport {
    /// Create a new in-process transport pair
    ///
    /// Returns:
    /// - `InProcessSource`: the session reads client frames here
    /// - `InProcessSink`: the session writes units here
    /// - `InProcessTransport`: the client end
    #[must_use]
    pub fn new_pair() -> (InProcessSource, InProcessSink, Self) {
        Self::new_pair_with_capacity(DEFAULT_CAPACITY)
    }

    /// Create with custom channel capacity
    #[must_use]
    pub fn new_pair_with_capacity(capacity: usize) -> (InProcessSource, InProcessSink, Self) {
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        let (text_tx, text_rx) = mpsc::channel(capacity);
        let closed = Arc::new(AtomicBool::new(false));

        let source = InProcessSource { frame_rx };
        let sink = InProcessSink {
            text_tx,
            closed: Arc::clone(&closed),
        };
        let client = Self {
            frame_tx: Some(frame_tx),
            text_rx,
            closed,
        };

        (source, sink, client)
    }

    /// Send a text frame to the session
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send_frame(InboundFrame::Text(text.into())).await
    }

    /// Send a raw frame to the session
    pub async fn send_frame(&self, frame: InboundFrame) -> Result<(), TransportError> {
        let tx = self
            .frame_tx
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
    }

    /// Receive the next frame from the session
    ///
    /// Returns `None` once the session has dropped its sink.
    pub async fn recv(&mut self) -> Option<String> {
        self.text_rx.recv().await
    }

    /// Try to receive a frame (non-blocking)
    pub fn try_recv(&mut self) -> Option<String> {
        self.text_rx.try_recv().ok()
    }

    /// Close the client side; the session sees end-of-stream
    pub fn disconnect(&mut self) {
        self.frame_tx = None;
    }

    /// Whether the session closed the connection
    #[must_use]
    pub fn is_closed_by_server(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for InProcessSource {
    async fn next_frame(&mut self) -> Result<Option<InboundFrame>, TransportError> {
        Ok(self.frame_rx.recv().await)
    }
}

#[async_trait]
impl FrameSink for InProcessSink {
    async fn send_frame(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        self.text_tx
            .send(text)
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_process_roundtrip() {
        let (mut source, mut sink, mut client) = InProcessTransport::new_pair();

        client.send_text(r#"{"action":"cancel"}"#).await.unwrap();
        assert_eq!(
            source.next_frame().await.unwrap(),
            Some(InboundFrame::Text(r#"{"action":"cancel"}"#.to_string()))
        );

        sink.send_frame("unit".to_string()).await.unwrap();
        assert_eq!(client.recv().await.as_deref(), Some("unit"));
    }

    #[tokio::test]
    async fn test_in_process_try_recv() {
        let (_source, mut sink, mut client) = InProcessTransport::new_pair();

        assert!(client.try_recv().is_none());
        sink.send_frame("ready".to_string()).await.unwrap();
        assert_eq!(client.try_recv().as_deref(), Some("ready"));
    }

    #[tokio::test]
    async fn test_client_disconnect_ends_source() {
        let (mut source, _sink, mut client) = InProcessTransport::new_pair();

        client.disconnect();
        assert_eq!(source.next_frame().await.unwrap(), None);
        assert!(matches!(
            client.send_text("late").await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_server_close_rejects_further_sends() {
        let (_source, mut sink, client) = InProcessTransport::new_pair();

        sink.close().await.unwrap();
        assert!(client.is_closed_by_server());
        assert!(matches!(
            sink.send_frame("after close".to_string()).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_client_fails_sends() {
        let (_source, mut sink, client) = InProcessTransport::new_pair();
        drop(client);
        assert!(matches!(
            sink.send_frame("x".to_string()).await,
            Err(TransportError::SendFailed(_))
        ));
    }
}
