//! Transport Traits
//!
//! Core trait definitions for the client side of a relay session.
//!
//! A connection is split into two halves so reading and writing can proceed
//! concurrently:
//! - `FrameSource`: inbound frames from the client
//! - `FrameSink`: outbound text frames to the client

use std::fmt;

use async_trait::async_trait;

/// Unique identifier for a client connection
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a new unique connection ID using cryptographically random 128-bit value
    #[must_use]
    pub fn new() -> Self {
        use rand::Rng;
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(format!("conn_{}", hex::encode(bytes)))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One inbound frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    /// A text frame (JSON control message)
    Text(String),
    /// A binary frame, which the relay protocol does not use
    Binary(Vec<u8>),
}

/// Errors that can occur during transport operations
#[derive(Debug)]
pub enum TransportError {
    /// Connection was closed
    ConnectionClosed,
    /// Failed to send a frame
    SendFailed(String),
    /// Failed to receive a frame
    ReceiveFailed(String),
    /// The opening handshake failed
    HandshakeFailed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::ReceiveFailed(msg) => write!(f, "Receive failed: {msg}"),
            Self::HandshakeFailed(msg) => write!(f, "Handshake failed: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Read half of a client connection
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame
    ///
    /// Returns `Ok(None)` once the client has closed the connection.
    async fn next_frame(&mut self) -> Result<Option<InboundFrame>, TransportError>;
}

/// Write half of a client connection
#[async_trait]
pub trait FrameSink: Send {
    /// Send one text frame
    async fn send_frame(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection from the server side
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.0.starts_with("conn_"));
        assert_eq!(id1.0.len(), "conn_".len() + 32);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId("test_conn".to_string());
        assert_eq!(format!("{}", id), "test_conn");
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::SendFailed("broken pipe".to_string());
        assert!(err.to_string().contains("Send failed"));

        let err = TransportError::HandshakeFailed("no upgrade header".to_string());
        assert_eq!(err.to_string(), "Handshake failed: no upgrade header");
    }
}
