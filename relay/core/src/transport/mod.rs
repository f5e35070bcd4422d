//! Transport Layer for Client Connections
//!
//! Provides abstraction over different transport mechanisms:
//! - `InProcess`: Direct channel communication (tests, embedding)
//! - `WebSocket`: Remote clients (feature `websocket`)
//!
//! # Design Philosophy
//!
//! The transport layer separates the communication mechanism from the relay
//! session. A session only sees a [`FrameSource`] and a [`FrameSink`], so the
//! same state machine serves a socket or an in-memory channel pair.

pub mod in_process;
pub mod traits;
#[cfg(feature = "websocket")]
pub mod websocket;

// Re-exports for convenience
pub use in_process::{InProcessSink, InProcessSource, InProcessTransport};
pub use traits::{ConnectionId, FrameSink, FrameSource, InboundFrame, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketServer, RELAY_PATH};
