//! Relay Core - Streaming Inference Relay
//!
//! This crate relays chat completions from an upstream inference provider to
//! connected clients, regrouping the upstream fragments into paced,
//! cancelable output units. It has no knowledge of HTTP routing or process
//! management; the daemon wires it to sockets.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Client                                  │
//! │          control messages (up)     output units (down)           │
//! └───────────────┬────────────────────────────▲─────────────────────┘
//!                 │                            │
//! ┌───────────────▼────────────────────────────┴─────────────────────┐
//! │  Transport: FrameSource / FrameSink (WebSocket, in-process)      │
//! └───────────────┬────────────────────────────▲─────────────────────┘
//!                 │                            │
//! ┌───────────────▼────────────────────────────┴─────────────────────┐
//! │                        RelaySession                              │
//! │  ┌────────────┐  ┌──────────────┐  ┌─────────┐  ┌─────────────┐  │
//! │  │ AllowList  │  │ Cancellation │  │ Chunker │─►│    Pacer    │  │
//! │  │            │  │     Gate     │  │         │  │             │  │
//! │  └────────────┘  └──────────────┘  └────▲────┘  └─────────────┘  │
//! └─────────────────────────────────────────┼────────────────────────┘
//!                                           │ fragments
//! ┌─────────────────────────────────────────┴────────────────────────┐
//! │  UpstreamBackend: FragmentStream (Hugging Face, scripted)        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`RelaySession`]: One client connection, any number of sequential requests
//! - [`RelayConfig`]: Immutable process-wide configuration
//! - [`UpstreamBackend`]: Source of completion fragments
//! - [`Chunker`]: Regroups fragments per chunk mode
//! - [`CancellationGate`]: The cancel flag shared by reader and streaming loop
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{load_config, HuggingFaceBackend, InProcessTransport, RelaySession};
//!
//! let config = load_config()?.into_shared();
//! let backend = Arc::new(HuggingFaceBackend::from_config(&config.upstream)?);
//!
//! let (source, sink, client) = InProcessTransport::new_pair();
//! let mut session = RelaySession::new(config, backend);
//! tokio::spawn(async move { session.run(source, sink).await });
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Upstream abstraction and the Hugging Face client
//! - [`config`]: TOML, environment and CLI configuration
//! - [`inference`]: Non-streaming inference
//! - [`messages`]: Client wire schema
//! - [`security`]: Allow-list and frame size validation
//! - [`session`]: The relay session state machine
//! - [`streaming`]: Chunker, pacer, cancellation gate, stats
//! - [`transport`]: Client transports (in-process, WebSocket)

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod inference;
pub mod messages;
pub mod security;
pub mod session;
pub mod streaming;
pub mod transport;

// Re-exports for convenience
pub use backend::{
    FragmentStream, HuggingFaceBackend, StreamToken, UpstreamBackend, UpstreamError,
    UpstreamRequest, UpstreamResponse,
};
pub use messages::{
    decode_inbound, ChatMessage, ChunkMode, ControlMessage, FatalMessage, InboundMessage,
    OutboundMessage, OutputUnit, ProtocolError, RequestEnvelope, UnitStatus,
};
pub use security::{validate_frame_size, AllowList, ValidationResult};
pub use session::{
    RelayError, RelaySession, RequestId, SessionCounters, SessionOutcome, SessionState,
    MAX_PENDING_INPUTS,
};

// Streaming exports
pub use streaming::{CancellationGate, ChunkPolicy, Chunker, Pacer, StreamStats};

// Transport exports
pub use transport::{
    ConnectionId, FrameSink, FrameSource, InProcessTransport, InboundFrame, TransportError,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfig, ServerSettings, UpstreamConfig,
};
