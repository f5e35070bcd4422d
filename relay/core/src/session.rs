//! Relay Session
//!
//! One [`RelaySession`] serves one client connection. It handles any number
//! of requests one after another, never two at once, and relays each
//! request's upstream completion through the chunker and pacer.
//!
//! # States
//!
//! ```text
//! Idle ─► AwaitingEnvelope ─► Validating ─► Streaming ─► AwaitingEnvelope
//!               ▲                  │             │
//!               │   (disallowed)   │             ▼
//!               └──────────────────┘        Cancelling ─► AwaitingEnvelope
//!
//! any state ─► Terminated   (client closed, transport failure, fatal frame)
//! ```
//!
//! # Concurrency
//!
//! A reader task owns the [`FrameSource`]. It signals the
//! [`CancellationGate`] directly when a cancel marker arrives and queues every
//! other frame for the session. The streaming loop waits on the gate, the
//! queue and upstream at once, so a cancel or a disconnect is observed
//! without draining the stream first. Requests that arrive mid-stream wait in
//! the queue and run afterwards. At most [`MAX_PENDING_INPUTS`] may wait; one
//! more closes the connection.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::backend::{FragmentStream, UpstreamBackend, UpstreamError, UpstreamRequest};
use crate::config::RelayConfig;
use crate::messages::{
    decode_inbound, ControlMessage, FatalMessage, OutboundMessage, OutputUnit, ProtocolError,
    RequestEnvelope,
};
use crate::security::{validate_frame_size, ValidationResult};
use crate::streaming::{CancellationGate, ChunkPolicy, Chunker, Pacer, StreamStats};
use crate::transport::{ConnectionId, FrameSink, FrameSource, InboundFrame, TransportError};

/// Client frames that may wait behind the request being streamed
pub const MAX_PENDING_INPUTS: usize = 32;

/// Request identifier, attached to every log line of a request
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a new unique request ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("req_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet running
    Idle,
    /// Waiting for the next request
    AwaitingEnvelope,
    /// Checking a request against the allow-list
    Validating,
    /// Relaying an upstream stream
    Streaming,
    /// Reporting a cancelled request
    Cancelling,
    /// The connection is gone; the session is finished
    Terminated,
}

/// Errors that end a single request
///
/// Each is reported to the client as one `error` unit.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The requested model is not on the allow-list
    #[error("{0}")]
    ModelNotAllowed(String),

    /// Opening or reading the upstream stream failed
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// The request frame could not be interpreted
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The client connection failed
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
}

impl From<UpstreamError> for RelayError {
    fn from(err: UpstreamError) -> Self {
        Self::Upstream(err.to_string())
    }
}

/// Why a session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The client closed the connection
    ClientClosed,
    /// Reading from or writing to the client failed
    TransportFailed(String),
    /// The client sent a frame the relay refuses to handle
    ProtocolViolation(String),
}

/// Request tallies for one session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionCounters {
    /// Requests received
    pub requests: u32,
    /// Requests that ended with `done`
    pub completed: u32,
    /// Requests that ended with `cancelled`
    pub cancelled: u32,
    /// Requests that ended with `error`
    pub failed: u32,
}

/// Work queued by the reader task
#[derive(Debug)]
enum SessionInput {
    Envelope(RequestEnvelope),
    Rejected(ProtocolError),
    Fatal(String),
    Closed,
    Failed(TransportError),
}

/// How a request ended
enum RequestEnd {
    Done,
    Cancelled,
    Failed(RelayError),
    /// The connection ended mid-request; no terminal unit can be sent
    Interrupted(SessionOutcome),
}

/// What woke the streaming loop
enum StreamEvent {
    Cancelled,
    Input(Option<SessionInput>),
    Fragment(Result<Option<String>, UpstreamError>),
}

/// A client connection being relayed
pub struct RelaySession {
    config: Arc<RelayConfig>,
    backend: Arc<dyn UpstreamBackend>,
    gate: Arc<CancellationGate>,
    pacer: Pacer,
    connection_id: ConnectionId,
    state: SessionState,
    /// Inputs that arrived while a request was streaming
    backlog: VecDeque<SessionInput>,
    counters: SessionCounters,
}

impl RelaySession {
    /// Create a session for a new connection
    #[must_use]
    pub fn new(config: Arc<RelayConfig>, backend: Arc<dyn UpstreamBackend>) -> Self {
        let pacer = config.pacer();
        Self {
            config,
            backend,
            gate: Arc::new(CancellationGate::new()),
            pacer,
            connection_id: ConnectionId::new(),
            state: SessionState::Idle,
            backlog: VecDeque::new(),
            counters: SessionCounters::default(),
        }
    }

    /// Use an existing connection ID (for log correlation)
    #[must_use]
    pub fn with_connection_id(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = connection_id;
        self
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Request tallies so far
    #[must_use]
    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    /// The connection this session serves
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Serve the connection until it ends
    pub async fn run<Src, Snk>(&mut self, source: Src, mut sink: Snk) -> SessionOutcome
    where
        Src: FrameSource + 'static,
        Snk: FrameSink,
    {
        let span = tracing::info_span!("session", conn = %self.connection_id);
        async {
            tracing::debug!("Session started");
            self.state = SessionState::AwaitingEnvelope;

            let (input_tx, mut inputs) = mpsc::channel(MAX_PENDING_INPUTS);
            let reader = tokio::spawn(
                read_frames(
                    source,
                    Arc::clone(&self.gate),
                    input_tx,
                    self.config.max_message_size,
                )
                .in_current_span(),
            );

            let outcome = self.serve(&mut sink, &mut inputs).await;

            if let SessionOutcome::ProtocolViolation(ref reason) = outcome {
                send_fatal(&mut sink, reason).await;
            }

            reader.abort();
            self.state = SessionState::Terminated;

            tracing::info!(
                outcome = ?outcome,
                requests = self.counters.requests,
                completed = self.counters.completed,
                cancelled = self.counters.cancelled,
                failed = self.counters.failed,
                "Session ended"
            );
            outcome
        }
        .instrument(span)
        .await
    }

    async fn serve<Snk: FrameSink>(
        &mut self,
        sink: &mut Snk,
        inputs: &mut mpsc::Receiver<SessionInput>,
    ) -> SessionOutcome {
        loop {
            let input = match self.backlog.pop_front() {
                Some(input) => input,
                None => inputs.recv().await.unwrap_or(SessionInput::Closed),
            };

            match input {
                SessionInput::Envelope(envelope) => {
                    let request_id = RequestId::new();
                    let span = tracing::info_span!(
                        "request",
                        id = %request_id,
                        model = %envelope.model_id,
                        mode = %envelope.chunk_mode,
                    );
                    if let Err(outcome) = self
                        .handle_request(envelope, sink, inputs)
                        .instrument(span)
                        .await
                    {
                        return outcome;
                    }
                }
                SessionInput::Rejected(error) => {
                    tracing::warn!(error = %error, "Rejected client frame");
                    let unit = OutputUnit::error(RelayError::from(error).to_string());
                    if let Err(e) = send_unit(sink, unit).await {
                        return SessionOutcome::TransportFailed(e.to_string());
                    }
                }
                SessionInput::Fatal(reason) => return SessionOutcome::ProtocolViolation(reason),
                SessionInput::Closed => return SessionOutcome::ClientClosed,
                SessionInput::Failed(e) => return SessionOutcome::TransportFailed(e.to_string()),
            }
        }
    }

    /// Run one request to its terminal unit
    async fn handle_request<Snk: FrameSink>(
        &mut self,
        envelope: RequestEnvelope,
        sink: &mut Snk,
        inputs: &mut mpsc::Receiver<SessionInput>,
    ) -> Result<(), SessionOutcome> {
        // Keeps a cancel that landed while this request sat in the queue
        self.gate.arm_if_idle();
        self.counters.requests += 1;
        self.state = SessionState::Validating;

        let mut stats = StreamStats::new();
        let end = match self.relay(envelope, sink, inputs, &mut stats).await {
            Ok(end) | Err(end) => end,
        };

        // From here on a cancel is late and changes nothing
        self.gate.disarm();

        let unit = match end {
            RequestEnd::Done => {
                self.counters.completed += 1;
                OutputUnit::done()
            }
            RequestEnd::Cancelled => {
                self.state = SessionState::Cancelling;
                self.counters.cancelled += 1;
                tracing::info!("Request cancelled by client");
                OutputUnit::cancelled()
            }
            RequestEnd::Failed(error) => {
                self.counters.failed += 1;
                tracing::warn!(error = %error, "Request failed");
                OutputUnit::error(error.to_string())
            }
            RequestEnd::Interrupted(outcome) => {
                tracing::debug!(outcome = ?outcome, "Request abandoned");
                if let SessionOutcome::ProtocolViolation(ref reason) = outcome {
                    let unit = OutputUnit::error(format!("Connection closing: {reason}"));
                    let _ = send_unit(sink, unit).await;
                }
                return Err(outcome);
            }
        };

        stats.log_summary(unit.status);
        send_unit(sink, unit)
            .await
            .map_err(|e| SessionOutcome::TransportFailed(e.to_string()))?;

        self.state = SessionState::AwaitingEnvelope;
        Ok(())
    }

    /// Validate, open upstream and stream until the request ends
    ///
    /// `Err` is an early exit; both sides carry the request's end.
    async fn relay<Snk: FrameSink>(
        &mut self,
        envelope: RequestEnvelope,
        sink: &mut Snk,
        inputs: &mut mpsc::Receiver<SessionInput>,
        stats: &mut StreamStats,
    ) -> Result<RequestEnd, RequestEnd> {
        if let ValidationResult::Invalid(reason) =
            self.config.allowed_models.validate(&envelope.model_id)
        {
            return Err(RequestEnd::Failed(RelayError::ModelNotAllowed(reason)));
        }

        let gate = Arc::clone(&self.gate);
        let policy = ChunkPolicy::for_mode(
            envelope.chunk_mode,
            self.config.char_batch_size,
            self.config.word_batch_size,
        );
        let request = UpstreamRequest::new(
            envelope.model_id,
            envelope.messages,
            envelope
                .max_tokens
                .unwrap_or(self.config.default_max_tokens),
        );

        let mut stream = tokio::select! {
            biased;
            () = gate.cancelled() => return Err(RequestEnd::Cancelled),
            opened = self.backend.open_stream(&request) => opened.map_err(|e| {
                RequestEnd::Failed(RelayError::Upstream(format!("{e:#}")))
            })?,
        };

        self.state = SessionState::Streaming;
        tracing::debug!(max_tokens = request.max_tokens, "Upstream stream opened");

        let read_timeout = self.config.upstream_read_timeout;
        let mut chunker = Chunker::new(policy);

        loop {
            let event = tokio::select! {
                biased;
                () = gate.cancelled() => StreamEvent::Cancelled,
                input = inputs.recv() => StreamEvent::Input(input),
                next = read_fragment(&mut stream, read_timeout) => StreamEvent::Fragment(next),
            };

            match event {
                StreamEvent::Cancelled => return Ok(RequestEnd::Cancelled),
                StreamEvent::Input(Some(
                    input @ (SessionInput::Envelope(_) | SessionInput::Rejected(_)),
                )) => {
                    if self.backlog.len() >= MAX_PENDING_INPUTS {
                        return Err(RequestEnd::Interrupted(SessionOutcome::ProtocolViolation(
                            too_many_pending(),
                        )));
                    }
                    tracing::debug!(
                        pending = self.backlog.len() + 1,
                        "Queued client frame until the current request ends"
                    );
                    self.backlog.push_back(input);
                }
                StreamEvent::Input(Some(SessionInput::Fatal(reason))) => {
                    return Err(RequestEnd::Interrupted(SessionOutcome::ProtocolViolation(
                        reason,
                    )));
                }
                StreamEvent::Input(Some(SessionInput::Failed(e))) => {
                    return Err(RequestEnd::Interrupted(SessionOutcome::TransportFailed(
                        e.to_string(),
                    )));
                }
                StreamEvent::Input(Some(SessionInput::Closed) | None) => {
                    return Err(RequestEnd::Interrupted(SessionOutcome::ClientClosed));
                }
                StreamEvent::Fragment(Ok(Some(fragment))) => {
                    stats.record_fragment(&fragment);
                    for text in chunker.push(&fragment) {
                        self.deliver(sink, text, stats).await?;
                    }
                }
                StreamEvent::Fragment(Ok(None)) => {
                    if let Some(rest) = chunker.finish() {
                        self.deliver(sink, rest, stats).await?;
                    }
                    return Ok(RequestEnd::Done);
                }
                StreamEvent::Fragment(Err(e)) => {
                    return Err(RequestEnd::Failed(RelayError::from(e)));
                }
            }
        }
    }

    /// Pace, then hand one content unit to the client unless cancelled
    async fn deliver<Snk: FrameSink>(
        &self,
        sink: &mut Snk,
        text: String,
        stats: &mut StreamStats,
    ) -> Result<(), RequestEnd> {
        tokio::select! {
            biased;
            () = self.gate.cancelled() => return Err(RequestEnd::Cancelled),
            () = self.pacer.pace() => {}
        }

        if self.gate.is_cancelled() {
            return Err(RequestEnd::Cancelled);
        }

        send_unit(sink, OutputUnit::content(text))
            .await
            .map_err(|e| RequestEnd::Interrupted(SessionOutcome::TransportFailed(e.to_string())))?;
        stats.record_unit();
        Ok(())
    }
}

/// Pull the next fragment, optionally bounded by the read timeout
async fn read_fragment(
    stream: &mut FragmentStream,
    read_timeout: Option<Duration>,
) -> Result<Option<String>, UpstreamError> {
    match read_timeout {
        Some(limit) => tokio::time::timeout(limit, stream.next())
            .await
            .unwrap_or(Err(UpstreamError::Timeout(limit))),
        None => stream.next().await,
    }
}

/// Reader task: decode client frames until the connection ends
async fn read_frames<Src: FrameSource>(
    mut source: Src,
    gate: Arc<CancellationGate>,
    inputs: mpsc::Sender<SessionInput>,
    max_message_size: usize,
) {
    loop {
        let input = match source.next_frame().await {
            Ok(None) => SessionInput::Closed,
            Err(e) => SessionInput::Failed(e),
            Ok(Some(InboundFrame::Binary(_))) => {
                SessionInput::Fatal("Binary frames are not supported".to_string())
            }
            Ok(Some(InboundFrame::Text(text))) => {
                if let ValidationResult::Invalid(reason) =
                    validate_frame_size(&text, max_message_size)
                {
                    SessionInput::Fatal(reason)
                } else {
                    match decode_inbound(&text) {
                        Ok(ControlMessage::Cancel) => {
                            if gate.signal() {
                                tracing::debug!("Cancel accepted");
                            } else {
                                tracing::debug!("Cancel ignored, no request in flight");
                            }
                            continue;
                        }
                        Ok(ControlMessage::Request(envelope)) => {
                            gate.arm_if_idle();
                            SessionInput::Envelope(envelope)
                        }
                        Err(e) => SessionInput::Rejected(e),
                    }
                }
            }
        };

        if matches!(input, SessionInput::Envelope(_) | SessionInput::Rejected(_)) {
            match inputs.try_send(input) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Closed(_)) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let _ = inputs.send(SessionInput::Fatal(too_many_pending())).await;
                    return;
                }
            }
        }

        // Closed, Failed or Fatal: nothing is read after these
        let _ = inputs.send(input).await;
        return;
    }
}

fn too_many_pending() -> String {
    format!("Too many pending requests (max: {MAX_PENDING_INPUTS})")
}

async fn send_unit<Snk: FrameSink>(sink: &mut Snk, unit: OutputUnit) -> Result<(), TransportError> {
    let text = serde_json::to_string(&OutboundMessage::from(unit))
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    sink.send_frame(text).await
}

/// Best-effort final error message, then close
async fn send_fatal<Snk: FrameSink>(sink: &mut Snk, reason: &str) {
    tracing::warn!(reason, "Closing connection");
    let message = FatalMessage {
        error: reason.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&message) {
        let _ = sink.send_frame(text).await;
    }
    let _ = sink.close().await;
}
