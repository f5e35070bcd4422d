//! WebSocket Transport
//!
//! Serves relay sessions to remote clients over WebSocket. Every accepted
//! connection runs its own [`RelaySession`].
//!
//! # Handshake
//!
//! Only upgrades on [`RELAY_PATH`] are accepted; any other path is answered
//! with `404`. Each connection holds one of `max_connections` permits from
//! accept until its session ends; without a spare permit the handshake is
//! answered with `503`.
//!
//! # Frames
//!
//! Text frames carry JSON control messages. Binary frames end the session
//! with a fatal error message. Ping frames are answered by tungstenite, and a
//! close frame ends the session like a dropped connection.
//!
//! # Example
//!
//! ```ignore
//! use relay_core::transport::websocket::WebSocketServer;
//!
//! let server = WebSocketServer::new(config, backend);
//! let listener = tokio::net::TcpListener::bind(&config.server.ws_addr).await?;
//! server.serve(listener, shutdown_signal).await;
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::traits::{ConnectionId, FrameSink, FrameSource, InboundFrame, TransportError};
use crate::backend::UpstreamBackend;
use crate::config::RelayConfig;
use crate::session::RelaySession;

/// The only path that upgrades to a relay session
pub const RELAY_PATH: &str = "/models/inference";

/// Read half of a WebSocket connection
pub struct WebSocketSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Write half of a WebSocket connection
pub struct WebSocketSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Split an upgraded stream into relay source and sink halves
#[must_use]
pub fn split<S>(ws: WebSocketStream<S>) -> (WebSocketSource<S>, WebSocketSink<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (
        WebSocketSource { inner: stream },
        WebSocketSink { inner: sink },
    )
}

#[async_trait]
impl<S> FrameSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_frame(&mut self) -> Result<Option<InboundFrame>, TransportError> {
        loop {
            match self.inner.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(InboundFrame::Text(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(InboundFrame::Binary(data))),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                    TransportError::ConnectionClosed
                }
                other => TransportError::SendFailed(other.to_string()),
            })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e.to_string())),
        }
    }
}

/// Bookkeeping for a live connection
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    /// Remote address, when known
    pub peer: Option<SocketAddr>,
    /// When the handshake completed
    pub connected_at: Instant,
}

/// Removes a connection from the registry when its task ends
struct ConnectionGuard {
    connections: Arc<DashMap<ConnectionId, ConnectionInfo>>,
    id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some((id, info)) = self.connections.remove(&self.id) {
            tracing::info!(
                conn = %id,
                peer = ?info.peer,
                connected_for = ?info.connected_at.elapsed(),
                "Client disconnected"
            );
        }
    }
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

/// Handshake policy: right path, spare capacity
fn check_handshake(
    request: &Request,
    response: Response,
    at_capacity: bool,
) -> Result<Response, ErrorResponse> {
    if request.uri().path() != RELAY_PATH {
        return Err(reject(StatusCode::NOT_FOUND, "Not Found"));
    }
    if at_capacity {
        return Err(reject(
            StatusCode::SERVICE_UNAVAILABLE,
            "Too many connections",
        ));
    }
    Ok(response)
}

/// Run the server side of the opening handshake
async fn handshake<S>(io: S, at_capacity: bool) -> Result<WebSocketStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio_tungstenite::accept_hdr_async(io, move |request: &Request, response: Response| {
        check_handshake(request, response, at_capacity)
    })
    .await
    .map_err(|e| TransportError::HandshakeFailed(e.to_string()))
}

/// WebSocket listener running one relay session per connection
pub struct WebSocketServer {
    config: Arc<RelayConfig>,
    backend: Arc<dyn UpstreamBackend>,
    connections: Arc<DashMap<ConnectionId, ConnectionInfo>>,
    permits: Arc<Semaphore>,
}

impl WebSocketServer {
    /// Create a server sharing one configuration and backend across sessions
    #[must_use]
    pub fn new(config: Arc<RelayConfig>, backend: Arc<dyn UpstreamBackend>) -> Self {
        let permits = Arc::new(Semaphore::new(config.server.max_connections));
        Self {
            permits,
            config,
            backend,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Number of live sessions
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Sessions already running are left to finish on their own. Accept
    /// errors are logged and skipped.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, path = RELAY_PATH, "WebSocket relay listening");
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!(
                        live = self.connection_count(),
                        "WebSocket relay stopped accepting connections"
                    );
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                        }
                        self.spawn_connection(stream, Some(peer));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                },
            }
        }
    }

    /// Handshake and serve one connection on its own task
    pub fn spawn_connection<S>(&self, io: S, peer: Option<SocketAddr>) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Held by the connection task until its session ends
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok();
        let config = Arc::clone(&self.config);
        let backend = Arc::clone(&self.backend);
        let connections = Arc::clone(&self.connections);

        tokio::spawn(async move {
            let ws = match handshake(io, permit.is_none()).await {
                Ok(ws) => ws,
                Err(e) => {
                    tracing::debug!(peer = ?peer, error = %e, "WebSocket handshake rejected");
                    return;
                }
            };

            let id = ConnectionId::new();
            connections.insert(
                id.clone(),
                ConnectionInfo {
                    peer,
                    connected_at: Instant::now(),
                },
            );
            let _guard = ConnectionGuard {
                connections,
                id: id.clone(),
            };
            tracing::info!(conn = %id, peer = ?peer, "Client connected");

            let (source, sink) = split(ws);
            let mut session = RelaySession::new(config, backend).with_connection_id(id);
            session.run(source, sink).await;
            drop(permit);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::ScriptedBackend;
    use crate::security::AllowList;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    type ClientStream = WebSocketStream<DuplexStream>;

    fn server(backend: ScriptedBackend, max_connections: usize) -> WebSocketServer {
        let mut config = RelayConfig::default()
            .with_allowed_models(AllowList::new(["modelA"]))
            .with_pacing_delay(Duration::ZERO);
        config.server.max_connections = max_connections;
        WebSocketServer::new(config.into_shared(), Arc::new(backend))
    }

    async fn connect(server: &WebSocketServer, path: &str) -> Result<ClientStream, WsError> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        server.spawn_connection(server_io, None);
        tokio_tungstenite::client_async(format!("ws://localhost{path}"), client_io)
            .await
            .map(|(ws, _)| ws)
    }

    async fn next_json(ws: &mut ClientStream) -> serde_json::Value {
        loop {
            match ws.next().await.expect("stream ended").expect("recv failed") {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Close(_) => return serde_json::Value::Null,
                _ => {}
            }
        }
    }

    async fn wait_for_count(server: &WebSocketServer, count: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while server.connection_count() != count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("connection count never settled");
    }

    #[tokio::test]
    async fn test_relays_request_over_websocket() {
        let server = server(ScriptedBackend::with_fragments(["He", "llo"]), 10);
        let mut ws = connect(&server, RELAY_PATH).await.unwrap();

        let request = serde_json::json!({
            "model_name": "modelA",
            "conservation": [{"role": "user", "content": "Hi"}],
        });
        ws.send(Message::Text(request.to_string())).await.unwrap();

        assert_eq!(
            next_json(&mut ws).await,
            serde_json::json!({"text": "He", "status": "continue"})
        );
        assert_eq!(
            next_json(&mut ws).await,
            serde_json::json!({"text": "llo", "status": "continue"})
        );
        assert_eq!(
            next_json(&mut ws).await,
            serde_json::json!({"text": null, "status": "done"})
        );
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_rejects_other_paths() {
        let server = server(ScriptedBackend::with_fragments(["x"]), 10);
        assert!(connect(&server, "/chat").await.is_err());
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_when_at_capacity() {
        let server = server(ScriptedBackend::with_fragments(["x"]), 1);
        let _first = connect(&server, RELAY_PATH).await.unwrap();
        wait_for_count(&server, 1).await;
        assert!(connect(&server, RELAY_PATH).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_handshakes_respect_capacity() {
        let server = server(ScriptedBackend::with_fragments(["x"]), 1);
        let (a, b) = tokio::join!(
            connect(&server, RELAY_PATH),
            connect(&server, RELAY_PATH)
        );
        assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
        wait_for_count(&server, 1).await;
    }

    #[tokio::test]
    async fn test_capacity_returns_after_close() {
        let server = server(ScriptedBackend::with_fragments(["x"]), 1);
        let mut first = connect(&server, RELAY_PATH).await.unwrap();
        wait_for_count(&server, 1).await;

        first.close(None).await.unwrap();
        wait_for_count(&server, 0).await;
        assert_eq!(server.permits.available_permits(), 1);

        assert!(connect(&server, RELAY_PATH).await.is_ok());
    }

    #[tokio::test]
    async fn test_handshake_failure_is_transport_error() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = tokio::spawn(tokio_tungstenite::client_async(
            "ws://localhost/chat",
            client_io,
        ));

        let result = handshake(server_io, false).await;
        assert!(matches!(result, Err(TransportError::HandshakeFailed(_))));
        assert!(client.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_binary_frame_is_fatal() {
        let server = server(ScriptedBackend::with_fragments(["x"]), 10);
        let mut ws = connect(&server, RELAY_PATH).await.unwrap();

        ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();

        let fatal = next_json(&mut ws).await;
        assert!(fatal["error"]
            .as_str()
            .unwrap()
            .contains("Binary frames are not supported"));
        assert_eq!(next_json(&mut ws).await, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_connection_released_after_close() {
        let server = server(ScriptedBackend::with_fragments(["x"]), 10);
        let mut ws = connect(&server, RELAY_PATH).await.unwrap();
        wait_for_count(&server, 1).await;

        ws.close(None).await.unwrap();
        wait_for_count(&server, 0).await;
    }
}
