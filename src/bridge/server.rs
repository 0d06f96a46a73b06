//! WebSocket Bridge server
//!
//! Serves `GET /ws/ssh/{connection_id}[?user_id=...]`. Each upgraded socket
//! resolves its connection record, then hands both halves of the socket to
//! the [`Relay`] for the lifetime of the session.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::protocol::{Frame, FrameSink, FrameSource, ProtocolError};
use super::relay::Relay;
use crate::config::StorageError;
use crate::ssh::{ConnectionRecord, SessionBroker};

/// Route prefix for shell sessions
pub const ROUTE_PREFIX: &str = "/ws/ssh/";

/// Maximum time for a client to finish the WebSocket handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const NOT_FOUND_MESSAGE: &str = "Connection not found";

/// Identity of one channel request, parsed from the upgrade URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub connection_id: String,
    pub user_id: Option<String>,
}

impl ChannelRequest {
    /// Parse `/ws/ssh/{id}` with an optional `user_id` query parameter
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        let id = uri.path().strip_prefix(ROUTE_PREFIX)?;
        if id.is_empty() || id.contains('/') {
            return None;
        }

        let user_id = uri.query().and_then(|query| {
            form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "user_id")
                .map(|(_, value)| value.into_owned())
                .filter(|value| !value.is_empty())
        });

        Some(Self {
            connection_id: id.to_string(),
            user_id,
        })
    }
}

/// Looks up the connection record a channel request refers to
#[async_trait]
pub trait ConnectionResolver: Send + Sync + 'static {
    async fn resolve(&self, request: &ChannelRequest) -> Result<ConnectionRecord, StorageError>;
}

fn ws_error(err: WsError) -> ProtocolError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ProtocolError::Closed,
        other => ProtocolError::Transport(other.to_string()),
    }
}

#[async_trait]
impl<S> FrameSink for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let text = frame.encode()?;
        SinkExt::send(self, Message::Text(text))
            .await
            .map_err(ws_error)
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        SinkExt::close(self).await.map_err(ws_error)
    }
}

#[async_trait]
impl<S> FrameSource for SplitStream<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Option<Result<Frame, ProtocolError>> {
        loop {
            let msg = match self.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(ws_error(e))),
            };

            match msg {
                Message::Text(text) => return Some(Frame::decode(&text)),
                Message::Binary(data) => {
                    return Some(
                        std::str::from_utf8(&data)
                            .map_err(|e| ProtocolError::Malformed(e.to_string()))
                            .and_then(Frame::decode),
                    )
                }
                Message::Close(_) => return None,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

/// WebSocket listener for shell sessions
pub struct BridgeServer {
    listener: TcpListener,
}

impl BridgeServer {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one relay task per socket
    pub async fn serve<B, R>(self, relay: Arc<Relay<B>>, resolver: Arc<R>)
    where
        B: SessionBroker,
        R: ConnectionResolver,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!("WebSocket bridge listening on {}", addr);
        }

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept WebSocket connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            // Disable Nagle's algorithm for low-latency interactive terminal
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }

            let relay = relay.clone();
            let resolver = resolver.clone();
            tokio::spawn(async move {
                handle_connection(stream, addr, relay, resolver).await;
            });
        }
    }
}

async fn handle_connection<B, R>(
    stream: TcpStream,
    addr: SocketAddr,
    relay: Arc<Relay<B>>,
    resolver: Arc<R>,
) where
    B: SessionBroker,
    R: ConnectionResolver,
{
    let mut request = None;
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match ChannelRequest::from_uri(req.uri()) {
            Some(parsed) => {
                request = Some(parsed);
                Ok(response)
            }
            None => {
                debug!("Rejecting upgrade for {} from {}", req.uri().path(), addr);
                let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };

    let ws_stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback)).await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
        Err(_) => {
            warn!("WebSocket handshake timeout for {}", addr);
            return;
        }
    };

    let Some(request) = request else {
        return;
    };

    info!(
        "WebSocket connected from {} for connection {}",
        addr, request.connection_id
    );

    let (mut sink, source) = ws_stream.split();

    let record = match resolver.resolve(&request).await {
        Ok(record) => record,
        Err(e) => {
            warn!(
                "Connection {} not resolved for user {:?}: {}",
                request.connection_id, request.user_id, e
            );
            let _ = FrameSink::send(&mut sink, &Frame::error(NOT_FOUND_MESSAGE)).await;
            let _ = FrameSink::close(&mut sink).await;
            return;
        }
    };

    let outcome = relay.run(&record, sink, source).await;
    info!(
        "WebSocket session for connection {} from {} ended: {:?}",
        request.connection_id, addr, outcome
    );
}
