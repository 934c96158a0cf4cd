//! WebSocket listener using tokio-tungstenite.
//!
//! The upgrade path selects what the connection wants:
//!
//! - `/session/new`: start a new session and attach to it
//! - `/session/<id>` (or `/session/<id>/ws`): attach to an existing session
//!
//! Malformed paths and ids are refused during the handshake, so they never
//! reach the broker. Accepted connections are wrapped in [`WebSocketSink`].

use flexitty_core::{
    ControlMessage, FlexiError, FlexiResult, SessionId, Sink, SinkEvent, SinkFuture,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Maximum inbound frame size (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// What an upgrade request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    NewSession,
    Attach(SessionId),
}

/// Map an upgrade path to a [`Route`].
pub fn parse_route(path: &str) -> Result<Route, (StatusCode, String)> {
    let path = path.split('?').next().unwrap_or_default();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["session", "new"] => Ok(Route::NewSession),
        ["session", id] | ["session", id, "ws"] => id
            .parse::<SessionId>()
            .map(Route::Attach)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string())),
        _ => Err((StatusCode::NOT_FOUND, format!("no route for {path}"))),
    }
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

/// An accepted, routed WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    pub route: Route,
}

/// Bind `bind_addr` and start accepting connections.
///
/// Returns a receiver that yields upgraded connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> FlexiResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| FlexiError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match accept(stream).await {
                            Ok((ws_stream, route)) => {
                                debug!(remote = %addr, ?route, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    route,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

/// Perform the upgrade handshake, routing on the request path.
pub async fn accept(stream: TcpStream) -> FlexiResult<(WebSocketStream<TcpStream>, Route)> {
    let mut route = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match parse_route(req.uri().path()) {
            Ok(r) => {
                route = Some(r);
                Ok(resp)
            }
            Err((status, reason)) => Err(reject(status, reason)),
        }
    })
    .await
    .map_err(|e| FlexiError::Transport(format!("WS handshake failed: {e}")))?;

    let route = route.ok_or_else(|| FlexiError::Transport("handshake produced no route".into()))?;
    Ok((ws_stream, route))
}

/// A WebSocket connection acting as a session sink.
///
/// Terminal output goes out as binary frames. Inbound binary frames are
/// terminal input; text frames are either a JSON control message or input.
pub struct WebSocketSink {
    writer: Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>,
    reader: Mutex<SplitStream<WebSocketStream<TcpStream>>>,
    remote_addr: SocketAddr,
}

impl WebSocketSink {
    pub fn new(conn: WebSocketConnection) -> Self {
        let (writer, reader) = conn.ws_stream.split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            remote_addr: conn.remote_addr,
        }
    }

    /// Send a JSON control message as a text frame.
    pub async fn send_control(&self, msg: &ControlMessage) -> FlexiResult<()> {
        let json = msg.to_json()?;
        self.writer
            .lock()
            .await
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| FlexiError::Transport(format!("WS send failed: {e}")))
    }

    /// Send a close frame. Errors are ignored; the peer may already be gone.
    pub async fn close(&self) {
        let _ = self.writer.lock().await.close().await;
    }

    async fn next_event(&self) -> FlexiResult<Option<SinkEvent>> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Binary(data))) => {
                    check_size(data.len())?;
                    return Ok(Some(SinkEvent::Input(data.to_vec())));
                }
                Some(Ok(Message::Text(text))) => {
                    let text = text.to_string();
                    check_size(text.len())?;
                    match ControlMessage::parse(&text) {
                        Some(ControlMessage::Resize { cols, rows }) => {
                            return Ok(Some(SinkEvent::Resize { cols, rows }));
                        }
                        Some(other) => {
                            debug!(remote = %self.remote_addr, ?other, "ignoring control message");
                        }
                        None => return Ok(Some(SinkEvent::Input(text.into_bytes()))),
                    }
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.writer.lock().await.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(FlexiError::Transport(format!("WS recv failed: {e}")));
                }
                None => return Ok(None),
            }
        }
    }
}

fn check_size(len: usize) -> FlexiResult<()> {
    if len > MAX_WS_FRAME_SIZE {
        return Err(FlexiError::Transport(format!(
            "WS frame too large: {len} bytes (max {MAX_WS_FRAME_SIZE})"
        )));
    }
    Ok(())
}

impl Sink for WebSocketSink {
    fn send<'a>(&'a self, data: &'a [u8]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            self.writer
                .lock()
                .await
                .send(Message::Binary(data.to_vec().into()))
                .await
                .map_err(|e| FlexiError::Transport(format!("WS send failed: {e}")))
        })
    }

    fn receive(&self) -> SinkFuture<'_, Option<SinkEvent>> {
        Box::pin(self.next_event())
    }

    fn label(&self) -> String {
        self.remote_addr.to_string()
    }
}
