//! Core server: accepts routed WebSocket connections and hands them to the broker.

use crate::config::ServerConfig;
use crate::session::SessionBroker;
use crate::transport::websocket::{self, Route, WebSocketConnection, WebSocketSink};
use flexitty_core::{ControlMessage, FlexiError, FlexiResult, SessionId};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// The flexitty server instance.
pub struct FlexiServer {
    config: ServerConfig,
    broker: Arc<SessionBroker>,
}

impl FlexiServer {
    pub fn new(config: ServerConfig) -> Self {
        let broker = Arc::new(SessionBroker::new(config.broker.clone()));
        Self { config, broker }
    }

    /// Accept connections until `shutdown` resolves, then stop every session.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> FlexiResult<()> {
        let server = Arc::new(self);
        let mut ws_rx = websocket::start_listener(server.config.listen).await?;

        info!(
            listen = %server.config.listen,
            command = %server.config.command,
            "flexitty ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("received shutdown signal");
                    break;
                }
                conn = ws_rx.recv() => match conn {
                    Some(conn) => {
                        let srv = server.clone();
                        tokio::spawn(async move {
                            let remote = conn.remote_addr;
                            if let Err(e) = srv.handle_connection(conn).await {
                                warn!(remote = %remote, error = %e, "connection error");
                            }
                        });
                    }
                    None => {
                        info!("listener closed, shutting down");
                        break;
                    }
                },
            }
        }

        server.broker.shutdown().await;
        Ok(())
    }

    /// Create or look up the requested session and attach the connection to it.
    async fn handle_connection(&self, conn: WebSocketConnection) -> FlexiResult<()> {
        let route = conn.route.clone();
        let sink = Arc::new(WebSocketSink::new(conn));

        let id = match route {
            Route::NewSession => match self.new_session().await {
                Ok(id) => id,
                Err(e) => return Self::refuse(&sink, e).await,
            },
            Route::Attach(id) => {
                if !self.broker.exists(&id).await {
                    return Self::refuse(&sink, FlexiError::SessionNotFound(id.to_string())).await;
                }
                id
            }
        };

        sink.send_control(&ControlMessage::Session { id: id.to_string() })
            .await?;
        self.broker.attach(&id, sink).await?;
        Ok(())
    }

    async fn new_session(&self) -> FlexiResult<SessionId> {
        self.broker
            .create_session(&self.config.command, &self.config.args)
            .await
    }

    /// Tell the client why it cannot attach, then close the connection.
    async fn refuse(sink: &WebSocketSink, err: FlexiError) -> FlexiResult<()> {
        let msg = ControlMessage::Error {
            message: err.to_string(),
        };
        if let Err(e) = sink.send_control(&msg).await {
            warn!(error = %e, "failed to report error to client");
        }
        sink.close().await;
        Err(err)
    }
}
