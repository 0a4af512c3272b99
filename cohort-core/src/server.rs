//! WebSocket front door of one node.
//!
//! ```text
//! Client A ──┐                        ┌── handshake / handle_message
//!             ├── connection task ────┤
//! Client B ──┘    select! {           └── SessionRegistry
//!                   ws frame  → registry → direct replies
//!                   outbound  ← channel forwarders (broadcasts, rehome)
//!                 }
//!
//! Monitor ────── /monitor ── HealthReport JSON every tick (read-only)
//! ```
//!
//! Each frame is one JSON `{type, payload}` envelope in a text message.
//! Frames that do not decode are answered with `bad_message` and the
//! connection stays open. When the registry drops a session (reaped,
//! migrated, evicted) its outbound queue closes and the connection is
//! closed from this side.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::healer::AutoHealer;
use crate::protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage};
use crate::session::SessionRegistry;

/// Path of the read-only monitoring feed.
pub const MONITOR_PATH: &str = "/monitor";

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Buffered outbound messages per connection
    pub outbound_capacity: usize,
    /// Interval between monitoring reports
    pub monitor_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            monitor_interval: Duration::from_secs(10),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub monitor_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

/// Accepts client and monitor connections for one node.
pub struct SessionServer {
    config: ServerConfig,
    sessions: Arc<SessionRegistry>,
    healer: Arc<AutoHealer>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SessionServer {
    pub fn new(config: ServerConfig, sessions: Arc<SessionRegistry>, healer: Arc<AutoHealer>) -> Self {
        Self {
            config,
            sessions,
            healer,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind to the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!(
            "Session server for node {} listening on {}",
            self.sessions.node_id(),
            listener.local_addr()?
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let sessions = self.sessions.clone();
            let healer = self.healer.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, sessions, healer, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        sessions: Arc<SessionRegistry>,
        healer: Arc<AutoHealer>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                path = request.uri().path().to_string();
                Ok(response)
            },
        )
        .await?;

        if path == MONITOR_PATH {
            stats.write().await.monitor_connections += 1;
            return Self::handle_monitor(ws_stream, addr, healer, config.monitor_interval).await;
        }
        Self::handle_session(ws_stream, addr, sessions, stats, config).await
    }

    async fn handle_session(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        sessions: Arc<SessionRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (outbound_tx, mut outbound) = mpsc::channel(config.outbound_capacity.max(1));
        let session_id = match sessions.handshake(outbound_tx) {
            Ok(id) => id,
            Err(e) => {
                stats.write().await.rejected_connections += 1;
                send(&mut ws_sender, &ServerMessage::error(e.code(), e.to_string())).await?;
                ws_sender.send(Message::Close(None)).await?;
                return Ok(());
            }
        };

        log::info!("WebSocket connection established from {addr} (session {session_id})");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result: Result<(), ServerError> = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket frame
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                let replies = match ClientMessage::decode(text.as_str()) {
                                    Ok(message) => sessions.handle_message(&session_id, message).await,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        vec![ServerMessage::error(ErrorCode::BadMessage, e.to_string())]
                                    }
                                };
                                for reply in &replies {
                                    send(&mut ws_sender, reply).await?;
                                }
                            }

                            Some(Ok(Message::Binary(_))) => {
                                send(
                                    &mut ws_sender,
                                    &ServerMessage::error(ErrorCode::BadMessage, "expected a JSON text frame"),
                                )
                                .await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Broadcasts and registry notices for this session
                    msg = outbound.recv() => {
                        match msg {
                            Some(message) => send(&mut ws_sender, &message).await?,
                            None => {
                                log::info!("Session {session_id} ended by the registry, closing {addr}");
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup runs on every exit path, including send failures.
        if let Err(e) = sessions.disconnect(&session_id).await {
            log::warn!("Cleanup of session {session_id} incomplete: {e}");
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    async fn handle_monitor(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        healer: Arc<AutoHealer>,
        interval: Duration,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut ticker = tokio::time::interval(interval);
        log::info!("Monitor attached from {addr}");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = serde_json::to_string(&healer.report())
                        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                    ws_sender.send(Message::Text(report.into())).await?;
                }
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                        _ => {}
                    }
                }
            }
        }
        log::info!("Monitor detached from {addr}");
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

async fn send(sink: &mut WsSink, message: &ServerMessage) -> Result<(), ServerError> {
    let text = message.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.monitor_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_monitor_path() {
        assert_eq!(MONITOR_PATH, "/monitor");
    }
}
