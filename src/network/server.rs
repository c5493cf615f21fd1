//! WebSocket Front End
//!
//! Async WebSocket server standing in as the host transport: it accepts
//! connections, frames the four wire shapes (plus the legacy join packet)
//! behind a one-byte discriminant, and feeds transport events into the
//! protocol loop. Outbound frames are drained in priority order, which is
//! where the interceptor's per-tag override takes effect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::network::envelope::Channel;
use crate::network::handshake::LegacyJoin;
use crate::network::protocol::{Protocol, ProtocolConfig, ProtocolEvent};
use crate::network::session::{DefaultHooks, GameHooks, LifecycleEvent};
use crate::network::transport::{ConnId, OutboundFrame, Transport};

/// Wire discriminant for the legacy join packet (the four channels use
/// 0..=3).
pub const LEGACY_JOIN_DISCRIMINANT: u8 = 4;

/// Front-end configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Protocol-core configuration.
    pub protocol: ProtocolConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            max_connections: 1000,
            protocol: ProtocolConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("WARDEN_BIND") {
            if let Ok(addr) = bind.parse() {
                config.bind_addr = addr;
            }
        }
        if let Ok(addr) = std::env::var("WARDEN_ADVERTISED_ADDR") {
            config.protocol.advertised_addr = addr;
        }
        if let Ok(v) = std::env::var("WARDEN_MIN_COMPAT_VERSION") {
            if let Ok(v) = v.parse() {
                config.protocol.min_compat_version = v;
            }
        }
        if let Ok(v) = std::env::var("WARDEN_MAX_CONNECTIONS") {
            if let Ok(v) = v.parse() {
                config.max_connections = v;
            }
        }
        config
    }
}

/// Front-end errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

enum WriterCmd {
    Frame(OutboundFrame),
    Close(String),
}

/// [`Transport`] implementation backed by per-connection writer channels.
#[derive(Default)]
struct WsTransport {
    links: Mutex<HashMap<ConnId, mpsc::UnboundedSender<WriterCmd>>>,
}

impl WsTransport {
    fn register(&self, conn: ConnId, tx: mpsc::UnboundedSender<WriterCmd>) {
        self.links.lock().unwrap().insert(conn, tx);
    }

    fn unregister(&self, conn: ConnId) {
        self.links.lock().unwrap().remove(&conn);
    }

    fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

impl Transport for WsTransport {
    fn send(&self, conn: ConnId, frame: OutboundFrame) {
        if let Some(tx) = self.links.lock().unwrap().get(&conn) {
            let _ = tx.send(WriterCmd::Frame(frame));
        }
    }

    fn close(&self, conn: ConnId, reason: &str) {
        if let Some(tx) = self.links.lock().unwrap().get(&conn) {
            let _ = tx.send(WriterCmd::Close(reason.to_string()));
        }
    }
}

/// The connection-warden server.
pub struct WardenServer {
    config: ServerConfig,
    hooks: Arc<dyn GameHooks>,
    transport: Arc<WsTransport>,
    next_conn: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl WardenServer {
    /// Create a server with the default (stand-in) game hooks.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a server bound to a real game layer.
    pub fn with_hooks(config: ServerConfig, hooks: Arc<dyn GameHooks>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            hooks,
            transport: Arc::new(WsTransport::default()),
            next_conn: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Run the server: spawn the protocol loop, then accept connections
    /// until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let protocol = Protocol::new(
            self.config.protocol.clone(),
            self.transport.clone(),
            self.hooks.clone(),
        );
        let events = protocol.sender();
        let mut lifecycle = protocol.subscribe();
        tokio::spawn(protocol.run());

        // Keep the lifecycle stream drained so slow subscribers elsewhere
        // never lag the channel; the log is the default consumer.
        tokio::spawn(async move {
            while let Ok(ev) = lifecycle.recv().await {
                match ev {
                    LifecycleEvent::PlayerConnected { conn, name, enhanced, .. } => {
                        info!(%conn, %name, enhanced, "player connected");
                    }
                    LifecycleEvent::ConnectionOpened { conn } => {
                        debug!(%conn, "connection opened");
                    }
                    LifecycleEvent::LegacyJoin { conn } => {
                        debug!(%conn, "legacy join received");
                    }
                }
            }
        });

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("warden server listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.transport.link_count() >= self.config.max_connections {
                                warn!("connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            let conn = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
                            debug!(%conn, %addr, "accepting connection");
                            self.handle_connection(conn, stream, addr, events.clone());
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(
        &self,
        conn: ConnId,
        stream: TcpStream,
        addr: SocketAddr,
        events: mpsc::UnboundedSender<ProtocolEvent>,
    ) {
        let transport = self.transport.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!(%conn, %addr, "websocket handshake failed: {}", e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<WriterCmd>();

            // Register the writer before the protocol hears about the
            // connection, so a guard kick during connect has somewhere to
            // go.
            transport.register(conn, cmd_tx);
            let _ = events.send(ProtocolEvent::Connected {
                conn,
                addr: addr.ip(),
            });

            // Writer: drain all queued commands and send frames in
            // priority order; a close flushes after the batch.
            let writer_task = tokio::spawn(async move {
                let mut batch: Vec<WriterCmd> = Vec::new();
                'writer: while let Some(first) = cmd_rx.recv().await {
                    batch.push(first);
                    while let Ok(next) = cmd_rx.try_recv() {
                        batch.push(next);
                    }
                    batch.sort_by_key(|cmd| {
                        std::cmp::Reverse(match cmd {
                            WriterCmd::Frame(f) => f.priority as i16,
                            // Closes go last so queued frames still flush.
                            WriterCmd::Close(_) => i16::MIN,
                        })
                    });

                    for cmd in batch.drain(..) {
                        match cmd {
                            WriterCmd::Frame(frame) => {
                                let mut bytes = Vec::with_capacity(frame.bytes.len() + 1);
                                bytes.push(frame.channel.discriminant());
                                bytes.extend_from_slice(&frame.bytes);
                                if ws_sender.send(Message::Binary(bytes)).await.is_err() {
                                    break 'writer;
                                }
                            }
                            WriterCmd::Close(reason) => {
                                let _ = ws_sender
                                    .send(Message::Close(Some(CloseFrame {
                                        code: CloseCode::Policy,
                                        reason: reason.into(),
                                    })))
                                    .await;
                                break 'writer;
                            }
                        }
                    }
                }
            });

            // Reader: route discriminant-framed messages into the loop.
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                Self::route_inbound(conn, &data, &events);
                            }
                            Some(Ok(Message::Text(_))) => {
                                debug!(%conn, "unexpected text frame dropped");
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!(%conn, "peer closed");
                                break;
                            }
                            Some(Err(e)) => {
                                debug!(%conn, "websocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        transport.close(conn, "server shutting down");
                        break;
                    }
                }
            }

            writer_task.abort();
            transport.unregister(conn);
            let _ = events.send(ProtocolEvent::Disconnected { conn });
            debug!(%conn, "connection task finished");
        });
    }

    /// Decode one inbound binary message and post the matching event.
    fn route_inbound(conn: ConnId, data: &[u8], events: &mpsc::UnboundedSender<ProtocolEvent>) {
        let Some((&disc, payload)) = data.split_first() else {
            return;
        };

        if disc == LEGACY_JOIN_DISCRIMINANT {
            match LegacyJoin::read(payload) {
                Ok(join) => {
                    let _ = events.send(ProtocolEvent::LegacyJoin { conn, join });
                }
                Err(e) => {
                    debug!(%conn, "malformed legacy join dropped: {}", e);
                }
            }
            return;
        }

        match Channel::from_discriminant(disc) {
            Some(channel) => {
                let _ = events.send(ProtocolEvent::Frame {
                    conn,
                    channel,
                    raw: payload.to_vec(),
                });
            }
            None => {
                debug!(%conn, disc, "unknown frame discriminant dropped");
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub fn connection_count(&self) -> usize {
        self.transport.link_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.protocol.min_compat_version, crate::MIN_COMPAT_VERSION);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = WardenServer::new(config);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = WardenServer::new(config);
        server.shutdown();
        // Should not panic
    }

    #[tokio::test]
    async fn test_route_inbound_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = ConnId(1);

        // A channel frame routes with its payload intact.
        WardenServer::route_inbound(conn, &[0, 9, 9], &tx);
        match rx.try_recv().unwrap() {
            ProtocolEvent::Frame { channel, raw, .. } => {
                assert_eq!(channel, Channel::ReliableBinary);
                assert_eq!(raw, vec![9, 9]);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Unknown discriminants and empty messages are dropped.
        WardenServer::route_inbound(conn, &[42, 1], &tx);
        WardenServer::route_inbound(conn, &[], &tx);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_inbound_legacy_join() {
        use crate::network::wire::WireWriter;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut w = WireWriter::new();
        w.put_string("Bob")
            .put_string("uuid-b")
            .put_string("usid-b")
            .put_bool(false)
            .put_u32(0)
            .put_string("de");
        let mut data = vec![LEGACY_JOIN_DISCRIMINANT];
        data.extend_from_slice(&w.into_bytes());

        WardenServer::route_inbound(ConnId(1), &data, &tx);
        match rx.try_recv().unwrap() {
            ProtocolEvent::LegacyJoin { join, .. } => {
                assert_eq!(join.name, "Bob");
                assert_eq!(join.locale, "de");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
