//! WebSocket front door: adapts real sockets to the document rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── DocumentRegistry ── DocumentRoom ("path" name)
//! Client B ──┘                           │
//!                               ┌────────┼────────┐
//!                               ▼        ▼        ▼
//!                            yrs Doc  Awareness  Persistence
//! ```
//!
//! One task per connection runs a select loop over three sources: the
//! room's outbound frame queue, the inbound WebSocket stream and the
//! liveness ticker. The document name is the upgrade request path with
//! the leading slash stripped; an empty path maps to "default". Exiting
//! the loop for any reason (clean close, socket error, missed pong,
//! closed queue) funnels into the same idempotent
//! [`DocumentRoom::close_connection`].
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::connection::{Heartbeat, Probe, DEFAULT_OUTBOUND_CAPACITY, DEFAULT_PING_INTERVAL};
use crate::persistence::{
    Persistence, DEFAULT_DEBOUNCE_MAX_WAIT, DEFAULT_DEBOUNCE_WAIT,
};
use crate::registry::DocumentRegistry;
use crate::room::{ContentInitializer, DocumentRoom, ErrorObserver, RoomOptions, UpdateCallback};

/// Relay configuration, read once at construction.
#[derive(Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Interval between liveness probes per connection
    pub ping_interval: Duration,
    /// Outbound frame queue capacity per connection
    pub outbound_capacity: usize,
    /// CRDT garbage collection (disable when keeping snapshots)
    pub gc: bool,
    /// Quiet period for the debounced update callback
    pub debounce_wait: Duration,
    /// Hard cap per debounce burst
    pub debounce_max_wait: Duration,
    /// Durability hooks (None = in-memory only)
    pub persistence: Option<Arc<dyn Persistence>>,
    /// Seeds default content into fresh rooms
    pub content_initializer: Option<ContentInitializer>,
    /// Debounced document-changed callback
    pub on_update: Option<UpdateCallback>,
    /// Receives every swallowed room fault
    pub on_error: Option<ErrorObserver>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            gc: true,
            debounce_wait: DEFAULT_DEBOUNCE_WAIT,
            debounce_max_wait: DEFAULT_DEBOUNCE_MAX_WAIT,
            persistence: None,
            content_initializer: None,
            on_update: None,
            on_error: None,
        }
    }
}

impl RelayConfig {
    fn room_options(&self) -> RoomOptions {
        RoomOptions {
            gc: self.gc,
            outbound_capacity: self.outbound_capacity,
            debounce_wait: self.debounce_wait,
            debounce_max_wait: self.debounce_max_wait,
            persistence: self.persistence.clone(),
            content_initializer: self.content_initializer.clone(),
            on_update: self.on_update.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<DocumentRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Create a relay server with the given configuration.
    pub fn new(config: RelayConfig) -> Self {
        let registry = DocumentRegistry::new(config.room_options());
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Accept WebSocket connections until the task is dropped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let ping_interval = self.config.ping_interval;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, registry, stats, ping_interval).await
                {
                    log::debug!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    /// Serve one WebSocket connection for its whole lifetime.
    async fn handle_connection(
        stream: TcpStream,
        registry: Arc<DocumentRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        ping_interval: Duration,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut doc_name = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp| {
            doc_name = document_name(req.uri().path());
            Ok::<Response, ErrorResponse>(resp)
        })
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (room, conn_id, mut outbound_rx) = registry.subscribe(&doc_name).await;
        log::info!("Connection {conn_id} opened for document {doc_name}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_rooms = registry.room_count().await;
        }

        let mut heartbeat = Heartbeat::new();
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + ping_interval,
            ping_interval,
        );

        loop {
            tokio::select! {
                // Frame queued by the room for this connection
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if ws_sender.send(WsMessage::Binary(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        // Room closed this connection's queue
                        None => break,
                    }
                }

                // Inbound WebSocket traffic
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            room.handle_message(conn_id, &bytes).await;
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            if ws_sender.send(WsMessage::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Pong(_))) => heartbeat.record_pong(),
                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::debug!("Connection {conn_id} closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {
                            log::debug!("Connection {conn_id}: ignoring non-binary frame");
                        }
                        Some(Err(e)) => {
                            log::debug!("WebSocket error on connection {conn_id}: {e}");
                            break;
                        }
                    }
                }

                // Liveness probe
                _ = ticker.tick() => {
                    match heartbeat.tick() {
                        Probe::Ping => {
                            if ws_sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                                break;
                            }
                        }
                        Probe::Evict => {
                            log::info!("Connection {conn_id} missed liveness probe, evicting");
                            break;
                        }
                    }
                }
            }
        }

        room.close_connection(conn_id).await;
        log::info!("Connection {conn_id} closed for document {doc_name}");

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = registry.room_count().await;
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the document registry.
    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// Resolve a room directly, bypassing the transport.
    pub async fn room(&self, name: &str) -> Arc<DocumentRoom> {
        self.registry.resolve(name).await
    }
}

/// Document name from the upgrade request path: leading slash stripped,
/// query string excluded, empty path mapped to "default".
fn document_name(path: &str) -> String {
    let name = path
        .trim_start_matches('/')
        .split('?')
        .next()
        .unwrap_or_default();
    if name.is_empty() {
        "default".to_string()
    } else {
        name.to_string()
    }
}
