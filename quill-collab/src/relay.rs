//! WebSocket relay with room-based routing.
//!
//! Architecture:
//! ```text
//! Session A ──┐                         ┌──► Session B
//!             ├── /notes ── BroadcastGroup ──┤
//! Session C ──┘                         └──► Session A, C (not the sender)
//! ```
//!
//! The relay holds no document state. It forwards every text frame to
//! the other connections on the same path; sessions converge through
//! their own operations and anti-entropy sync.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::RoomManager;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it starts lagging
    pub broadcast_capacity: usize,
    /// Connections beyond this are refused
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub frames_relayed: u64,
    pub bytes_relayed: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    frames_relayed: AtomicU64,
    bytes_relayed: AtomicU64,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    counters: Arc<Counters>,
    next_connection: Arc<AtomicU64>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(config.broadcast_capacity)),
            config,
            counters: Arc::new(Counters::default()),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let counters = self.counters.clone();
            let max_peers = self.config.max_peers_per_room;
            let id = self.next_connection.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, id, rooms, counters, max_peers).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        id: u64,
        rooms: Arc<RoomManager>,
        counters: Arc<Counters>,
        max_peers: usize,
    ) -> Result<(), BoxError> {
        let mut path = String::new();
        let mut ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            Ok(resp)
        })
        .await?;

        let room = match path.trim_matches('/') {
            "" => "default".to_string(),
            name => name.to_string(),
        };

        let group = rooms.room(&room).await;
        if group.member_count() >= max_peers {
            log::warn!("Room {room} full, refusing {addr}");
            counters.rejected_connections.fetch_add(1, Ordering::Relaxed);
            ws_stream.close(None).await?;
            rooms.release(&room).await;
            return Ok(());
        }

        let mut frames = group.join();
        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("{addr} joined room {room} ({} connected)", group.member_count());

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        counters.frames_relayed.fetch_add(1, Ordering::Relaxed);
                        counters.bytes_relayed.fetch_add(text.len() as u64, Ordering::Relaxed);
                        group.broadcast(id, text.as_str());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        log::debug!("Ignoring binary frame from {addr}");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                },

                frame = group.recv_for(id, &mut frames) => match frame {
                    Some(frame) => {
                        if let Err(e) = ws_sender.send(Message::text(frame.text.to_string())).await {
                            log::debug!("Send to {addr} failed: {e}");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        group.leave();
        drop(frames);
        rooms.release(&room).await;
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected_connections.load(Ordering::Relaxed),
            frames_relayed: self.counters.frames_relayed.load(Ordering::Relaxed),
            bytes_relayed: self.counters.bytes_relayed.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }
}
