//! Duplex message channel used by the session.
//!
//! A [`Connector`] opens a channel to a URL and hands back a
//! [`ChannelHandle`]: a sender for outgoing text frames and a receiver of
//! [`ChannelEvent`]s. Dropping the handle closes the channel.
//!
//! Two connectors ship with the crate:
//! - [`WsConnector`]: WebSocket client (tokio-tungstenite) with separate
//!   writer and reader tasks
//! - [`MemoryConnector`]: in-process loopback through a [`MemoryHub`],
//!   for tests and single-process embedding

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::broadcast::RoomManager;
use crate::error::SessionError;

/// Something that happened on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Inbound text frame
    Frame(String),
    /// Transport failure; the channel is unusable afterwards
    Error(String),
    /// Remote side closed the channel
    Closed,
}

/// Both directions of an open channel.
#[derive(Debug)]
pub struct ChannelHandle {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelHandle {
    /// Queue a frame for sending.
    pub fn send(&self, frame: String) -> Result<(), SessionError> {
        self.outgoing
            .send(frame)
            .map_err(|_| SessionError::ChannelError("channel closed".into()))
    }
}

/// Opens channels. Implementations decide what a URL means.
pub trait Connector {
    fn connect(
        &mut self,
        url: &str,
    ) -> impl Future<Output = Result<ChannelHandle, SessionError>> + Send;
}

/// WebSocket connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn connect(&mut self, url: &str) -> Result<ChannelHandle, SessionError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SessionError::ChannelError(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        // Writer task: forward outgoing frames until the handle is dropped
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(WsMessage::text(frame)).await {
                    log::debug!("WebSocket write failed: {e}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(ChannelEvent::Frame(text.as_str().to_owned())).is_err() {
                            return;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = in_tx.send(ChannelEvent::Error(e.to_string()));
                        return;
                    }
                }
            }
            let _ = in_tx.send(ChannelEvent::Closed);
        });

        log::debug!("WebSocket channel open to {url}");
        Ok(ChannelHandle {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

struct HubInner {
    rooms: RoomManager,
    next_connection: AtomicU64,
    available: AtomicBool,
    severed: watch::Sender<u64>,
}

/// In-process message hub. Every URL is a room; a frame sent on one
/// connection reaches every other connection in the same room.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// `capacity` frames are buffered per connection.
    pub fn with_capacity(capacity: usize) -> Self {
        let (severed, _) = watch::channel(0);
        Self {
            inner: Arc::new(HubInner {
                rooms: RoomManager::new(capacity),
                next_connection: AtomicU64::new(1),
                available: AtomicBool::new(true),
                severed,
            }),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { hub: self.clone() }
    }

    /// Fail every open connection with a channel error.
    pub fn sever(&self) {
        log::debug!("Severing all memory connections");
        self.inner.severed.send_modify(|generation| *generation += 1);
    }

    /// While unavailable, `connect` fails with a channel error.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Relaxed);
    }

    /// Open connections in `url`'s room.
    pub async fn connections(&self, url: &str) -> usize {
        self.inner.rooms.room(url).await.member_count()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Connector onto a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryConnector {
    hub: MemoryHub,
}

impl Connector for MemoryConnector {
    async fn connect(&mut self, url: &str) -> Result<ChannelHandle, SessionError> {
        let inner = self.hub.inner.clone();
        if !inner.available.load(Ordering::Relaxed) {
            return Err(SessionError::ChannelError(format!("{url} unreachable")));
        }

        let me = inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let group = inner.rooms.room(url).await;
        let mut frames = group.join();
        let mut severed = inner.severed.subscribe();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    Ok(()) = severed.changed() => {
                        let _ = in_tx.send(ChannelEvent::Error("connection severed".into()));
                        break;
                    }
                    frame = out_rx.recv() => match frame {
                        Some(text) => {
                            group.broadcast(me, text);
                        }
                        None => break,
                    },
                    frame = group.recv_for(me, &mut frames) => match frame {
                        // Keep pumping after the reader is gone so queued
                        // outgoing frames still go out
                        Some(frame) => {
                            let _ = in_tx.send(ChannelEvent::Frame(frame.text.to_string()));
                        }
                        None => break,
                    },
                }
            }
            group.leave();
            log::trace!("Memory connection {me} closed");
        });

        Ok(ChannelHandle {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
