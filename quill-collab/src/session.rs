//! Collaboration session: one replica driven over one channel.
//!
//! ```text
//!        editor                              channel
//!   DocumentChange ──► apply_local_change ──► operation ──►
//!   set_content ◄──── refresh_view ◄──────── handle_frame ◄──
//!                          │
//!                       Replica
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ─connect()─► Connecting ─ok─► Connected
//!                               │                │ channel error / close
//!                             fail               ▼
//!                               ▼           Reconnecting ─delay─► Connecting
//!                             Error ◄── budget spent
//! ```
//!
//! Everything runs on the caller's task. `step()` waits for the next
//! wake-up (local edit, inbound frame, timer, reconnect deadline) and
//! handles it; `run()` loops `step()` while the session is live.

use quill_crdt::{CrdtError, DocumentState, Operation, Replica, SiteId};
use std::collections::VecDeque;
use std::future::pending;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::channel::{ChannelEvent, ChannelHandle, Connector};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::presence::{
    color_for, CollaborationUser, CursorPosition, PresenceEvent, PresenceTable, SelectionRange,
};
use crate::protocol::{
    now_millis, CursorPayload, Envelope, HeartbeatPayload, LeavePayload, Message,
    SyncRequestPayload,
};
use crate::reconnect::Backoff;
use crate::view::{strip_echo, DocumentChange, DocumentView};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect budget spent or the initial connect failed
    Error,
}

/// Events emitted to the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// A remote operation took effect locally
    RemoteOperation {
        from: SiteId,
        operation: Operation,
    },
    Presence(PresenceEvent),
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// Non-fatal failure; the session keeps going
    Error(SessionError),
    /// Terminal: reconnection gave up
    ConnectionFailed {
        attempts: u32,
    },
}

/// Local operations made while disconnected, replayed on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<Operation>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an operation. Returns `false` if the queue is full.
    pub fn enqueue(&mut self, op: Operation) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(op);
        true
    }

    pub fn drain(&mut self) -> Vec<Operation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// What woke `step()` up.
enum Wake {
    Change(DocumentChange),
    Channel(Option<ChannelEvent>),
    Heartbeat,
    Sync,
    Reconnect,
    CursorFlush,
}

const EVENT_CAPACITY: usize = 256;

/// A collaboration session over connector `C`, rendering into view `V`.
pub struct CollabSession<C: Connector, V: DocumentView> {
    config: SessionConfig,
    connector: C,
    view: V,
    replica: Replica,
    local_user: CollaborationUser,
    presence: PresenceTable,
    state: ConnectionState,
    channel: Option<ChannelHandle>,
    offline: OfflineQueue,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
    sync: Option<Interval>,
    last_cursor_sent: Option<Instant>,
    cursor_flush_at: Option<Instant>,
    change_tx: mpsc::UnboundedSender<DocumentChange>,
    change_rx: mpsc::UnboundedReceiver<DocumentChange>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl<C: Connector, V: DocumentView> CollabSession<C, V> {
    pub fn new(config: SessionConfig, connector: C, view: V) -> Result<Self, SessionError> {
        config.validate()?;

        let site = config.user.id.unwrap_or_default();
        let mut local_user = CollaborationUser::new(site, config.user.name.clone());
        local_user.avatar = config.user.avatar.clone();
        local_user.color = config.cursor_color.clone().unwrap_or_else(|| color_for(site));

        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

        Ok(Self {
            replica: Replica::with_config(site, config.replica_config()),
            offline: OfflineQueue::new(config.offline_queue_capacity),
            backoff: Backoff::new(config.reconnect_policy()),
            config,
            connector,
            view,
            local_user,
            presence: PresenceTable::new(),
            state: ConnectionState::Disconnected,
            channel: None,
            reconnect_at: None,
            heartbeat: None,
            sync: None,
            last_cursor_sent: None,
            cursor_flush_at: None,
            change_tx,
            change_rx,
            event_tx,
            event_rx: Some(event_rx),
        })
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn site_id(&self) -> SiteId {
        self.replica.site_id()
    }

    pub fn text(&self) -> String {
        self.replica.text()
    }

    pub fn state(&self) -> DocumentState {
        self.replica.state()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn users(&self) -> impl Iterator<Item = &CollaborationUser> {
        self.presence.users()
    }

    pub fn presence(&self) -> &PresenceTable {
        &self.presence
    }

    pub fn local_user(&self) -> &CollaborationUser {
        &self.local_user
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn offline_queue_len(&self) -> usize {
        self.offline.len()
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Sender the editor reports local edits on.
    pub fn change_sender(&self) -> mpsc::UnboundedSender<DocumentChange> {
        self.change_tx.clone()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Open the channel and announce ourselves.
    ///
    /// Fails with `ConnectionTimeout` if the channel does not open within
    /// the configured connect timeout.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.backoff.reset();
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);

        match self.open().await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("Connect failed: {e}");
                self.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// Send `leave`, close the channel, stop all timers and forget
    /// presence. Local edits made afterwards are queued.
    pub fn disconnect(&mut self) {
        if self.channel.is_some() {
            let leave = Message::Leave(LeavePayload {
                user_id: self.site_id(),
            });
            if let Err(e) = self.send(&leave) {
                log::debug!("Could not send leave: {e}");
            }
        }
        self.teardown();
        self.reconnect_at = None;
        self.set_state(ConnectionState::Disconnected);
        log::info!("Session {} disconnected", self.site_id().short());
    }

    /// Disconnect and drop the session.
    pub fn destroy(mut self) {
        self.disconnect();
    }

    /// Handle wake-ups until the session is neither connected nor trying
    /// to be.
    pub async fn run(&mut self) {
        while matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            self.step().await;
        }
    }

    /// Wait for the next wake-up and handle it.
    ///
    /// Cancel-safe while waiting. Dropping the future during a reconnect
    /// attempt abandons that attempt and leaves the session `Connecting`.
    pub async fn step(&mut self) {
        let reconnect_at = self.reconnect_at;
        let cursor_flush_at = self.cursor_flush_at;

        let wake = tokio::select! {
            Some(change) = self.change_rx.recv() => Wake::Change(change),
            event = next_channel_event(&mut self.channel) => Wake::Channel(event),
            _ = tick(&mut self.heartbeat) => Wake::Heartbeat,
            _ = tick(&mut self.sync) => Wake::Sync,
            _ = sleep_until(reconnect_at) => Wake::Reconnect,
            _ = sleep_until(cursor_flush_at) => Wake::CursorFlush,
        };

        match wake {
            Wake::Change(change) => {
                if let Err(e) = self.apply_local_change(change) {
                    log::warn!("Dropped local change: {e}");
                    self.emit(SessionEvent::Error(e));
                }
            }
            Wake::Channel(Some(ChannelEvent::Frame(frame))) => {
                if let Err(e) = self.handle_frame(&frame) {
                    self.report_frame_error(e);
                }
            }
            Wake::Channel(Some(ChannelEvent::Error(e))) => {
                self.channel_lost(Some(SessionError::ChannelError(e)));
            }
            Wake::Channel(Some(ChannelEvent::Closed) | None) => self.channel_lost(None),
            Wake::Heartbeat => self.on_heartbeat_tick(),
            Wake::Sync => self.on_sync_tick(),
            Wake::Reconnect => self.reconnect().await,
            Wake::CursorFlush => {
                if let Err(e) = self.send_cursor(Instant::now()) {
                    log::debug!("Cursor flush failed: {e}");
                }
            }
        }
    }

    async fn open(&mut self) -> Result<(), SessionError> {
        let url = self.config.channel_url()?;
        let limit = self.config.connect_timeout;

        let handle = match tokio::time::timeout(limit, self.connector.connect(&url)).await {
            Ok(result) => result?,
            Err(_) => {
                log::warn!("Connection to {url} timed out after {limit:?}");
                return Err(SessionError::ConnectionTimeout);
            }
        };

        self.channel = Some(handle);
        if let Err(e) = self.handshake() {
            self.teardown();
            return Err(e);
        }

        self.backoff.reset();
        self.start_timers();
        self.set_state(ConnectionState::Connected);
        log::info!("Session {} connected to {url}", self.site_id().short());
        Ok(())
    }

    /// Join, ask for missed state, replay offline edits.
    fn handshake(&mut self) -> Result<(), SessionError> {
        self.send(&Message::Join(self.local_user.clone()))?;
        self.send_sync_request()?;

        let queued = self.offline.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued operations", queued.len());
        }
        for op in queued {
            self.send(&Message::Operation(op))?;
        }
        Ok(())
    }

    async fn reconnect(&mut self) {
        self.set_state(ConnectionState::Connecting);
        let result = self.open().await;
        self.reconnect_at = None;

        if let Err(e) = result {
            log::warn!("Reconnect attempt {} failed: {e}", self.backoff.attempts());
            self.emit(SessionEvent::Error(e));
            self.schedule_reconnect();
        }
    }

    /// The channel died underneath us.
    fn channel_lost(&mut self, error: Option<SessionError>) {
        match &error {
            Some(e) => log::warn!("Channel lost: {e}"),
            None => log::info!("Channel closed by remote"),
        }
        self.teardown();
        if let Some(e) = error {
            self.emit(SessionEvent::Error(e));
        }

        if self.config.auto_reconnect {
            self.schedule_reconnect();
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.backoff.next_delay() {
            Some(delay) => {
                let attempt = self.backoff.attempts();
                log::info!("Reconnect attempt {attempt} in {delay:?}");
                self.reconnect_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Reconnecting);
                self.emit(SessionEvent::ReconnectScheduled { attempt, delay });
            }
            None => {
                let attempts = self.backoff.attempts();
                log::error!("Giving up after {attempts} reconnect attempts");
                self.set_state(ConnectionState::Error);
                self.emit(SessionEvent::ConnectionFailed { attempts });
            }
        }
    }

    fn start_timers(&mut self) {
        let now = Instant::now();

        let mut heartbeat = interval_at(now + self.config.heartbeat_interval, self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);

        let mut sync = interval_at(now + self.config.sync_interval, self.config.sync_interval);
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.sync = Some(sync);
    }

    /// Drop channel, timers and presence.
    fn teardown(&mut self) {
        self.channel = None;
        self.heartbeat = None;
        self.sync = None;
        self.cursor_flush_at = None;
        self.last_cursor_sent = None;
        self.presence.clear();
    }

    // ── Local edits ──────────────────────────────────────────────

    /// Turn an editor edit into CRDT operations and publish them.
    ///
    /// Deleting past the end of the document stops at the end.
    pub fn apply_local_change(&mut self, change: DocumentChange) -> Result<Vec<Operation>, SessionError> {
        let ops = match change {
            DocumentChange::Insert { from, text } => self.replica.insert_str(from, &text)?,
            DocumentChange::Delete { from, length } => {
                let mut ops = Vec::with_capacity(length);
                for _ in 0..length {
                    match self.replica.delete(from) {
                        Ok(op) => ops.push(op),
                        Err(CrdtError::NotFound { position }) => {
                            log::debug!("Nothing to delete at {position}");
                            break;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                ops
            }
        };

        for op in &ops {
            self.publish(op);
        }
        Ok(ops)
    }

    fn publish(&mut self, op: &Operation) {
        if self.state == ConnectionState::Connected {
            match self.send(&Message::Operation(op.clone())) {
                Ok(()) => return,
                Err(e) => log::warn!("Send failed, queueing {}: {e}", op.id()),
            }
        }
        if !self.offline.enqueue(op.clone()) {
            log::warn!("Offline queue full, dropping {}", op.id());
        }
    }

    /// Apply edits the editor reported before a remote change lands, so
    /// their offsets still refer to the text the editor saw.
    fn drain_local_changes(&mut self) {
        while let Ok(change) = self.change_rx.try_recv() {
            if let Err(e) = self.apply_local_change(change) {
                log::warn!("Dropped local change: {e}");
            }
        }
    }

    /// Move the local cursor. Updates are sent at most once per
    /// `cursorThrottle`; the latest position always goes out.
    pub fn update_cursor(
        &mut self,
        position: usize,
        selection: Option<SelectionRange>,
    ) -> Result<(), SessionError> {
        self.local_user.cursor = Some(CursorPosition { position, selection });
        if self.state != ConnectionState::Connected {
            return Ok(());
        }

        let now = Instant::now();
        match self.last_cursor_sent {
            Some(last) if now < last + self.config.cursor_throttle => {
                self.cursor_flush_at.get_or_insert(last + self.config.cursor_throttle);
                Ok(())
            }
            _ => self.send_cursor(now),
        }
    }

    fn send_cursor(&mut self, now: Instant) -> Result<(), SessionError> {
        self.cursor_flush_at = None;
        self.last_cursor_sent = Some(now);
        match self.local_user.cursor {
            Some(cursor) => self.send(&Message::Cursor(CursorPayload {
                user_id: self.site_id(),
                cursor,
            })),
            None => Ok(()),
        }
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Dispatch one inbound frame.
    pub fn handle_frame(&mut self, frame: &str) -> Result<(), SessionError> {
        let envelope = Envelope::decode(frame)?;
        if envelope.from == self.site_id() {
            return Ok(());
        }
        let message = envelope.message()?;
        let from = envelope.from;
        log::trace!("{:?} from {}", envelope.kind, from.short());

        match message {
            Message::Operation(op) => self.apply_remote(from, op),
            Message::SyncResponse(state) => {
                self.merge_remote(from, &state);
                Ok(())
            }
            Message::SyncRequest(_) => self.answer_sync(),
            Message::Join(user) => {
                ensure_sender(from, user.id)?;
                self.on_join(user)
            }
            Message::Leave(leave) => {
                ensure_sender(from, leave.user_id)?;
                if self.presence.leave(&leave.user_id).is_some() {
                    log::info!("{} left", leave.user_id.short());
                    self.emit(SessionEvent::Presence(PresenceEvent::Left(leave.user_id)));
                }
                Ok(())
            }
            Message::Cursor(update) => {
                ensure_sender(from, update.user_id)?;
                self.presence
                    .update_cursor(update.user_id, update.cursor, now_millis());
                self.emit(SessionEvent::Presence(PresenceEvent::CursorMoved {
                    user_id: update.user_id,
                    cursor: update.cursor,
                }));
                Ok(())
            }
            Message::Heartbeat(beat) => {
                self.presence.heartbeat(&from, now_millis());
                log::trace!("Heartbeat from {} at clock {}", beat.site_id.short(), beat.clock);
                Ok(())
            }
        }
    }

    fn apply_remote(&mut self, from: SiteId, op: Operation) -> Result<(), SessionError> {
        self.drain_local_changes();
        let before = self.replica.text();
        let applied = self
            .replica
            .apply_operation_at(op, Instant::now().into_std())?;
        self.publish_remote(from, applied, &before);
        Ok(())
    }

    fn merge_remote(&mut self, from: SiteId, state: &DocumentState) {
        self.drain_local_changes();
        let before = self.replica.text();
        let applied = self.replica.merge_at(state, Instant::now().into_std());
        if !applied.is_empty() {
            log::debug!("Merged {} operations from {}", applied.len(), from.short());
        }
        self.publish_remote(from, applied, &before);
    }

    fn publish_remote(&mut self, from: SiteId, applied: Vec<Operation>, before: &str) {
        if applied.is_empty() {
            return;
        }
        self.refresh_view(before);
        for operation in applied {
            self.emit(SessionEvent::RemoteOperation { from, operation });
        }
    }

    /// Push the text into the view. Of the changes queued meanwhile, the
    /// one describing `before` -> new text is the view's echo; the rest
    /// are edits the user made and are applied.
    fn refresh_view(&mut self, before: &str) {
        let text = self.replica.text();
        self.view.set_content(&text);

        let mut queued = Vec::new();
        while let Ok(change) = self.change_rx.try_recv() {
            queued.push(change);
        }
        if queued.is_empty() {
            return;
        }
        let total = queued.len();
        let genuine = strip_echo(queued, before, &text);
        log::trace!("Suppressed {} echoed changes", total - genuine.len());
        for change in genuine {
            if let Err(e) = self.apply_local_change(change) {
                log::warn!("Dropped local change: {e}");
                self.emit(SessionEvent::Error(e));
            }
        }
    }

    /// Answer with full state. Version vectors only carry high-water
    /// marks and cannot show a gap below them, so no request is skipped
    /// unless there is nothing to send.
    fn answer_sync(&mut self) -> Result<(), SessionError> {
        if self.replica.is_empty() && self.replica.tombstone_count() == 0 {
            return Ok(());
        }
        self.send(&Message::SyncResponse(self.replica.state()))
    }

    fn on_join(&mut self, user: CollaborationUser) -> Result<(), SessionError> {
        let fresh = self.presence.join(user.clone());
        if !fresh {
            return Ok(());
        }
        log::info!("{} ({}) joined", user.name, user.id.short());
        self.emit(SessionEvent::Presence(PresenceEvent::Joined(user)));
        // Introduce ourselves to the newcomer
        self.send(&Message::Join(self.local_user.clone()))
    }

    fn report_frame_error(&mut self, error: SessionError) {
        match error {
            SessionError::MalformedMessage(e) => log::warn!("Dropped malformed frame: {e}"),
            e => {
                log::warn!("Frame handling failed: {e}");
                self.emit(SessionEvent::Error(e));
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────

    fn on_heartbeat_tick(&mut self) {
        let beat = Message::Heartbeat(HeartbeatPayload {
            site_id: self.site_id(),
            clock: self.replica.clock(),
        });
        if let Err(e) = self.send(&beat) {
            log::debug!("Heartbeat not sent: {e}");
        }

        for id in self.presence.mark_idle(now_millis(), self.config.idle_timeout) {
            log::debug!("{} went idle", id.short());
            self.emit(SessionEvent::Presence(PresenceEvent::WentIdle(id)));
        }
    }

    fn on_sync_tick(&mut self) {
        if let Err(e) = self.send_sync_request() {
            log::debug!("Sync request not sent: {e}");
        }
        for e in self.replica.expire_pending(Instant::now().into_std()) {
            self.emit(SessionEvent::Error(e.into()));
        }
    }

    fn send_sync_request(&self) -> Result<(), SessionError> {
        self.send(&Message::SyncRequest(SyncRequestPayload {
            version_vector: self.replica.version_vector().clone(),
        }))
    }

    // ── Plumbing ─────────────────────────────────────────────────

    fn send(&self, message: &Message) -> Result<(), SessionError> {
        let handle = self.channel.as_ref().ok_or(SessionError::NotConnected)?;
        let frame = Envelope::new(self.site_id(), message)?.encode()?;
        handle.send(frame)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::debug!("Session {}: {:?} -> {state:?}", self.site_id().short(), self.state);
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            log::debug!("Event queue full, dropped {event:?}");
        }
    }
}

fn ensure_sender(from: SiteId, claimed: SiteId) -> Result<(), SessionError> {
    if from == claimed {
        Ok(())
    } else {
        Err(SessionError::MalformedMessage(format!(
            "{} speaking for {}",
            from.short(),
            claimed.short()
        )))
    }
}

async fn next_channel_event(channel: &mut Option<ChannelHandle>) -> Option<ChannelEvent> {
    match channel {
        Some(handle) => handle.incoming.recv().await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryHub;
    use crate::protocol::MessageType;
    use quill_crdt::{ElementId, VersionVector};

    type TestSession = CollabSession<crate::channel::MemoryConnector, fn(&str)>;

    fn site(n: u128) -> SiteId {
        SiteId::from_u128(n)
    }

    fn config(n: u128) -> SessionConfig {
        let mut config = SessionConfig::new("mem://test");
        config.user.id = Some(site(n));
        config.user.name = format!("user-{n}");
        config
    }

    fn offline_session(n: u128) -> TestSession {
        let hub = MemoryHub::new();
        CollabSession::new(config(n), hub.connector(), (|_: &str| {}) as fn(&str)).unwrap()
    }

    fn frame(from: SiteId, message: Message) -> String {
        Envelope::new(from, &message).unwrap().encode().unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_new_session_identity() {
        let session = offline_session(1);
        assert_eq!(session.site_id(), site(1));
        assert_eq!(session.local_user().name, "user-1");
        assert_eq!(session.local_user().color, color_for(site(1)));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_configured_cursor_color() {
        let hub = MemoryHub::new();
        let mut config = config(1);
        config.cursor_color = Some("#123456".into());
        let session = CollabSession::new(config, hub.connector(), |_: &str| {}).unwrap();
        assert_eq!(session.local_user().color, "#123456");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let hub = MemoryHub::new();
        let mut config = config(1);
        config.heartbeat_interval = Duration::ZERO;
        assert!(CollabSession::new(config, hub.connector(), |_: &str| {}).is_err());
    }

    #[test]
    fn test_local_changes_queue_offline() {
        let mut session = offline_session(1);
        let ops = session.apply_local_change(DocumentChange::insert(0, "hey")).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(session.offline_queue_len(), 3);

        let ops = session.apply_local_change(DocumentChange::delete(1, 10)).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(session.text(), "h");
    }

    #[test]
    fn test_local_insert_out_of_range() {
        let mut session = offline_session(1);
        let result = session.apply_local_change(DocumentChange::insert(5, "x"));
        assert!(matches!(
            result,
            Err(SessionError::Crdt(CrdtError::OutOfRange { position: 5, len: 0 }))
        ));
    }

    #[test]
    fn test_remote_operation_updates_view_and_emits() {
        let hub = MemoryHub::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut session = CollabSession::new(config(1), hub.connector(), move |text: &str| {
            sink.lock().unwrap().push(text.to_string())
        })
        .unwrap();
        let mut events = session.take_event_rx().unwrap();

        let op = Operation::Insert {
            id: ElementId::new(1, site(2)),
            value: 'z',
            after: None,
        };
        session.handle_frame(&frame(site(2), Message::Operation(op.clone()))).unwrap();
        session.handle_frame(&frame(site(2), Message::Operation(op.clone()))).unwrap();

        assert_eq!(session.text(), "z");
        assert_eq!(*seen.lock().unwrap(), vec!["z".to_string()]);
        let remote: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::RemoteOperation { .. }))
            .collect();
        assert_eq!(remote, vec![SessionEvent::RemoteOperation { from: site(2), operation: op }]);
    }

    #[test]
    fn test_pending_local_change_applied_before_remote() {
        let mut session = offline_session(1);
        session.change_sender().send(DocumentChange::insert(0, "a")).unwrap();

        let op = Operation::Insert {
            id: ElementId::new(1, site(2)),
            value: 'b',
            after: None,
        };
        session.handle_frame(&frame(site(2), Message::Operation(op))).unwrap();

        // Both landed; 'a' was integrated before 'b' arrived
        assert_eq!(session.text().len(), 2);
        assert_eq!(session.offline_queue_len(), 1);
    }

    #[test]
    fn test_own_frames_ignored() {
        let mut session = offline_session(1);
        let op = Operation::Insert {
            id: ElementId::new(1, site(1)),
            value: 'x',
            after: None,
        };
        session.handle_frame(&frame(site(1), Message::Operation(op))).unwrap();
        assert_eq!(session.text(), "");
    }

    #[test]
    fn test_malformed_frames_rejected() {
        let mut session = offline_session(1);
        assert!(matches!(
            session.handle_frame("{{{"),
            Err(SessionError::MalformedMessage(_))
        ));

        let spoofed = frame(site(2), Message::Leave(LeavePayload { user_id: site(3) }));
        assert!(matches!(
            session.handle_frame(&spoofed),
            Err(SessionError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_presence_dispatch() {
        let mut session = offline_session(1);
        let mut events = session.take_event_rx().unwrap();

        let bob = CollaborationUser::new(site(2), "Bob");
        // Not connected: the reply join fails but the user is recorded
        let _ = session.handle_frame(&frame(site(2), Message::Join(bob.clone())));
        assert_eq!(session.presence().get(&site(2)).unwrap().name, "Bob");

        let cursor = CursorPosition { position: 0, selection: None };
        session
            .handle_frame(&frame(site(2), Message::Cursor(CursorPayload { user_id: site(2), cursor })))
            .unwrap();
        session
            .handle_frame(&frame(site(2), Message::Leave(LeavePayload { user_id: site(2) })))
            .unwrap();

        let presence: Vec<PresenceEvent> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Presence(p) => Some(p),
                _ => None,
            })
            .collect();
        assert!(matches!(presence[0], PresenceEvent::Joined(ref u) if u.id == site(2)));
        assert_eq!(presence[1], PresenceEvent::CursorMoved { user_id: site(2), cursor });
        assert_eq!(presence[2], PresenceEvent::Left(site(2)));
        assert_eq!(session.presence().len(), 0);
    }

    #[test]
    fn test_presence_uses_receive_time() {
        let mut session = offline_session(1);
        let _ = session.handle_frame(&frame(site(2), Message::Join(CollaborationUser::new(site(2), "Bob"))));

        // Bob's clock runs an hour ahead
        let mut beat = Envelope::new(
            site(2),
            &Message::Heartbeat(HeartbeatPayload { site_id: site(2), clock: 0 }),
        )
        .unwrap();
        beat.timestamp += 3_600_000;
        session.handle_frame(&beat.encode().unwrap()).unwrap();

        assert!(session.presence().get(&site(2)).unwrap().last_active <= now_millis());
    }

    #[tokio::test]
    async fn test_sync_request_answered_when_gap_hides_below_vector() {
        let hub = MemoryHub::new();
        let mut peer = hub.connector().connect("mem://test/default").await.unwrap();
        let mut session = CollabSession::new(config(1), hub.connector(), |_: &str| {}).unwrap();
        session.connect().await.unwrap();

        session.apply_local_change(DocumentChange::insert(0, "a")).unwrap();
        let later = session.apply_local_change(DocumentChange::insert(0, "b")).unwrap();

        // The requester only ever saw the clock-2 insert
        let mut behind = quill_crdt::Replica::new(site(2));
        behind.apply_operation(later[0].clone()).unwrap();
        assert_eq!(behind.text(), "b");
        let mut vv = VersionVector::new();
        vv.observe(site(1), 2);
        assert!(vv.dominates(session.replica().version_vector()));

        while tokio::time::timeout(Duration::from_millis(20), peer.incoming.recv())
            .await
            .is_ok()
        {}
        let request = Message::SyncRequest(SyncRequestPayload { version_vector: vv });
        session.handle_frame(&frame(site(2), request)).unwrap();

        let mut response = None;
        while let Ok(Some(ChannelEvent::Frame(text))) =
            tokio::time::timeout(Duration::from_millis(50), peer.incoming.recv()).await
        {
            if let Ok(Message::SyncResponse(state)) = Envelope::decode(&text).unwrap().message() {
                response = Some(state);
            }
        }
        behind.merge(&response.expect("sync-response"));
        assert_eq!(behind.text(), session.text());
        assert_eq!(behind.text(), "ba");
    }

    #[test]
    fn test_keystroke_during_refresh_is_kept() {
        let hub = MemoryHub::new();
        let editor: std::sync::Arc<std::sync::Mutex<Option<mpsc::UnboundedSender<DocumentChange>>>> =
            Default::default();
        let slot = editor.clone();
        let mut session = CollabSession::new(config(1), hub.connector(), move |text: &str| {
            let guard = slot.lock().unwrap();
            let Some(tx) = guard.as_ref() else { return };
            // The user types on another thread while the text is pushed
            let typist = tx.clone();
            std::thread::spawn(move || typist.send(DocumentChange::insert(0, "K")).unwrap())
                .join()
                .unwrap();
            // The editor reports the pushed text back as its own edit
            tx.send(DocumentChange::insert(0, text)).unwrap();
        })
        .unwrap();
        *editor.lock().unwrap() = Some(session.change_sender());

        let op = Operation::Insert {
            id: ElementId::new(1, site(2)),
            value: 'r',
            after: None,
        };
        session.handle_frame(&frame(site(2), Message::Operation(op))).unwrap();

        assert_eq!(session.text(), "Kr");
        assert_eq!(session.offline_queue_len(), 1);
    }

    #[test]
    fn test_sync_response_merges() {
        let mut source = quill_crdt::Replica::new(site(2));
        source.insert_str(0, "sync").unwrap();

        let mut session = offline_session(1);
        session
            .handle_frame(&frame(site(2), Message::SyncResponse(source.state())))
            .unwrap();
        assert_eq!(session.text(), "sync");
        assert_eq!(session.replica().clock(), 4);
    }

    #[test]
    fn test_sync_request_offline_is_not_connected() {
        let mut session = offline_session(1);
        session.apply_local_change(DocumentChange::insert(0, "x")).unwrap();

        let request = Message::SyncRequest(SyncRequestPayload {
            version_vector: VersionVector::new(),
        });
        assert_eq!(
            session.handle_frame(&frame(site(2), request)),
            Err(SessionError::NotConnected)
        );
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        let op = |n| Operation::Delete { id: ElementId::new(n, site(1)) };
        assert!(queue.enqueue(op(1)));
        assert!(queue.enqueue(op(2)));
        assert!(!queue.enqueue(op(3)));
        assert_eq!(queue.drain(), vec![op(1), op(2)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_event_rx_once() {
        let mut session = offline_session(1);
        assert!(session.take_event_rx().is_some());
        assert!(session.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_connect_without_server_url() {
        let hub = MemoryHub::new();
        let mut config = config(1);
        config.server_url = None;
        let mut session = CollabSession::new(config, hub.connector(), |_: &str| {}).unwrap();

        let result = session.connect().await;
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
        assert_eq!(session.connection_state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_states() {
        let hub = MemoryHub::new();
        let mut session = CollabSession::new(config(1), hub.connector(), |_: &str| {}).unwrap();
        let mut events = session.take_event_rx().unwrap();

        session.connect().await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        session.disconnect();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        let states: Vec<ConnectionState> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn test_destroy_announces_leave() {
        let hub = MemoryHub::new();
        let mut peer = hub.connector().connect("mem://test/default").await.unwrap();
        let mut session = CollabSession::new(config(1), hub.connector(), |_: &str| {}).unwrap();
        session.connect().await.unwrap();
        session.destroy();

        let mut kinds = Vec::new();
        while let Ok(Some(ChannelEvent::Frame(text))) =
            tokio::time::timeout(Duration::from_millis(50), peer.incoming.recv()).await
        {
            kinds.push(Envelope::decode(&text).unwrap().kind);
        }
        assert_eq!(kinds.last(), Some(&MessageType::Leave));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_updates_throttled() {
        let hub = MemoryHub::new();
        let mut peer = hub.connector().connect("mem://test/default").await.unwrap();
        let mut session = CollabSession::new(config(1), hub.connector(), |_: &str| {}).unwrap();
        session.connect().await.unwrap();

        session.update_cursor(1, None).unwrap();
        session.update_cursor(2, None).unwrap();
        session.update_cursor(3, None).unwrap();
        assert!(session.cursor_flush_at.is_some());

        // Trailing flush
        session.step().await;

        let mut positions = Vec::new();
        while let Ok(Some(ChannelEvent::Frame(text))) =
            tokio::time::timeout(Duration::from_millis(5), peer.incoming.recv()).await
        {
            if let Ok(Message::Cursor(c)) = Envelope::decode(&text).unwrap().message() {
                positions.push(c.cursor.position);
            }
        }
        assert_eq!(positions, vec![1, 3]);
    }
}
