//! Session protocol state machine.
//!
//! The controller owns the session context (replica, awareness table, undo
//! history, offline queue) and reacts to exactly three kinds of input:
//! transport events, local application commands, and timer ticks. It never
//! performs I/O itself; outbound frames accumulate in an outbox and
//! application-facing notifications in an event queue, both drained by the
//! driver ([`SyncClient`](crate::client::SyncClient)) in FIFO order.
//!
//! ```text
//! Disconnected ─► Connecting ─► AwaitingBootstrap ─► Synced
//!                     ▲                │                │
//!                     │                ▼                ▼
//!                     └──────────── Degraded ◄──── (transport error)
//!
//! Synced ─► Crashed   (health check failed, terminal)
//! any    ─► Closed    (close, eviction, rejection, reconnect exhausted)
//! ```
//!
//! Inbound frames are handled strictly in arrival order. Local fragments go
//! out in the order they were produced; fragments produced while the channel
//! is down wait in the offline queue until the next bootstrap completes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::awareness::{
    AwarenessChange, AwarenessField, AwarenessTable, AwarenessUser, ChangeOrigin, ClientId,
    CursorRange, EmitThrottle, PeerPresence,
};
use crate::health::{CrashReason, HealthMonitor, HealthVerdict, RenderedState, ViewProbeError};
use crate::latency::{epoch_millis, LatencyProber};
use crate::offline::OfflineQueue;
use crate::protocol::{
    decode_b64, ChatMessage, RosterUser, VoiceSignal, WireMessage, ANONYMOUS_REJECTED_CLOSE_CODE,
    NOT_A_MEMBER_CLOSE_CODE,
};
use crate::replica::{
    EditOp, MutationOrigin, ReplicaChange, ReplicaError, ReplicaManager, UpdateFragment,
};
use crate::session::{PendingUpdatePolicy, Session, SessionConfig};
use crate::transport::TransportEvent;
use crate::undo::UndoCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingBootstrap,
    Synced,
    Degraded,
    Crashed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Crashed | Self::Closed)
    }

    /// Frames can be sent in this state.
    pub fn channel_open(&self) -> bool {
        matches!(self, Self::AwaitingBootstrap | Self::Synced)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingBootstrap => "awaiting-bootstrap",
            Self::Synced => "synced",
            Self::Degraded => "degraded",
            Self::Crashed => "crashed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Notifications for the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Replica content changed by something other than a local edit.
    TextChanged(String),
    PresenceChanged(Vec<PeerPresence>),
    Roster(Vec<RosterUser>),
    Chat(ChatMessage),
    VoiceRoomUpdate(Vec<Value>),
    VoiceSignal(VoiceSignal),
    RelayError(String),
    Latency(Duration),
    /// The relay closed the room; the work on the relay is saved.
    Evicted,
    /// The relay refused this user (4001 / 4003).
    Rejected { code: u16, reason: String },
    Crashed(CrashReason),
    ReconnectFailed,
    Closed,
}

/// Everything owned for the lifetime of one session, destroyed as a unit.
struct SessionContext {
    replica: ReplicaManager,
    awareness: AwarenessTable,
    undo: UndoCoordinator,
    offline: OfflineQueue,
    pending_updates: Vec<Vec<u8>>,
}

type Inbox<T> = Rc<RefCell<VecDeque<T>>>;

pub struct SyncController {
    session: Session,
    config: SessionConfig,
    state: SessionState,
    bootstrapped: bool,
    context: Option<SessionContext>,
    prober: LatencyProber,
    health: HealthMonitor,
    throttle: EmitThrottle,
    timers_active: bool,
    close_requested: bool,
    replica_inbox: Inbox<ReplicaChange>,
    awareness_inbox: Inbox<AwarenessChange>,
    outbox: VecDeque<WireMessage>,
    events: VecDeque<SessionEvent>,
}

impl SyncController {
    pub fn new(session: Session, config: SessionConfig) -> Self {
        Self::with_awareness(session, config, AwarenessTable::new())
    }

    /// Build with a caller-provided awareness table (fixed client id).
    pub fn with_awareness(
        session: Session,
        config: SessionConfig,
        mut awareness: AwarenessTable,
    ) -> Self {
        let replica_inbox: Inbox<ReplicaChange> = Rc::new(RefCell::new(VecDeque::new()));
        let awareness_inbox: Inbox<AwarenessChange> = Rc::new(RefCell::new(VecDeque::new()));

        let mut replica = ReplicaManager::new();
        replica.subscribe({
            let inbox = replica_inbox.clone();
            move |change| inbox.borrow_mut().push_back(change.clone())
        });
        awareness.subscribe({
            let inbox = awareness_inbox.clone();
            move |change| inbox.borrow_mut().push_back(change.clone())
        });
        let undo = UndoCoordinator::new(&replica, config.undo_capture_window);

        let context = SessionContext {
            replica,
            awareness,
            undo,
            offline: OfflineQueue::new(config.offline_capacity),
            pending_updates: Vec::new(),
        };

        Self {
            health: HealthMonitor::new(config.health),
            throttle: EmitThrottle::new(config.awareness_throttle),
            session,
            config,
            state: SessionState::Disconnected,
            bootstrapped: false,
            context: Some(context),
            prober: LatencyProber::new(),
            timers_active: false,
            close_requested: false,
            replica_inbox,
            awareness_inbox,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Current replica text (empty once the context is destroyed).
    pub fn text(&self) -> String {
        self.context
            .as_ref()
            .map(|ctx| ctx.replica.current_text())
            .unwrap_or_default()
    }

    pub fn replica_len(&self) -> u32 {
        self.context.as_ref().map_or(0, |ctx| ctx.replica.len())
    }

    pub fn visible_peers(&self) -> Vec<PeerPresence> {
        self.context
            .as_ref()
            .map(|ctx| ctx.awareness.visible_peers())
            .unwrap_or_default()
    }

    pub fn local_client_id(&self) -> Option<ClientId> {
        self.context
            .as_ref()
            .map(|ctx| ctx.awareness.local_client_id())
    }

    pub fn offline_len(&self) -> usize {
        self.context.as_ref().map_or(0, |ctx| ctx.offline.len())
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    /// Whether the ping and health timers should be running.
    pub fn timers_active(&self) -> bool {
        self.timers_active
    }

    /// The driver must close the channel once the outbox is flushed.
    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub fn take_outbound(&mut self) -> Vec<WireMessage> {
        self.outbox.drain(..).collect()
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    // ── Transport ────────────────────────────────────────────────

    /// Mark a connection attempt. Returns `false` when no attempt is allowed
    /// from the current state.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            SessionState::Disconnected | SessionState::Degraded => {
                self.set_state(SessionState::Connecting);
                true
            }
            _ => false,
        }
    }

    pub fn handle_transport(&mut self, event: TransportEvent) {
        if self.state.is_terminal() {
            log::debug!("Ignoring transport event in {} state", self.state);
            return;
        }
        match event {
            TransportEvent::Opened => self.on_open(),
            TransportEvent::Frame(message) => {
                self.handle_message(message);
                self.drain_changes(Instant::now());
            }
            TransportEvent::Error(reason) => self.on_transport_error(&reason),
            TransportEvent::Closed { code, reason } => self.on_closed(code, reason),
        }
    }

    fn on_open(&mut self) {
        if self.state != SessionState::Connecting {
            log::warn!("Channel opened in unexpected {} state", self.state);
        }
        self.set_state(SessionState::AwaitingBootstrap);
        self.close_requested = false;
        self.prober.reset();
        self.throttle.reset();
        self.timers_active = true;
        self.outbox.push_back(WireMessage::RequestSync);
    }

    fn on_transport_error(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        log::warn!("Transport fault in {} state: {reason}", self.state);
        self.timers_active = false;
        self.prober.reset();
        self.throttle.reset();
        self.set_state(SessionState::Degraded);

        if let Some(ctx) = self.context.as_mut() {
            ctx.awareness.clear_local();
            ctx.awareness.clear_remote();
        }
        self.drain_changes(Instant::now());
    }

    fn on_closed(&mut self, code: Option<u16>, reason: String) {
        match code {
            Some(code) if code == self.config.eviction_close_code => {
                log::warn!("Session evicted by relay (code {code})");
                self.events.push_back(SessionEvent::Evicted);
                self.teardown(SessionState::Closed, false);
            }
            Some(code @ (ANONYMOUS_REJECTED_CLOSE_CODE | NOT_A_MEMBER_CLOSE_CODE)) => {
                log::warn!("Relay rejected session (code {code}): {reason}");
                self.events.push_back(SessionEvent::Rejected { code, reason });
                self.teardown(SessionState::Closed, false);
            }
            _ => self.on_transport_error(&format!("channel closed (code {code:?})")),
        }
    }

    /// Put back unsent frames after a failed send and degrade. Update
    /// fragments go to the front of the offline queue in their original
    /// order; other frames are dropped.
    pub fn requeue_failed(&mut self, unsent: Vec<WireMessage>, reason: &str) {
        if let Some(ctx) = self.context.as_mut() {
            for message in unsent.into_iter().rev() {
                if let WireMessage::Update { update_b64 } = message {
                    match decode_b64(&update_b64) {
                        Ok(bytes) => ctx.offline.requeue_front(UpdateFragment(bytes)),
                        Err(e) => log::warn!("Dropping unsendable fragment: {e}"),
                    }
                }
            }
        }
        self.on_transport_error(reason);
    }

    // ── Inbound frames ───────────────────────────────────────────

    fn handle_message(&mut self, message: WireMessage) {
        log::trace!("Inbound {} frame", message.kind());
        match message {
            WireMessage::Sync { ydoc_b64 } => self.on_sync(&ydoc_b64),
            WireMessage::Initial { content } => self.on_initial(&content),
            WireMessage::Update { update_b64 } => self.on_update(&update_b64),
            WireMessage::Awareness { update_b64 } => self.on_awareness(&update_b64),
            WireMessage::RemoveAwareness { user_id } => {
                if let Some(ctx) = self.context.as_mut() {
                    let removed = ctx.awareness.remove_by_user_id(&user_id);
                    log::debug!("Removed {} awareness entries of {user_id}", removed.len());
                }
            }
            WireMessage::Connection { users } => self.on_roster(users),
            WireMessage::ChatMessage(chat) => self.events.push_back(SessionEvent::Chat(chat)),
            WireMessage::VoiceRoomUpdate { participants } => self
                .events
                .push_back(SessionEvent::VoiceRoomUpdate(participants)),
            WireMessage::VoiceSignal(signal) => {
                self.events.push_back(SessionEvent::VoiceSignal(signal))
            }
            WireMessage::Error { message } => {
                log::warn!("Relay reported an error: {message}");
                self.events.push_back(SessionEvent::RelayError(message));
            }
            WireMessage::Pong { timestamp } => {
                if let Some(sample) = self.prober.on_pong(timestamp, epoch_millis()) {
                    self.events
                        .push_back(SessionEvent::Latency(sample.round_trip()));
                }
            }
            other @ (WireMessage::RequestSync
            | WireMessage::Ping { .. }
            | WireMessage::JoinVoice
            | WireMessage::LeaveVoice) => {
                log::debug!("Ignoring relay-bound {} frame", other.kind());
            }
        }
    }

    fn on_sync(&mut self, ydoc_b64: &str) {
        if self.state == SessionState::Synced {
            log::debug!("Ignoring snapshot: already synced");
            return;
        }
        let snapshot = match decode_b64(ydoc_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Dropping undecodable snapshot: {e}");
                return;
            }
        };
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        if let Err(e) = ctx.replica.apply_snapshot(&snapshot) {
            log::warn!("Dropping snapshot: {e}");
            return;
        }
        log::info!("Bootstrapped from {}-byte snapshot", snapshot.len());

        // After a reconnect the relay may have missed fragments that were
        // written to the old socket; send whatever it still lacks.
        if self.bootstrapped {
            match ctx.replica.missing_from(&snapshot) {
                Ok(Some(diff)) => {
                    log::info!("Republishing {} bytes the relay is missing", diff.len());
                    ctx.offline.clear();
                    self.outbox.push_back(WireMessage::update(diff.as_bytes()));
                }
                Ok(None) => ctx.offline.clear(),
                Err(e) => log::warn!("Cannot diff against relay snapshot: {e}"),
            }
        }
        self.complete_bootstrap();
    }

    fn on_initial(&mut self, content: &str) {
        if self.state == SessionState::Synced {
            log::debug!("Ignoring initial content: already synced");
            return;
        }
        let Some(ctx) = self.context.as_mut() else {
            return;
        };

        if self.bootstrapped {
            log::info!("Relay has no state; republishing the retained replica");
            let full = ctx.replica.encode_snapshot();
            self.outbox.push_back(WireMessage::update(full.as_bytes()));
        } else if ctx.replica.current_text() != content {
            match ctx.replica.replace_content(content, MutationOrigin::Remote) {
                Ok(fragment) => {
                    ctx.undo.clear();
                    self.outbox.push_back(WireMessage::update(fragment.as_bytes()));
                }
                Err(e) => {
                    log::warn!("Dropping initial content: {e}");
                    return;
                }
            }
        } else {
            ctx.undo.clear();
        }
        self.complete_bootstrap();
    }

    fn on_update(&mut self, update_b64: &str) {
        let fragment = match decode_b64(update_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Dropping undecodable update: {e}");
                return;
            }
        };
        let Some(ctx) = self.context.as_mut() else {
            return;
        };

        if !self.bootstrapped {
            match self.config.pending_updates {
                PendingUpdatePolicy::Drop => {
                    log::debug!("Dropping update received before bootstrap");
                }
                PendingUpdatePolicy::Queue => ctx.pending_updates.push(fragment),
            }
            return;
        }

        if let Err(e) = ctx.replica.apply_update(&fragment, MutationOrigin::Remote) {
            log::warn!("Dropping update: {e}");
        }
    }

    fn on_awareness(&mut self, update_b64: &str) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        if !self.bootstrapped || ctx.replica.len() <= self.config.awareness_min_len {
            log::debug!("Dropping awareness: replica not ready");
            return;
        }
        let result =
            decode_b64(update_b64).and_then(|bytes| ctx.awareness.apply_remote_update(&bytes));
        if let Err(e) = result {
            log::warn!("Dropping awareness update: {e}");
        }
    }

    fn on_roster(&mut self, users: Vec<RosterUser>) {
        if let Some(ctx) = self.context.as_mut() {
            let me = users
                .iter()
                .find(|user| user.id == self.session.local_user_id());
            if let Some(me) = me {
                let user = AwarenessUser {
                    id: me.id.clone(),
                    name: me.display_name(),
                    color: me.color.clone(),
                    color_light: me.color_light.clone(),
                };
                let current = ctx.awareness.local_state().and_then(|s| s.user.as_ref());
                if current != Some(&user) {
                    ctx.awareness.set_local(AwarenessField::User(Some(user)));
                }
            }
        }
        self.events.push_back(SessionEvent::Roster(users));
    }

    fn complete_bootstrap(&mut self) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        self.bootstrapped = true;

        for fragment in std::mem::take(&mut ctx.pending_updates) {
            if let Err(e) = ctx.replica.apply_update(&fragment, MutationOrigin::Remote) {
                log::warn!("Dropping buffered update: {e}");
            }
        }

        let queued = ctx.offline.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued fragments", queued.len());
            for fragment in queued {
                self.outbox.push_back(WireMessage::update(fragment.as_bytes()));
            }
        }

        self.health.prime(ctx.replica.len() as usize);
        self.set_state(SessionState::Synced);
    }

    // ── Local commands ───────────────────────────────────────────

    /// Apply a local edit batch. Its fragment is sent (or queued) in order.
    pub fn apply_local_edit(&mut self, ops: &[EditOp]) -> Result<UpdateFragment, ReplicaError> {
        let ctx = self.context.as_mut().ok_or(ReplicaError::Unavailable)?;
        let fragment = ctx.replica.mutate(ops, MutationOrigin::Local)?;
        self.drain_changes(Instant::now());
        Ok(fragment)
    }

    pub fn set_cursor(&mut self, cursor: Option<CursorRange>) -> bool {
        let Some(ctx) = self.context.as_mut() else {
            return false;
        };
        ctx.awareness.set_local(AwarenessField::Cursor(cursor));
        self.drain_changes(Instant::now());
        true
    }

    pub fn undo(&mut self) -> bool {
        let Some(ctx) = self.context.as_mut() else {
            return false;
        };
        let undone = ctx.undo.undo(&mut ctx.replica).is_some();
        self.drain_changes(Instant::now());
        undone
    }

    pub fn redo(&mut self) -> bool {
        let Some(ctx) = self.context.as_mut() else {
            return false;
        };
        let redone = ctx.undo.redo(&mut ctx.replica).is_some();
        self.drain_changes(Instant::now());
        redone
    }

    pub fn send_chat(&mut self, message: &str) -> bool {
        self.send_if_open(WireMessage::ChatMessage(ChatMessage {
            message: message.to_string(),
            ..ChatMessage::default()
        }))
    }

    pub fn join_voice(&mut self) -> bool {
        self.send_if_open(WireMessage::JoinVoice)
    }

    pub fn leave_voice(&mut self) -> bool {
        self.send_if_open(WireMessage::LeaveVoice)
    }

    pub fn send_voice_signal(&mut self, target_user: &str, signal_data: Value) -> bool {
        self.send_if_open(WireMessage::VoiceSignal(VoiceSignal {
            target_user: Some(target_user.to_string()),
            from_user: None,
            signal_data,
        }))
    }

    fn send_if_open(&mut self, message: WireMessage) -> bool {
        if self.state.channel_open() {
            self.outbox.push_back(message);
            true
        } else {
            log::debug!("Dropping {} frame in {} state", message.kind(), self.state);
            false
        }
    }

    // ── Timers ───────────────────────────────────────────────────

    pub fn ping_tick(&mut self, now_ms: u64) {
        if !self.timers_active || !self.state.channel_open() {
            return;
        }
        let ping = self.prober.issue(now_ms);
        self.outbox.push_back(ping);
    }

    /// Compare the rendered view against the replica. Only runs once synced.
    pub fn health_tick(&mut self, probe: Result<RenderedState, ViewProbeError>) {
        if !self.timers_active || self.state != SessionState::Synced {
            return;
        }
        let replica_len = self.replica_len() as usize;
        if let HealthVerdict::Crashed(reason) = self.health.check(replica_len, probe) {
            self.events.push_back(SessionEvent::Crashed(reason));
            self.teardown(SessionState::Crashed, true);
        }
    }

    /// When the trailing awareness emission is due.
    pub fn awareness_deadline(&self) -> Option<Instant> {
        if self.state.channel_open() {
            self.throttle.deadline()
        } else {
            None
        }
    }

    pub fn flush_awareness(&mut self, now: Instant) {
        if let Some(clients) = self.throttle.flush_due(now) {
            self.emit_awareness(&clients);
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Reconnect attempts ran out.
    pub fn reconnect_exhausted(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        log::error!("Giving up reconnecting to the relay");
        self.events.push_back(SessionEvent::ReconnectFailed);
        self.teardown(SessionState::Closed, false);
    }

    /// Close the session. Idempotent.
    pub fn close(&mut self) {
        self.teardown(SessionState::Closed, true);
    }

    /// Ordered, non-aborting teardown: stop timers, detach observers, queue
    /// the local departure while the channel is usable, request the channel
    /// close, then destroy the context.
    fn teardown(&mut self, final_state: SessionState, channel_usable: bool) {
        if self.state.is_terminal() {
            return;
        }

        self.timers_active = false;
        self.prober.reset();
        self.throttle.reset();

        if let Some(ctx) = self.context.as_mut() {
            ctx.replica.detach_all();
            ctx.awareness.detach_all();
        }
        self.replica_inbox.borrow_mut().clear();
        self.awareness_inbox.borrow_mut().clear();

        if channel_usable && self.state.channel_open() {
            if let Some(ctx) = self.context.as_mut() {
                ctx.awareness.clear_local();
                let local = ctx.awareness.local_client_id();
                match ctx.awareness.encode_entries(&[local]) {
                    Ok(bytes) => self.outbox.push_back(WireMessage::awareness(&bytes)),
                    Err(e) => log::warn!("Skipping departure notice: {e}"),
                }
            }
        }

        self.close_requested = true;
        self.context = None;
        self.bootstrapped = false;
        self.set_state(final_state);
        if final_state == SessionState::Closed {
            self.events.push_back(SessionEvent::Closed);
        }
    }

    // ── Change propagation ───────────────────────────────────────

    /// Turn queued replica and awareness notifications into outbound frames
    /// and application events, oldest first.
    fn drain_changes(&mut self, now: Instant) {
        let mut text_changed = false;
        loop {
            let change = self.replica_inbox.borrow_mut().pop_front();
            let Some(change) = change else {
                break;
            };
            match change.origin {
                MutationOrigin::Local => self.publish_fragment(change.fragment),
                MutationOrigin::History => {
                    text_changed = true;
                    self.publish_fragment(change.fragment);
                }
                MutationOrigin::Remote => text_changed = true,
            }
        }
        if text_changed {
            let text = self.text();
            self.events.push_back(SessionEvent::TextChanged(text));
        }

        let mut presence_changed = false;
        loop {
            let change = self.awareness_inbox.borrow_mut().pop_front();
            let Some(change) = change else {
                break;
            };
            presence_changed = true;
            if change.origin == ChangeOrigin::Purge {
                continue;
            }
            if let Some(clients) = self.throttle.offer(&change.changed_clients(), now) {
                self.emit_awareness(&clients);
            }
        }
        if presence_changed {
            let peers = self.visible_peers();
            self.events.push_back(SessionEvent::PresenceChanged(peers));
        }
    }

    fn publish_fragment(&mut self, fragment: UpdateFragment) {
        if self.state.channel_open() {
            self.outbox.push_back(WireMessage::update(fragment.as_bytes()));
            return;
        }
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        if !ctx.offline.enqueue(fragment) {
            let full = ctx.replica.encode_snapshot();
            ctx.offline.compact(UpdateFragment(full.0));
        }
        log::debug!(
            "Queued fragment offline ({} pending, {} bytes)",
            ctx.offline.len(),
            ctx.offline.total_bytes()
        );
    }

    fn emit_awareness(&mut self, clients: &[ClientId]) {
        if !self.state.channel_open() {
            return;
        }
        let Some(ctx) = self.context.as_ref() else {
            return;
        };
        match ctx.awareness.encode_entries(clients) {
            Ok(bytes) => self.outbox.push_back(WireMessage::awareness(&bytes)),
            Err(e) => log::warn!("Failed to encode awareness: {e}"),
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        log::info!("Session {} → {next}", self.state);
        self.state = next;
        self.events.push_back(SessionEvent::StateChanged(next));
    }
}
