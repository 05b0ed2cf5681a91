//! In-memory development relay speaking the session wire protocol.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (group, project) ── Yrs Doc ── BroadcastGroup
//! Client B ──┘                                            │
//!                                          ┌──────────────┼──────────────┐
//!                                          ▼              ▼              ▼
//!                                       Client A       Client B       Client C
//! ```
//!
//! Each room maintains:
//! - An authoritative Yrs `Doc`, absent until the first content arrives
//! - A `BroadcastGroup` for fan-out, the roster and the voice roster
//!
//! Nothing is persisted; a room disappears with its last connection.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, Transact, Update};

use crate::broadcast::{BroadcastGroup, ConnId, Delivery, Envelope, Frame};
use crate::protocol::{
    decode_b64, ChatMessage, ProtocolError, RosterUser, VoiceSignal, WireMessage,
    ANONYMOUS_REJECTED_CLOSE_CODE, EVICTION_CLOSE_CODE, NOT_A_MEMBER_CLOSE_CODE,
};
use crate::replica::TEXT_NAME;
use crate::transport::{close_message, encode_frame};

pub const MESSAGE_TOO_LARGE: &str = "Message too large";

const MAX_CHAT_LEN: usize = 1000;

/// `(color, colorLight)` pairs handed out to participants.
const PALETTE: [(&str, &str); 8] = [
    ("#30bced", "#30bced33"),
    ("#6eeb83", "#6eeb8333"),
    ("#ffbc42", "#ffbc4233"),
    ("#ecd444", "#ecd44433"),
    ("#ee6352", "#ee635233"),
    ("#9ac2c9", "#9ac2c933"),
    ("#8acb88", "#8acb8833"),
    ("#1be7ff", "#1be7ff33"),
];

const HERO_ADJECTIVES: [&str; 16] = [
    "Swift", "Cosmic", "Thunder", "Shadow", "Mighty", "Blazing", "Quantum", "Mystic",
    "Stellar", "Neon", "Phantom", "Crimson", "Arctic", "Sonic", "Astral", "Solar",
];

const HERO_NOUNS: [&str; 16] = [
    "Phoenix", "Falcon", "Panther", "Wolf", "Dragon", "Titan", "Hawk", "Viper",
    "Raven", "Lynx", "Griffin", "Kraken", "Wizard", "Ranger", "Sentinel", "Voyager",
];

type RelaySocket = WebSocketStream<TcpStream>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it lags
    pub broadcast_capacity: usize,
    /// Inbound text frames above this many bytes are answered with `error`
    pub max_message_size: usize,
    /// Content materialised into every fresh room
    pub seed: Option<String>,
    /// When set, tokens outside this list also need a share token
    pub members: Option<Vec<String>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            broadcast_capacity: 256,
            max_message_size: 512 * 1024,
            seed: None,
            members: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub group_id: u64,
    pub project_id: u64,
}

impl RoomKey {
    /// Parse `/ws/groups/{g}/projects/{p}/code/`.
    fn from_path(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["ws", "groups", group, "projects", project, "code"] => Some(Self {
                group_id: group.parse().ok()?,
                project_id: project.parse().ok()?,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}/p{}", self.group_id, self.project_id)
    }
}

/// What a connecting client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct JoinRequest {
    room: RoomKey,
    token: Option<String>,
    share_token: Option<String>,
}

impl JoinRequest {
    fn parse(target: &str) -> Option<Self> {
        let url = Url::parse(&format!("ws://relay{target}")).ok()?;
        let room = RoomKey::from_path(url.path())?;
        let mut token = None;
        let mut share_token = None;
        for (key, value) in url.query_pairs() {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "token" => token = Some(value.into_owned()),
                "share_token" => share_token = Some(value.into_owned()),
                _ => {}
            }
        }
        Some(Self {
            room,
            token,
            share_token,
        })
    }
}

struct Room {
    doc: Option<Doc>,
    group: Arc<BroadcastGroup>,
}

impl Room {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: None,
            group: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }
}

/// The development relay. Cheap to clone; clones share all rooms.
#[derive(Clone)]
pub struct DevRelay {
    config: Arc<RelayConfig>,
    rooms: Arc<RwLock<HashMap<RoomKey, Room>>>,
    stats: Arc<RwLock<RelayStats>>,
}

impl DevRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections from `listener`, one task per connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Dev relay listening on {addr}");
        }
        loop {
            let (stream, addr) = listener.accept().await.map_err(RelayError::Accept)?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Close every connection in a room with the eviction code. Returns the
    /// number of connections notified.
    pub async fn evict(&self, group_id: u64, project_id: u64) -> usize {
        let key = RoomKey {
            group_id,
            project_id,
        };
        let rooms = self.rooms.read().await;
        match rooms.get(&key) {
            Some(room) => {
                log::info!("Evicting room {key}");
                room.group.close_all(EVICTION_CLOSE_CODE, "Your work was saved")
            }
            None => 0,
        }
    }

    /// Current text of a room's document.
    pub async fn room_text(&self, group_id: u64, project_id: u64) -> Option<String> {
        let key = RoomKey {
            group_id,
            project_id,
        };
        let rooms = self.rooms.read().await;
        let doc = rooms.get(&key)?.doc.as_ref()?;
        let text = doc.get_or_insert_text(TEXT_NAME);
        let txn = doc.transact();
        Some(text.get_string(&txn))
    }

    pub async fn peer_count(&self, group_id: u64, project_id: u64) -> usize {
        let key = RoomKey {
            group_id,
            project_id,
        };
        let group = {
            let rooms = self.rooms.read().await;
            match rooms.get(&key) {
                Some(room) => room.group.clone(),
                None => return 0,
            }
        };
        group.peer_count().await
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    // ── Connection lifecycle ─────────────────────────────────────

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let mut target = String::new();
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                target = request.uri().to_string();
                Ok(response)
            },
        )
        .await?;
        let (mut sink, source) = ws.split();
        self.stats.write().await.total_connections += 1;

        let Some(join) = JoinRequest::parse(&target) else {
            log::warn!("Rejecting {addr}: unknown path");
            let _ = sink.send(close_message(1008, "unknown session path")).await;
            return Ok(());
        };
        let user = match self.admit(&join) {
            Ok(user) => user,
            Err((code, reason)) => {
                log::warn!("Rejecting {addr} from room {} (code {code})", join.room);
                self.stats.write().await.rejected_connections += 1;
                let _ = sink.send(close_message(code, reason)).await;
                let _ = sink.close().await;
                return Ok(());
            }
        };

        let key = join.room;
        let conn: ConnId = Uuid::new_v4();
        let (group, receiver) = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(key)
                .or_insert_with(|| Room::new(self.config.broadcast_capacity));
            let group = room.group.clone();
            let receiver = group.add_peer(conn, user.clone()).await;
            (group, receiver)
        };
        self.stats.write().await.active_connections += 1;
        log::info!("Peer {} joined room {key} from {addr}", user.id);

        let outcome = self
            .serve_peer(key, conn, &user, &group, sink, source, receiver)
            .await;
        self.disconnect(key, conn, &group).await;
        outcome
    }

    /// Decide who a connection is, or the close code rejecting it.
    fn admit(&self, join: &JoinRequest) -> Result<RosterUser, (u16, &'static str)> {
        if let Some(token) = &join.token {
            let is_member = match &self.config.members {
                Some(members) => members.iter().any(|m| m == token),
                None => true,
            };
            if !is_member && join.share_token.is_none() {
                return Err((NOT_A_MEMBER_CLOSE_CODE, "not a member of this project"));
            }
            return Ok(roster_user(token.clone(), format!("{token}@coedit.local")));
        }
        if join.share_token.is_some() {
            let hero = hero_name();
            return Ok(roster_user(format!("anon_{hero}"), format!("🦸 {hero}")));
        }
        Err((ANONYMOUS_REJECTED_CLOSE_CODE, "share token required"))
    }

    #[allow(clippy::too_many_arguments)]
    async fn serve_peer(
        &self,
        key: RoomKey,
        conn: ConnId,
        user: &RosterUser,
        group: &BroadcastGroup,
        mut sink: SplitSink<RelaySocket, Message>,
        mut source: SplitStream<RelaySocket>,
        mut receiver: broadcast::Receiver<Arc<Envelope>>,
    ) -> Result<(), RelayError> {
        self.broadcast_roster(group).await?;
        sink.send(encode_frame(&self.bootstrap(key).await)?).await?;
        let voice = WireMessage::VoiceRoomUpdate {
            participants: group.voice_participants().await,
        };
        sink.send(encode_frame(&voice)?).await?;

        loop {
            tokio::select! {
                inbound = source.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        self.stats.write().await.total_messages += 1;
                        if text.len() > self.config.max_message_size {
                            log::warn!("Oversized frame ({} bytes) from {}", text.len(), user.id);
                            let error = WireMessage::Error {
                                message: MESSAGE_TOO_LARGE.to_string(),
                            };
                            sink.send(encode_frame(&error)?).await?;
                            continue;
                        }
                        match WireMessage::decode(text.as_str()) {
                            Ok(message) => {
                                let reply = self
                                    .handle_message(key, conn, user, group, message)
                                    .await?;
                                if let Some(reply) = reply {
                                    sink.send(encode_frame(&reply)?).await?;
                                }
                            }
                            Err(e) => log::warn!("Dropping malformed frame from {}: {e}", user.id),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Peer {} left room {key}", user.id);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                outbound = receiver.recv() => match outbound {
                    Ok(envelope) => {
                        if !envelope.is_for(conn, &user.id) {
                            continue;
                        }
                        match &envelope.frame {
                            Frame::Text(text) => sink.send(Message::text(text.to_string())).await?,
                            Frame::Close { code, reason } => {
                                let _ = sink.send(close_message(*code, reason)).await;
                                let _ = sink.close().await;
                                return Ok(());
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {} lagged by {n} frames", user.id);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn handle_message(
        &self,
        key: RoomKey,
        conn: ConnId,
        user: &RosterUser,
        group: &BroadcastGroup,
        message: WireMessage,
    ) -> Result<Option<WireMessage>, RelayError> {
        log::trace!("Inbound {} frame from {}", message.kind(), user.id);
        match message {
            WireMessage::Update { update_b64 } => {
                let merged = match decode_b64(&update_b64) {
                    Ok(bytes) => self.merge_update(key, &bytes).await,
                    Err(e) => Err(e.to_string()),
                };
                match merged {
                    Ok(()) => {
                        let relayed = WireMessage::Update { update_b64 };
                        group.send(Delivery::AllExcept(conn), &relayed)?;
                    }
                    Err(e) => log::warn!("Dropping update from {}: {e}", user.id),
                }
                Ok(None)
            }
            WireMessage::RequestSync => Ok(Some(self.bootstrap(key).await)),
            WireMessage::Awareness { update_b64 } => {
                let relayed = WireMessage::Awareness { update_b64 };
                group.send(Delivery::AllExcept(conn), &relayed)?;
                Ok(None)
            }
            WireMessage::ChatMessage(chat) => {
                let text = chat.message.trim();
                if text.is_empty() || text.chars().count() > MAX_CHAT_LEN {
                    log::debug!("Dropping chat message of {} chars", text.chars().count());
                    return Ok(None);
                }
                let stamped = ChatMessage {
                    message: text.to_string(),
                    user_id: Some(user.id.clone()),
                    user_email: Some(user.email.clone()),
                    color: Some(user.color.clone()),
                    timestamp: Some(epoch_seconds()),
                };
                group.send(Delivery::All, &WireMessage::ChatMessage(stamped))?;
                Ok(None)
            }
            WireMessage::JoinVoice => {
                group.join_voice(&user.id).await;
                self.broadcast_voice(group).await?;
                Ok(None)
            }
            WireMessage::LeaveVoice => {
                group.leave_voice(&user.id).await;
                self.broadcast_voice(group).await?;
                Ok(None)
            }
            WireMessage::VoiceSignal(signal) => {
                match signal.target_user {
                    Some(target) if !target.is_empty() && !signal.signal_data.is_null() => {
                        let forwarded = VoiceSignal {
                            target_user: None,
                            from_user: Some(user.id.clone()),
                            signal_data: signal.signal_data,
                        };
                        let message = WireMessage::VoiceSignal(forwarded);
                        group.send(Delivery::User(target), &message)?;
                    }
                    _ => log::debug!("Dropping voice signal without target from {}", user.id),
                }
                Ok(None)
            }
            WireMessage::Ping { timestamp } => Ok(Some(WireMessage::Pong { timestamp })),
            other => {
                log::debug!("Ignoring client-sent {} frame", other.kind());
                Ok(None)
            }
        }
    }

    async fn disconnect(&self, key: RoomKey, conn: ConnId, group: &BroadcastGroup) {
        let Some(user) = group.remove_peer(&conn).await else {
            return;
        };
        {
            let mut stats = self.stats.write().await;
            stats.active_connections = stats.active_connections.saturating_sub(1);
        }

        let still_present = group.roster().await.iter().any(|u| u.id == user.id);
        let notified = async {
            self.broadcast_roster(group).await?;
            self.broadcast_voice(group).await?;
            if !still_present {
                group.send(
                    Delivery::AllExcept(conn),
                    &WireMessage::RemoveAwareness {
                        user_id: user.id.clone(),
                    },
                )?;
            }
            Ok::<(), RelayError>(())
        };
        if let Err(e) = notified.await {
            log::warn!("Failed to announce departure of {}: {e}", user.id);
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&key) {
            if room.group.is_empty().await {
                rooms.remove(&key);
                log::info!("Room {key} removed (empty)");
            }
        }
    }

    // ── Room state ───────────────────────────────────────────────

    /// `sync` with the room document, materialising the seed into a fresh
    /// document first; `initial` with empty content when there is neither.
    async fn bootstrap(&self, key: RoomKey) -> WireMessage {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&key) else {
            return WireMessage::Initial {
                content: String::new(),
            };
        };
        if room.doc.is_none() {
            if let Some(seed) = self.config.seed.as_deref().filter(|s| !s.is_empty()) {
                room.doc = Some(seeded_doc(seed));
            }
        }
        match &room.doc {
            Some(doc) => {
                let snapshot = doc
                    .transact()
                    .encode_state_as_update_v1(&StateVector::default());
                WireMessage::sync(&snapshot)
            }
            None => WireMessage::Initial {
                content: String::new(),
            },
        }
    }

    async fn merge_update(&self, key: RoomKey, bytes: &[u8]) -> Result<(), String> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&key).ok_or_else(|| format!("room {key} is gone"))?;
        // `Update` is not `Send`; decode only once the lock is held.
        let update = Update::decode_v1(bytes).map_err(|e| e.to_string())?;
        let doc = room.doc.get_or_insert_with(room_doc);
        let mut txn = doc.transact_mut();
        txn.apply_update(update).map_err(|e| format!("{e:?}"))?;
        Ok(())
    }

    async fn broadcast_roster(&self, group: &BroadcastGroup) -> Result<(), RelayError> {
        let users = group.roster().await;
        group.send(Delivery::All, &WireMessage::Connection { users })?;
        Ok(())
    }

    async fn broadcast_voice(&self, group: &BroadcastGroup) -> Result<(), RelayError> {
        let participants = group.voice_participants().await;
        group.send(Delivery::All, &WireMessage::VoiceRoomUpdate { participants })?;
        Ok(())
    }
}

fn room_doc() -> Doc {
    Doc::with_options(Options {
        offset_kind: OffsetKind::Utf16,
        ..Options::default()
    })
}

fn seeded_doc(seed: &str) -> Doc {
    let doc = room_doc();
    let text = doc.get_or_insert_text(TEXT_NAME);
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, seed);
    }
    doc
}

fn roster_user(id: String, email: String) -> RosterUser {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    let (color, color_light) = PALETTE[(hasher.finish() % PALETTE.len() as u64) as usize];
    RosterUser {
        id,
        email,
        color: color.to_string(),
        color_light: color_light.to_string(),
    }
}

fn hero_name() -> String {
    let (high, low) = Uuid::new_v4().as_u64_pair();
    let adjective = HERO_ADJECTIVES[(high % HERO_ADJECTIVES.len() as u64) as usize];
    let noun = HERO_NOUNS[(low % HERO_NOUNS.len() as u64) as usize];
    format!("{adjective}{noun}")
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
