//! Per-room fan-out for the development relay.
//!
//! Every connection in a room holds one receiver on the room's broadcast
//! channel. Frames are encoded once and carry a [`Delivery`] address; each
//! connection filters what it forwards to its socket:
//!
//! ```text
//!                     ┌──► conn A  (All, AllExcept(B), User("7") if A is 7)
//!  send(delivery) ────┼──► conn B
//!                     └──► conn C
//! ```
//!
//! The group also tracks the room roster (who is connected, in join order)
//! and the voice roster.
//!
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, RosterUser, WireMessage};

/// Identifies one socket; a user may hold several.
pub type ConnId = Uuid;

/// Who a frame is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    All,
    AllExcept(ConnId),
    User(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Arc<str>),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub delivery: Delivery,
    pub frame: Frame,
}

impl Envelope {
    pub fn is_for(&self, conn: ConnId, user_id: &str) -> bool {
        match &self.delivery {
            Delivery::All => true,
            Delivery::AllExcept(sender) => *sender != conn,
            Delivery::User(target) => target == user_id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

#[derive(Debug, Clone)]
struct PeerSlot {
    user: RosterUser,
    joined: u64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    peers: RwLock<HashMap<ConnId, PeerSlot>>,
    voice: RwLock<BTreeSet<String>>,
    capacity: usize,
    joins: AtomicU64,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a slow connection may lag before it starts
    /// losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            voice: RwLock::new(BTreeSet::new()),
            capacity,
            joins: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection and return its receiver.
    pub async fn add_peer(
        &self,
        conn: ConnId,
        user: RosterUser,
    ) -> broadcast::Receiver<Arc<Envelope>> {
        let joined = self.joins.fetch_add(1, Ordering::Relaxed);
        let receiver = self.sender.subscribe();
        self.peers.write().await.insert(conn, PeerSlot { user, joined });
        receiver
    }

    /// Unregister a connection. The user also leaves the voice roster unless
    /// another of their connections is still present.
    pub async fn remove_peer(&self, conn: &ConnId) -> Option<RosterUser> {
        let mut peers = self.peers.write().await;
        let slot = peers.remove(conn)?;
        let still_present = peers.values().any(|p| p.user.id == slot.user.id);
        drop(peers);
        if !still_present {
            self.voice.write().await.remove(&slot.user.id);
        }
        Some(slot.user)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Connected users in join order, one entry per user.
    pub async fn roster(&self) -> Vec<RosterUser> {
        let peers = self.peers.read().await;
        let mut slots: Vec<&PeerSlot> = peers.values().collect();
        slots.sort_by_key(|slot| slot.joined);

        let mut users: Vec<RosterUser> = Vec::with_capacity(slots.len());
        for slot in slots {
            if !users.iter().any(|u| u.id == slot.user.id) {
                users.push(slot.user.clone());
            }
        }
        users
    }

    pub async fn join_voice(&self, user_id: &str) -> bool {
        self.voice.write().await.insert(user_id.to_string())
    }

    pub async fn leave_voice(&self, user_id: &str) -> bool {
        self.voice.write().await.remove(user_id)
    }

    /// Voice participants as `{id, email}` objects.
    pub async fn voice_participants(&self) -> Vec<Value> {
        let voice = self.voice.read().await;
        let roster = self.roster().await;
        voice
            .iter()
            .map(|id| {
                let email = roster
                    .iter()
                    .find(|u| &u.id == id)
                    .map(|u| u.email.clone())
                    .unwrap_or_default();
                json!({ "id": id, "email": email })
            })
            .collect()
    }

    /// Encode once and fan out. Returns the number of receivers.
    pub fn send(&self, delivery: Delivery, message: &WireMessage) -> Result<usize, ProtocolError> {
        let text: Arc<str> = message.encode()?.into();
        Ok(self.publish(Envelope {
            delivery,
            frame: Frame::Text(text),
        }))
    }

    /// Ask every connection in the room to close with `code`.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        self.publish(Envelope {
            delivery: Delivery::All,
            frame: Frame::Close {
                code,
                reason: reason.to_string(),
            },
        })
    }

    fn publish(&self, envelope: Envelope) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: the room may be emptying.
        self.sender.send(Arc::new(envelope)).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }
}
