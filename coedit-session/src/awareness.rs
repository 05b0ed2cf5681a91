//! Ephemeral presence (who is here, where their cursor is).
//!
//! ## Architecture
//!
//! ```text
//! set_local(Cursor)          relay "awareness" frame
//!       │                             │
//!       ▼                             ▼
//! AwarenessTable ◄──── apply_remote_update()  (last-writer-wins per client)
//!       │
//!       ▼  AwarenessChange { added, updated, removed }
//! EmitThrottle  (leading + trailing, 100ms)
//!       │
//!       ▼
//! encode_entries(changed clients) ──► "awareness" frame
//! ```
//!
//! Entries are keyed by a per-session client id, so one user with several
//! tabs owns several entries. The relay's `remove_awareness` names a user,
//! and [`AwarenessTable::remove_by_user_id`] drops every entry that user owns.
//!
//! Reference: Kleppmann, Chapter 8, Broadcast Protocols

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// Identifies one awareness participant (one session, not one user).
pub type ClientId = u64;

// ───────────────────────────────────────────────────────────────────
// Entry payloads
// ───────────────────────────────────────────────────────────────────

/// Identity block of an awareness entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUser {
    pub id: String,
    pub name: String,
    pub color: String,
    pub color_light: String,
}

/// Cursor or selection in UTF-16 offsets. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

impl CursorRange {
    pub fn caret(at: u32) -> Self {
        Self {
            anchor: at,
            head: at,
        }
    }
}

/// Published state of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerState {
    pub user: Option<AwarenessUser>,
    pub cursor: Option<CursorRange>,
}

/// One row of the awareness table. `state == None` means the participant
/// has departed but its clock is still remembered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub clock: u64,
    pub state: Option<PeerState>,
}

/// Field of the local state to overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwarenessField {
    User(Option<AwarenessUser>),
    Cursor(Option<CursorRange>),
}

/// Wire payload carried (bincode, then base64) in `awareness` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<EncodedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedEntry {
    pub client_id: ClientId,
    pub clock: u64,
    pub state: Option<PeerState>,
}

impl AwarenessUpdate {
    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Payload(e.to_string()))
    }

    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Payload(e.to_string()))?;
        Ok(update)
    }
}

// ───────────────────────────────────────────────────────────────────
// Change notifications
// ───────────────────────────────────────────────────────────────────

/// What produced an awareness change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// The local participant updated its own state.
    Local,
    /// Entries merged from a remote awareness update.
    Remote,
    /// Entries purged on the relay's instruction. Never re-broadcast.
    Purge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: ChangeOrigin,
}

impl AwarenessChange {
    fn new(origin: ChangeOrigin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client touched by this change.
    pub fn changed_clients(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// A visible participant, as handed to the presence surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPresence {
    pub client_id: ClientId,
    pub is_local: bool,
    pub user: AwarenessUser,
    pub cursor: Option<CursorRange>,
}

type ChangeObserver = Box<dyn FnMut(&AwarenessChange)>;

// ───────────────────────────────────────────────────────────────────
// Awareness table
// ───────────────────────────────────────────────────────────────────

pub struct AwarenessTable {
    local_client_id: ClientId,
    states: HashMap<ClientId, AwarenessEntry>,
    observers: Vec<ChangeObserver>,
}

impl AwarenessTable {
    /// Create a table with a fresh random local client id.
    pub fn new() -> Self {
        let (high, low) = Uuid::new_v4().as_u64_pair();
        Self::with_client_id(high ^ low)
    }

    pub fn with_client_id(local_client_id: ClientId) -> Self {
        let mut states = HashMap::new();
        states.insert(
            local_client_id,
            AwarenessEntry {
                clock: 0,
                state: Some(PeerState::default()),
            },
        );
        Self {
            local_client_id,
            states,
            observers: Vec::new(),
        }
    }

    pub fn local_client_id(&self) -> ClientId {
        self.local_client_id
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&AwarenessChange) + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn detach_all(&mut self) {
        self.observers.clear();
    }

    pub fn local_state(&self) -> Option<&PeerState> {
        self.states
            .get(&self.local_client_id)
            .and_then(|entry| entry.state.as_ref())
    }

    pub fn entry(&self, client_id: ClientId) -> Option<&AwarenessEntry> {
        self.states.get(&client_id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Overwrite one field of the local state and bump its clock.
    /// A departed local participant is revived with an empty state.
    pub fn set_local(&mut self, field: AwarenessField) {
        let local = self.local_client_id;
        let entry = self.states.entry(local).or_insert(AwarenessEntry {
            clock: 0,
            state: None,
        });
        let revived = entry.state.is_none();
        let state = entry.state.get_or_insert_with(PeerState::default);
        match field {
            AwarenessField::User(user) => state.user = user,
            AwarenessField::Cursor(cursor) => state.cursor = cursor,
        }
        entry.clock += 1;

        let mut change = AwarenessChange::new(ChangeOrigin::Local);
        if revived {
            change.added.push(local);
        } else {
            change.updated.push(local);
        }
        self.notify(&change);
    }

    /// Mark the local participant as departed.
    pub fn clear_local(&mut self) {
        let local = self.local_client_id;
        let entry = self.states.entry(local).or_insert(AwarenessEntry {
            clock: 0,
            state: None,
        });
        let was_present = entry.state.take().is_some();
        entry.clock += 1;

        if was_present {
            let mut change = AwarenessChange::new(ChangeOrigin::Local);
            change.removed.push(local);
            self.notify(&change);
        }
    }

    /// Merge a remote awareness update. Per client, an entry with a clock
    /// lower than or equal to the stored one is discarded. Entries naming
    /// the local client are ignored.
    pub fn apply_remote_update(&mut self, bytes: &[u8]) -> Result<AwarenessChange, ProtocolError> {
        let update = AwarenessUpdate::decode(bytes)?;
        let mut change = AwarenessChange::new(ChangeOrigin::Remote);

        for incoming in update.entries {
            if incoming.client_id == self.local_client_id {
                continue;
            }

            let previous = self.states.get(&incoming.client_id);
            if let Some(existing) = previous {
                if incoming.clock <= existing.clock {
                    continue;
                }
            }
            let was_present = previous.is_some_and(|e| e.state.is_some());

            match (was_present, incoming.state.is_some()) {
                (false, true) => change.added.push(incoming.client_id),
                (true, true) => change.updated.push(incoming.client_id),
                (true, false) => change.removed.push(incoming.client_id),
                (false, false) => {}
            }

            self.states.insert(
                incoming.client_id,
                AwarenessEntry {
                    clock: incoming.clock,
                    state: incoming.state,
                },
            );
        }

        if !change.is_empty() {
            self.notify(&change);
        }
        Ok(change)
    }

    /// Drop every entry whose `user.id` equals `user_id`, emitting a single
    /// change listing all of them. A matching local entry is marked departed
    /// with its clock advanced rather than forgotten.
    pub fn remove_by_user_id(&mut self, user_id: &str) -> Vec<ClientId> {
        let local = self.local_client_id;
        let stale: Vec<ClientId> = self
            .states
            .iter()
            .filter(|(_, entry)| {
                entry
                    .state
                    .as_ref()
                    .and_then(|s| s.user.as_ref())
                    .is_some_and(|user| user.id == user_id)
            })
            .map(|(client_id, _)| *client_id)
            .collect();

        for client_id in &stale {
            if *client_id == local {
                if let Some(entry) = self.states.get_mut(client_id) {
                    entry.state = None;
                    entry.clock += 1;
                }
            } else {
                self.states.remove(client_id);
            }
        }

        if !stale.is_empty() {
            let mut change = AwarenessChange::new(ChangeOrigin::Purge);
            change.removed = stale.clone();
            self.notify(&change);
        }
        stale
    }

    /// Forget every remote entry (the channel went away, so nothing keeps
    /// them current).
    pub fn clear_remote(&mut self) -> Vec<ClientId> {
        let local = self.local_client_id;
        let mut removed = Vec::new();
        self.states.retain(|client_id, entry| {
            if *client_id == local {
                return true;
            }
            if entry.state.is_some() {
                removed.push(*client_id);
            }
            false
        });

        if !removed.is_empty() {
            let mut change = AwarenessChange::new(ChangeOrigin::Purge);
            change.removed = removed.clone();
            self.notify(&change);
        }
        removed
    }

    /// Encode the current entries of `client_ids` (skipping unknown ids).
    pub fn encode_entries(&self, client_ids: &[ClientId]) -> Result<Vec<u8>, ProtocolError> {
        let entries = client_ids
            .iter()
            .filter_map(|client_id| {
                self.states.get(client_id).map(|entry| EncodedEntry {
                    client_id: *client_id,
                    clock: entry.clock,
                    state: entry.state.clone(),
                })
            })
            .collect();
        AwarenessUpdate { entries }.encode()
    }

    /// Participants with a published `user` block, sorted by client id.
    /// Entries without one stay invisible to the presence surface.
    pub fn visible_peers(&self) -> Vec<PeerPresence> {
        let mut peers: Vec<PeerPresence> = self
            .states
            .iter()
            .filter_map(|(client_id, entry)| {
                let state = entry.state.as_ref()?;
                let user = state.user.clone()?;
                Some(PeerPresence {
                    client_id: *client_id,
                    is_local: *client_id == self.local_client_id,
                    user,
                    cursor: state.cursor,
                })
            })
            .collect();
        peers.sort_by_key(|peer| peer.client_id);
        peers
    }

    fn notify(&mut self, change: &AwarenessChange) {
        for observer in self.observers.iter_mut() {
            observer(change);
        }
    }
}

impl Default for AwarenessTable {
    fn default() -> Self {
        Self::new()
    }
}

// ───────────────────────────────────────────────────────────────────
// Emit throttle
// ───────────────────────────────────────────────────────────────────

/// Leading + trailing rate limiter for outbound awareness.
///
/// The first change after a quiet period goes out immediately. Changes
/// arriving within `interval` of the last emission are coalesced and go out
/// once the interval elapses (see [`EmitThrottle::deadline`]).
pub struct EmitThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: BTreeSet<ClientId>,
}

impl EmitThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: BTreeSet::new(),
        }
    }

    /// Record changed clients. Returns the set to emit now, if any.
    pub fn offer(&mut self, clients: &[ClientId], now: Instant) -> Option<Vec<ClientId>> {
        self.pending.extend(clients.iter().copied());
        if self.pending.is_empty() {
            return None;
        }
        match self.last_emit {
            Some(last) if now.saturating_duration_since(last) < self.interval => None,
            _ => self.take(now),
        }
    }

    /// When the trailing emission is due, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.last_emit.map_or_else(Instant::now, |last| last + self.interval))
    }

    /// Emit the coalesced set if its deadline has passed.
    pub fn flush_due(&mut self, now: Instant) -> Option<Vec<ClientId>> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.take(now),
            _ => None,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop anything pending and forget the last emission.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_emit = None;
    }

    fn take(&mut self, now: Instant) -> Option<Vec<ClientId>> {
        self.last_emit = Some(now);
        let clients: Vec<ClientId> = std::mem::take(&mut self.pending).into_iter().collect();
        Some(clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn user(id: &str) -> AwarenessUser {
        AwarenessUser {
            id: id.to_string(),
            name: format!("user-{id}"),
            color: "#30bced".into(),
            color_light: "#30bced33".into(),
        }
    }

    fn update(entries: Vec<(ClientId, u64, Option<PeerState>)>) -> Vec<u8> {
        AwarenessUpdate {
            entries: entries
                .into_iter()
                .map(|(client_id, clock, state)| EncodedEntry {
                    client_id,
                    clock,
                    state,
                })
                .collect(),
        }
        .encode()
        .unwrap()
    }

    fn present(id: &str, cursor: Option<CursorRange>) -> Option<PeerState> {
        Some(PeerState {
            user: Some(user(id)),
            cursor,
        })
    }

    fn recorder(table: &mut AwarenessTable) -> Rc<RefCell<Vec<AwarenessChange>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        table.subscribe(move |change| sink.borrow_mut().push(change.clone()));
        log
    }

    #[test]
    fn test_local_entry_starts_present_but_invisible() {
        let table = AwarenessTable::with_client_id(1);
        assert_eq!(table.entry(1).unwrap().clock, 0);
        assert!(table.local_state().is_some());
        assert!(table.visible_peers().is_empty());
    }

    #[test]
    fn test_set_local_bumps_clock_and_notifies() {
        let mut table = AwarenessTable::with_client_id(1);
        let log = recorder(&mut table);

        table.set_local(AwarenessField::User(Some(user("7"))));
        table.set_local(AwarenessField::Cursor(Some(CursorRange::caret(3))));

        assert_eq!(table.entry(1).unwrap().clock, 2);
        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].updated, vec![1]);
        assert_eq!(log[1].origin, ChangeOrigin::Local);

        let visible = table.visible_peers();
        assert_eq!(visible.len(), 1);
        assert!(visible[0].is_local);
        assert_eq!(visible[0].cursor, Some(CursorRange::caret(3)));
    }

    #[test]
    fn test_remote_lww_per_client() {
        let mut table = AwarenessTable::with_client_id(1);
        let log = recorder(&mut table);

        let change = table
            .apply_remote_update(&update(vec![(2, 5, present("b", Some(CursorRange::caret(1))))]))
            .unwrap();
        assert_eq!(change.added, vec![2]);

        // Equal clock is discarded.
        let change = table
            .apply_remote_update(&update(vec![(2, 5, present("b", Some(CursorRange::caret(9))))]))
            .unwrap();
        assert!(change.is_empty());

        // Lower clock is discarded.
        table
            .apply_remote_update(&update(vec![(2, 4, present("b", None))]))
            .unwrap();
        assert_eq!(
            table.entry(2).unwrap().state.as_ref().unwrap().cursor,
            Some(CursorRange::caret(1))
        );

        let change = table
            .apply_remote_update(&update(vec![(2, 6, present("b", Some(CursorRange::caret(4))))]))
            .unwrap();
        assert_eq!(change.updated, vec![2]);
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_remote_departure_keeps_clock() {
        let mut table = AwarenessTable::with_client_id(1);
        table
            .apply_remote_update(&update(vec![(2, 1, present("b", None))]))
            .unwrap();
        let change = table
            .apply_remote_update(&update(vec![(2, 2, None)]))
            .unwrap();
        assert_eq!(change.removed, vec![2]);
        assert_eq!(table.entry(2).unwrap().clock, 2);
        assert!(table.visible_peers().is_empty());
    }

    #[test]
    fn test_remote_entry_for_local_client_ignored() {
        let mut table = AwarenessTable::with_client_id(1);
        let change = table
            .apply_remote_update(&update(vec![(1, 99, None)]))
            .unwrap();
        assert!(change.is_empty());
        assert!(table.local_state().is_some());
    }

    #[test]
    fn test_entry_without_user_is_invisible() {
        let mut table = AwarenessTable::with_client_id(1);
        table
            .apply_remote_update(&update(vec![(
                2,
                1,
                Some(PeerState {
                    user: None,
                    cursor: Some(CursorRange::caret(0)),
                }),
            )]))
            .unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.visible_peers().is_empty());
    }

    #[test]
    fn test_remove_by_user_id_purges_all_tabs_once() {
        let mut table = AwarenessTable::with_client_id(1);
        table
            .apply_remote_update(&update(vec![
                (2, 1, present("u", None)),
                (3, 1, present("u", Some(CursorRange::caret(2)))),
                (4, 1, present("other", None)),
            ]))
            .unwrap();
        let log = recorder(&mut table);

        let mut removed = table.remove_by_user_id("u");
        removed.sort_unstable();
        assert_eq!(removed, vec![2, 3]);

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].origin, ChangeOrigin::Purge);
        assert_eq!(log[0].removed.len(), 2);

        let visible: Vec<ClientId> = table.visible_peers().iter().map(|p| p.client_id).collect();
        assert_eq!(visible, vec![4]);
    }

    #[test]
    fn test_remove_by_user_id_includes_local_entry() {
        let mut table = AwarenessTable::with_client_id(1);
        table.set_local(AwarenessField::User(Some(user("7"))));
        let clock = table.entry(1).unwrap().clock;
        table
            .apply_remote_update(&update(vec![(5, 1, present("7", None))]))
            .unwrap();
        let log = recorder(&mut table);

        let mut removed = table.remove_by_user_id("7");
        removed.sort_unstable();
        assert_eq!(removed, vec![1, 5]);
        assert_eq!(log.borrow().len(), 1);

        let remaining = table
            .states
            .values()
            .filter_map(|e| e.state.as_ref().and_then(|s| s.user.as_ref()))
            .filter(|u| u.id == "7")
            .count();
        assert_eq!(remaining, 0);
        assert!(table.local_state().is_none());
        assert_eq!(table.entry(1).unwrap().clock, clock + 1);
    }

    #[test]
    fn test_remove_unknown_user_is_silent() {
        let mut table = AwarenessTable::with_client_id(1);
        let log = recorder(&mut table);
        assert!(table.remove_by_user_id("ghost").is_empty());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_clear_remote_keeps_local() {
        let mut table = AwarenessTable::with_client_id(1);
        table.set_local(AwarenessField::User(Some(user("me"))));
        table
            .apply_remote_update(&update(vec![(2, 1, present("b", None)), (3, 4, None)]))
            .unwrap();
        let log = recorder(&mut table);

        assert_eq!(table.clear_remote(), vec![2]);
        assert_eq!(table.len(), 1);
        assert_eq!(log.borrow()[0].origin, ChangeOrigin::Purge);
        assert!(table.visible_peers()[0].is_local);
    }

    #[test]
    fn test_clear_local_then_revive() {
        let mut table = AwarenessTable::with_client_id(1);
        table.set_local(AwarenessField::User(Some(user("7"))));
        let log = recorder(&mut table);

        table.clear_local();
        assert!(table.local_state().is_none());
        assert_eq!(table.entry(1).unwrap().clock, 2);

        table.set_local(AwarenessField::Cursor(None));
        assert_eq!(log.borrow()[0].removed, vec![1]);
        assert_eq!(log.borrow()[1].added, vec![1]);
        // The revived state starts empty, so no user block is visible.
        assert!(table.visible_peers().is_empty());
    }

    #[test]
    fn test_encode_entries_round_trip_into_other_table() {
        let mut source = AwarenessTable::with_client_id(1);
        source.set_local(AwarenessField::User(Some(user("7"))));
        let bytes = source.encode_entries(&[1, 42]).unwrap();

        let mut sink = AwarenessTable::with_client_id(2);
        let change = sink.apply_remote_update(&bytes).unwrap();
        assert_eq!(change.added, vec![1]);
        assert_eq!(sink.visible_peers()[0].user.id, "7");
    }

    #[test]
    fn test_garbage_update_is_error() {
        let mut table = AwarenessTable::with_client_id(1);
        assert!(table.apply_remote_update(&[0xff, 0xff]).is_err());
    }

    #[test]
    fn test_throttle_leading_edge() {
        let mut throttle = EmitThrottle::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert_eq!(throttle.offer(&[1], t0), Some(vec![1]));
        assert!(throttle.deadline().is_none());
    }

    #[test]
    fn test_throttle_trailing_coalesces() {
        let mut throttle = EmitThrottle::new(Duration::from_millis(100));
        let t0 = Instant::now();
        throttle.offer(&[1], t0);

        assert_eq!(throttle.offer(&[2], t0 + Duration::from_millis(10)), None);
        assert_eq!(throttle.offer(&[1, 2], t0 + Duration::from_millis(20)), None);
        assert_eq!(throttle.deadline(), Some(t0 + Duration::from_millis(100)));

        assert_eq!(throttle.flush_due(t0 + Duration::from_millis(50)), None);
        assert_eq!(
            throttle.flush_due(t0 + Duration::from_millis(100)),
            Some(vec![1, 2])
        );
        assert!(!throttle.has_pending());
    }

    #[test]
    fn test_throttle_after_quiet_period_is_immediate() {
        let mut throttle = EmitThrottle::new(Duration::from_millis(100));
        let t0 = Instant::now();
        throttle.offer(&[1], t0);
        assert_eq!(
            throttle.offer(&[3], t0 + Duration::from_millis(250)),
            Some(vec![3])
        );
    }

    #[test]
    fn test_throttle_reset() {
        let mut throttle = EmitThrottle::new(Duration::from_millis(100));
        let t0 = Instant::now();
        throttle.offer(&[1], t0);
        throttle.offer(&[2], t0);
        throttle.reset();
        assert!(throttle.deadline().is_none());
        assert_eq!(throttle.offer(&[5], t0), Some(vec![5]));
    }
}
