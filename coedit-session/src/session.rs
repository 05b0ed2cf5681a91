//! Session identity and tunables.
//!
//! A session binds one local user to one project's shared document on the
//! relay. It is immutable once built; everything that changes over its
//! lifetime lives in the [`SyncController`](crate::controller::SyncController).

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::health::HealthThresholds;
use crate::protocol::{ProtocolError, EVICTION_CLOSE_CODE};

/// How the user proves access to the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Authenticated member access.
    Token(String),
    /// Anonymous access through a share link.
    Share(String),
}

impl Credential {
    fn query_key(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Share(_) => "share_token",
        }
    }

    fn value(&self) -> &str {
        match self {
            Self::Token(value) | Self::Share(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    relay_base: Url,
    group_id: u64,
    project_id: u64,
    credential: Credential,
    local_user_id: String,
}

impl Session {
    pub fn builder(relay_base: impl Into<String>) -> SessionBuilder {
        SessionBuilder {
            relay_base: relay_base.into(),
            ..SessionBuilder::default()
        }
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn project_id(&self) -> u64 {
        self.project_id
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Roster id of the local user (as reported in `connection` frames).
    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// `{base}/ws/groups/{g}/projects/{p}/code/?token=...`
    pub fn connect_url(&self) -> Result<Url, SessionError> {
        let mut url = self.relay_base.clone();
        url.path_segments_mut()
            .map_err(|_| SessionError::InvalidRelayUrl(self.relay_base.to_string()))?
            .pop_if_empty()
            .extend([
                "ws",
                "groups",
                &self.group_id.to_string(),
                "projects",
                &self.project_id.to_string(),
                "code",
                "",
            ]);
        url.query_pairs_mut()
            .clear()
            .append_pair(self.credential.query_key(), self.credential.value());
        Ok(url)
    }
}

/// Collects session identifiers; [`SessionBuilder::build`] rejects
/// incomplete sets.
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder {
    relay_base: String,
    group_id: Option<u64>,
    project_id: Option<u64>,
    credential: Option<Credential>,
    local_user_id: Option<String>,
}

impl SessionBuilder {
    pub fn group(mut self, group_id: u64) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn project(mut self, project_id: u64) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn user(mut self, local_user_id: impl Into<String>) -> Self {
        self.local_user_id = Some(local_user_id.into());
        self
    }

    pub fn build(self) -> Result<Session, SessionError> {
        let group_id = self.group_id.ok_or(SessionError::MissingIdentifier("group"))?;
        let project_id = self
            .project_id
            .ok_or(SessionError::MissingIdentifier("project"))?;
        let credential = self
            .credential
            .filter(|c| !c.value().is_empty())
            .ok_or(SessionError::MissingIdentifier("credential"))?;

        let relay_base = Url::parse(&self.relay_base)
            .map_err(|_| SessionError::InvalidRelayUrl(self.relay_base.clone()))?;
        if !matches!(relay_base.scheme(), "ws" | "wss") {
            return Err(SessionError::InvalidRelayUrl(self.relay_base));
        }

        // Share links carry no local id; the relay picks an anonymous one.
        let local_user_id = self.local_user_id.unwrap_or_else(|| match &credential {
            Credential::Token(token) => token.clone(),
            Credential::Share(_) => String::new(),
        });

        Ok(Session {
            relay_base,
            group_id,
            project_id,
            credential,
            local_user_id,
        })
    }
}

/// What to do with update fragments that arrive before bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingUpdatePolicy {
    /// Discard them; the snapshot already contains their effect.
    #[default]
    Drop,
    /// Buffer them and apply right after the snapshot.
    Queue,
}

/// Reconnect backoff: `initial_delay * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Never reconnect.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` once
    /// the attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(
            self.initial_delay
                .checked_mul(factor)
                .map_or(self.max_delay, |delay| delay.min(self.max_delay)),
        )
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            max_attempts: 10,
        }
    }
}

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ping_interval: Duration,
    pub health_interval: Duration,
    pub health: HealthThresholds,
    pub awareness_throttle: Duration,
    /// Remote awareness is applied only once the replica is longer than this.
    pub awareness_min_len: u32,
    pub undo_capture_window: Duration,
    pub pending_updates: PendingUpdatePolicy,
    pub offline_capacity: usize,
    pub reconnect: ReconnectPolicy,
    pub eviction_close_code: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            health_interval: Duration::from_secs(2),
            health: HealthThresholds::default(),
            awareness_throttle: Duration::from_millis(100),
            awareness_min_len: 10,
            undo_capture_window: Duration::from_millis(150),
            pending_updates: PendingUpdatePolicy::default(),
            offline_capacity: 10_000,
            reconnect: ReconnectPolicy::default(),
            eviction_close_code: EVICTION_CLOSE_CODE,
        }
    }
}

/// Session-level errors.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("missing session identifier: {0}")]
    MissingIdentifier(&'static str),
    #[error("invalid relay url: {0}")]
    InvalidRelayUrl(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("send failed: {0}")]
    Send(String),
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("session is closed")]
    Closed,
}
