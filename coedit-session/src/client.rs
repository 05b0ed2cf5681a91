//! Async driver connecting a [`SyncController`] to a live relay.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect with backoff, close)
//! - Strictly ordered inbound dispatch, one frame at a time
//! - Ping, health-check and awareness-throttle timers
//! - A command handle for the application and an event stream back to it
//!
//! ```text
//!  ClientHandle ──command──┐
//!                          ▼
//!  relay socket ──frame──► select! ──► SyncController ──outbox──► relay socket
//!  timers ──tick───────────┘                 │
//!                                            └──events──► application
//! ```
//!
//! The controller is single-threaded (`!Send`); spawn [`SyncClient::run`]
//! with `tokio::task::spawn_local` inside a `LocalSet`.
//!
//! Reference: Kleppmann, Chapter 5, Replication

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use crate::awareness::CursorRange;
use crate::controller::{SessionEvent, SyncController};
use crate::health::RenderedView;
use crate::latency::epoch_millis;
use crate::protocol::WireMessage;
use crate::replica::EditOp;
use crate::session::{Session, SessionConfig, SessionError};
use crate::transport::{self, RelayStream, TransportEvent};

/// Application commands accepted by a running client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Edit(Vec<EditOp>),
    Cursor(Option<CursorRange>),
    Undo,
    Redo,
    Chat(String),
    JoinVoice,
    LeaveVoice,
    VoiceSignal {
        target_user: String,
        signal_data: Value,
    },
    Close,
}

/// Cloneable, `Send` handle for driving a running [`SyncClient`].
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl ClientHandle {
    pub fn send(&self, command: ClientCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Closed)
    }

    pub fn edit(&self, ops: Vec<EditOp>) -> Result<(), SessionError> {
        self.send(ClientCommand::Edit(ops))
    }

    pub fn insert(&self, index: u32, text: impl Into<String>) -> Result<(), SessionError> {
        self.edit(vec![EditOp::insert(index, text)])
    }

    pub fn set_cursor(&self, cursor: Option<CursorRange>) -> Result<(), SessionError> {
        self.send(ClientCommand::Cursor(cursor))
    }

    pub fn undo(&self) -> Result<(), SessionError> {
        self.send(ClientCommand::Undo)
    }

    pub fn redo(&self) -> Result<(), SessionError> {
        self.send(ClientCommand::Redo)
    }

    pub fn chat(&self, message: impl Into<String>) -> Result<(), SessionError> {
        self.send(ClientCommand::Chat(message.into()))
    }

    pub fn close(&self) -> Result<(), SessionError> {
        self.send(ClientCommand::Close)
    }
}

/// The sync client.
pub struct SyncClient {
    controller: SyncController,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    view: Option<Box<dyn RenderedView>>,
}

impl SyncClient {
    /// Create a client plus its command handle and event receiver.
    pub fn new(
        session: Session,
        config: SessionConfig,
    ) -> (Self, ClientHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::from_controller(SyncController::new(session, config))
    }

    pub fn from_controller(
        controller: SyncController,
    ) -> (Self, ClientHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client = Self {
            controller,
            commands: command_rx,
            events: event_tx,
            view: None,
        };
        (
            client,
            ClientHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }

    /// Attach the rendered view checked by the health monitor.
    pub fn with_view(mut self, view: impl RenderedView + 'static) -> Self {
        self.view = Some(Box::new(view));
        self
    }

    pub fn controller(&self) -> &SyncController {
        &self.controller
    }

    /// Run until the session reaches a terminal state.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let url = self.controller.session().connect_url()?;
        let mut attempt: u32 = 0;

        while !self.controller.state().is_terminal() {
            self.controller.begin_connect();
            self.forward_events();

            match transport::connect(&url).await {
                Ok(stream) => {
                    attempt = 0;
                    self.controller.handle_transport(TransportEvent::Opened);
                    self.pump(stream).await;
                }
                Err(e) => {
                    self.controller
                        .handle_transport(TransportEvent::Error(e.to_string()));
                }
            }
            self.forward_events();
            if self.controller.state().is_terminal() {
                break;
            }

            attempt += 1;
            match self.controller.config().reconnect.delay_for(attempt) {
                Some(delay) => {
                    log::info!("Reconnecting in {delay:?} (attempt {attempt})");
                    self.wait_offline(delay).await;
                }
                None => {
                    self.controller.reconnect_exhausted();
                    self.forward_events();
                    return Err(SessionError::ReconnectExhausted {
                        attempts: self.controller.config().reconnect.max_attempts,
                    });
                }
            }
        }

        self.forward_events();
        Ok(())
    }

    /// Serve one open connection until it ends.
    async fn pump(&mut self, stream: RelayStream) {
        let (mut sink, mut source) = stream.split();

        let ping_period = self.controller.config().ping_interval;
        let mut ping = interval_at(Instant::now() + ping_period, ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let health_period = self.controller.config().health_interval;
        let mut health = interval_at(Instant::now() + health_period, health_period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !self.flush(&mut sink).await {
                break;
            }
            self.forward_events();

            if self.controller.close_requested() {
                let _ = sink
                    .send(transport::close_message(1000, "session closed"))
                    .await;
                let _ = sink.close().await;
                break;
            }
            if !self.controller.state().channel_open() {
                break;
            }

            let deadline = self.controller.awareness_deadline();
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(message)) => {
                        if let Some(event) = transport::decode_frame(message) {
                            self.controller.handle_transport(event);
                        }
                    }
                    Some(Err(e)) => {
                        self.controller.handle_transport(TransportEvent::Error(e.to_string()));
                    }
                    None => {
                        self.controller.handle_transport(TransportEvent::Closed {
                            code: None,
                            reason: "stream ended".into(),
                        });
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.apply_command(command),
                    None => self.controller.close(),
                },
                _ = ping.tick() => self.controller.ping_tick(epoch_millis()),
                _ = health.tick(), if self.view.is_some() => self.check_health(),
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.controller.flush_awareness(std::time::Instant::now());
                }
            }
        }

        self.forward_events();
    }

    /// Send everything in the controller's outbox. On a send failure the
    /// unsent frames are handed back to the controller and `false` returned.
    async fn flush(&mut self, sink: &mut SplitSink<RelayStream, Message>) -> bool {
        let mut pending: VecDeque<WireMessage> = self.controller.take_outbound().into();
        while let Some(message) = pending.pop_front() {
            let frame = match transport::encode_frame(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("Dropping unencodable {} frame: {e}", message.kind());
                    continue;
                }
            };
            log::trace!("Outbound {} frame", message.kind());
            if let Err(e) = sink.send(frame).await {
                let error = SessionError::Send(e.to_string());
                pending.push_front(message);
                self.controller.requeue_failed(pending.into(), &error.to_string());
                return false;
            }
        }
        true
    }

    /// Keep serving commands while disconnected, so edits land in the
    /// offline queue.
    async fn wait_offline(&mut self, delay: Duration) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply_command(command),
                    None => self.controller.close(),
                },
            }
            self.forward_events();
            if self.controller.state().is_terminal() {
                return;
            }
        }
    }

    fn apply_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Edit(ops) => {
                if let Err(e) = self.controller.apply_local_edit(&ops) {
                    log::warn!("Rejected local edit: {e}");
                }
            }
            ClientCommand::Cursor(cursor) => {
                self.controller.set_cursor(cursor);
            }
            ClientCommand::Undo => {
                self.controller.undo();
            }
            ClientCommand::Redo => {
                self.controller.redo();
            }
            ClientCommand::Chat(message) => {
                self.controller.send_chat(&message);
            }
            ClientCommand::JoinVoice => {
                self.controller.join_voice();
            }
            ClientCommand::LeaveVoice => {
                self.controller.leave_voice();
            }
            ClientCommand::VoiceSignal {
                target_user,
                signal_data,
            } => {
                self.controller.send_voice_signal(&target_user, signal_data);
            }
            ClientCommand::Close => self.controller.close(),
        }
    }

    fn check_health(&mut self) {
        if let Some(view) = &self.view {
            let probe = view.probe();
            self.controller.health_tick(probe);
        }
    }

    fn forward_events(&mut self) {
        for event in self.controller.take_events() {
            // A dropped receiver does not stop the session.
            let _ = self.events.send(event);
        }
    }
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::SessionState;
    use crate::session::{Credential, ReconnectPolicy};

    fn session(base: &str) -> Session {
        Session::builder(base)
            .group(1)
            .project(2)
            .credential(Credential::Token("7".into()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_handle_commands_queue() {
        let (_client, handle, _events) =
            SyncClient::new(session("ws://127.0.0.1:9"), SessionConfig::default());
        handle.insert(0, "x").unwrap();
        handle.undo().unwrap();
        handle.close().unwrap();
    }

    #[test]
    fn test_handle_fails_after_client_dropped() {
        let (client, handle, _events) =
            SyncClient::new(session("ws://127.0.0.1:9"), SessionConfig::default());
        drop(client);
        assert!(matches!(handle.undo(), Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_unreachable_relay_exhausts_reconnects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = SessionConfig {
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
                max_attempts: 2,
            },
            ..SessionConfig::default()
        };
        let (client, _handle, mut events) =
            SyncClient::new(session(&format!("ws://127.0.0.1:{port}")), config);

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let result = tokio::time::timeout(Duration::from_secs(5), client.run())
                    .await
                    .expect("client should give up");
                assert!(matches!(
                    result,
                    Err(SessionError::ReconnectExhausted { attempts: 2 })
                ));
            })
            .await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&SessionEvent::ReconnectFailed));
        assert_eq!(
            seen.last(),
            Some(&SessionEvent::Closed),
            "events: {seen:?}"
        );
        assert!(seen.contains(&SessionEvent::StateChanged(SessionState::Degraded)));
    }

    #[tokio::test]
    async fn test_offline_edits_survive_failed_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = SessionConfig {
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(50),
                max_attempts: 1,
            },
            ..SessionConfig::default()
        };
        let (client, handle, _events) =
            SyncClient::new(session(&format!("ws://127.0.0.1:{port}")), config);
        handle.insert(0, "hello").unwrap();

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let result = tokio::time::timeout(Duration::from_secs(5), client.run())
                    .await
                    .expect("client should give up");
                assert!(matches!(
                    result,
                    Err(SessionError::ReconnectExhausted { attempts: 1 })
                ));
            })
            .await;
    }
}
