//! Client side of a story editing session.
//!
//! A [`CollabClient`] owns one supervisor task per `connect` call. The
//! supervisor opens the socket, keeps it alive with `ping` frames and
//! reconnects with exponential backoff after abnormal closes. Clean closes
//! (1000/1001) and `disconnect()` end the session for good.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::models::{
    BlockRefMessage, ReceivedMessage, SendMessage, StoryId, StoryRefMessage, TypingMessage,
    UpdateBlockMessage, UpdateStoryContentMessage,
};
use super::backoff::{Backoff, ReconnectPolicy};

const PING_FRAME: &str = r#"{"type":"ping"}"#;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Open,
    /// Closed while suspended; waits for `resume()`.
    Suspended,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Opened,
    Message(SendMessage),
    /// An `error` frame from the server.
    ServerError { message: String, details: Option<String> },
    /// An open session ended. `None` when no close frame was received.
    Closed { code: Option<u16> },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Reconnect attempts are exhausted; the client stays disconnected.
    GaveUp { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session is not open")]
    NotConnected,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

enum Command {
    Send(String),
    Suspend,
    Resume,
    Disconnect,
}

pub struct CollabClient {
    url: String,
    policy: ReconnectPolicy,
    state_tx: Arc<watch::Sender<ClientState>>,
    state_rx: watch::Receiver<ClientState>,
    events_tx: mpsc::Sender<ClientEvent>,
    events_rx: Option<mpsc::Receiver<ClientEvent>>,
    commands: Option<mpsc::Sender<Command>>,
    supervisor: Option<JoinHandle<()>>,
}

impl CollabClient {
    /// `url` is the server's WebSocket endpoint, e.g. `ws://localhost:3001/ws`.
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            url: url.into(),
            policy,
            state_tx: Arc::new(state_tx),
            state_rx,
            events_tx,
            events_rx: Some(events_rx),
            commands: None,
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events_rx.take()
    }

    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    /// Start a session with `token`. No-op while a session is running.
    pub fn connect(&mut self, token: &str) {
        if self.supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Session already running, ignoring connect");
            return;
        }

        let separator = if self.url.contains('?') { '&' } else { '?' };
        let (commands_tx, commands_rx) = mpsc::channel(256);
        let supervisor = Supervisor {
            url: format!("{}{}token={}", self.url, separator, token),
            policy: self.policy.clone(),
            state: self.state_tx.clone(),
            events: self.events_tx.clone(),
            commands: commands_rx,
            suspended: false,
        };
        self.commands = Some(commands_tx);
        self.supervisor = Some(tokio::spawn(supervisor.run()));
    }

    /// Stop reconnecting after the connection drops, e.g. while the editor
    /// is hidden. An open connection stays open.
    pub async fn suspend(&self) {
        self.command(Command::Suspend).await;
    }

    /// Leave suspension; reconnects at once if the connection dropped meanwhile.
    pub async fn resume(&self) {
        self.command(Command::Resume).await;
    }

    /// Close with 1000 and never reconnect.
    pub async fn disconnect(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Disconnect).await;
        }
        if let Some(handle) = self.supervisor.take() {
            if let Err(e) = handle.await {
                warn!("Session supervisor ended abnormally: {}", e);
            }
        }
        self.state_tx.send_replace(ClientState::Disconnected);
    }

    pub async fn send(&self, message: &ReceivedMessage) -> Result<(), ClientError> {
        if self.state() != ClientState::Open {
            return Err(ClientError::NotConnected);
        }
        let text = serde_json::to_string(message)?;
        let commands = self.commands.as_ref().ok_or(ClientError::NotConnected)?;
        commands.send(Command::Send(text)).await.map_err(|_| ClientError::NotConnected)
    }

    pub async fn join_story(&self, story_id: StoryId) -> Result<(), ClientError> {
        self.send(&ReceivedMessage::JoinStory(StoryRefMessage { story_id })).await
    }

    pub async fn leave_story(&self, story_id: StoryId) -> Result<(), ClientError> {
        self.send(&ReceivedMessage::LeaveStory(StoryRefMessage { story_id })).await
    }

    pub async fn lock_block(&self, block_id: &str, story_id: StoryId) -> Result<(), ClientError> {
        let msg = BlockRefMessage { block_id: block_id.to_string(), story_id };
        self.send(&ReceivedMessage::LockBlock(msg)).await
    }

    pub async fn unlock_block(&self, block_id: &str, story_id: StoryId) -> Result<(), ClientError> {
        let msg = BlockRefMessage { block_id: block_id.to_string(), story_id };
        self.send(&ReceivedMessage::UnlockBlock(msg)).await
    }

    pub async fn update_block(&self, block_id: &str, content: &str, story_id: StoryId) -> Result<(), ClientError> {
        let msg = UpdateBlockMessage {
            block_id: block_id.to_string(),
            content: content.to_string(),
            story_id,
        };
        self.send(&ReceivedMessage::UpdateBlock(msg)).await
    }

    pub async fn update_story_content(&self, story_id: StoryId, content: &str) -> Result<(), ClientError> {
        let msg = UpdateStoryContentMessage {
            story_id,
            content: content.to_string(),
            user_id: None,
            username: None,
        };
        self.send(&ReceivedMessage::UpdateStoryContent(msg)).await
    }

    pub async fn start_typing(&self, story_id: StoryId) -> Result<(), ClientError> {
        self.send(&ReceivedMessage::Typing(TypingMessage { story_id, username: None })).await
    }

    pub async fn stop_typing(&self, story_id: StoryId) -> Result<(), ClientError> {
        self.send(&ReceivedMessage::StopTyping(TypingMessage { story_id, username: None })).await
    }

    async fn command(&self, command: Command) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(command).await;
        }
    }
}

/// 1000 and 1001 are deliberate closes; everything else is worth a retry.
pub fn is_clean_close(code: Option<u16>) -> bool {
    matches!(code, Some(1000) | Some(1001))
}

enum SessionEnd {
    Intentional,
    Closed(Option<u16>),
}

enum Wait {
    Retry,
    Resumed,
    Stop,
}

struct Supervisor {
    url: String,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ClientState>>,
    events: mpsc::Sender<ClientEvent>,
    commands: mpsc::Receiver<Command>,
    suspended: bool,
}

impl Supervisor {
    async fn run(mut self) {
        let mut backoff = Backoff::new(&self.policy);
        loop {
            self.set_state(ClientState::Connecting);
            let end = match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    backoff.reset();
                    self.set_state(ClientState::Open);
                    info!("Collaboration session open");
                    self.emit(ClientEvent::Opened);
                    self.run_session(socket).await
                }
                Err(e) => {
                    // A refused handshake counts as an abnormal close
                    warn!("WebSocket handshake failed: {}", e);
                    SessionEnd::Closed(None)
                }
            };

            let code = match end {
                SessionEnd::Intentional => break,
                SessionEnd::Closed(code) => code,
            };
            if is_clean_close(code) {
                info!(?code, "Session closed cleanly");
                break;
            }

            if self.suspended {
                self.set_state(ClientState::Suspended);
                if !self.wait_for_resume().await {
                    break;
                }
                backoff.reset();
                continue;
            }

            self.set_state(ClientState::Connecting);
            let Some(delay) = backoff.next_delay() else {
                warn!(attempts = backoff.attempts(), "Max reconnection attempts reached");
                self.emit(ClientEvent::GaveUp { attempts: backoff.attempts() });
                break;
            };
            info!(attempt = backoff.attempts(), max = self.policy.max_attempts, "Reconnecting in {:?}", delay);
            self.emit(ClientEvent::ReconnectScheduled { attempt: backoff.attempts(), delay });

            match self.wait_before_retry(delay).await {
                Wait::Retry => {}
                Wait::Resumed => backoff.reset(),
                Wait::Stop => break,
            }
        }
        self.set_state(ClientState::Disconnected);
    }

    async fn run_session(&mut self, socket: WebSocketStream<MaybeTlsStream<TcpStream>>) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        let period = self.policy.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.deliver(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        debug!(?code, "Server closed the session");
                        return self.closed(code);
                    }
                    // Pings are answered by the transport
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket transport error: {}", e);
                        return self.closed(None);
                    }
                    None => return self.closed(None),
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = sink.send(Message::Text(Utf8Bytes::from_static(PING_FRAME))).await {
                        warn!("Failed to send heartbeat: {}", e);
                        return self.closed(None);
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Send(text)) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            warn!("Failed to send message: {}", e);
                            return self.closed(None);
                        }
                    }
                    Some(Command::Suspend) => self.suspended = true,
                    Some(Command::Resume) => self.suspended = false,
                    Some(Command::Disconnect) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: Utf8Bytes::from_static("Normal closure"),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            debug!("Close frame not delivered: {}", e);
                        }
                        self.emit(ClientEvent::Closed { code: Some(1000) });
                        return SessionEnd::Intentional;
                    }
                },
            }
        }
    }

    fn deliver(&self, text: &str) {
        match serde_json::from_str::<SendMessage>(text) {
            Ok(SendMessage::Error { message, details }) => {
                warn!("Server error: {}", message);
                self.emit(ClientEvent::ServerError { message, details });
            }
            Ok(msg) => self.emit(ClientEvent::Message(msg)),
            Err(e) => warn!("Ignoring unreadable server frame: {}", e),
        }
    }

    fn closed(&self, code: Option<u16>) -> SessionEnd {
        self.emit(ClientEvent::Closed { code });
        SessionEnd::Closed(code)
    }

    async fn wait_before_retry(&mut self, delay: Duration) -> Wait {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Wait::Retry,
                command = self.commands.recv() => match command {
                    Some(Command::Send(_)) => warn!("Dropping message, session is not open"),
                    Some(Command::Suspend) => {
                        self.suspended = true;
                        self.set_state(ClientState::Suspended);
                        return if self.wait_for_resume().await { Wait::Resumed } else { Wait::Stop };
                    }
                    Some(Command::Resume) => {}
                    Some(Command::Disconnect) | None => return Wait::Stop,
                },
            }
        }
    }

    /// Returns false when the client disconnected instead.
    async fn wait_for_resume(&mut self) -> bool {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Resume => {
                    self.suspended = false;
                    return true;
                }
                Command::Disconnect => return false,
                Command::Suspend => {}
                Command::Send(_) => warn!("Dropping message, session is suspended"),
            }
        }
        false
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    /// Never blocks the session loop. Events are dropped when the receiver
    /// lags or was never taken.
    fn emit(&self, event: ClientEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => debug!("Event queue full, dropping {:?}", event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_close_codes() {
        assert!(is_clean_close(Some(1000)));
        assert!(is_clean_close(Some(1001)));
        assert!(!is_clean_close(Some(1006)));
        assert!(!is_clean_close(Some(1011)));
        assert!(!is_clean_close(None));
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let mut client = CollabClient::new("ws://127.0.0.1:9/ws", ReconnectPolicy::default());
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.take_events().is_some());
        assert!(client.take_events().is_none());
    }

    #[tokio::test]
    async fn sending_without_a_session_fails() {
        let client = CollabClient::new("ws://127.0.0.1:9/ws", ReconnectPolicy::default());
        assert!(matches!(client.lock_block("b1", 1).await, Err(ClientError::NotConnected)));
        assert!(matches!(client.start_typing(1).await, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn disconnect_without_session_is_a_noop() {
        let mut client = CollabClient::new("ws://127.0.0.1:9/ws", ReconnectPolicy::default());
        client.disconnect().await;
        assert_eq!(client.state(), ClientState::Disconnected);
    }
}
