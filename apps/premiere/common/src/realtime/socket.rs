use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::protocol::{self, Frame, Inbound};
use super::{ChannelSpec, ChannelStatus, RealtimeChannel, RealtimeTransport, RoomEvent, Subscription};
use crate::presence::PresenceState;
use crate::recovery::RecoveryManager;
use crate::{ChatError, ChatResult, Participant};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Websocket client for the backend's realtime channels.
#[derive(Clone)]
pub struct WsRealtime {
    url: String,
    api_key: String,
    access_token: Option<String>,
    heartbeat_interval: Duration,
    recovery: RecoveryManager,
}

impl WsRealtime {
    pub fn new(realtime_url: &str, api_key: &str, access_token: Option<String>) -> Self {
        Self {
            url: realtime_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            access_token,
            heartbeat_interval: Duration::from_secs(30),
            recovery: RecoveryManager::default(),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryManager) -> Self {
        self.recovery = recovery;
        self
    }

    fn socket_url(&self) -> String {
        let params = [
            ("apikey", self.api_key.as_str()),
            ("vsn", protocol::PROTOCOL_VERSION),
        ]
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<String>>()
        .join("&");
        format!("{}/websocket?{}", self.url, params)
    }

    /// Connects and joins; frames that arrive ahead of the join reply are
    /// returned for the caller to process.
    async fn open(&self, spec: &ChannelSpec, join_ref: &str) -> ChatResult<(WsStream, Vec<String>)> {
        let url = self.socket_url();
        debug!("Connecting to realtime socket: {}", self.url);

        let (mut ws, _) = connect_async(url).await?;

        let join = Frame::join(spec, self.access_token.as_deref(), join_ref);
        ws.send(Message::Text(join.encode()?.into())).await?;

        let mut early = Vec::new();
        loop {
            let next = timeout(JOIN_TIMEOUT, ws.next())
                .await
                .map_err(|_| ChatError::WebSocket("Join timed out".to_string()))?;

            let text = match next {
                Some(Ok(Message::Text(text))) => text.to_string(),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ChatError::WebSocket("Socket closed during join".to_string()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            };

            match protocol::decode_frame(&text, spec) {
                Ok(Inbound::Reply { reference, ok, response }) if reference.as_deref() == Some(join_ref) => {
                    if !ok {
                        return Err(ChatError::Rejected(format!("Join refused: {}", response)));
                    }
                    return Ok((ws, early));
                }
                Ok(_) => early.push(text),
                Err(e) => warn!("Dropping undecodable frame during join: {}", e),
            }
        }
    }
}

#[async_trait]
impl RealtimeTransport for WsRealtime {
    async fn subscribe(&self, spec: ChannelSpec) -> ChatResult<Subscription> {
        let refs = Arc::new(AtomicU64::new(1));
        let join_ref = refs.fetch_add(1, Ordering::SeqCst).to_string();

        let (ws, early) = self
            .recovery
            .execute(|| self.open(&spec, &join_ref))
            .await?;
        info!("Subscribed to {}", spec.topic());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let mut task = ChannelTask {
            client: self.clone(),
            spec: spec.clone(),
            join_ref,
            refs: refs.clone(),
            presence: PresenceState::new(),
            events: event_tx,
            commands: command_rx,
            closed: closed.clone(),
            pending_heartbeat: None,
        };
        for text in early {
            task.handle_text(&text);
        }
        let _ = task.events.send(RoomEvent::Status(ChannelStatus::Subscribed));

        tokio::spawn(task.run(ws));

        Ok(Subscription {
            channel: Arc::new(WsChannel {
                topic: spec.topic(),
                commands: command_tx,
                closed,
            }),
            events: event_rx,
        })
    }
}

enum Command {
    Track(Participant),
    Leave,
}

/// Handle to a running channel task
pub struct WsChannel {
    topic: String,
    commands: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl RealtimeChannel for WsChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn track(&self, participant: &Participant) -> ChatResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChatError::Detached);
        }
        self.commands
            .send(Command::Track(participant.clone()))
            .map_err(|_| ChatError::WebSocket("Channel task has stopped".to_string()))
    }

    fn unsubscribe(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Leave);
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

enum Exit {
    Left,
    Dropped(String),
}

/// Owns the socket: reads frames, writes commands, heartbeats, reconnects.
struct ChannelTask {
    client: WsRealtime,
    spec: ChannelSpec,
    join_ref: String,
    refs: Arc<AtomicU64>,
    presence: PresenceState,
    events: mpsc::UnboundedSender<RoomEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    closed: Arc<AtomicBool>,
    pending_heartbeat: Option<String>,
}

impl ChannelTask {
    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn emit(&self, event: RoomEvent) -> bool {
        self.events.send(event).is_ok()
    }

    async fn run(mut self, mut ws: WsStream) {
        let topic = self.spec.topic();

        loop {
            match self.drive(&mut ws).await {
                Exit::Left => {
                    info!("Left {}", topic);
                    break;
                }
                Exit::Dropped(reason) => {
                    warn!("Realtime channel {} dropped: {}", topic, reason);
                    self.emit(RoomEvent::Status(ChannelStatus::Reconnecting));
                    match self.reconnect().await {
                        Some(next) => ws = next,
                        None => break,
                    }
                }
            }
        }

        self.emit(RoomEvent::Status(ChannelStatus::Closed));
    }

    async fn drive(&mut self, ws: &mut WsStream) -> Exit {
        let mut heartbeat = tokio::time::interval(self.client.heartbeat_interval);
        heartbeat.tick().await;
        self.pending_heartbeat = None;

        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(exit) = self.handle_text(&text) {
                            return exit;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Exit::Dropped("socket closed".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Exit::Dropped(e.to_string()),
                },

                command = self.commands.recv() => match command {
                    Some(Command::Track(participant)) => {
                        let reference = self.next_ref();
                        let frame = match Frame::track(&self.spec.topic(), &self.join_ref, &reference, &participant) {
                            Ok(frame) => frame,
                            Err(e) => {
                                error!("Failed to encode presence: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = send_frame(ws, &frame).await {
                            return Exit::Dropped(e.to_string());
                        }
                    }
                    Some(Command::Leave) | None => {
                        let leave = Frame::leave(&self.spec.topic(), &self.join_ref, &self.next_ref());
                        if let Err(e) = send_frame(ws, &leave).await {
                            debug!("Leave not delivered: {}", e);
                        }
                        let _ = ws.close(None).await;
                        return Exit::Left;
                    }
                },

                _ = heartbeat.tick() => {
                    if self.pending_heartbeat.is_some() {
                        return Exit::Dropped("heartbeat timeout".to_string());
                    }
                    let reference = self.next_ref();
                    if let Err(e) = send_frame(ws, &Frame::heartbeat(&reference)).await {
                        return Exit::Dropped(e.to_string());
                    }
                    self.pending_heartbeat = Some(reference);
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str) -> Option<Exit> {
        let inbound = match protocol::decode_frame(text, &self.spec) {
            Ok(inbound) => inbound,
            Err(e) => {
                error!("Error processing frame: {:?}", e);
                return None;
            }
        };

        let delivered = match inbound {
            Inbound::Reply { reference, .. } => {
                if reference.is_some() && reference == self.pending_heartbeat {
                    self.pending_heartbeat = None;
                }
                true
            }
            Inbound::Event(event) => self.emit(event),
            Inbound::PresenceState(state) => {
                self.presence = state;
                self.emit(RoomEvent::PresenceSynced(self.presence.clone()))
            }
            Inbound::PresenceDiff(diff) => {
                protocol::apply_presence_diff(&mut self.presence, diff);
                self.emit(RoomEvent::PresenceSynced(self.presence.clone()))
            }
            Inbound::ChannelLost(reason) => return Some(Exit::Dropped(reason)),
            Inbound::Ignored => true,
        };

        // nobody is listening anymore
        if !delivered {
            self.closed.store(true, Ordering::SeqCst);
            return Some(Exit::Left);
        }
        None
    }

    /// Reconnects with backoff until it succeeds or the channel is closed.
    async fn reconnect(&mut self) -> Option<WsStream> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let wake = Instant::now() + self.client.recovery.delay_for(attempt);

            // presence is re-announced by the session once subscribed again
            loop {
                tokio::select! {
                    _ = sleep_until(wake) => break,
                    command = self.commands.recv() => match command {
                        Some(Command::Track(_)) => continue,
                        Some(Command::Leave) | None => return None,
                    },
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            self.join_ref = self.next_ref();
            match self.client.open(&self.spec, &self.join_ref).await {
                Ok((ws, early)) => {
                    info!("Rejoined {} after {} attempts", self.spec.topic(), attempt);
                    self.presence = PresenceState::new();
                    for text in early {
                        self.handle_text(&text);
                    }
                    self.emit(RoomEvent::Status(ChannelStatus::Subscribed));
                    return Some(ws);
                }
                Err(e) => warn!("Reconnect attempt {} to {} failed: {}", attempt, self.spec.topic(), e),
            }
        }
    }
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) -> ChatResult<()> {
    let text = frame.encode()?;
    ws.send(Message::Text(text.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_url() {
        let client = WsRealtime::new("wss://realtime.example.com/realtime/v1/", "anon-key", None);
        assert_eq!(
            client.socket_url(),
            "wss://realtime.example.com/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_sends_leave_once() {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let channel = WsChannel {
            topic: "realtime:room:r1".to_string(),
            commands,
            closed: Arc::new(AtomicBool::new(false)),
        };

        channel.unsubscribe();
        channel.unsubscribe();
        drop(channel);

        assert!(matches!(rx.recv().await, Some(Command::Leave)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_track_after_unsubscribe_is_refused() {
        let (commands, _rx) = mpsc::unbounded_channel();
        let channel = WsChannel {
            topic: "realtime:room:r1".to_string(),
            commands,
            closed: Arc::new(AtomicBool::new(false)),
        };
        channel.unsubscribe();

        let participant = Participant {
            user_id: "u1".to_string(),
            username: "ninja".to_string(),
            avatar: None,
            is_moderator: false,
            is_broadcaster: false,
            joined_at: chrono::Utc::now(),
        };
        assert!(matches!(channel.track(&participant).await, Err(ChatError::Detached)));
    }
}
