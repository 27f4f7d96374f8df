//! Realtime channel: one subscription per room, carrying message changes,
//! presence and the viewer's moderation row.

pub mod protocol;
pub mod socket;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::presence::PresenceState;
use crate::{ChatMessage, ChatResult, MessageId, ModerationRow, Participant, RoomId, UserId};

pub use socket::WsRealtime;

/// Every event a room subscription delivers
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    MessageInserted(ChatMessage),
    MessageDeleted { id: MessageId },
    PresenceSynced(PresenceState),
    ModerationUpdated(ModerationRow),
    Status(ChannelStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Connecting,
    Subscribed,
    Reconnecting,
    Closed,
}

/// What to subscribe to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub room_id: RoomId,
    pub viewer_id: Option<UserId>,
    pub presence_key: String,
}

impl ChannelSpec {
    pub fn new(room_id: impl Into<RoomId>, viewer_id: Option<UserId>) -> Self {
        let presence_key = viewer_id
            .clone()
            .unwrap_or_else(|| format!("anon-{}", uuid::Uuid::new_v4()));
        Self {
            room_id: room_id.into(),
            viewer_id,
            presence_key,
        }
    }

    pub fn topic(&self) -> String {
        protocol::room_topic(&self.room_id)
    }
}

/// An open room channel
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn topic(&self) -> &str;

    /// Announces (or replaces) this connection's presence payload.
    async fn track(&self, participant: &Participant) -> ChatResult<()>;

    /// Leaves the channel. Synchronous so it can run from `Drop`; calling it
    /// again is a no-op.
    fn unsubscribe(&self);
}

pub struct Subscription {
    pub channel: Arc<dyn RealtimeChannel>,
    pub events: mpsc::UnboundedReceiver<RoomEvent>,
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Joins the room channel. Returns once the join is acknowledged.
    async fn subscribe(&self, spec: ChannelSpec) -> ChatResult<Subscription>;
}
