pub mod backend;
pub mod error;
pub mod messages;
pub mod moderation;
pub mod presence;
pub mod realtime;
pub mod recovery;
pub mod session;
pub mod throttle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::{ChatError, ChatResult};

/// Chat rooms are keyed by the id of the content they belong to.
pub type RoomId = String;
pub type UserId = String;
pub type MessageId = String;

/// Display fields attached to a message or roster entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorProfile {
    pub username: String,
    #[serde(default, alias = "avatar_url")]
    pub avatar: Option<String>,
}

impl AuthorProfile {
    /// Shown when the profile lookup fails or has not resolved yet.
    pub fn placeholder() -> Self {
        Self {
            username: "Anonymous".to_string(),
            avatar: None,
        }
    }
}

/// Chat message structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    #[serde(alias = "user_id")]
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub author: Option<AuthorProfile>,
    /// Set while a locally originated send waits for the server.
    #[serde(default, skip_deserializing)]
    pub pending: bool,
}

/// Presence record for one attached user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub is_moderator: bool,
    #[serde(default)]
    pub is_broadcaster: bool,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn role(&self) -> Role {
        Role::from_flags(self.is_broadcaster, self.is_moderator)
    }
}

/// Moderation row as stored server-side, one per user per room
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModerationRow {
    pub user_id: UserId,
    pub room_id: RoomId,
    #[serde(default)]
    pub silenced_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub silenced_by: Option<UserId>,
    #[serde(default)]
    pub is_banned: bool,
    #[serde(default)]
    pub kicked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_moderator: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, alias = "avatar_url")]
    pub avatar: Option<String>,
    pub points: i64,
}

/// The local identity watching the room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewer {
    pub id: UserId,
    pub username: String,
    pub avatar: Option<String>,
    pub is_moderator: bool,
    pub is_broadcaster: bool,
}

impl Viewer {
    pub fn role(&self) -> Role {
        Role::from_flags(self.is_broadcaster, self.is_moderator)
    }

    /// Presence payload announced for this viewer.
    pub fn as_participant(&self, joined_at: DateTime<Utc>) -> Participant {
        Participant {
            user_id: self.id.clone(),
            username: self.username.clone(),
            avatar: self.avatar.clone(),
            is_moderator: self.is_moderator,
            is_broadcaster: self.is_broadcaster,
            joined_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Broadcaster,
    Moderator,
    Viewer,
}

impl Role {
    pub fn from_flags(is_broadcaster: bool, is_moderator: bool) -> Self {
        if is_broadcaster {
            Role::Broadcaster
        } else if is_moderator {
            Role::Moderator
        } else {
            Role::Viewer
        }
    }

    pub fn is_moderator(self) -> bool {
        matches!(self, Role::Broadcaster | Role::Moderator)
    }
}

/// Source of "now" for everything time-dependent in a room.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Utility functions
pub mod utils {
    use uuid::Uuid;

    pub const TEMPORARY_ID_PREFIX: &str = "temp-";

    pub fn temporary_message_id() -> String {
        format!("{}{}", TEMPORARY_ID_PREFIX, Uuid::new_v4())
    }

    pub fn is_temporary_id(id: &str) -> bool {
        id.starts_with(TEMPORARY_ID_PREFIX)
    }
}

pub mod logger {
    use tracing_subscriber::{EnvFilter, fmt};

    pub fn init_tracing(default_filter: &str) {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));

        fmt().with_env_filter(env_filter).with_target(false).init();
    }
}

pub mod config {
    use config::{Config, ConfigError, Environment};
    use dotenv::dotenv;
    use serde::Deserialize;

    use crate::Viewer;

    #[derive(Debug, Deserialize)]
    pub struct ServiceConfig {
        pub api_url: String,
        pub api_key: String,
        pub realtime_url: String,
        pub access_token: Option<String>,
        pub room_id: String,
        pub viewer_id: Option<String>,
        pub viewer_username: Option<String>,
        pub viewer_avatar: Option<String>,
        pub viewer_is_moderator: bool,
        pub viewer_is_broadcaster: bool,
        pub history_limit: usize,
        pub heartbeat_interval: u64,
        pub request_timeout: u64,
        pub status_port: u16,
        pub log_filter: String,
    }

    impl ServiceConfig {
        pub fn new() -> Result<Self, ConfigError> {
            // Load environment variables from .env file
            dotenv().ok();

            let mut s = Config::new();
            s.set_default("viewer_is_moderator", false)?;
            s.set_default("viewer_is_broadcaster", false)?;
            s.set_default("history_limit", 50i64)?;
            s.set_default("heartbeat_interval", 30i64)?;
            s.set_default("request_timeout", 10i64)?;
            s.set_default("status_port", 8080i64)?;
            s.set_default("log_filter", "info")?;

            // Eg.. `APP_ROOM_ID=abc` sets the `room_id` key
            s.merge(Environment::with_prefix("APP"))?;

            s.try_into()
        }

        /// Anonymous viewing when no viewer id is configured.
        pub fn viewer(&self) -> Option<Viewer> {
            let id = self.viewer_id.clone().filter(|id| !id.is_empty())?;
            Some(Viewer {
                username: self.viewer_username.clone().unwrap_or_else(|| id.clone()),
                id,
                avatar: self.viewer_avatar.clone(),
                is_moderator: self.viewer_is_moderator,
                is_broadcaster: self.viewer_is_broadcaster,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_flags() {
        assert_eq!(Role::from_flags(true, false), Role::Broadcaster);
        assert_eq!(Role::from_flags(true, true), Role::Broadcaster);
        assert_eq!(Role::from_flags(false, true), Role::Moderator);
        assert_eq!(Role::from_flags(false, false), Role::Viewer);

        assert!(Role::Broadcaster.is_moderator());
        assert!(!Role::Viewer.is_moderator());
    }

    #[test]
    fn test_temporary_ids_are_distinct() {
        let a = utils::temporary_message_id();
        let b = utils::temporary_message_id();

        assert_ne!(a, b);
        assert!(utils::is_temporary_id(&a));
        assert!(!utils::is_temporary_id("m123"));
    }

    #[test]
    fn test_message_row_accepts_user_id_column() {
        let row = serde_json::json!({
            "id": "m1",
            "room_id": "r1",
            "user_id": "u1",
            "content": "hi",
            "created_at": "2024-03-20T12:00:00Z",
        });

        let message: ChatMessage = serde_json::from_value(row).unwrap();
        assert_eq!(message.author_id, "u1");
        assert!(message.author.is_none());
        assert!(!message.pending);
    }
}
