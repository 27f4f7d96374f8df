use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{AuthorProfile, ChatError, ModerationRow, Role, UserId, Viewer};

/// A kick older than this at processing time is a leftover row, not a kick.
pub const KICK_RECENCY_SECS: i64 = 10;
pub const DEFAULT_TIMEOUT_SECS: i64 = 300;
pub const MIN_TIMEOUT_SECS: i64 = 1;
pub const MAX_TIMEOUT_SECS: i64 = 24 * 60 * 60;

/// Time left on a silence, `None` once expired.
pub fn silence_remaining(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Option<Duration> {
    let remaining = expires_at.signed_duration_since(now);
    (remaining > Duration::zero()).then_some(remaining)
}

fn is_recent_kick(kicked_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(kicked_at) <= Duration::seconds(KICK_RECENCY_SECS)
}

/// Highest-priority moderation state of the viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Standing {
    Normal,
    Silenced {
        until: DateTime<Utc>,
        by: Option<UserId>,
    },
    Banned,
    Kicked,
}

/// Cached projection of the viewer's own moderation row.
///
/// Flags are tracked independently; [`ModerationState::standing`] resolves
/// them in the order kicked, banned, silenced. Kicked is terminal for the
/// attachment that observed it.
#[derive(Debug, Clone, Default)]
pub struct ModerationState {
    silenced_until: Option<DateTime<Utc>>,
    silenced_by: Option<UserId>,
    is_banned: bool,
    kicked: bool,
}

impl ModerationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an authoritative row for the current viewer.
    pub fn on_update(&mut self, row: &ModerationRow, now: DateTime<Utc>) {
        self.is_banned = row.is_banned;

        // an expired silence is stored as not silenced
        match row.silenced_until {
            Some(until) if silence_remaining(now, until).is_some() => {
                self.silenced_until = Some(until);
                self.silenced_by = row.silenced_by.clone();
            }
            _ => {
                self.silenced_until = None;
                self.silenced_by = None;
            }
        }

        if let Some(kicked_at) = row.kicked_at {
            if is_recent_kick(kicked_at, now) {
                if !self.kicked {
                    info!("Viewer {} kicked from room {}", row.user_id, row.room_id);
                }
                self.kicked = true;
            }
        }
    }

    /// Local reconciliation after the server refused a send.
    pub fn apply_rejection(&mut self, error: &ChatError, now: DateTime<Utc>) {
        match error {
            ChatError::Banned => {
                warn!("Send rejected as banned, disabling chat input");
                self.is_banned = true;
            }
            ChatError::Silenced => {
                if !self.is_silenced(now) {
                    warn!("Send rejected as silenced, disabling chat input");
                    self.silenced_until = Some(now + Duration::seconds(DEFAULT_TIMEOUT_SECS));
                    self.silenced_by = None;
                }
            }
            _ => {}
        }
    }

    pub fn is_silenced(&self, now: DateTime<Utc>) -> bool {
        self.silenced_until
            .is_some_and(|until| silence_remaining(now, until).is_some())
    }

    pub fn silence_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.silenced_until
            .and_then(|until| silence_remaining(now, until))
    }

    pub fn standing(&self, now: DateTime<Utc>) -> Standing {
        if self.kicked {
            return Standing::Kicked;
        }
        if self.is_banned {
            return Standing::Banned;
        }
        match self.silenced_until {
            Some(until) if silence_remaining(now, until).is_some() => Standing::Silenced {
                until,
                by: self.silenced_by.clone(),
            },
            _ => Standing::Normal,
        }
    }

    /// Send gate: kick and ban short-circuit regardless of silence.
    pub fn check_can_send(&self, now: DateTime<Utc>) -> Result<(), ChatError> {
        match self.standing(now) {
            Standing::Normal => Ok(()),
            Standing::Silenced { .. } => Err(ChatError::Silenced),
            Standing::Banned => Err(ChatError::Banned),
            Standing::Kicked => Err(ChatError::Kicked),
        }
    }
}

/// One moderator action, issued through a single parameterized operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ModerationAction {
    Kick,
    Ban,
    Unban,
    Timeout { duration_secs: i64 },
    Untimeout,
    Mod,
    Unmod,
}

impl ModerationAction {
    /// Timeout clamped to the supported range.
    pub fn timeout(duration: Duration) -> Self {
        ModerationAction::Timeout {
            duration_secs: duration
                .num_seconds()
                .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModerationAction::Kick => "kick",
            ModerationAction::Ban => "ban",
            ModerationAction::Unban => "unban",
            ModerationAction::Timeout { .. } => "timeout",
            ModerationAction::Untimeout => "untimeout",
            ModerationAction::Mod => "mod",
            ModerationAction::Unmod => "unmod",
        }
    }

    pub fn duration_secs(&self) -> Option<i64> {
        match self {
            ModerationAction::Timeout { duration_secs } => Some(*duration_secs),
            _ => None,
        }
    }

    /// Any moderator may kick or time out; the room owner alone manages
    /// bans and the moderator list.
    pub fn permitted_for(&self, role: Role) -> bool {
        match self {
            ModerationAction::Kick
            | ModerationAction::Timeout { .. }
            | ModerationAction::Untimeout => role.is_moderator(),
            ModerationAction::Ban
            | ModerationAction::Unban
            | ModerationAction::Mod
            | ModerationAction::Unmod => role == Role::Broadcaster,
        }
    }
}

/// Local checks before a moderation action is sent. The server enforces
/// the same rules independently.
pub fn authorize(actor: &Viewer, target_id: &str, action: &ModerationAction) -> Result<(), ChatError> {
    if actor.id == target_id {
        return Err(ChatError::SelfTarget);
    }
    if !action.permitted_for(actor.role()) {
        return Err(ChatError::Forbidden(format!(
            "{} requires {}",
            action.name(),
            if actor.role().is_moderator() {
                "the room owner"
            } else {
                "a moderator"
            }
        )));
    }
    Ok(())
}

pub fn can_delete_messages(role: Role) -> bool {
    role.is_moderator()
}

/// Mini-profile a moderator has open for another user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetProfile {
    pub user_id: UserId,
    pub username: String,
    pub avatar: Option<String>,
    pub is_moderator: bool,
    pub is_banned: bool,
    pub silenced_until: Option<DateTime<Utc>>,
    pub kicked: bool,
}

impl TargetProfile {
    pub fn new(
        user_id: impl Into<UserId>,
        profile: AuthorProfile,
        row: Option<&ModerationRow>,
        now: DateTime<Utc>,
    ) -> Self {
        let user_id = user_id.into();
        match row {
            Some(row) => Self {
                user_id,
                username: profile.username,
                avatar: profile.avatar,
                is_moderator: row.is_moderator,
                is_banned: row.is_banned,
                silenced_until: row
                    .silenced_until
                    .filter(|until| silence_remaining(now, *until).is_some()),
                kicked: row.kicked_at.is_some_and(|at| is_recent_kick(at, now)),
            },
            None => Self {
                user_id,
                username: profile.username,
                avatar: profile.avatar,
                is_moderator: false,
                is_banned: false,
                silenced_until: None,
                kicked: false,
            },
        }
    }

    /// Speculative effect of `action`, shown before the server answers.
    pub fn reflect(&mut self, action: &ModerationAction, now: DateTime<Utc>) {
        match action {
            ModerationAction::Kick => self.kicked = true,
            ModerationAction::Ban => self.is_banned = true,
            ModerationAction::Unban => self.is_banned = false,
            ModerationAction::Timeout { duration_secs } => {
                self.silenced_until = Some(now + Duration::seconds(*duration_secs))
            }
            ModerationAction::Untimeout => self.silenced_until = None,
            ModerationAction::Mod => self.is_moderator = true,
            ModerationAction::Unmod => self.is_moderator = false,
        }
    }

    /// Undoes `reflect` for the field `action` touched. A field that no
    /// longer holds the reflected value was changed by something newer and
    /// is left alone.
    pub fn revert(&mut self, action: &ModerationAction, reflected: &TargetProfile, previous: &TargetProfile) {
        match action {
            ModerationAction::Kick => {
                if self.kicked == reflected.kicked {
                    self.kicked = previous.kicked;
                }
            }
            ModerationAction::Ban | ModerationAction::Unban => {
                if self.is_banned == reflected.is_banned {
                    self.is_banned = previous.is_banned;
                }
            }
            ModerationAction::Timeout { .. } | ModerationAction::Untimeout => {
                if self.silenced_until == reflected.silenced_until {
                    self.silenced_until = previous.silenced_until;
                }
            }
            ModerationAction::Mod | ModerationAction::Unmod => {
                if self.is_moderator == reflected.is_moderator {
                    self.is_moderator = previous.is_moderator;
                }
            }
        }
    }

    pub fn silence_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.silenced_until
            .and_then(|until| silence_remaining(now, until))
    }
}
