//! Room session: one realtime attachment per (room, viewer), fanned out to the
//! message stream, presence roster and moderation state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::ChatBackend;
use crate::messages::{DEFAULT_HISTORY_LIMIT, MessageStream, Reconciliation};
use crate::moderation::{self, ModerationAction, ModerationState, Standing, TargetProfile};
use crate::presence::{PresenceRoster, RosterFilter};
use crate::realtime::{ChannelSpec, ChannelStatus, RealtimeChannel, RealtimeTransport, RoomEvent};
use crate::throttle::RateLimiter;
use crate::{
    AuthorProfile, ChatError, ChatMessage, ChatResult, Clock, LeaderboardEntry, MessageId,
    ModerationRow, Participant, RoomId, UserId, Viewer, utils,
};

/// Everything a view renders for one room
#[derive(Debug)]
pub struct RoomState {
    room_id: RoomId,
    viewer: Option<Viewer>,
    generation: u64,
    alive: Arc<AtomicBool>,
    status: ChannelStatus,
    joined_at: DateTime<Utc>,
    ended: bool,
    messages: MessageStream,
    roster: PresenceRoster,
    moderation: ModerationState,
    limiter: RateLimiter,
    leaderboard: Vec<LeaderboardEntry>,
    target: Option<TargetProfile>,
    profiles: HashMap<UserId, AuthorProfile>,
    /// Authors with a profile lookup in flight.
    resolving: HashSet<UserId>,
}

impl RoomState {
    fn new(room_id: RoomId, viewer: Option<Viewer>, generation: u64, now: DateTime<Utc>) -> Self {
        Self {
            room_id,
            viewer,
            generation,
            alive: Arc::new(AtomicBool::new(false)),
            status: ChannelStatus::Closed,
            joined_at: now,
            ended: false,
            messages: MessageStream::default(),
            roster: PresenceRoster::new(),
            moderation: ModerationState::new(),
            limiter: RateLimiter::default(),
            leaderboard: Vec::new(),
            target: None,
            profiles: HashMap::new(),
            resolving: HashSet::new(),
        }
    }

    fn is_attached(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn presence_payload(&self) -> Option<Participant> {
        self.viewer
            .as_ref()
            .map(|viewer| viewer.as_participant(self.joined_at))
    }

    fn snapshot(&self, filter: RosterFilter, now: DateTime<Utc>) -> RoomSnapshot {
        let attached = self.is_attached();
        RoomSnapshot {
            room_id: self.room_id.clone(),
            status: if attached { self.status } else { ChannelStatus::Closed },
            attached,
            ended: self.ended,
            viewer: self.viewer.clone(),
            standing: self.moderation.standing(now),
            silence_remaining_secs: self
                .moderation
                .silence_remaining(now)
                .map(|d| d.num_seconds()),
            messages: self.messages.to_vec(),
            participant_count: self.roster.count(),
            moderator_count: self.roster.moderator_count(),
            participants: self.roster.filtered(filter).into_iter().cloned().collect(),
            leaderboard: self.leaderboard.clone(),
            target: self.target.clone(),
        }
    }
}

/// Serialisable copy of a room's state
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub status: ChannelStatus,
    pub attached: bool,
    pub ended: bool,
    pub viewer: Option<Viewer>,
    pub standing: Standing,
    pub silence_remaining_secs: Option<i64>,
    pub messages: Vec<ChatMessage>,
    pub participant_count: usize,
    pub moderator_count: usize,
    pub participants: Vec<Participant>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub target: Option<TargetProfile>,
}

/// Read-only handle for views outside the session owner.
#[derive(Clone)]
pub struct RoomView {
    state: Arc<RwLock<RoomState>>,
    clock: Arc<dyn Clock>,
}

impl RoomView {
    pub async fn snapshot(&self, filter: RosterFilter) -> RoomSnapshot {
        self.state.read().await.snapshot(filter, self.clock.now())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { id: MessageId },
    /// Dropped by the client-side throttle.
    Throttled,
}

/// Applies channel events to the room state of the attachment it was
/// created for. Once that attachment is gone every delivery is a no-op.
#[derive(Clone)]
pub struct RoomListener {
    room_id: RoomId,
    viewer_id: Option<UserId>,
    generation: u64,
    alive: Arc<AtomicBool>,
    state: Arc<RwLock<RoomState>>,
    backend: Arc<dyn ChatBackend>,
    channel: Arc<dyn RealtimeChannel>,
    clock: Arc<dyn Clock>,
}

impl RoomListener {
    pub fn is_live(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn owns(&self, state: &RoomState) -> bool {
        self.is_live() && state.generation == self.generation && state.room_id == self.room_id
    }

    async fn run(self, mut events: mpsc::UnboundedReceiver<RoomEvent>) {
        while let Some(event) = events.recv().await {
            if !self.is_live() {
                break;
            }
            self.deliver(event).await;
        }
        debug!("Dispatch for room {} finished", self.room_id);
    }

    pub async fn deliver(&self, event: RoomEvent) {
        if !self.is_live() {
            debug!("Dropping late event for detached room {}", self.room_id);
            return;
        }

        match event {
            RoomEvent::MessageInserted(message) => self.on_message_inserted(message).await,
            RoomEvent::MessageDeleted { id } => self.on_message_deleted(&id).await,
            RoomEvent::PresenceSynced(presence) => {
                let mut state = self.state.write().await;
                if !self.owns(&state) {
                    return;
                }
                state.roster.on_presence_sync(&presence);
                let seen: Vec<(UserId, AuthorProfile)> = state
                    .roster
                    .participants()
                    .iter()
                    .map(|p| {
                        let profile = AuthorProfile {
                            username: p.username.clone(),
                            avatar: p.avatar.clone(),
                        };
                        (p.user_id.clone(), profile)
                    })
                    .collect();
                state.profiles.extend(seen);
            }
            RoomEvent::ModerationUpdated(row) => self.on_moderation_updated(row).await,
            RoomEvent::Status(status) => self.on_status(status).await,
        }
    }

    async fn on_message_inserted(&self, mut message: ChatMessage) {
        if message.room_id != self.room_id {
            return;
        }

        let author_id = message.author_id.clone();
        let needs_profile = {
            let mut state = self.state.write().await;
            if !self.owns(&state) {
                return;
            }
            if message.author.is_none() {
                message.author = state.profiles.get(&author_id).cloned();
            }
            let missing = message.author.is_none();
            state.messages.on_message_created(message)
                && missing
                && state.resolving.insert(author_id.clone())
        };

        // the lookup must not hold up later events
        if needs_profile {
            let listener = self.clone();
            tokio::spawn(async move { listener.enrich(&author_id).await });
        }
    }

    async fn on_message_deleted(&self, id: &str) {
        let mut state = self.state.write().await;
        if self.owns(&state) && state.messages.on_message_deleted(id) {
            debug!("Message {} removed from room {}", id, self.room_id);
        }
    }

    async fn on_moderation_updated(&self, row: ModerationRow) {
        if self.viewer_id.as_deref() != Some(row.user_id.as_str()) || row.room_id != self.room_id {
            return;
        }

        let reannounce = {
            let mut state = self.state.write().await;
            if !self.owns(&state) {
                return;
            }
            let now = self.clock.now();
            state.moderation.on_update(&row, now);

            match state.viewer.as_mut() {
                Some(viewer) if !viewer.is_broadcaster && viewer.is_moderator != row.is_moderator => {
                    info!("Viewer {} moderator flag is now {}", viewer.id, row.is_moderator);
                    viewer.is_moderator = row.is_moderator;
                    true
                }
                _ => false,
            }
        };

        if reannounce {
            self.announce().await;
        }
    }

    async fn on_status(&self, status: ChannelStatus) {
        let resubscribed = {
            let mut state = self.state.write().await;
            if !self.owns(&state) {
                return;
            }
            let was_reconnecting = state.status == ChannelStatus::Reconnecting;
            state.status = status;
            status == ChannelStatus::Subscribed && was_reconnecting
        };

        // presence does not survive a dropped connection
        if resubscribed {
            info!("Room {} resubscribed, announcing presence again", self.room_id);
            self.announce().await;
        }
    }

    async fn announce(&self) {
        let payload = {
            let state = self.state.read().await;
            if !self.owns(&state) {
                return;
            }
            state.presence_payload()
        };

        if let Some(participant) = payload {
            if let Err(e) = self.channel.track(&participant).await {
                warn!("Failed to announce presence in room {}: {}", self.room_id, e);
            }
        }
    }

    /// Looks up an author's display profile, falling back to a placeholder.
    async fn enrich(&self, author_id: &str) {
        let (profile, cache) = match self.backend.fetch_profile(author_id).await {
            Ok(profile) => (profile, true),
            Err(e) => {
                warn!("Profile lookup for {} failed: {}", author_id, e);
                (AuthorProfile::placeholder(), false)
            }
        };

        let mut state = self.state.write().await;
        if !self.owns(&state) {
            return;
        }
        state.resolving.remove(author_id);
        if cache {
            state.profiles.insert(author_id.to_string(), profile.clone());
        }
        state.messages.attach_author(author_id, &profile);
    }
}

/// Keeps the channel and dispatch task alive; dropping it tears both down.
struct Attachment {
    room_id: RoomId,
    viewer_id: Option<UserId>,
    listener: RoomListener,
    dispatch: Option<JoinHandle<()>>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.listener.alive.store(false, Ordering::SeqCst);
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
        }
        self.listener.channel.unsubscribe();
        info!("Detached from room {}", self.room_id);
    }
}

/// Lifecycle owner for one chat room.
pub struct RoomSession {
    backend: Arc<dyn ChatBackend>,
    realtime: Arc<dyn RealtimeTransport>,
    clock: Arc<dyn Clock>,
    state: Arc<RwLock<RoomState>>,
    attachment: Option<Attachment>,
    history_limit: usize,
    generation: u64,
}

impl RoomSession {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        realtime: Arc<dyn RealtimeTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            backend,
            realtime,
            clock,
            state: Arc::new(RwLock::new(RoomState::new(String::new(), None, 0, now))),
            attachment: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            generation: 0,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn view(&self) -> RoomView {
        RoomView {
            state: self.state.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    /// Listener of the current attachment, if any.
    pub fn listener(&self) -> Option<RoomListener> {
        self.attachment.as_ref().map(|a| a.listener.clone())
    }

    fn current(&self) -> ChatResult<&RoomListener> {
        self.attachment
            .as_ref()
            .map(|a| &a.listener)
            .ok_or(ChatError::Detached)
    }

    /// Attaches to `room_id`. A changed room or viewer id replaces the
    /// existing attachment; an unchanged key is a no-op.
    pub async fn attach(&mut self, room_id: &str, viewer: Option<Viewer>) -> ChatResult<()> {
        let viewer_id = viewer.as_ref().map(|v| v.id.clone());

        if let Some(current) = &self.attachment {
            if current.room_id == room_id && current.viewer_id == viewer_id {
                debug!("Already attached to room {}", room_id);
                return Ok(());
            }
        }
        self.detach();

        self.generation += 1;
        let now = self.clock.now();
        let mut fresh = RoomState::new(room_id.to_string(), viewer, self.generation, now);
        fresh.status = ChannelStatus::Connecting;
        let alive = fresh.alive.clone();
        *self.state.write().await = fresh;

        info!("Attaching to room {} (generation {})", room_id, self.generation);
        let subscription = match self
            .realtime
            .subscribe(ChannelSpec::new(room_id, viewer_id.clone()))
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                self.state.write().await.status = ChannelStatus::Closed;
                return Err(e);
            }
        };

        let listener = RoomListener {
            room_id: room_id.to_string(),
            viewer_id: viewer_id.clone(),
            generation: self.generation,
            alive: alive.clone(),
            state: self.state.clone(),
            backend: self.backend.clone(),
            channel: subscription.channel,
            clock: self.clock.clone(),
        };
        alive.store(true, Ordering::SeqCst);

        // handlers are registered before presence is announced
        let dispatch = tokio::spawn(listener.clone().run(subscription.events));
        self.attachment = Some(Attachment {
            room_id: room_id.to_string(),
            viewer_id,
            listener: listener.clone(),
            dispatch: Some(dispatch),
        });

        listener.announce().await;
        self.load_initial(&listener).await;
        Ok(())
    }

    /// One-time history and leaderboard reads; failures leave them empty.
    async fn load_initial(&self, listener: &RoomListener) {
        let (history, leaderboard) = tokio::join!(
            self.backend.load_history(&listener.room_id, self.history_limit),
            self.backend.fetch_leaderboard(&listener.room_id),
        );

        let missing = {
            let mut state = self.state.write().await;
            if !listener.owns(&state) {
                return;
            }

            match history {
                Ok(rows) => {
                    let authored: Vec<(UserId, AuthorProfile)> = rows
                        .iter()
                        .filter_map(|m| m.author.clone().map(|a| (m.author_id.clone(), a)))
                        .collect();
                    state.profiles.extend(authored);
                    let loaded = state.messages.load_history(rows);
                    info!("Loaded {} messages of history for room {}", loaded, listener.room_id);
                }
                Err(e) => warn!("History load for room {} failed: {}", listener.room_id, e),
            }

            match leaderboard {
                Ok(entries) => state.leaderboard = entries,
                Err(e) => warn!("Leaderboard load for room {} failed: {}", listener.room_id, e),
            }

            let missing: Vec<UserId> = state
                .messages
                .authors_without_profile()
                .into_iter()
                .filter(|author| !state.resolving.contains(author))
                .collect();
            state.resolving.extend(missing.iter().cloned());
            missing
        };

        for author_id in missing {
            listener.enrich(&author_id).await;
        }
    }

    /// Releases the channel. Idempotent.
    pub fn detach(&mut self) {
        self.attachment = None;
    }

    pub async fn snapshot(&self, filter: RosterFilter) -> RoomSnapshot {
        self.view().snapshot(filter).await
    }

    /// The premiere is over; sending is disabled from now on.
    pub async fn mark_ended(&self) {
        let listener = match self.current() {
            Ok(listener) => listener,
            Err(_) => return,
        };
        let mut state = self.state.write().await;
        if listener.owns(&state) {
            state.ended = true;
        }
    }

    /// Optimistic send. Local checks run before anything touches the network.
    pub async fn send(&self, content: &str) -> ChatResult<SendOutcome> {
        let listener = self.current()?;
        let content = content.trim();
        let now = self.clock.now();

        let temp_id = {
            let mut state = self.state.write().await;
            if !listener.owns(&state) {
                return Err(ChatError::Detached);
            }
            if content.is_empty() {
                return Err(ChatError::EmptyMessage);
            }
            let Some(viewer) = state.viewer.clone() else {
                return Err(ChatError::NotAuthenticated);
            };
            state.moderation.check_can_send(now)?;
            if state.ended {
                return Err(ChatError::RoomEnded);
            }
            if !state.limiter.try_acquire(now) {
                debug!("Send throttled for {}", viewer.id);
                return Ok(SendOutcome::Throttled);
            }

            let room_id = state.room_id.clone();
            state.messages.push_optimistic(&room_id, &viewer, content, now)
        };

        let result = self.backend.send_message(&listener.room_id, content).await;

        let mut state = self.state.write().await;
        if !listener.owns(&state) {
            return result.map(|id| SendOutcome::Sent { id });
        }

        match result {
            Ok(id) => {
                if state.messages.confirm(&temp_id, &id) == Reconciliation::Missing {
                    debug!("Optimistic entry {} was gone before confirmation", temp_id);
                }
                Ok(SendOutcome::Sent { id })
            }
            Err(e) => {
                warn!("Send failed in room {}: {}", listener.room_id, e);
                state.messages.discard(&temp_id);
                state.moderation.apply_rejection(&e, self.clock.now());
                Err(e)
            }
        }
    }

    pub async fn delete_message(&self, message_id: &str) -> ChatResult<()> {
        let listener = self.current()?;
        {
            let state = self.state.read().await;
            let Some(viewer) = state.viewer.as_ref() else {
                return Err(ChatError::NotAuthenticated);
            };
            if !moderation::can_delete_messages(viewer.role()) {
                return Err(ChatError::Forbidden("deleting messages requires a moderator".to_string()));
            }
        }
        if utils::is_temporary_id(message_id) {
            return Err(ChatError::Rejected("message is not confirmed yet".to_string()));
        }

        self.backend.delete_message(message_id).await?;

        let mut state = self.state.write().await;
        if listener.owns(&state) {
            state.messages.on_message_deleted(message_id);
        }
        Ok(())
    }

    /// Opens the mini-profile for `user_id`, the subject of moderation
    /// reflection.
    pub async fn open_profile(&self, user_id: &str) -> ChatResult<TargetProfile> {
        let listener = self.current()?;
        let cached = self.state.read().await.profiles.get(user_id).cloned();

        let profile = match cached {
            Some(profile) => profile,
            None => match self.backend.fetch_profile(user_id).await {
                Ok(profile) => profile,
                Err(e) => {
                    warn!("Profile lookup for {} failed: {}", user_id, e);
                    AuthorProfile::placeholder()
                }
            },
        };
        let row = match self.backend.fetch_moderation(&listener.room_id, user_id).await {
            Ok(row) => row,
            Err(e) => {
                warn!("Moderation lookup for {} failed: {}", user_id, e);
                None
            }
        };

        let target = TargetProfile::new(user_id, profile, row.as_ref(), self.clock.now());
        let mut state = self.state.write().await;
        if !listener.owns(&state) {
            return Err(ChatError::Detached);
        }
        state.target = Some(target.clone());
        Ok(target)
    }

    pub async fn close_profile(&self) {
        self.state.write().await.target = None;
    }

    /// Issues a moderator action. The open mini-profile shows the expected
    /// effect right away and is restored if the server refuses.
    pub async fn moderate(&self, target_user_id: &str, action: ModerationAction) -> ChatResult<()> {
        let listener = self.current()?;
        let now = self.clock.now();

        let reflection = {
            let mut state = self.state.write().await;
            if !listener.owns(&state) {
                return Err(ChatError::Detached);
            }
            let Some(actor) = state.viewer.as_ref() else {
                return Err(ChatError::NotAuthenticated);
            };
            moderation::authorize(actor, target_user_id, &action)?;

            match state.target.as_mut() {
                Some(target) if target.user_id == target_user_id => {
                    let previous = target.clone();
                    target.reflect(&action, now);
                    Some((previous, target.clone()))
                }
                _ => None,
            }
        };

        match self
            .backend
            .moderate(&listener.room_id, target_user_id, &action)
            .await
        {
            Ok(()) => {
                info!("Applied {} to {} in room {}", action.name(), target_user_id, listener.room_id);
                Ok(())
            }
            Err(e) => {
                warn!("{} on {} failed: {}", action.name(), target_user_id, e);
                let mut state = self.state.write().await;
                if listener.owns(&state) {
                    if let (Some((previous, reflected)), Some(target)) =
                        (reflection, state.target.as_mut())
                    {
                        if target.user_id == previous.user_id {
                            target.revert(&action, &reflected, &previous);
                        }
                    }
                }
                Err(e)
            }
        }
    }
}
