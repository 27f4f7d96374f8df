use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::{AuthorProfile, ChatMessage, MessageId, UserId, Viewer, utils};

/// Oldest entries are dropped silently past this length.
pub const MAX_MESSAGES: usize = 100;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// How a send confirmation was folded into the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The optimistic entry now carries the server id.
    Replaced,
    /// The server echo arrived first, so the optimistic entry was dropped.
    EchoAlreadyPresent,
    /// The optimistic entry is gone (truncated or discarded).
    Missing,
}

/// Bounded, arrival-ordered view of a room's recent messages.
#[derive(Debug, Clone)]
pub struct MessageStream {
    messages: VecDeque<ChatMessage>,
    capacity: usize,
}

impl Default for MessageStream {
    fn default() -> Self {
        Self::with_capacity(MAX_MESSAGES)
    }
}

impl MessageStream {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    fn truncate_front(&mut self) {
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
    }

    /// Merges a history page, newest first as the backend returns it, in
    /// front of anything already received live.
    pub fn load_history(&mut self, newest_first: Vec<ChatMessage>) -> usize {
        let mut history: VecDeque<ChatMessage> = newest_first
            .into_iter()
            .rev()
            .filter(|m| !self.contains(&m.id))
            .collect();
        let loaded = history.len();

        history.extend(self.messages.drain(..));
        self.messages = history;
        self.truncate_front();
        loaded
    }

    /// Appends a live message unless its id is already present.
    pub fn on_message_created(&mut self, message: ChatMessage) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.messages.push_back(message);
        self.truncate_front();
        true
    }

    /// Idempotent removal by id.
    pub fn on_message_deleted(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(index) => {
                self.messages.remove(index);
                true
            }
            None => false,
        }
    }

    /// Appends a pending entry for a local send and returns its temporary id.
    pub fn push_optimistic(
        &mut self,
        room_id: &str,
        viewer: &Viewer,
        content: &str,
        now: DateTime<Utc>,
    ) -> MessageId {
        let id = utils::temporary_message_id();
        self.messages.push_back(ChatMessage {
            id: id.clone(),
            room_id: room_id.to_string(),
            author_id: viewer.id.clone(),
            content: content.to_string(),
            created_at: now,
            author: Some(AuthorProfile {
                username: viewer.username.clone(),
                avatar: viewer.avatar.clone(),
            }),
            pending: true,
        });
        self.truncate_front();
        id
    }

    /// Swaps a temporary id for the server-assigned one, in place.
    pub fn confirm(&mut self, temp_id: &str, server_id: &str) -> Reconciliation {
        let Some(index) = self.position(temp_id) else {
            return Reconciliation::Missing;
        };

        if self.contains(server_id) {
            self.messages.remove(index);
            return Reconciliation::EchoAlreadyPresent;
        }

        let entry = &mut self.messages[index];
        entry.id = server_id.to_string();
        entry.pending = false;
        Reconciliation::Replaced
    }

    /// Drops a failed optimistic send.
    pub fn discard(&mut self, temp_id: &str) -> bool {
        if !utils::is_temporary_id(temp_id) {
            return false;
        }
        self.on_message_deleted(temp_id)
    }

    /// Authors whose display profile has not been attached yet.
    pub fn authors_without_profile(&self) -> Vec<UserId> {
        let mut authors: Vec<UserId> = Vec::new();
        for message in self.messages.iter().filter(|m| m.author.is_none()) {
            if !authors.contains(&message.author_id) {
                authors.push(message.author_id.clone());
            }
        }
        authors
    }

    /// Fills the profile on every message by `author_id` that lacks one.
    pub fn attach_author(&mut self, author_id: &str, profile: &AuthorProfile) -> usize {
        let mut updated = 0;
        for message in self
            .messages
            .iter_mut()
            .filter(|m| m.author_id == author_id && m.author.is_none())
        {
            message.author = Some(profile.clone());
            updated += 1;
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(id: &str, content: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            room_id: "room".to_string(),
            author_id: "u2".to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            author: None,
            pending: false,
        }
    }

    fn viewer() -> Viewer {
        Viewer {
            id: "u1".to_string(),
            username: "ninja".to_string(),
            avatar: None,
            is_moderator: false,
            is_broadcaster: false,
        }
    }

    fn ids(stream: &MessageStream) -> Vec<String> {
        stream.iter().map(|m| m.id.clone()).collect()
    }

    #[test]
    fn test_history_is_reversed_to_ascending() {
        let mut stream = MessageStream::default();
        stream.load_history(vec![message("m3", "c"), message("m2", "b"), message("m1", "a")]);

        assert_eq!(ids(&stream), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_history_does_not_duplicate_live_messages() {
        let mut stream = MessageStream::default();
        stream.on_message_created(message("m3", "c"));
        stream.on_message_created(message("m4", "d"));

        let loaded = stream.load_history(vec![message("m3", "c"), message("m2", "b")]);

        assert_eq!(loaded, 1);
        assert_eq!(ids(&stream), vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_duplicate_insert_is_discarded() {
        let mut stream = MessageStream::default();
        assert!(stream.on_message_created(message("m1", "a")));
        assert!(!stream.on_message_created(message("m1", "a")));
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn test_stream_is_bounded() {
        let mut stream = MessageStream::default();
        for i in 0..250 {
            stream.on_message_created(message(&format!("m{i}"), "spam"));
            assert!(stream.len() <= MAX_MESSAGES);
        }

        assert_eq!(stream.len(), MAX_MESSAGES);
        assert_eq!(stream.iter().next().unwrap().id, "m150");
        assert_eq!(stream.iter().last().unwrap().id, "m249");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut stream = MessageStream::default();
        stream.on_message_created(message("m1", "a"));

        assert!(stream.on_message_deleted("m1"));
        assert!(!stream.on_message_deleted("m1"));
        assert!(stream.is_empty());
    }

    #[test]
    fn test_optimistic_send_is_replaced_in_place() {
        let mut stream = MessageStream::default();
        stream.on_message_created(message("m1", "first"));
        let temp = stream.push_optimistic("room", &viewer(), "hello", Utc::now());
        stream.on_message_created(message("m2", "after"));

        assert!(stream.get(&temp).unwrap().pending);
        assert_eq!(stream.confirm(&temp, "m123"), Reconciliation::Replaced);

        assert_eq!(ids(&stream), vec!["m1", "m123", "m2"]);
        let confirmed = stream.get("m123").unwrap();
        assert_eq!(confirmed.content, "hello");
        assert!(!confirmed.pending);
    }

    #[test]
    fn test_echo_before_confirmation_is_not_double_counted() {
        let mut stream = MessageStream::default();
        let temp = stream.push_optimistic("room", &viewer(), "hello", Utc::now());

        let mut echo = message("m123", "hello");
        echo.author_id = "u1".to_string();
        stream.on_message_created(echo.clone());

        assert_eq!(stream.confirm(&temp, "m123"), Reconciliation::EchoAlreadyPresent);
        assert!(!stream.on_message_created(echo));

        let hellos = stream.iter().filter(|m| m.content == "hello").count();
        assert_eq!(hellos, 1);
        assert_eq!(ids(&stream), vec!["m123"]);
    }

    #[test]
    fn test_failed_send_is_discarded() {
        let mut stream = MessageStream::default();
        let temp = stream.push_optimistic("room", &viewer(), "hello", Utc::now());

        assert!(stream.discard(&temp));
        assert_eq!(stream.iter().filter(|m| m.content == "hello").count(), 0);
        assert_eq!(stream.confirm(&temp, "m123"), Reconciliation::Missing);
    }

    #[test]
    fn test_discard_ignores_server_ids() {
        let mut stream = MessageStream::default();
        stream.on_message_created(message("m1", "a"));
        assert!(!stream.discard("m1"));
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn test_author_enrichment() {
        let mut stream = MessageStream::default();
        stream.on_message_created(message("m1", "a"));
        stream.on_message_created(message("m2", "b"));
        stream.push_optimistic("room", &viewer(), "mine", Utc::now() + Duration::seconds(1));

        assert_eq!(stream.authors_without_profile(), vec!["u2".to_string()]);

        let profile = AuthorProfile {
            username: "pokimane".to_string(),
            avatar: Some("https://cdn/avatar.png".to_string()),
        };
        assert_eq!(stream.attach_author("u2", &profile), 2);
        assert!(stream.authors_without_profile().is_empty());
    }
}
