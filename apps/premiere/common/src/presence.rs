use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{Participant, Role};

/// Full presence state: connection key to the payloads tracked on it.
/// One user may hold several keys (tabs, devices).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceState(pub BTreeMap<String, Vec<Value>>);

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, metas: Vec<Value>) {
        self.0.insert(key.into(), metas);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All tracked payloads, in key order.
    pub fn payloads(&self) -> impl Iterator<Item = &Value> {
        self.0.values().flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RosterFilter {
    #[default]
    All,
    ModeratorsOnly,
}

/// Who is currently attached to the room, rebuilt from each full sync.
#[derive(Debug, Clone, Default)]
pub struct PresenceRoster {
    participants: Vec<Participant>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the roster with the deduplicated, tier-sorted content of `state`.
    pub fn on_presence_sync(&mut self, state: &PresenceState) {
        let mut participants: Vec<Participant> = Vec::new();

        for payload in state.payloads() {
            let Some(participant) = tracked_participant(payload) else {
                continue;
            };

            match participants
                .iter_mut()
                .find(|p| p.user_id == participant.user_id)
            {
                Some(existing) => *existing = participant,
                None => participants.push(participant),
            }
        }

        // sort_by_key is stable, insertion order holds within a tier
        participants.sort_by_key(Participant::role);
        debug!("Presence sync: {} participants", participants.len());
        self.participants = participants;
    }

    pub fn count(&self) -> usize {
        self.participants.len()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn filtered(&self, filter: RosterFilter) -> Vec<&Participant> {
        self.participants
            .iter()
            .filter(|p| match filter {
                RosterFilter::All => true,
                RosterFilter::ModeratorsOnly => p.role().is_moderator(),
            })
            .collect()
    }

    pub fn moderator_count(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.role() != Role::Viewer)
            .count()
    }
}

/// Anonymous and malformed payloads are not listed.
fn tracked_participant(payload: &Value) -> Option<Participant> {
    let user_id = payload.get("user_id")?.as_str()?;
    if user_id.is_empty() {
        return None;
    }
    serde_json::from_value(payload.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(roster: &PresenceRoster) -> Vec<&str> {
        roster.participants().iter().map(|p| p.user_id.as_str()).collect()
    }

    fn meta(user_id: &str, broadcaster: bool, moderator: bool) -> Value {
        json!({
            "user_id": user_id,
            "username": format!("name-{user_id}"),
            "avatar": null,
            "is_moderator": moderator,
            "is_broadcaster": broadcaster,
            "joined_at": "2024-03-20T12:00:00Z",
            "phx_ref": format!("ref-{user_id}"),
        })
    }

    #[test]
    fn test_multiple_connections_collapse_to_one_participant() {
        let mut state = PresenceState::new();
        state.insert("conn-a", vec![meta("u1", false, false)]);
        state.insert("conn-b", vec![meta("u1", false, false), meta("u1", false, false)]);
        state.insert("conn-c", vec![meta("u2", false, false)]);

        let mut roster = PresenceRoster::new();
        roster.on_presence_sync(&state);

        assert_eq!(roster.count(), 2);
        assert_eq!(ids(&roster), vec!["u1", "u2"]);
    }

    #[test]
    fn test_roster_orders_by_tier() {
        let orders = [
            ["u3", "u2", "u1"],
            ["u2", "u3", "u1"],
            ["u1", "u3", "u2"],
        ];

        for order in orders {
            let mut state = PresenceState::new();
            for (i, user) in order.iter().enumerate() {
                let payload = match *user {
                    "u1" => meta("u1", true, false),
                    "u2" => meta("u2", false, true),
                    _ => meta("u3", false, false),
                };
                state.insert(format!("k{i}"), vec![payload]);
            }

            let mut roster = PresenceRoster::new();
            roster.on_presence_sync(&state);
            assert_eq!(ids(&roster), vec!["u1", "u2", "u3"]);
        }
    }

    #[test]
    fn test_anonymous_entries_are_dropped() {
        let mut state = PresenceState::new();
        state.insert("anon", vec![json!({ "phx_ref": "x" })]);
        state.insert("blank", vec![meta("", false, false)]);
        state.insert("garbled", vec![json!({ "user_id": "u9" })]);
        state.insert("real", vec![meta("u1", false, false)]);

        let mut roster = PresenceRoster::new();
        roster.on_presence_sync(&state);

        assert_eq!(ids(&roster), vec!["u1"]);
    }

    #[test]
    fn test_sync_replaces_previous_roster() {
        let mut roster = PresenceRoster::new();

        let mut first = PresenceState::new();
        first.insert("a", vec![meta("u1", false, false)]);
        first.insert("b", vec![meta("u2", false, false)]);
        roster.on_presence_sync(&first);
        assert_eq!(roster.count(), 2);

        let mut second = PresenceState::new();
        second.insert("b", vec![meta("u2", false, false)]);
        roster.on_presence_sync(&second);

        assert_eq!(ids(&roster), vec!["u2"]);
        assert_eq!(roster.count(), 1);
    }

    #[test]
    fn test_moderators_only_filter() {
        let mut state = PresenceState::new();
        state.insert("a", vec![meta("u3", false, false)]);
        state.insert("b", vec![meta("u2", false, true)]);
        state.insert("c", vec![meta("u1", true, false)]);

        let mut roster = PresenceRoster::new();
        roster.on_presence_sync(&state);

        let moderators: Vec<&str> = roster
            .filtered(RosterFilter::ModeratorsOnly)
            .iter()
            .map(|p| p.user_id.as_str())
            .collect();
        assert_eq!(moderators, vec!["u1", "u2"]);
        assert_eq!(roster.filtered(RosterFilter::All).len(), 3);
        assert_eq!(roster.moderator_count(), 2);
    }
}
