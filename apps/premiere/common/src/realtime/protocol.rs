use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ChannelSpec, RoomEvent};
use crate::presence::PresenceState;
use crate::{ChatError, ChatMessage, ChatResult, ModerationRow, Participant};

pub const PHOENIX_TOPIC: &str = "phoenix";
pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const MESSAGES_TABLE: &str = "chat_messages";
pub const MODERATION_TABLE: &str = "chat_moderation";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_PRESENCE_STATE: &str = "presence_state";
pub const EVENT_PRESENCE_DIFF: &str = "presence_diff";
pub const EVENT_ROW_CHANGE: &str = "postgres_changes";

pub fn room_topic(room_id: &str) -> String {
    format!("realtime:room:{}", room_id)
}

/// One websocket frame of the channel protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub join_ref: Option<String>,
}

impl Frame {
    pub fn encode(&self) -> ChatResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn join(spec: &ChannelSpec, access_token: Option<&str>, join_ref: &str) -> Self {
        Self {
            topic: spec.topic(),
            event: EVENT_JOIN.to_string(),
            payload: join_payload(spec, access_token),
            reference: Some(join_ref.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    pub fn leave(topic: &str, join_ref: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_LEAVE.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    pub fn track(topic: &str, join_ref: &str, reference: &str, participant: &Participant) -> ChatResult<Self> {
        Ok(Self {
            topic: topic.to_string(),
            event: EVENT_PRESENCE.to_string(),
            payload: json!({
                "type": "presence",
                "event": "track",
                "payload": serde_json::to_value(participant)?,
            }),
            reference: Some(reference.to_string()),
            join_ref: Some(join_ref.to_string()),
        })
    }
}

/// Join configuration: one channel carries message changes, moderation rows
/// for this viewer only, and presence.
pub fn join_payload(spec: &ChannelSpec, access_token: Option<&str>) -> Value {
    let mut changes = vec![
        json!({
            "event": "INSERT",
            "schema": "public",
            "table": MESSAGES_TABLE,
            "filter": format!("room_id=eq.{}", spec.room_id),
        }),
        json!({
            "event": "DELETE",
            "schema": "public",
            "table": MESSAGES_TABLE,
            "filter": format!("room_id=eq.{}", spec.room_id),
        }),
    ];

    if let Some(viewer_id) = &spec.viewer_id {
        changes.push(json!({
            "event": "*",
            "schema": "public",
            "table": MODERATION_TABLE,
            "filter": format!("user_id=eq.{}", viewer_id),
        }));
    }

    let mut payload = json!({
        "config": {
            "broadcast": { "self": false, "ack": false },
            "presence": { "key": spec.presence_key },
            "postgres_changes": changes,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    payload
}

#[derive(Debug, Deserialize)]
struct WireMetas {
    #[serde(default)]
    metas: Vec<Value>,
}

fn presence_from_wire(value: Value) -> ChatResult<PresenceState> {
    let wire: BTreeMap<String, WireMetas> = serde_json::from_value(value)?;
    Ok(PresenceState(
        wire.into_iter().map(|(key, w)| (key, w.metas)).collect(),
    ))
}

/// Incremental presence change, folded into a full state by the client
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceDiff {
    pub joins: PresenceState,
    pub leaves: PresenceState,
}

fn phx_ref(meta: &Value) -> Option<&str> {
    meta.get("phx_ref").and_then(Value::as_str)
}

/// Folds `diff` into `state`: leaves remove metas by `phx_ref`, joins append.
pub fn apply_presence_diff(state: &mut PresenceState, diff: PresenceDiff) {
    for (key, leaving) in diff.leaves.0 {
        if let Some(metas) = state.0.get_mut(&key) {
            metas.retain(|meta| {
                !leaving
                    .iter()
                    .any(|gone| phx_ref(gone).is_some() && phx_ref(gone) == phx_ref(meta))
            });
            if metas.is_empty() {
                state.0.remove(&key);
            }
        }
    }

    for (key, joining) in diff.joins.0 {
        let metas = state.0.entry(key).or_default();
        for meta in joining {
            let duplicate = phx_ref(&meta).is_some()
                && metas.iter().any(|existing| phx_ref(existing) == phx_ref(&meta));
            if !duplicate {
                metas.push(meta);
            }
        }
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply {
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    Event(RoomEvent),
    PresenceState(PresenceState),
    PresenceDiff(PresenceDiff),
    /// The server dropped the channel; the client must rejoin.
    ChannelLost(String),
    Ignored,
}

#[derive(Debug, Deserialize)]
struct RowChange {
    #[serde(rename = "type", alias = "eventType")]
    change_type: String,
    table: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

pub fn decode_frame(text: &str, spec: &ChannelSpec) -> ChatResult<Inbound> {
    let frame: Frame = serde_json::from_str(text)
        .map_err(|e| ChatError::ParseError(format!("Frame parse error: {}", e)))?;

    if frame.topic == PHOENIX_TOPIC {
        return Ok(match frame.event.as_str() {
            EVENT_REPLY => reply(frame),
            _ => Inbound::Ignored,
        });
    }
    if frame.topic != spec.topic() {
        return Ok(Inbound::Ignored);
    }

    match frame.event.as_str() {
        EVENT_REPLY => Ok(reply(frame)),
        EVENT_ERROR | EVENT_CLOSE => Ok(Inbound::ChannelLost(frame.event)),
        EVENT_PRESENCE_STATE => Ok(Inbound::PresenceState(presence_from_wire(frame.payload)?)),
        EVENT_PRESENCE_DIFF => {
            let joins = frame.payload.get("joins").cloned().unwrap_or(json!({}));
            let leaves = frame.payload.get("leaves").cloned().unwrap_or(json!({}));
            Ok(Inbound::PresenceDiff(PresenceDiff {
                joins: presence_from_wire(joins)?,
                leaves: presence_from_wire(leaves)?,
            }))
        }
        EVENT_ROW_CHANGE => decode_row_change(frame.payload, spec),
        _ => Ok(Inbound::Ignored),
    }
}

fn reply(frame: Frame) -> Inbound {
    let ok = frame.payload.get("status").and_then(Value::as_str) == Some("ok");
    Inbound::Reply {
        reference: frame.reference,
        ok,
        response: frame.payload.get("response").cloned().unwrap_or(Value::Null),
    }
}

fn decode_row_change(payload: Value, spec: &ChannelSpec) -> ChatResult<Inbound> {
    let data = payload
        .get("data")
        .cloned()
        .ok_or_else(|| ChatError::ParseError("Row change without data".to_string()))?;
    let change: RowChange = serde_json::from_value(data)
        .map_err(|e| ChatError::ParseError(format!("Row change parse error: {}", e)))?;

    match (change.table.as_str(), change.change_type.as_str()) {
        (MESSAGES_TABLE, "INSERT") => {
            let record = change
                .record
                .ok_or_else(|| ChatError::ParseError("Insert without record".to_string()))?;
            let message: ChatMessage = serde_json::from_value(record)?;
            if message.room_id != spec.room_id {
                return Ok(Inbound::Ignored);
            }
            Ok(Inbound::Event(RoomEvent::MessageInserted(message)))
        }
        (MESSAGES_TABLE, "DELETE") => {
            let id = change
                .old_record
                .as_ref()
                .and_then(|old| old.get("id"))
                .and_then(|id| match id {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .ok_or_else(|| ChatError::ParseError("Delete without id".to_string()))?;
            Ok(Inbound::Event(RoomEvent::MessageDeleted { id }))
        }
        (MODERATION_TABLE, "INSERT" | "UPDATE") => {
            let record = change
                .record
                .ok_or_else(|| ChatError::ParseError("Update without record".to_string()))?;
            let row: ModerationRow = serde_json::from_value(record)?;
            let for_viewer = spec.viewer_id.as_deref() == Some(row.user_id.as_str());
            if !for_viewer || row.room_id != spec.room_id {
                return Ok(Inbound::Ignored);
            }
            Ok(Inbound::Event(RoomEvent::ModerationUpdated(row)))
        }
        // a removed row means no restriction is left
        (MODERATION_TABLE, "DELETE") => {
            let old = change.old_record.unwrap_or(Value::Null);
            let field = |name: &str| old.get(name).and_then(Value::as_str);
            let for_viewer = field("user_id").is_some() && field("user_id") == spec.viewer_id.as_deref();
            let other_room = field("room_id").is_some_and(|room| room != spec.room_id);
            if !for_viewer || other_room {
                return Ok(Inbound::Ignored);
            }
            Ok(Inbound::Event(RoomEvent::ModerationUpdated(ModerationRow {
                user_id: field("user_id").unwrap_or_default().to_string(),
                room_id: spec.room_id.clone(),
                ..ModerationRow::default()
            })))
        }
        _ => Ok(Inbound::Ignored),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ChannelSpec {
        ChannelSpec::new("room1", Some("u1".to_string()))
    }

    fn row_change(data: Value) -> String {
        json!({
            "topic": "realtime:room:room1",
            "event": "postgres_changes",
            "payload": { "data": data, "ids": [1] },
            "ref": null,
        })
        .to_string()
    }

    #[test]
    fn test_join_payload_scopes_moderation_to_viewer() {
        let payload = join_payload(&spec(), Some("jwt"));
        let changes = payload["config"]["postgres_changes"].as_array().unwrap();

        assert_eq!(changes.len(), 3);
        assert_eq!(changes[2]["table"], MODERATION_TABLE);
        assert_eq!(changes[2]["filter"], "user_id=eq.u1");
        assert_eq!(payload["config"]["presence"]["key"], "u1");
        assert_eq!(payload["access_token"], "jwt");
    }

    #[test]
    fn test_anonymous_join_has_no_moderation_feed() {
        let payload = join_payload(&ChannelSpec::new("room1", None), None);
        let changes = payload["config"]["postgres_changes"].as_array().unwrap();

        assert_eq!(changes.len(), 2);
        assert!(payload.get("access_token").is_none());
    }

    #[test]
    fn test_decode_message_insert() {
        let text = row_change(json!({
            "type": "INSERT",
            "schema": "public",
            "table": "chat_messages",
            "record": {
                "id": "m1",
                "room_id": "room1",
                "user_id": "u2",
                "content": "hello",
                "created_at": "2024-03-20T12:00:00Z"
            },
            "commit_timestamp": "2024-03-20T12:00:00Z"
        }));

        match decode_frame(&text, &spec()).unwrap() {
            Inbound::Event(RoomEvent::MessageInserted(message)) => {
                assert_eq!(message.id, "m1");
                assert_eq!(message.author_id, "u2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_message_delete() {
        let text = row_change(json!({
            "type": "DELETE",
            "table": "chat_messages",
            "old_record": { "id": "m1" }
        }));

        assert_eq!(
            decode_frame(&text, &spec()).unwrap(),
            Inbound::Event(RoomEvent::MessageDeleted { id: "m1".to_string() })
        );
    }

    #[test]
    fn test_moderation_rows_for_other_users_are_ignored() {
        let mine = row_change(json!({
            "type": "UPDATE",
            "table": "chat_moderation",
            "record": { "user_id": "u1", "room_id": "room1", "is_banned": true }
        }));
        let theirs = row_change(json!({
            "type": "UPDATE",
            "table": "chat_moderation",
            "record": { "user_id": "u2", "room_id": "room1", "is_banned": true }
        }));

        assert!(matches!(
            decode_frame(&mine, &spec()).unwrap(),
            Inbound::Event(RoomEvent::ModerationUpdated(ModerationRow { is_banned: true, .. }))
        ));
        assert_eq!(decode_frame(&theirs, &spec()).unwrap(), Inbound::Ignored);
    }

    #[test]
    fn test_deleted_moderation_row_clears_restrictions() {
        let cleared = row_change(json!({
            "type": "DELETE",
            "table": "chat_moderation",
            "old_record": { "user_id": "u1", "room_id": "room1", "is_banned": true }
        }));
        let keyless = row_change(json!({
            "type": "DELETE",
            "table": "chat_moderation",
            "old_record": { "id": 7 }
        }));
        let elsewhere = row_change(json!({
            "type": "DELETE",
            "table": "chat_moderation",
            "old_record": { "user_id": "u1", "room_id": "room2" }
        }));

        assert_eq!(
            decode_frame(&cleared, &spec()).unwrap(),
            Inbound::Event(RoomEvent::ModerationUpdated(ModerationRow {
                user_id: "u1".to_string(),
                room_id: "room1".to_string(),
                ..ModerationRow::default()
            }))
        );
        assert_eq!(decode_frame(&keyless, &spec()).unwrap(), Inbound::Ignored);
        assert_eq!(decode_frame(&elsewhere, &spec()).unwrap(), Inbound::Ignored);
    }

    #[test]
    fn test_other_topics_are_ignored() {
        let text = json!({
            "topic": "realtime:room:other",
            "event": "presence_state",
            "payload": {},
        })
        .to_string();

        assert_eq!(decode_frame(&text, &spec()).unwrap(), Inbound::Ignored);
    }

    #[test]
    fn test_decode_reply() {
        let text = json!({
            "topic": "phoenix",
            "event": "phx_reply",
            "payload": { "status": "ok", "response": {} },
            "ref": "7",
        })
        .to_string();

        assert!(matches!(
            decode_frame(&text, &spec()).unwrap(),
            Inbound::Reply { ok: true, reference: Some(r), .. } if r == "7"
        ));
    }

    #[test]
    fn test_malformed_frame_is_a_parse_error() {
        assert!(matches!(
            decode_frame("not json", &spec()),
            Err(ChatError::ParseError(_))
        ));
    }

    #[test]
    fn test_presence_diff_folds_into_state() {
        let text = json!({
            "topic": "realtime:room:room1",
            "event": "presence_state",
            "payload": {
                "u1": { "metas": [{ "user_id": "u1", "phx_ref": "a" }] },
                "u2": { "metas": [{ "user_id": "u2", "phx_ref": "b" }] }
            }
        })
        .to_string();
        let Inbound::PresenceState(mut state) = decode_frame(&text, &spec()).unwrap() else {
            panic!("expected presence state");
        };

        let diff = json!({
            "topic": "realtime:room:room1",
            "event": "presence_diff",
            "payload": {
                "joins": { "u1": { "metas": [{ "user_id": "u1", "phx_ref": "c" }] } },
                "leaves": { "u2": { "metas": [{ "user_id": "u2", "phx_ref": "b" }] } }
            }
        })
        .to_string();
        let Inbound::PresenceDiff(diff) = decode_frame(&diff, &spec()).unwrap() else {
            panic!("expected presence diff");
        };

        apply_presence_diff(&mut state, diff);

        assert_eq!(state.0.len(), 1);
        assert_eq!(state.0["u1"].len(), 2);
    }

    #[test]
    fn test_track_frame_carries_participant() {
        let participant = Participant {
            user_id: "u1".to_string(),
            username: "ninja".to_string(),
            avatar: None,
            is_moderator: true,
            is_broadcaster: false,
            joined_at: chrono::Utc::now(),
        };

        let frame = Frame::track("realtime:room:room1", "1", "2", &participant).unwrap();
        assert_eq!(frame.payload["event"], "track");
        assert_eq!(frame.payload["payload"]["user_id"], "u1");
        assert_eq!(frame.payload["payload"]["is_moderator"], true);
    }
}
