use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, error};

use crate::moderation::ModerationAction;
use crate::{
    AuthorProfile, ChatError, ChatMessage, ChatResult, LeaderboardEntry, MessageId, ModerationRow,
};

/// Operations the room core needs from the hosted backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Most recent messages, newest first.
    async fn load_history(&self, room_id: &str, limit: usize) -> ChatResult<Vec<ChatMessage>>;

    /// Atomic accept-or-reject; returns the server-assigned id.
    async fn send_message(&self, room_id: &str, content: &str) -> ChatResult<MessageId>;

    async fn delete_message(&self, message_id: &str) -> ChatResult<()>;

    async fn moderate(
        &self,
        room_id: &str,
        target_user_id: &str,
        action: &ModerationAction,
    ) -> ChatResult<()>;

    async fn fetch_profile(&self, user_id: &str) -> ChatResult<AuthorProfile>;

    async fn fetch_moderation(&self, room_id: &str, user_id: &str) -> ChatResult<Option<ModerationRow>>;

    async fn fetch_leaderboard(&self, room_id: &str) -> ChatResult<Vec<LeaderboardEntry>>;
}

/// REST rows + RPC endpoints of the hosted backend
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl HttpBackend {
    pub fn new(
        api_url: &str,
        api_key: &str,
        access_token: Option<String>,
        request_timeout: Duration,
    ) -> ChatResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            access_token,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        builder
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", bearer))
    }

    fn rows(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn rpc(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, function)
    }

    async fn send(&self, builder: RequestBuilder) -> ChatResult<Response> {
        let response = self
            .authorized(builder)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait_time_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(2);
            return Err(ChatError::RateLimited { wait_time_secs });
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ChatError::NotAuthenticated);
        }

        let body = response.text().await.unwrap_or_default();
        error!("Backend returned {}: {}", status, body);
        if status.is_client_error() {
            Err(rejection_from_body(&body))
        } else {
            Err(ChatError::ApiError(format!("{}: {}", status, body)))
        }
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ChatResult<T> {
        Ok(self.send(builder).await?.json::<T>().await?)
    }
}

/// Error bodies carry a `message` (and sometimes `details`/`hint`).
fn rejection_from_body(body: &str) -> ChatError {
    let reason = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    ChatError::from_rejection(&reason)
}

/// The send RPC answers with the new id, bare or wrapped in a row.
fn parse_send_response(value: &Value) -> ChatResult<MessageId> {
    let id = match value {
        Value::Array(rows) => rows.first().and_then(|row| row.get("id")),
        Value::Object(_) => value.get("id"),
        other => Some(other),
    };

    match id {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ChatError::ParseError(format!("No message id in send response: {}", value))),
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn load_history(&self, room_id: &str, limit: usize) -> ChatResult<Vec<ChatMessage>> {
        debug!("Loading {} messages of history for room {}", limit, room_id);
        let request = self.client.get(self.rows("chat_messages")).query(&[
            (
                "select",
                "id,room_id,user_id,content,created_at,author:profiles(username,avatar_url)".to_string(),
            ),
            ("room_id", format!("eq.{}", room_id)),
            ("order", "created_at.desc".to_string()),
            ("limit", limit.to_string()),
        ]);
        self.json(request).await
    }

    async fn send_message(&self, room_id: &str, content: &str) -> ChatResult<MessageId> {
        let request = self.client.post(self.rpc("send_chat_message")).json(&json!({
            "p_room_id": room_id,
            "p_content": content,
        }));
        let value: Value = self.json(request).await?;
        parse_send_response(&value)
    }

    async fn delete_message(&self, message_id: &str) -> ChatResult<()> {
        let request = self
            .client
            .delete(self.rows("chat_messages"))
            .query(&[("id", format!("eq.{}", message_id))]);
        self.send(request).await?;
        Ok(())
    }

    async fn moderate(
        &self,
        room_id: &str,
        target_user_id: &str,
        action: &ModerationAction,
    ) -> ChatResult<()> {
        let request = self.client.post(self.rpc("moderate_chat_user")).json(&json!({
            "p_room_id": room_id,
            "p_target_user_id": target_user_id,
            "p_action": action.name(),
            "p_duration_seconds": action.duration_secs(),
        }));
        self.send(request).await?;
        Ok(())
    }

    async fn fetch_profile(&self, user_id: &str) -> ChatResult<AuthorProfile> {
        let request = self.client.get(self.rows("profiles")).query(&[
            ("select", "username,avatar_url".to_string()),
            ("id", format!("eq.{}", user_id)),
        ]);
        let profiles: Vec<AuthorProfile> = self.json(request).await?;
        profiles
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::ApiError(format!("Profile {} not found", user_id)))
    }

    async fn fetch_moderation(&self, room_id: &str, user_id: &str) -> ChatResult<Option<ModerationRow>> {
        let request = self.client.get(self.rows("chat_moderation")).query(&[
            ("select", "*".to_string()),
            ("room_id", format!("eq.{}", room_id)),
            ("user_id", format!("eq.{}", user_id)),
        ]);
        let rows: Vec<ModerationRow> = self.json(request).await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_leaderboard(&self, room_id: &str) -> ChatResult<Vec<LeaderboardEntry>> {
        let request = self
            .client
            .post(self.rpc("get_room_leaderboard"))
            .json(&json!({ "p_room_id": room_id }));
        self.json(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_response_shapes() {
        assert_eq!(parse_send_response(&json!("m123")).unwrap(), "m123");
        assert_eq!(parse_send_response(&json!({ "id": "m123" })).unwrap(), "m123");
        assert_eq!(parse_send_response(&json!([{ "id": 42 }])).unwrap(), "42");
        assert!(parse_send_response(&json!(null)).is_err());
        assert!(parse_send_response(&json!([])).is_err());
    }

    #[test]
    fn test_rejection_from_body() {
        let banned = r#"{"code":"P0001","message":"User is banned","details":null,"hint":null}"#;
        assert!(matches!(rejection_from_body(banned), ChatError::Banned));

        let silenced = r#"{"code":"P0001","message":"User is silenced"}"#;
        assert!(matches!(rejection_from_body(silenced), ChatError::Silenced));

        assert!(matches!(
            rejection_from_body("plain text failure"),
            ChatError::Rejected(reason) if reason == "plain text failure"
        ));
    }

    #[test]
    fn test_endpoint_urls() {
        let backend = HttpBackend::new(
            "https://api.example.com/",
            "anon-key",
            None,
            Duration::from_secs(10),
        )
        .unwrap();

        assert_eq!(backend.rows("profiles"), "https://api.example.com/rest/v1/profiles");
        assert_eq!(
            backend.rpc("send_chat_message"),
            "https://api.example.com/rest/v1/rpc/send_chat_message"
        );
    }
}
