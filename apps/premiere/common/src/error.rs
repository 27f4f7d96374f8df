use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Recovery failed after {attempts} attempts: {message}")]
    RecoveryFailed { attempts: u32, message: String },

    #[error("Rate limited: must wait {wait_time_secs} seconds")]
    RateLimited { wait_time_secs: u64 },

    #[error("Sign in to chat")]
    NotAuthenticated,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("You are silenced in this room")]
    Silenced,

    #[error("You are banned from this room")]
    Banned,

    #[error("You were kicked from this room")]
    Kicked,

    #[error("The room has ended")]
    RoomEnded,

    #[error("Not allowed: {0}")]
    Forbidden(String),

    #[error("Moderators cannot target themselves")]
    SelfTarget,

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Room session is not attached")]
    Detached,
}

impl ChatError {
    /// Classifies a server-side rejection message.
    pub fn from_rejection(reason: &str) -> Self {
        let lowered = reason.to_lowercase();
        if lowered.contains("banned") {
            ChatError::Banned
        } else if lowered.contains("silenced") || lowered.contains("timed out") {
            ChatError::Silenced
        } else if lowered.contains("rate limit")
            || lowered.contains("rate_limit")
            || lowered.contains("too many") {
            ChatError::RateLimited { wait_time_secs: 2 }
        } else {
            ChatError::Rejected(reason.to_string())
        }
    }

    /// Transport level failures the channel client may retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::Http(e) => e.is_timeout() || e.is_connect(),
            ChatError::Tungstenite(_)
            | ChatError::WebSocket(_)
            | ChatError::IO(_)
            | ChatError::RateLimited { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(matches!(
            ChatError::from_rejection("User is banned from this room"),
            ChatError::Banned
        ));
        assert!(matches!(
            ChatError::from_rejection("user silenced until 2024-03-20"),
            ChatError::Silenced
        ));
        assert!(matches!(
            ChatError::from_rejection("Too many messages"),
            ChatError::RateLimited { .. }
        ));
        assert!(matches!(
            ChatError::from_rejection("content too long"),
            ChatError::Rejected(_)
        ));
    }

    #[test]
    fn test_socket_errors_convert_and_retry() {
        let err: ChatError = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();

        assert!(matches!(err, ChatError::Tungstenite(_)));
        assert!(err.is_transient());
        assert!(!ChatError::Banned.is_transient());
    }
}
