use common::backend::HttpBackend;
use common::config::ServiceConfig;
use common::logger;
use common::moderation::{DEFAULT_TIMEOUT_SECS, ModerationAction};
use common::presence::RosterFilter;
use common::realtime::WsRealtime;
use common::session::{RoomSession, RoomView, SendOutcome};
use common::{ChatError, SystemClock};

use actix_web::{App, HttpResponse, HttpServer, web};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// One line typed into the service
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Say(String),
    Delete(String),
    Moderate { target: String, action: ModerationAction },
    Profile(String),
    End,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Say(line.to_string()));
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::to_string);
    let user = || arg.clone().ok_or_else(|| format!("/{} needs a user id", name));

    let moderate = |action| -> Result<Command, String> {
        Ok(Command::Moderate {
            target: user()?,
            action,
        })
    };

    match name {
        "delete" => arg
            .clone()
            .map(Command::Delete)
            .ok_or_else(|| "/delete needs a message id".to_string()),
        "kick" => moderate(ModerationAction::Kick),
        "ban" => moderate(ModerationAction::Ban),
        "unban" => moderate(ModerationAction::Unban),
        "untimeout" => moderate(ModerationAction::Untimeout),
        "mod" => moderate(ModerationAction::Mod),
        "unmod" => moderate(ModerationAction::Unmod),
        "timeout" => {
            let duration = match parts.next() {
                Some(raw) => raw
                    .parse::<i64>()
                    .ok()
                    .and_then(ChronoDuration::try_seconds)
                    .ok_or_else(|| format!("Invalid timeout duration: {}", raw))?,
                None => ChronoDuration::seconds(DEFAULT_TIMEOUT_SECS),
            };
            moderate(ModerationAction::timeout(duration))
        }
        "profile" => user().map(Command::Profile),
        "end" => Ok(Command::End),
        other => Err(format!("Unknown command: /{}", other)),
    }
}

async fn execute(session: &RoomSession, command: Command) -> Result<(), ChatError> {
    match command {
        Command::Say(content) => match session.send(&content).await? {
            SendOutcome::Sent { id } => info!("Sent message {}", id),
            SendOutcome::Throttled => info!("Slow down, message dropped"),
        },
        Command::Delete(id) => {
            session.delete_message(&id).await?;
            info!("Deleted message {}", id);
        }
        Command::Moderate { target, action } => session.moderate(&target, action).await?,
        Command::Profile(user_id) => {
            let profile = session.open_profile(&user_id).await?;
            info!(
                "{} ({}) moderator={} banned={} kicked={} silenced_until={:?}",
                profile.username,
                profile.user_id,
                profile.is_moderator,
                profile.is_banned,
                profile.kicked,
                profile.silenced_until
            );
        }
        Command::End => {
            session.mark_ended().await;
            info!("Premiere marked as ended");
        }
    }
    Ok(())
}

async fn command_loop(session: &RoomSession) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(command) => {
                if let Err(e) = execute(session, command).await {
                    warn!("Command failed: {}", e);
                }
            }
            Err(message) => warn!("{}", message),
        }
    }

    // keep serving status until shutdown
    info!("Input closed");
    std::future::pending().await
}

#[derive(Debug, Deserialize)]
struct RoomQuery {
    #[serde(default)]
    filter: RosterFilter,
}

/// Health check endpoint
async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": Utc::now()
    }))
}

async fn room_snapshot(view: web::Data<RoomView>, query: web::Query<RoomQuery>) -> HttpResponse {
    HttpResponse::Ok().json(view.snapshot(query.filter).await)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = ServiceConfig::new()?;
    logger::init_tracing(&settings.log_filter);

    let viewer = settings.viewer();
    info!(
        "Starting room service for room {} as {}",
        settings.room_id,
        viewer.as_ref().map(|v| v.id.as_str()).unwrap_or("anonymous")
    );

    let backend = HttpBackend::new(
        &settings.api_url,
        &settings.api_key,
        settings.access_token.clone(),
        Duration::from_secs(settings.request_timeout),
    )?;
    let realtime = WsRealtime::new(
        &settings.realtime_url,
        &settings.api_key,
        settings.access_token.clone(),
    )
    .with_heartbeat_interval(Duration::from_secs(settings.heartbeat_interval));

    let mut session = RoomSession::new(Arc::new(backend), Arc::new(realtime), Arc::new(SystemClock))
        .with_history_limit(settings.history_limit);
    session.attach(&settings.room_id, viewer).await?;

    let view = web::Data::new(session.view());
    let status_server = HttpServer::new(move || {
        App::new()
            .app_data(view.clone())
            .route("/health", web::get().to(health_check))
            .route("/room", web::get().to(room_snapshot))
    })
    .bind(("0.0.0.0", settings.status_port))?
    .run();

    tokio::select! {
        result = status_server => {
            if let Err(e) = result {
                error!("Status server error: {:?}", e);
            }
        }
        result = command_loop(&session) => {
            if let Err(e) = result {
                error!("Failed to read commands: {:?}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    session.detach();
    info!("Room service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_message() {
        assert_eq!(
            parse_command("  hello there "),
            Ok(Command::Say("hello there".to_string()))
        );
    }

    #[test]
    fn test_moderation_commands() {
        assert_eq!(
            parse_command("/ban u2"),
            Ok(Command::Moderate {
                target: "u2".to_string(),
                action: ModerationAction::Ban
            })
        );
        assert_eq!(
            parse_command("/timeout u2"),
            Ok(Command::Moderate {
                target: "u2".to_string(),
                action: ModerationAction::Timeout { duration_secs: 300 }
            })
        );
        assert_eq!(
            parse_command("/timeout u2 999999"),
            Ok(Command::Moderate {
                target: "u2".to_string(),
                action: ModerationAction::Timeout { duration_secs: 86_400 }
            })
        );
    }

    #[test]
    fn test_invalid_commands() {
        assert!(parse_command("/kick").is_err());
        assert!(parse_command("/timeout u2 soon").is_err());
        assert!(parse_command("/timeout u2 9223372036854775807").is_err());
        assert!(parse_command("/timeout u2 -9223372036854775808").is_err());
        assert!(parse_command("/dance").is_err());
        assert_eq!(parse_command("/delete m1"), Ok(Command::Delete("m1".to_string())));
        assert_eq!(parse_command("/end"), Ok(Command::End));
    }
}
