//! `/ws`: project rooms for task status and agent log events.
//!
//! Frames are JSON `{ "event": <name>, "data": <payload> }`. Clients send
//! `joinProjectRoom`, `leaveProjectRoom` and `ping`; anything else, or any
//! payload that is not a usable room id, is dropped without closing the socket.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use db::models::project::Project;
use deployment::Deployment;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use services::services::broadcast::{
    ClientMessage, ServerEvent, SubscriberHandle, room_id_from_payload,
};
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct RealtimeQuery {
    pub token: Option<String>,
}

pub async fn realtime_ws(
    ws: WebSocketUpgrade,
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<RealtimeQuery>,
) -> Result<Response, ApiError> {
    let realtime = deployment.config().realtime.clone();
    let user_id = match query.token.as_deref() {
        Some(token) => match deployment.auth().verify(token) {
            Ok(user_id) => Some(user_id),
            Err(e) if realtime.require_auth => return Err(e.into()),
            Err(e) => {
                tracing::debug!("Ignoring invalid realtime token: {}", e);
                None
            }
        },
        None if realtime.require_auth => {
            return Err(ApiError::Unauthorized("Missing token".to_string()));
        }
        None => None,
    };

    Ok(ws
        .max_message_size(realtime.max_message_bytes)
        .max_frame_size(realtime.max_message_bytes)
        .on_upgrade(move |socket| handle_realtime_socket(socket, deployment, user_id)))
}

async fn handle_realtime_socket(socket: WebSocket, deployment: DeploymentImpl, user_id: Option<Uuid>) {
    let gateway = deployment.gateway().clone();
    let (handle, mut events) = gateway.connect(user_id);
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to serialize realtime event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            frame = receiver.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(subscriber_id = %handle.id(), "Realtime receive error: {}", e);
                        break;
                    }
                };
                handle_client_frame(&deployment, &handle, text.as_str()).await;
            }
        }
    }

    send_task.abort();
    // Dropping the handle leaves every joined room
    drop(handle);
}

async fn handle_client_frame(deployment: &DeploymentImpl, handle: &SubscriberHandle, text: &str) {
    let Some(message) = ClientMessage::parse(text) else {
        tracing::debug!(subscriber_id = %handle.id(), "Ignoring unrecognized realtime frame");
        return;
    };
    let gateway = deployment.gateway();
    match message {
        ClientMessage::JoinProjectRoom(payload) => {
            let Some(room) = room_id_from_payload(&payload) else {
                tracing::debug!(subscriber_id = %handle.id(), "Ignoring malformed join payload");
                return;
            };
            if !may_join(deployment, handle.user_id(), &room).await {
                tracing::debug!(subscriber_id = %handle.id(), room, "Join refused");
                return;
            }
            gateway.join(handle, &room);
        }
        ClientMessage::LeaveProjectRoom(payload) => {
            if let Some(room) = room_id_from_payload(&payload) {
                gateway.leave(handle, &room);
            }
        }
        ClientMessage::Ping(payload) => {
            handle.send(ServerEvent::Pong(payload));
        }
    }
}

/// With `require_auth` on, only rooms of projects the caller owns are joinable.
async fn may_join(deployment: &DeploymentImpl, user_id: Option<Uuid>, room: &str) -> bool {
    if !deployment.config().realtime.require_auth {
        return true;
    }
    let (Some(user_id), Ok(project_id)) = (user_id, Uuid::parse_str(room)) else {
        return false;
    };
    match Project::find_owned(&deployment.db().pool, project_id, user_id).await {
        Ok(project) => project.is_some(),
        Err(e) => {
            tracing::error!("Failed to check room ownership: {}", e);
            false
        }
    }
}
