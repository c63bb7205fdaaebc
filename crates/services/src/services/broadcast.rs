//! Project-scoped real-time fan-out.
//!
//! Each room is a set of weak references to live subscribers keyed by
//! subscriber id. A subscriber's rooms are left when its handle drops, and
//! references whose subscriber is gone are pruned on the next emit, so a
//! disconnect never needs a lock that an emitter holds.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use db::models::task::TaskStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use ts_rs::TS;
use uuid::Uuid;

pub const MAX_ROOM_ID_LEN: usize = 128;
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusUpdate {
    pub task_id: Uuid,
    pub new_status: TaskStatus,
    pub agent_id: Option<Uuid>,
    pub agent_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct AgentLog {
    pub message: String,
    pub agent_id: Option<Uuid>,
    pub agent_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub task_id: Uuid,
    pub execution_id: String,
}

/// Frames sent to clients, serialized as `{ "event": ..., "data": ... }`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    JoinedRoom(String),
    LeftRoom(String),
    TaskStatusUpdate(TaskStatusUpdate),
    AgentLog(AgentLog),
    Pong(Value),
}

/// Frames accepted from clients. Payloads stay raw so malformed ones can be
/// inspected and dropped instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinProjectRoom(Value),
    LeaveProjectRoom(Value),
    Ping(Value),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let event = value.get("event")?.as_str()?;
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        match event {
            "joinProjectRoom" => Some(ClientMessage::JoinProjectRoom(data)),
            "leaveProjectRoom" => Some(ClientMessage::LeaveProjectRoom(data)),
            "ping" => Some(ClientMessage::Ping(data)),
            _ => None,
        }
    }
}

/// Normalize a join payload into a room id, or `None` if it is unusable.
///
/// Project ids are canonicalized so `ABC…` and `abc…` land in the same room.
pub fn room_id_from_payload(payload: &Value) -> Option<String> {
    let raw = payload.as_str()?.trim();
    if raw.is_empty() || raw.len() > MAX_ROOM_ID_LEN {
        return None;
    }
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return None;
    }
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id.to_string()),
        Err(_) => Some(raw.to_string()),
    }
}

pub fn project_room(project_id: Uuid) -> String {
    project_id.to_string()
}

pub struct Subscriber {
    id: Uuid,
    user_id: Option<Uuid>,
    tx: mpsc::Sender<ServerEvent>,
    rooms: Mutex<HashSet<String>>,
}

impl Subscriber {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    pub fn rooms(&self) -> Vec<String> {
        self.rooms
            .lock()
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue a frame for this subscriber only.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

/// Owning side of a connection. Dropping it leaves every joined room.
pub struct SubscriberHandle {
    subscriber: Arc<Subscriber>,
    gateway: BroadcastGateway,
}

impl std::ops::Deref for SubscriberHandle {
    type Target = Subscriber;
    fn deref(&self) -> &Self::Target {
        &self.subscriber
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.gateway.leave_all(&self.subscriber);
    }
}

#[derive(Clone, Default)]
pub struct BroadcastGateway {
    rooms: Arc<DashMap<String, HashMap<Uuid, Weak<Subscriber>>>>,
}

impl BroadcastGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, user_id: Option<Uuid>) -> (SubscriberHandle, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let subscriber = Arc::new(Subscriber {
            id: Uuid::new_v4(),
            user_id,
            tx,
            rooms: Mutex::new(HashSet::new()),
        });
        tracing::debug!(subscriber_id = %subscriber.id, "Subscriber connected");
        (
            SubscriberHandle {
                subscriber,
                gateway: self.clone(),
            },
            rx,
        )
    }

    /// Add the subscriber to `room` and acknowledge. Joining twice is harmless.
    pub fn join(&self, handle: &SubscriberHandle, room: &str) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(handle.id, Arc::downgrade(&handle.subscriber));
        if let Ok(mut rooms) = handle.rooms.lock() {
            rooms.insert(room.to_string());
        }
        tracing::debug!(subscriber_id = %handle.id, room, "Joined room");
        handle.send(ServerEvent::JoinedRoom(format!(
            "Successfully joined project room {room}"
        )));
    }

    pub fn leave(&self, handle: &SubscriberHandle, room: &str) {
        self.remove_member(room, handle.id);
        if let Ok(mut rooms) = handle.rooms.lock() {
            rooms.remove(room);
        }
        handle.send(ServerEvent::LeftRoom(format!("Left project room {room}")));
    }

    fn leave_all(&self, subscriber: &Subscriber) {
        let rooms: Vec<String> = match subscriber.rooms.lock() {
            Ok(mut rooms) => rooms.drain().collect(),
            Err(_) => return,
        };
        for room in rooms {
            self.remove_member(&room, subscriber.id);
        }
        tracing::debug!(subscriber_id = %subscriber.id, "Subscriber disconnected");
    }

    fn remove_member(&self, room: &str, subscriber_id: Uuid) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&subscriber_id);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    /// Deliver `event` to every live member of `room`. Returns the number of
    /// subscribers it was queued for.
    pub fn emit(&self, room: &str, event: ServerEvent) -> usize {
        // Snapshot the members so no shard lock is held while sending.
        let members: Vec<(Uuid, Weak<Subscriber>)> = match self.rooms.get(room) {
            Some(members) => members
                .iter()
                .map(|(id, subscriber)| (*id, subscriber.clone()))
                .collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, weak) in members {
            let Some(subscriber) = weak.upgrade() else {
                dead.push(id);
                continue;
            };
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscriber_id = %id, room, "Subscriber lagging, dropping event");
                }
                Err(TrySendError::Closed(_)) => dead.push(id),
            }
        }

        for id in dead {
            self.remove_member(room, id);
        }
        delivered
    }

    pub fn emit_status(&self, project_id: Uuid, update: TaskStatusUpdate) -> usize {
        self.emit(&project_room(project_id), ServerEvent::TaskStatusUpdate(update))
    }

    pub fn emit_log(&self, project_id: Uuid, log: AgentLog) -> usize {
        self.emit(&project_room(project_id), ServerEvent::AgentLog(log))
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|members| members.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
