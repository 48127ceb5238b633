// src/hub/protocol.rs

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A frame from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub action: ClientAction,
    #[serde(default)]
    pub task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAction {
    Subscribe,
    Unsubscribe,
    Ping,
}

/// A frame from the hub to a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: ServerMessageKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMessageKind {
    Subscribed,
    Log,
    Complete,
    Close,
    Pong,
    Error,
}

impl ServerMessage {
    fn stamped(kind: ServerMessageKind, task_id: &str, content: &str) -> Self {
        Self {
            kind,
            task_id: task_id.to_string(),
            content: content.to_string(),
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn subscribed(task_id: &str) -> Self {
        Self::stamped(ServerMessageKind::Subscribed, task_id, "")
    }

    pub fn log(task_id: &str, content: &str) -> Self {
        Self::stamped(ServerMessageKind::Log, task_id, content)
    }

    pub fn complete(task_id: &str) -> Self {
        Self::stamped(ServerMessageKind::Complete, task_id, "")
    }

    pub fn close(task_id: &str) -> Self {
        Self::stamped(ServerMessageKind::Close, task_id, "")
    }

    pub fn pong() -> Self {
        Self::stamped(ServerMessageKind::Pong, "", "")
    }

    pub fn error(task_id: &str, content: &str) -> Self {
        Self::stamped(ServerMessageKind::Error, task_id, content)
    }
}
