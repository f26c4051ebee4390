//! Wire format
//!
//! Requests are `{id?, task, data?}`; every reply is
//! `{id, timestamp, lastmsg, status, data, completed, task?}`.
//! `completed: false` marks a reply that will be followed by more
//! asynchronous messages carrying the same `id` (long-running `play`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Incoming control message.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<String>,
    pub task: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Outgoing control message.
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Id of the last message received on this connection.
    pub lastmsg: Option<String>,
    pub status: String,
    pub data: Option<Value>,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl Reply {
    fn new(status: &str, data: Option<Value>, completed: bool, lastmsg: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            lastmsg,
            status: status.to_string(),
            data,
            completed,
            task: None,
        }
    }

    pub fn success(data: Value, lastmsg: Option<String>) -> Self {
        Self::new("success", Some(data), true, lastmsg)
    }

    pub fn error(message: impl Into<String>, lastmsg: Option<String>) -> Self {
        Self::new(
            "error",
            Some(serde_json::json!({ "error": message.into() })),
            true,
            lastmsg,
        )
    }

    /// Error with a machine-readable reason alongside the message.
    pub fn error_with_reason(
        reason: &str,
        message: impl Into<String>,
        lastmsg: Option<String>,
    ) -> Self {
        Self::new(
            "error",
            Some(serde_json::json!({ "reason": reason, "error": message.into() })),
            true,
            lastmsg,
        )
    }

    /// First reply of an asynchronous stream: fixed id, not completed.
    pub fn stream_opening(id: &str, data: Value, lastmsg: Option<String>) -> Self {
        let mut reply = Self::new("success", Some(data), false, lastmsg);
        reply.id = id.to_string();
        reply
    }

    /// Follow-up message of an asynchronous stream.
    pub fn stream_message(
        id: &str,
        task: &str,
        data: Value,
        completed: bool,
        lastmsg: Option<String>,
    ) -> Self {
        let mut reply = Self::new("success", Some(data), completed, lastmsg);
        reply.id = id.to_string();
        reply.task = Some(task.to_string());
        reply
    }

    pub fn with_task(mut self, task: &str) -> Self {
        self.task = Some(task.to_string());
        self
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
