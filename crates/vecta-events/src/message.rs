//! Push message model for the console event stream.

use crate::error::{Result, StreamError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress record for one background task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub id: String,
    pub name: String,
    pub status: String,
    pub progress: f32,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One user-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub title: String,
    pub body: String,
    pub read: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Read-state change for one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationReadReceipt {
    pub id: String,
    pub read: bool,
}

/// One server-side log line. `time` is displayed verbatim, so it stays a
/// string rather than a parsed timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemLogLine {
    pub time: String,
    pub level: String,
    pub message: String,
}

/// Push message received from the event stream, tagged by the frame's
/// `type` field with its payload under `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushMessage {
    TaskUpdate(TaskProgress),
    TasksList(Vec<TaskProgress>),
    Notification(NotificationRecord),
    NotificationsList(Vec<NotificationRecord>),
    NotificationRead(NotificationReadReceipt),
    SystemLog(SystemLogLine),
}

/// Decode one stream line into a push message.
///
/// Blank lines are keepalives and decode to `None`. Bad JSON and unknown
/// tags are errors; the caller drops such frames without closing the stream.
pub fn parse_frame(line: &str) -> Result<Option<PushMessage>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let message: PushMessage = serde_json::from_str(line)
        .map_err(|error| StreamError::Frame(format!("undecodable push frame: {error}")))?;
    Ok(Some(message))
}
