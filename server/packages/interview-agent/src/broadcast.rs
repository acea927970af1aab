use std::path::Path;

use interview_agent_error::InterviewError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use utoipa::ToSchema;

use crate::store::now_ms;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeType {
    Create,
    Update,
}

/// A file written by a tool during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeEvent {
    pub session_id: String,
    #[serde(rename = "type")]
    pub change_type: FileChangeType,
    pub path: String,
    pub name: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl FileChangeEvent {
    pub fn new(session_id: &str, change_type: FileChangeType, path: &str) -> Self {
        let name = Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        Self {
            session_id: session_id.to_string(),
            change_type,
            path: path.to_string(),
            name,
            timestamp: now_ms(),
        }
    }
}

pub trait FileChangeBroadcaster: Send + Sync {
    fn publish(&self, event: FileChangeEvent) -> Result<(), InterviewError>;
}

/// In-process fan-out to every open file event stream.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<FileChangeEvent>,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FileChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl FileChangeBroadcaster for ChannelBroadcaster {
    fn publish(&self, event: FileChangeEvent) -> Result<(), InterviewError> {
        // No subscribers is fine.
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_name_is_last_path_segment() {
        let event = FileChangeEvent::new("s1", FileChangeType::Create, "src/app/main.py");
        assert_eq!(event.name, "main.py");
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(value["type"], "create");
        assert_eq!(value["sessionId"], "s1");
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let broadcaster = ChannelBroadcaster::new();
        broadcaster
            .publish(FileChangeEvent::new("s1", FileChangeType::Update, "a.py"))
            .expect("publish without subscribers");

        let mut rx = broadcaster.subscribe();
        broadcaster
            .publish(FileChangeEvent::new("s1", FileChangeType::Update, "b.py"))
            .expect("publish");
        let event = rx.recv().await.expect("event");
        assert_eq!(event.path, "b.py");
        assert_eq!(event.change_type, FileChangeType::Update);
    }
}
