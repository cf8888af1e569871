use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// Downloads
// ============================================================================

/// Status reported by the desktop app for a single download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Stopped,
    Extracting,
    Completed,
    Error,
}

impl DownloadStatus {
    /// Download is making (or about to make) progress.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Downloading | Self::Extracting)
    }

    /// Download is halted but resumable. The desktop app stops reporting
    /// reliable progress/size figures in these states.
    pub fn is_paused(self) -> bool {
        matches!(self, Self::Paused | Self::Stopped)
    }

    /// Download will never change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// A single download as reported by the desktop app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
    pub id: String,
    pub name: String,
    pub status: DownloadStatus,
    /// Percent complete, 0.0..=100.0.
    pub progress: f64,
    /// Human-readable amount downloaded so far, e.g. "40 MB".
    #[serde(default)]
    pub downloaded: String,
    /// Human-readable total size, e.g. "1.2 GB".
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub speed: String,
    #[serde(default)]
    pub eta: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: String,
}

impl Download {
    /// Optimistic record for a download the server has announced but not yet
    /// listed. Reconciled away once the real record shows up.
    pub fn placeholder(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: DownloadStatus::Queued,
            progress: 0.0,
            downloaded: "0 MB".to_string(),
            size: "Unknown".to_string(),
            speed: String::new(),
            eta: String::new(),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Id/name pair announcing a download before it appears in the list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDownloadInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadsResponse {
    pub downloads: Vec<Download>,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub has_new_downloads: bool,
    #[serde(default)]
    pub new_downloads_info: Vec<NewDownloadInfo>,
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadCommand {
    Pause,
    Resume,
    Kill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: DownloadCommand,
    pub download_id: String,
}

/// Fire-and-forget acknowledgment; the state change lands asynchronously
/// and is observed on a later downloads poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Pairing / session
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyCodeRequest {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResponse {
    pub session_id: String,
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub session_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayNameResponse {
    pub display_name: String,
}

// ============================================================================
// Friends / presence
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Online,
    Away,
    Busy,
    Offline,
    DoNotDisturb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendPresence {
    pub uid: String,
    pub display_name: String,
    #[serde(rename = "photoURL", default)]
    pub photo_url: String,
    pub status: PresenceState,
    #[serde(default)]
    pub custom_message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FriendsResponse {
    pub friends: Vec<FriendPresence>,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadNotification {
    pub download_id: String,
    pub download_name: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsResponse {
    pub has_new_downloads: bool,
    #[serde(default)]
    pub notifications: Vec<DownloadNotification>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_status_serialization() {
        let json = serde_json::to_string(&DownloadStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");

        let status: DownloadStatus = serde_json::from_str("\"extracting\"").unwrap();
        assert_eq!(status, DownloadStatus::Extracting);
    }

    #[test]
    fn test_status_classes() {
        assert!(DownloadStatus::Queued.is_active());
        assert!(DownloadStatus::Downloading.is_active());
        assert!(DownloadStatus::Extracting.is_active());
        assert!(DownloadStatus::Paused.is_paused());
        assert!(DownloadStatus::Stopped.is_paused());
        assert!(DownloadStatus::Completed.is_terminal());
        assert!(DownloadStatus::Error.is_terminal());
        assert!(!DownloadStatus::Paused.is_active());
        assert!(!DownloadStatus::Completed.is_paused());
    }

    #[test]
    fn test_download_deserialization_with_defaults() {
        // Desktop app omits fields it has no value for
        let json = r#"{"id":"a1","name":"Game A","status":"queued","progress":0}"#;
        let d: Download = serde_json::from_str(json).unwrap();
        assert_eq!(d.id, "a1");
        assert_eq!(d.status, DownloadStatus::Queued);
        assert_eq!(d.downloaded, "");
        assert_eq!(d.error, None);
    }

    #[test]
    fn test_downloads_response_field_names() {
        let json = r#"{
            "downloads": [],
            "lastUpdated": "2025-01-01T00:00:00Z",
            "hasNewDownloads": true,
            "newDownloadsInfo": [{"id": "z", "name": "Game Z"}]
        }"#;
        let resp: DownloadsResponse = serde_json::from_str(json).unwrap();
        assert!(resp.has_new_downloads);
        assert_eq!(resp.new_downloads_info[0].id, "z");
        assert_eq!(resp.new_downloads_info[0].name, "Game Z");
    }

    #[test]
    fn test_placeholder_shape() {
        let p = Download::placeholder("z", "Game Z");
        assert_eq!(p.status, DownloadStatus::Queued);
        assert_eq!(p.progress, 0.0);
        assert_eq!(p.size, "Unknown");
        assert!(p.error.is_none());
    }

    #[test]
    fn test_command_request_serialization() {
        let req = CommandRequest {
            command: DownloadCommand::Pause,
            download_id: "d-1".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"command\":\"pause\""));
        assert!(json.contains("\"downloadId\":\"d-1\""));
    }

    #[test]
    fn test_connection_response_deserialization() {
        let json = r#"{"sessionId":"s-1","userId":"u-1","displayName":"Alice"}"#;
        let resp: ConnectionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.session_id, "s-1");
        assert_eq!(resp.user_id, "u-1");
        assert_eq!(resp.display_name, "Alice");
    }

    #[test]
    fn test_friend_presence_deserialization() {
        let json = r#"{
            "uid": "u-2",
            "displayName": "Bob",
            "photoURL": "https://example.com/b.png",
            "status": "do_not_disturb",
            "customMessage": "heads down"
        }"#;
        let friend: FriendPresence = serde_json::from_str(json).unwrap();
        assert_eq!(friend.status, PresenceState::DoNotDisturb);
        assert_eq!(friend.custom_message, "heads down");
    }
}
