//! Device-to-server messages.

use super::ErrorCode;
use crate::catalog::FileRecord;
use crate::transfer::Direction;
use serde::{Deserialize, Serialize};

/// Result marker carried by acks and completion notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineData {
    pub version: String,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListData {
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressData {
    pub filename: String,
    pub percent: u8,
    pub transferred: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub filename: String,
    pub md5: String,
}

/// A message from the device to the distribution server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Online {
        data: OnlineData,
    },
    FileList {
        data: FileListData,
    },
    Heartbeat {
        timestamp: u64,
    },
    DownloadAck {
        status: Status,
        message: String,
        data: FileRef,
    },
    UploadAck {
        status: Status,
        message: String,
        data: FileRef,
    },
    DownloadProgress {
        data: ProgressData,
    },
    UploadProgress {
        data: ProgressData,
    },
    DownloadComplete {
        status: Status,
        data: Completion,
    },
    UploadComplete {
        status: Status,
        data: Completion,
    },
    Error {
        status: Status,
        code: u16,
        message: String,
    },
}

impl Outbound {
    pub fn online(version: &str, mac: &str) -> Self {
        Self::Online {
            data: OnlineData {
                version: version.to_string(),
                mac: mac.to_string(),
            },
        }
    }

    pub fn file_list(files: Vec<FileRecord>) -> Self {
        Self::FileList {
            data: FileListData { files },
        }
    }

    pub fn heartbeat(timestamp: u64) -> Self {
        Self::Heartbeat { timestamp }
    }

    /// Acknowledge that a transfer is about to start.
    pub fn ack(direction: Direction, filename: &str) -> Self {
        let data = FileRef {
            filename: filename.to_string(),
        };
        match direction {
            Direction::Download => Self::DownloadAck {
                status: Status::Success,
                message: "download started".to_string(),
                data,
            },
            Direction::Upload => Self::UploadAck {
                status: Status::Success,
                message: "upload started".to_string(),
                data,
            },
        }
    }

    pub fn progress(direction: Direction, data: ProgressData) -> Self {
        match direction {
            Direction::Download => Self::DownloadProgress { data },
            Direction::Upload => Self::UploadProgress { data },
        }
    }

    pub fn complete(direction: Direction, filename: &str, md5: &str) -> Self {
        let data = Completion {
            filename: filename.to_string(),
            md5: md5.to_string(),
        };
        match direction {
            Direction::Download => Self::DownloadComplete {
                status: Status::Success,
                data,
            },
            Direction::Upload => Self::UploadComplete {
                status: Status::Success,
                data,
            },
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            status: Status::Error,
            code: code.code(),
            message: message.into(),
        }
    }

    /// The wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Online { .. } => "online",
            Self::FileList { .. } => "file_list",
            Self::Heartbeat { .. } => "heartbeat",
            Self::DownloadAck { .. } => "download_ack",
            Self::UploadAck { .. } => "upload_ack",
            Self::DownloadProgress { .. } => "download_progress",
            Self::UploadProgress { .. } => "upload_progress",
            Self::DownloadComplete { .. } => "download_complete",
            Self::UploadComplete { .. } => "upload_complete",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Outbound serialization should not fail")
    }

    /// Try to parse from a JSON text frame.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn wire(msg: &Outbound) -> Value {
        serde_json::from_str(&msg.to_json()).unwrap()
    }

    #[test]
    fn test_online_wire_format() {
        let msg = Outbound::online("1.0.0", "AA:BB:CC:DD:EE:FF");
        assert_eq!(
            wire(&msg),
            json!({"type": "online", "data": {"version": "1.0.0", "mac": "AA:BB:CC:DD:EE:FF"}})
        );
    }

    #[test]
    fn test_file_list_wire_format() {
        let msg = Outbound::file_list(vec![FileRecord {
            filename: "file1.bin".into(),
            size: 2048,
            md5: "0cc175b9c0f1b6a831c399e269772661".into(),
            timestamp: 1_700_000_000,
        }]);
        assert_eq!(
            wire(&msg),
            json!({"type": "file_list", "data": {"files": [{
                "filename": "file1.bin",
                "size": 2048,
                "md5": "0cc175b9c0f1b6a831c399e269772661",
                "timestamp": 1_700_000_000u64
            }]}})
        );
    }

    #[test]
    fn test_heartbeat_wire_format() {
        assert_eq!(
            wire(&Outbound::heartbeat(12)),
            json!({"type": "heartbeat", "timestamp": 12})
        );
    }

    #[test]
    fn test_ack_and_complete_follow_direction() {
        let ack = wire(&Outbound::ack(Direction::Download, "a.bin"));
        assert_eq!(ack["type"], "download_ack");
        assert_eq!(ack["status"], "success");
        assert_eq!(ack["data"], json!({"filename": "a.bin"}));

        let ack = wire(&Outbound::ack(Direction::Upload, "log.txt"));
        assert_eq!(ack["type"], "upload_ack");

        let done = wire(&Outbound::complete(Direction::Download, "a.bin", "abc"));
        assert_eq!(
            done,
            json!({"type": "download_complete", "status": "success", "data": {"filename": "a.bin", "md5": "abc"}})
        );
        let done = Outbound::complete(Direction::Upload, "log.txt", "abc");
        assert_eq!(done.kind(), "upload_complete");
    }

    #[test]
    fn test_progress_wire_format() {
        let msg = Outbound::progress(
            Direction::Download,
            ProgressData {
                filename: "a.bin".into(),
                percent: 40,
                transferred: 400,
                total_size: 1000,
            },
        );
        assert_eq!(
            wire(&msg),
            json!({"type": "download_progress", "data": {
                "filename": "a.bin", "percent": 40, "transferred": 400, "total_size": 1000
            }})
        );
    }

    #[test]
    fn test_error_wire_format() {
        let msg = Outbound::error(ErrorCode::InsufficientStorage, "no room");
        assert_eq!(
            wire(&msg),
            json!({"type": "error", "status": "error", "code": 1005, "message": "no room"})
        );
    }

    #[test]
    fn test_from_json_roundtrip() {
        let msg = Outbound::complete(Direction::Upload, "log.txt", "abc");
        assert_eq!(Outbound::from_json(msg.to_json().as_bytes()), Some(msg));
        assert_eq!(Outbound::from_json(b"nope"), None);
    }
}
