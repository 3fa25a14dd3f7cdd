//! Cheap type-tag detection.
//!
//! The read loop must stay fast, so it never builds a full message. It only
//! borrows the `"type"` string out of the frame and decides a [`Route`]:
//! a handful of idempotent acks are handled right there, the rest goes to
//! the processing queue.

use serde::Deserialize;

/// Known inbound message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    OnlineAck,
    FileListAck,
    HeartbeatAck,
    DownloadNotify,
    UploadRequest,
    DownloadCompleteAck,
    UploadCompleteAck,
    Error,
    Unknown,
}

/// Where an inbound frame gets handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Handled in the read loop without touching the queue
    Inline,
    /// Moved to the processing loop
    Queued,
    /// Not ours; log and drop
    Discard,
}

impl MessageKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "online_ack" => Self::OnlineAck,
            "file_list_ack" => Self::FileListAck,
            "heartbeat_ack" => Self::HeartbeatAck,
            "download_notify" => Self::DownloadNotify,
            "upload_request" => Self::UploadRequest,
            "download_complete_ack" => Self::DownloadCompleteAck,
            "upload_complete_ack" => Self::UploadCompleteAck,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub fn route(self) -> Route {
        match self {
            Self::OnlineAck | Self::FileListAck | Self::HeartbeatAck => Route::Inline,
            Self::DownloadNotify
            | Self::UploadRequest
            | Self::DownloadCompleteAck
            | Self::UploadCompleteAck
            | Self::Error => Route::Queued,
            Self::Unknown => Route::Discard,
        }
    }
}

#[derive(Deserialize)]
struct TypeTag<'a> {
    #[serde(rename = "type", borrow)]
    kind: Option<&'a str>,
}

/// Borrow the `"type"` tag from a JSON frame.
///
/// Returns None for non-JSON input, a missing tag, or a tag that needs
/// unescaping (none of ours do).
pub fn peek_tag(data: &[u8]) -> Option<&str> {
    if data.first() != Some(&b'{') {
        return None;
    }
    let tag: TypeTag<'_> = serde_json::from_slice(data).ok()?;
    tag.kind
}

/// Classify a frame by its type tag. None means the frame is malformed.
pub fn peek_type(data: &[u8]) -> Option<MessageKind> {
    peek_tag(data).map(MessageKind::from_tag)
}
