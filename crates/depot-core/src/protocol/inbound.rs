//! Server-to-device messages.

use super::{peek_tag, MessageKind, ProtocolError};
use crate::storage::is_valid_name;
use serde::{Deserialize, Serialize};

/// A message from the distribution server.
///
/// Wire format: `{"type":"<snake_case variant>", ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    OnlineAck {
        status: Option<String>,
        message: Option<String>,
    },
    FileListAck {
        status: Option<String>,
        message: Option<String>,
    },
    HeartbeatAck {
        timestamp: Option<u64>,
    },
    DownloadNotify {
        data: DownloadNotifyData,
    },
    UploadRequest {
        data: UploadRequestData,
    },
    DownloadCompleteAck {
        message: Option<String>,
    },
    UploadCompleteAck {
        message: Option<String>,
    },
    Error {
        code: Option<i64>,
        message: Option<String>,
    },
}

impl Inbound {
    /// Full structured parse of a frame.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        match peek_tag(data) {
            None => Err(ProtocolError::Malformed(
                "not a JSON object with a string \"type\" tag".to_string(),
            )),
            Some(tag) if MessageKind::from_tag(tag) == MessageKind::Unknown => {
                Err(ProtocolError::UnknownType(tag.to_string()))
            }
            Some(_) => {
                serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
            }
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::OnlineAck { .. } => MessageKind::OnlineAck,
            Self::FileListAck { .. } => MessageKind::FileListAck,
            Self::HeartbeatAck { .. } => MessageKind::HeartbeatAck,
            Self::DownloadNotify { .. } => MessageKind::DownloadNotify,
            Self::UploadRequest { .. } => MessageKind::UploadRequest,
            Self::DownloadCompleteAck { .. } => MessageKind::DownloadCompleteAck,
            Self::UploadCompleteAck { .. } => MessageKind::UploadCompleteAck,
            Self::Error { .. } => MessageKind::Error,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Inbound serialization should not fail")
    }
}

/// Payload of `download_notify`, exactly as received.
///
/// Every field is optional on the wire; [`DownloadNotifyData::validate`]
/// decides whether the notification is usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadNotifyData {
    pub filename: Option<String>,
    pub size: Option<i64>,
    pub md5: Option<String>,
    pub url: Option<String>,
}

/// A validated download notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSpec {
    pub filename: String,
    pub size: u64,
    /// Lowercase hex MD5
    pub md5: String,
    pub url: String,
}

impl DownloadNotifyData {
    pub fn validate(self) -> Result<DownloadSpec, ProtocolError> {
        let filename = require_name(self.filename)?;
        let url = require_url(self.url)?;
        let md5 = self.md5.ok_or(ProtocolError::MissingField("md5"))?;
        if md5.len() != 32 || !md5.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidField {
                field: "md5",
                reason: format!("expected 32 hex digits, got {:?}", md5),
            });
        }
        let size = self.size.ok_or(ProtocolError::MissingField("size"))?;
        if size <= 0 {
            return Err(ProtocolError::InvalidField {
                field: "size",
                reason: format!("must be positive, got {}", size),
            });
        }

        Ok(DownloadSpec {
            filename,
            size: size as u64,
            md5: md5.to_ascii_lowercase(),
            url,
        })
    }
}

/// Payload of `upload_request`, exactly as received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadRequestData {
    pub filename: Option<String>,
    pub url: Option<String>,
}

/// A validated upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSpec {
    pub filename: String,
    pub url: String,
}

impl UploadRequestData {
    pub fn validate(self) -> Result<UploadSpec, ProtocolError> {
        Ok(UploadSpec {
            filename: require_name(self.filename)?,
            url: require_url(self.url)?,
        })
    }
}

fn require_name(name: Option<String>) -> Result<String, ProtocolError> {
    let name = name.ok_or(ProtocolError::MissingField("filename"))?;
    if !is_valid_name(&name) {
        return Err(ProtocolError::InvalidField {
            field: "filename",
            reason: format!("{:?} is not a plain file name", name),
        });
    }
    Ok(name)
}

fn require_url(url: Option<String>) -> Result<String, ProtocolError> {
    let url = url.ok_or(ProtocolError::MissingField("url"))?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ProtocolError::InvalidField {
            field: "url",
            reason: format!("unsupported locator {:?}", url),
        });
    }
    Ok(url)
}
