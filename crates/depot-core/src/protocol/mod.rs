//! Wire protocol between the device agent and the distribution server.
//!
//! Every message is a JSON text frame carrying a `"type"` tag. Parsing is
//! two-tier on purpose:
//! - [`peek_type`] reads only the tag, without allocating, so the network read
//!   loop can answer cheap acks inline and route everything else to the queue
//! - [`Inbound::parse`] does the full structured parse on the processing side

pub mod encoding;
pub mod inbound;
pub mod outbound;

use thiserror::Error;

pub use encoding::{peek_tag, peek_type, MessageKind, Route};
pub use inbound::{DownloadNotifyData, DownloadSpec, Inbound, UploadRequestData, UploadSpec};
pub use outbound::{Completion, FileListData, FileRef, OnlineData, Outbound, ProgressData, Status};

/// Version announced in the `online` message unless configured otherwise.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Control messages are small; anything larger is not ours.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Error codes carried by the `error` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Generic = 1001,
    BadParameters = 1002,
    NotFound = 1003,
    ChecksumMismatch = 1004,
    InsufficientStorage = 1005,
}

impl ErrorCode {
    /// Numeric code as sent on the wire.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Map a wire code back to a known variant.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1001 => Some(Self::Generic),
            1002 => Some(Self::BadParameters),
            1003 => Some(Self::NotFound),
            1004 => Some(Self::ChecksumMismatch),
            1005 => Some(Self::InsufficientStorage),
            _ => None,
        }
    }
}

/// A message that could not be understood. Logged and dropped, never fatal.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}
