//! depot-core: Shared library for the file-distribution device agent.
//!
//! This crate provides:
//! - The JSON control protocol spoken with the distribution server
//! - The local catalog of resident files and storage reclamation
//! - The transfer engine that streams files over the bulk channel
//! - Storage and BulkTransport trait abstractions

pub mod bulk;
pub mod catalog;
pub mod outbox;
pub mod protocol;
pub mod reclaim;
pub mod storage;
pub mod transfer;

pub use bulk::{BulkError, BulkTransport, DownloadBody, InMemoryTransport};
pub use catalog::{Catalog, CatalogError, FileRecord};
pub use outbox::{Outbox, OutboxReceiver};
pub use protocol::{ErrorCode, Inbound, MessageKind, Outbound, ProtocolError};
pub use storage::{FileEntry, InMemoryStorage, Storage, StorageError};
pub use transfer::{Direction, TransferConfig, TransferEngine, TransferError};
