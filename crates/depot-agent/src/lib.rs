//! depot-agent: Device-side agent for the file distribution service.
//!
//! Keeps a WebSocket control connection to the distribution server, moves
//! file bytes over HTTP, and stores them in a local directory. The protocol,
//! catalog and transfer logic live in depot-core; this crate supplies the
//! network, disk and process plumbing around them.
//!
//! This is a library layer so integration tests can drive a full agent.

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod heartbeat;
pub mod http;
pub mod identity;
pub mod link;
pub mod native_storage;
pub mod relay;
pub mod supervisor;

pub use agent::{Agent, AgentHandle};
pub use config::{AgentConfig, Args, ConfigError};
pub use http::HttpTransport;
pub use identity::Identity;
pub use native_storage::NativeStorage;
pub use supervisor::{ConnectionState, ReconnectConfig};
