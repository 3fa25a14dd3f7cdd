//! Wiring: builds the catalog, queues and tasks, and hands back a handle.

use crate::config::AgentConfig;
use crate::dispatcher::Dispatcher;
use crate::identity::Identity;
use crate::link::{run_writer, Control, Link, SharedSink, WRITE_TIMEOUT};
use crate::relay::{self, RelaySender};
use crate::supervisor::ConnectionState;
use depot_core::outbox;
use depot_core::{BulkTransport, Catalog, Storage, StorageError, TransferEngine};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

pub struct Agent {
    config: AgentConfig,
    identity: Identity,
}

impl Agent {
    pub fn new(config: AgentConfig, identity: Identity) -> Self {
        Self { config, identity }
    }

    /// Start the writer, processing and link tasks.
    ///
    /// Scans `storage` first unless disabled, so the first `file_list`
    /// reflects what is already on disk.
    pub async fn spawn<S, T>(self, storage: S, transport: T) -> Result<AgentHandle, StorageError>
    where
        S: Storage + 'static,
        T: BulkTransport + 'static,
    {
        let Agent { config, identity } = self;

        let catalog = if config.scan_on_start {
            let catalog = Catalog::rebuild(&storage, config.catalog_cap, config.transfer.chunk_size).await?;
            info!("Found {} resident file(s)", catalog.len());
            catalog
        } else {
            Catalog::new(config.catalog_cap)
        };

        let (control, control_rx) = mpsc::channel(4);
        let (outbox, outbox_rx) = outbox::channel(config.outbox_capacity);
        let sink: SharedSink = Arc::new(Mutex::new(None));
        let writer = tokio::spawn(run_writer(outbox_rx, sink.clone(), WRITE_TIMEOUT, control.downgrade()));

        let (relay, frames) = relay::channel(config.queue_capacity);
        let engine = TransferEngine::new(storage, transport, config.transfer.clone());
        let (dispatcher, catalog_rx) = Dispatcher::new(engine, catalog, outbox.clone());
        let processing = tokio::spawn(dispatcher.run(frames));

        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let link = Link::new(&config, identity, relay.clone(), outbox, sink, catalog_rx, state_tx);
        let link = tokio::spawn(link.run(control_rx));

        Ok(AgentHandle {
            control,
            state,
            relay,
            link,
            background: vec![processing, writer],
        })
    }
}

/// Handle to a running agent.
pub struct AgentHandle {
    control: mpsc::Sender<Control>,
    state: watch::Receiver<ConnectionState>,
    relay: RelaySender,
    link: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    /// Clear the reconnect counter; reconnects right away if it had given up.
    pub async fn reset_reconnect(&self) {
        let _ = self.control.send(Control::Reset).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Inbound frames dropped because the processing queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.relay.dropped()
    }

    /// Close the connection and stop every task. An in-flight transfer is
    /// abandoned.
    pub async fn shutdown(self) {
        let _ = self.control.send(Control::Shutdown).await;
        let _ = self.link.await;
        for task in self.background {
            task.abort();
        }
        info!("Agent stopped");
    }
}
