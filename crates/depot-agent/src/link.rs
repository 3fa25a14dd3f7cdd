//! The WebSocket link to the distribution server.
//!
//! One task owns the socket read half, the supervisor and the reconnect
//! timer. It answers cheap acks inline and hands everything else to the
//! relay queue without waiting. A separate writer task drains the outbox
//! into whatever sink is current.

use crate::config::AgentConfig;
use crate::heartbeat::Heartbeat;
use crate::identity::Identity;
use crate::relay::{Frame, RelaySender};
use crate::supervisor::{Action, ConnectionState, Supervisor};
use depot_core::catalog::FileRecord;
use depot_core::protocol::{peek_tag, peek_type, MessageKind, Route, MAX_MESSAGE_SIZE};
use depot_core::{Outbound, Outbox, OutboxReceiver};
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, StreamExt};
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Sleep;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the current connection, if any.
pub type SharedSink = Arc<Mutex<Option<SplitSink<WsStream, Message>>>>;

/// Longest a single socket write may take before the connection is
/// considered dead.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Requests from outside the link task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Clear the reconnect counter, reconnecting if parked
    Reset,
    /// The writer gave up on a socket write and dropped the sink
    WriteStalled,
    Shutdown,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

/// Drain the outbox into the current sink. Dropped while offline.
///
/// A write that takes longer than `write_timeout` drops the sink and reports
/// `Control::WriteStalled`, so the lock is never held for longer than that.
pub async fn run_writer<W>(
    mut rx: OutboxReceiver,
    sink: Arc<Mutex<Option<W>>>,
    write_timeout: Duration,
    control: mpsc::WeakSender<Control>,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(msg) = rx.recv().await {
        let mut guard = sink.lock().await;
        let Some(write) = guard.as_mut() else {
            debug!("Offline, dropping {}", msg.kind());
            continue;
        };
        match tokio::time::timeout(write_timeout, write.send(Message::Text(msg.to_json()))).await {
            Ok(Ok(())) => {}
            // The read half notices the broken socket and drives the reconnect
            Ok(Err(e)) => warn!("Failed to send {}: {}", msg.kind(), e),
            Err(_) => {
                warn!("Sending {} stalled for {:?}, dropping connection", msg.kind(), write_timeout);
                guard.take();
                drop(guard);
                if let Some(control) = control.upgrade() {
                    let _ = control.try_send(Control::WriteStalled);
                }
            }
        }
    }
    debug!("Writer stopped");
}

pub struct Link {
    endpoint: String,
    identity: Identity,
    protocol_version: String,
    connect_timeout: Duration,
    reconnect_interval: Duration,
    supervisor: Supervisor,
    relay: RelaySender,
    outbox: Outbox,
    sink: SharedSink,
    /// Write half of a connection that hasn't announced itself yet
    fresh: Option<SplitSink<WsStream, Message>>,
    stream: Option<SplitStream<WsStream>>,
    timer: Option<Pin<Box<Sleep>>>,
    heartbeat: Heartbeat,
    catalog: watch::Receiver<Vec<FileRecord>>,
    state_tx: watch::Sender<ConnectionState>,
}

enum Event {
    Frame(Option<Result<Message, WsError>>),
    Timer,
    Control(Option<Control>),
}

impl Link {
    pub fn new(
        config: &AgentConfig,
        identity: Identity,
        relay: RelaySender,
        outbox: Outbox,
        sink: SharedSink,
        catalog: watch::Receiver<Vec<FileRecord>>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            endpoint: identity.endpoint(&config.server_url),
            identity,
            protocol_version: config.protocol_version.clone(),
            connect_timeout: config.reconnect.connect_timeout,
            reconnect_interval: config.reconnect.interval,
            supervisor: Supervisor::new(config.reconnect.clone()),
            relay,
            heartbeat: Heartbeat::new(config.heartbeat_interval, outbox.clone()),
            outbox,
            sink,
            fresh: None,
            stream: None,
            timer: None,
            catalog,
            state_tx,
        }
    }

    pub async fn run(mut self, mut control: mpsc::Receiver<Control>) {
        info!("Connecting to {}", self.endpoint);
        let mut pending: VecDeque<Action> = self.supervisor.start().into();

        loop {
            while let Some(action) = pending.pop_front() {
                let follow_up = self.apply(action).await;
                pending.extend(follow_up);
            }
            self.state_tx.send_replace(self.supervisor.state());

            let event = tokio::select! {
                frame = next_frame(&mut self.stream) => Event::Frame(frame),
                _ = expire(&mut self.timer) => Event::Timer,
                ctrl = control.recv() => Event::Control(ctrl),
            };

            match event {
                Event::Frame(Some(Ok(msg))) => {
                    if let Some(status) = self.on_message(msg) {
                        pending.extend(self.supervisor.on_disconnected(status));
                    }
                }
                Event::Frame(Some(Err(e))) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection to {} closed", self.endpoint);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", self.endpoint, e);
                        }
                    }
                    pending.extend(self.supervisor.on_transport_error(None));
                }
                Event::Frame(None) => {
                    debug!("Connection to {} ended", self.endpoint);
                    pending.extend(self.supervisor.on_disconnected(None));
                }
                Event::Timer => {
                    self.timer = None;
                    pending.extend(self.supervisor.on_timer());
                }
                Event::Control(Some(Control::Reset)) => {
                    pending.extend(self.supervisor.reset());
                }
                Event::Control(Some(Control::WriteStalled)) => {
                    if self.supervisor.state() == ConnectionState::Connected {
                        pending.extend(self.supervisor.on_transport_error(None));
                    }
                }
                Event::Control(Some(Control::Shutdown)) | Event::Control(None) => break,
            }
        }

        self.close().await;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("Link stopped");
    }

    async fn apply(&mut self, action: Action) -> Vec<Action> {
        match action {
            Action::Connect => match self.connect().await {
                Ok(()) => self.supervisor.on_connected(),
                Err(e) => {
                    warn!("Connect to {} failed: {}", self.endpoint, e);
                    self.supervisor.on_transport_error(None)
                }
            },
            Action::CancelTimer => {
                self.timer = None;
                Vec::new()
            }
            Action::AnnounceOnline => self.announce_online().await,
            Action::StartHeartbeat => {
                self.heartbeat.start();
                Vec::new()
            }
            Action::StopHeartbeat => {
                self.heartbeat.stop();
                Vec::new()
            }
            Action::ClearConnection => {
                self.stream = None;
                self.fresh = None;
                self.sink.lock().await.take();
                Vec::new()
            }
            Action::ArmTimer => {
                self.timer = Some(Box::pin(tokio::time::sleep(self.reconnect_interval)));
                Vec::new()
            }
        }
    }

    async fn connect(&mut self) -> Result<(), LinkError> {
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(self.endpoint.as_str()))
            .await
            .map_err(|_| LinkError::Timeout(self.connect_timeout))??;
        info!("Connected to {}", self.endpoint);

        let (write, read) = ws.split();
        self.fresh = Some(write);
        self.stream = Some(read);
        Ok(())
    }

    /// Send `online` first, then hand the sink to the writer.
    async fn announce_online(&mut self) -> Vec<Action> {
        let Some(mut write) = self.fresh.take() else {
            return Vec::new();
        };
        let online = Outbound::online(&self.protocol_version, &self.identity.mac);
        if let Err(e) = write.send(Message::Text(online.to_json())).await {
            warn!("Failed to announce online: {}", e);
            self.stream = None;
            return self.supervisor.on_transport_error(None);
        }
        debug!("Announced online as {}", self.identity.mac);
        *self.sink.lock().await = Some(write);
        Vec::new()
    }

    /// Handle one frame. Returns the close status if the server hung up.
    fn on_message(&self, msg: Message) -> Option<Option<u16>> {
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return None,
            Message::Close(frame) => {
                let status = frame.map(|f| u16::from(f.code));
                debug!("Received close frame from {} ({:?})", self.endpoint, status);
                return Some(status);
            }
        };
        self.on_frame(data);
        None
    }

    fn on_frame(&self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        if data.len() > MAX_MESSAGE_SIZE {
            warn!(
                "Message exceeds max size ({} > {}), dropping",
                data.len(),
                MAX_MESSAGE_SIZE
            );
            return;
        }
        let Some(kind) = peek_type(&data) else {
            warn!("Dropping malformed frame ({} bytes)", data.len());
            return;
        };

        match kind.route() {
            Route::Inline => self.answer_inline(kind),
            Route::Queued => {
                self.relay.push(Frame { kind, payload: data });
            }
            Route::Discard => {
                warn!("Ignoring unknown message type {:?}", peek_tag(&data).unwrap_or_default());
            }
        }
    }

    fn answer_inline(&self, kind: MessageKind) {
        match kind {
            MessageKind::OnlineAck => {
                let files = self.catalog.borrow().clone();
                debug!("Online acknowledged, announcing {} file(s)", files.len());
                self.outbox.post_priority(Outbound::file_list(files));
            }
            _ => debug!("{:?}", kind),
        }
    }

    async fn close(&mut self) {
        self.heartbeat.stop();
        self.timer = None;
        self.stream = None;
        self.fresh = None;
        let write = self.sink.lock().await.take();
        if let Some(mut write) = write {
            let _ = tokio::time::timeout(WRITE_TIMEOUT, write.send(Message::Close(None))).await;
        }
    }
}

async fn next_frame(stream: &mut Option<SplitStream<WsStream>>) -> Option<Result<Message, WsError>> {
    match stream {
        Some(read) => read.next().await,
        None => std::future::pending().await,
    }
}

async fn expire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::outbox;

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_releases_sink() {
        let (outbox, rx) = outbox::channel(8);
        // Nobody reads the other end, so the first flush never completes
        let (write, _peer) = futures::channel::mpsc::channel::<Message>(0);
        let sink = Arc::new(Mutex::new(Some(write)));
        let (control_tx, mut control_rx) = mpsc::channel(4);
        let writer = tokio::spawn(run_writer(rx, sink.clone(), Duration::from_secs(5), control_tx.downgrade()));

        assert!(outbox.send(Outbound::heartbeat(1)).await);
        assert_eq!(control_rx.recv().await, Some(Control::WriteStalled));
        assert!(sink.lock().await.is_none());

        // Later messages are dropped without touching a socket
        assert!(outbox.send(Outbound::heartbeat(2)).await);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(control_rx.try_recv().is_err());
        writer.abort();
    }

    #[tokio::test]
    async fn test_writer_sends_priority_lane_first() {
        let (outbox, rx) = outbox::channel(8);
        let (write, mut peer) = futures::channel::mpsc::channel::<Message>(16);
        outbox.post(Outbound::heartbeat(1));
        outbox.post_priority(Outbound::file_list(Vec::new()));

        let sink = Arc::new(Mutex::new(Some(write)));
        let (control_tx, _control_rx) = mpsc::channel(4);
        let writer = tokio::spawn(run_writer(rx, sink, Duration::from_secs(5), control_tx.downgrade()));

        let first = peer.next().await.unwrap();
        assert_eq!(first, Message::Text(Outbound::file_list(Vec::new()).to_json()));
        let second = peer.next().await.unwrap();
        assert_eq!(second, Message::Text(Outbound::heartbeat(1).to_json()));
        writer.abort();
    }
}
