//! Persistent connection to the remote node service.
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──connect()──→ Connecting ──handshake ok──→ Open
//!                                  │                        │
//!                          handshake failed /     close() → Closing ──→ Disconnected
//!                              timeout            server close frame ─→ Disconnected
//!                                  ↓              transport error ────→ Failed
//!                                Failed ──close()──→ Disconnected
//! ```
//!
//! While `Open`, two tasks run: the receive loop (routes points updates into
//! the [`StateStore`]) and the heartbeat loop (keep-alive pings). The session
//! never reconnects on its own; the supervisor in [`crate::node`] decides.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pulse_core::config::AgentConfig;
use pulse_core::{fields, Snapshot, StateStore};
use pulse_protocol::{endpoint_url, parse_server_message, PointsUpdate, ServerMessage};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::heartbeat;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type SharedSink = Arc<tokio::sync::Mutex<SplitSink<WsStream, Message>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Failed,
}

impl ConnectionState {
    /// Whether a session in this state has stopped on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid endpoint address: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("Connection to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },

    #[error("Connection to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub url: String,
    pub path: String,
    pub version: String,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl SessionConfig {
    pub fn from_agent_config(config: &AgentConfig) -> Self {
        Self {
            url: config.endpoint.url.clone(),
            path: config.endpoint.path.clone(),
            version: config.endpoint.version.clone(),
            connect_timeout: config.endpoint.connect_timeout(),
            close_timeout: config.endpoint.close_timeout(),
            heartbeat_interval: config.timing.heartbeat_interval(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_agent_config(&AgentConfig::default())
    }
}

struct ActiveConnection {
    sink: SharedSink,
    shutdown: watch::Sender<bool>,
    receiver: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

/// One connection at a time. Create once per process and drive it with
/// [`Session::connect`] and [`Session::close`].
pub struct Session {
    config: SessionConfig,
    store: Arc<StateStore>,
    state: Arc<watch::Sender<ConnectionState>>,
    points: Arc<Mutex<Option<PointsUpdate>>>,
    active: Option<ActiveConnection>,
}

impl Session {
    pub fn new(config: SessionConfig, store: Arc<StateStore>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            store,
            state: Arc::new(state),
            points: Arc::new(Mutex::new(None)),
            active: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Observes state transitions without borrowing the session.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Last totals received from the server during this process.
    pub fn points(&self) -> Option<PointsUpdate> {
        *lock_points(&self.points)
    }

    /// Opens the connection for `identity`.
    ///
    /// A no-op while the session is `Connecting` or `Open`. Handshake
    /// failures and timeouts leave the session `Failed` and are returned.
    pub async fn connect(&mut self, identity: &str) -> Result<(), SessionError> {
        let current = self.state();
        if matches!(current, ConnectionState::Connecting | ConnectionState::Open) {
            debug!(state = ?current, "Connect skipped; session already active");
            return Ok(());
        }

        // Reap tasks left behind by a connection that ended on its own.
        if self.active.is_some() {
            self.close().await;
        }

        let url = endpoint_url(
            &self.config.url,
            &self.config.path,
            identity,
            &self.config.version,
        )?;
        self.set_state(ConnectionState::Connecting);
        info!(url = %url, "Connecting to node service");

        let stream = match timeout(self.config.connect_timeout, connect_async(url.as_str())).await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(source)) => {
                self.set_state(ConnectionState::Failed);
                return Err(SessionError::Connect {
                    url: url.to_string(),
                    source: Box::new(source),
                });
            }
            Err(_) => {
                self.set_state(ConnectionState::Failed);
                return Err(SessionError::Timeout {
                    url: url.to_string(),
                    timeout: self.config.connect_timeout,
                });
            }
        };

        let connected_at = Utc::now();
        let patch = Snapshot::new()
            .with(fields::IDENTITY, identity)
            .with_timestamp(fields::LAST_HEARTBEAT_AT, connected_at);
        if let Err(err) = self.store.merge(&patch) {
            warn!(error = %err, "Failed to record connection checkpoint");
        }

        let (sink, stream) = stream.split();
        let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
        let (shutdown, shutdown_rx) = watch::channel(false);

        self.set_state(ConnectionState::Open);
        info!(connected_at = %connected_at.to_rfc3339(), "Connected to node service");

        let heartbeat = tokio::spawn(heartbeat::run(
            Arc::clone(&sink),
            self.state.subscribe(),
            Arc::clone(&self.store),
            self.config.heartbeat_interval,
            shutdown_rx.clone(),
        ));
        let inbound = Inbound {
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
            points: Arc::clone(&self.points),
        };
        let receiver = tokio::spawn(receive_loop(stream, inbound, shutdown_rx));

        self.active = Some(ActiveConnection {
            sink,
            shutdown,
            receiver,
            heartbeat,
        });
        Ok(())
    }

    /// Closes the connection and stops its tasks. Idempotent.
    pub async fn close(&mut self) {
        let Some(mut active) = self.active.take() else {
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        if self.state() == ConnectionState::Open {
            self.set_state(ConnectionState::Closing);
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            let sink = Arc::clone(&active.sink);
            let sent = timeout(self.config.close_timeout, async move {
                let mut sink = sink.lock().await;
                sink.send(Message::Close(Some(frame))).await
            })
            .await;
            match sent {
                Ok(Ok(())) => debug!("Close frame sent"),
                Ok(Err(err)) => debug!(error = %err, "Failed to send close frame"),
                Err(_) => debug!("Timed out sending close frame"),
            }
        }

        let _ = active.shutdown.send(true);
        active.heartbeat.abort();
        if timeout(self.config.close_timeout, &mut active.receiver)
            .await
            .is_err()
        {
            warn!("Receive task did not stop in time; aborting");
            active.receiver.abort();
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Session closed");
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Session state changed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.heartbeat.abort();
            active.receiver.abort();
        }
    }
}

/// Everything the receive loop needs, detached from the session.
struct Inbound {
    store: Arc<StateStore>,
    state: Arc<watch::Sender<ConnectionState>>,
    points: Arc<Mutex<Option<PointsUpdate>>>,
}

impl Inbound {
    fn handle_text(&self, text: &str) {
        match parse_server_message(text) {
            Ok(ServerMessage::Points(update)) => self.record_points(update),
            Ok(ServerMessage::Other(value)) => {
                debug!(message = %value, "Ignoring inbound message");
            }
            Err(err) => {
                warn!(error = %err, "Failed to decode inbound message");
            }
        }
    }

    fn record_points(&self, update: PointsUpdate) {
        let patch = Snapshot::new()
            .with_timestamp(fields::LAST_HEARTBEAT_AT, Utc::now())
            .with(fields::POINTS_TOTAL, update.points_total)
            .with(fields::POINTS_TODAY, update.points_today);
        if let Err(err) = self.store.merge(&patch) {
            warn!(error = %err, "Failed to persist points update");
        }
        *lock_points(&self.points) = Some(update);
        info!(
            points_total = update.points_total,
            points_today = update.points_today,
            "Heartbeat acknowledged"
        );
    }

    /// Moves an `Open` session to `next`. A local close already moved it to
    /// `Closing`, which must not be overwritten.
    fn finish(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Open {
                *current = next;
                true
            } else {
                false
            }
        });
    }
}

async fn receive_loop(
    mut stream: SplitStream<WsStream>,
    inbound: Inbound,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => {
                debug!("Receive loop stopping");
                return;
            }
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => inbound.handle_text(&text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => inbound.handle_text(&text),
                Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                info!(
                    code = ?frame.as_ref().map(|frame| frame.code),
                    "Server closed the connection"
                );
                inbound.finish(ConnectionState::Disconnected);
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(error = %err, "Connection error");
                inbound.finish(ConnectionState::Failed);
                return;
            }
            None => {
                warn!("Connection ended without a close frame");
                inbound.finish(ConnectionState::Failed);
                return;
            }
        }
    }
}

fn lock_points(
    points: &Mutex<Option<PointsUpdate>>,
) -> std::sync::MutexGuard<'_, Option<PointsUpdate>> {
    points.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
