use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pulse_core::{ReconnectPolicy, StateStore};
use pulse_node::{ConnectionState, Node, NodeError, Session, SessionConfig, SessionError};
use pulse_protocol::PointsUpdate;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

enum Control {
    Send(Message),
    /// Drops the TCP connection without a closing handshake.
    Drop,
}

/// Websocket server that serves one connection at a time and is steered by
/// the test through [`Control`] commands.
struct NodeServer {
    base_url: String,
    connections: Arc<AtomicUsize>,
    control: mpsc::UnboundedSender<Control>,
    inbound: mpsc::UnboundedReceiver<String>,
    handle: JoinHandle<()>,
}

impl NodeServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("local TCP listener should bind");
        let addr = listener.local_addr().expect("listener address");
        let connections = Arc::new(AtomicUsize::new(0));
        let (control, mut control_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let handle = tokio::spawn({
            let connections = Arc::clone(&connections);
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let Ok(ws) = tokio_tungstenite::accept_async(socket).await else {
                        continue;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let (mut tx, mut rx) = ws.split();

                    loop {
                        tokio::select! {
                            incoming = rx.next() => match incoming {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = inbound_tx.send(text);
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                            command = control_rx.recv() => match command {
                                Some(Control::Send(message)) => {
                                    let _ = tx.send(message).await;
                                }
                                Some(Control::Drop) | None => break,
                            },
                        }
                    }
                }
            }
        });

        Self {
            base_url: format!("ws://{addr}"),
            connections,
            control,
            inbound,
            handle,
        }
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: &str) {
        self.control
            .send(Control::Send(Message::Text(text.to_string())))
            .expect("server control");
    }

    fn send(&self, message: Message) {
        self.control
            .send(Control::Send(message))
            .expect("server control");
    }

    fn drop_connection(&self) {
        self.control.send(Control::Drop).expect("server control");
    }

    async fn next_inbound(&mut self) -> String {
        timeout(Duration::from_secs(5), self.inbound.recv())
            .await
            .expect("server should receive a frame")
            .expect("server inbound channel")
    }

    /// Frames received so far, without waiting for more.
    fn drain_inbound(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.inbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn shutdown(&self) {
        self.handle.abort();
    }
}

fn session_config(base_url: &str) -> SessionConfig {
    SessionConfig {
        url: base_url.to_string(),
        path: "/websocket".to_string(),
        version: "v0.2".to_string(),
        connect_timeout: Duration::from_secs(2),
        close_timeout: Duration::from_millis(500),
        heartbeat_interval: Duration::from_secs(60),
    }
}

fn temp_store() -> (TempDir, Arc<StateStore>) {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(StateStore::new(&temp_dir.path().join("state.json")));
    (temp_dir, store)
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for {what}");
}

async fn wait_for_state(state: &mut watch::Receiver<ConnectionState>, expected: ConnectionState) {
    timeout(Duration::from_secs(5), state.wait_for(|state| *state == expected))
        .await
        .expect("state transition in time")
        .expect("session state channel");
}

#[tokio::test]
async fn connect_records_identity_and_points_updates() {
    let server = NodeServer::start().await;
    let (_temp_dir, store) = temp_store();
    let mut session = Session::new(session_config(&server.base_url), Arc::clone(&store));

    session.connect("user-1").await.expect("connect");
    assert!(session.is_open());

    let opened = store.load();
    assert_eq!(opened.identity(), Some("user-1"));
    let connected_at = opened.last_heartbeat_at().expect("checkpoint on open");

    server.send_text(r#"{"pointsTotal":120,"pointsToday":15,"message":"Pulse from server"}"#);
    wait_until("points update", || store.load().points_total() == Some(120)).await;

    let snapshot = store.load();
    assert_eq!(snapshot.points_today(), Some(15));
    assert!(snapshot.last_heartbeat_at().expect("checkpoint") >= connected_at);
    assert_eq!(
        session.points(),
        Some(PointsUpdate {
            points_total: 120,
            points_today: 15,
        })
    );

    session.close().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    server.shutdown();
}

#[tokio::test]
async fn unrelated_messages_leave_the_store_alone() {
    let server = NodeServer::start().await;
    let (_temp_dir, store) = temp_store();
    let mut session = Session::new(session_config(&server.base_url), Arc::clone(&store));

    session.connect("user-1").await.expect("connect");
    server.send_text(r#"{"message":"Connected successfully"}"#);
    server.send_text("not json");
    server.send_text(r#"{"pointsTotal":7,"pointsToday":1}"#);
    wait_until("points update", || store.load().points_total() == Some(7)).await;

    assert!(store.load().get("message").is_none());
    assert!(session.is_open());

    session.close().await;
    server.shutdown();
}

#[tokio::test]
async fn second_connect_while_open_is_a_noop() {
    let mut server = NodeServer::start().await;
    let (_temp_dir, store) = temp_store();
    let mut config = session_config(&server.base_url);
    config.heartbeat_interval = Duration::from_millis(100);
    let mut session = Session::new(config, store);

    session.connect("user-1").await.expect("connect");
    session.connect("user-1").await.expect("second connect");
    sleep(Duration::from_millis(550)).await;

    assert_eq!(server.connections(), 1);
    assert!(session.is_open());

    // Five periods elapsed; a second heartbeat task would double the count.
    let pings = server.drain_inbound();
    assert!(
        (3..=7).contains(&pings.len()),
        "expected one heartbeat task, got {} pings",
        pings.len()
    );
    assert!(pings.iter().all(|frame| frame == r#"{"type":"PING"}"#));

    session.close().await;
    server.shutdown();
}

#[tokio::test]
async fn heartbeat_sends_ping_and_records_time() {
    let mut server = NodeServer::start().await;
    let (_temp_dir, store) = temp_store();
    let mut config = session_config(&server.base_url);
    config.heartbeat_interval = Duration::from_millis(50);
    let mut session = Session::new(config, Arc::clone(&store));

    session.connect("user-1").await.expect("connect");
    assert!(store.load().last_ping_at().is_none());

    let frame = server.next_inbound().await;
    let value: serde_json::Value = serde_json::from_str(&frame).expect("ping json");
    assert_eq!(value, serde_json::json!({ "type": "PING" }));
    wait_until("ping time", || store.load().last_ping_at().is_some()).await;

    session.close().await;
    server.shutdown();
}

#[tokio::test]
async fn server_close_frame_disconnects() {
    let server = NodeServer::start().await;
    let (_temp_dir, store) = temp_store();
    let mut session = Session::new(session_config(&server.base_url), store);
    let mut state = session.subscribe();

    session.connect("user-1").await.expect("connect");
    server.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "bye".into(),
    })));

    wait_for_state(&mut state, ConnectionState::Disconnected).await;
    session.close().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    server.shutdown();
}

#[tokio::test]
async fn transport_drop_marks_session_failed() {
    let server = NodeServer::start().await;
    let (_temp_dir, store) = temp_store();
    let mut session = Session::new(session_config(&server.base_url), store);
    let mut state = session.subscribe();

    session.connect("user-1").await.expect("connect");
    server.drop_connection();

    wait_for_state(&mut state, ConnectionState::Failed).await;
    session.close().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    server.shutdown();
}

#[tokio::test]
async fn refused_connection_fails_without_touching_store() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("listener address");
    drop(listener);

    let (_temp_dir, store) = temp_store();
    let mut session = Session::new(session_config(&format!("ws://{addr}")), Arc::clone(&store));

    let err = session.connect("user-1").await.expect_err("connect should fail");
    assert!(matches!(err, SessionError::Connect { .. }));
    assert_eq!(session.state(), ConnectionState::Failed);
    assert!(store.load().is_empty());

    session.close().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("listener address");
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let (_temp_dir, store) = temp_store();
    let mut config = session_config(&format!("ws://{addr}"));
    config.connect_timeout = Duration::from_millis(200);
    let mut session = Session::new(config, store);

    let err = session.connect("user-1").await.expect_err("connect should time out");
    assert!(matches!(err, SessionError::Timeout { .. }));
    assert_eq!(session.state(), ConnectionState::Failed);
    holder.abort();
}

#[tokio::test]
async fn invalid_endpoint_is_rejected_before_connecting() {
    let (_temp_dir, store) = temp_store();
    let mut session = Session::new(session_config("not a url"), store);

    let err = session.connect("user-1").await.expect_err("invalid endpoint");
    assert!(matches!(err, SessionError::InvalidEndpoint(_)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn close_without_connection_is_harmless() {
    let (_temp_dir, store) = temp_store();
    let mut session = Session::new(SessionConfig::default(), store);

    session.close().await;
    session.close().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn node_reconnects_after_transport_drop() {
    let server = NodeServer::start().await;
    let (_temp_dir, store) = temp_store();
    let node = Node::with_parts(
        session_config(&server.base_url),
        ReconnectPolicy::new(
            Duration::from_millis(20),
            Duration::from_millis(20),
            Duration::from_secs(5),
        ),
        Duration::from_millis(50),
        Arc::clone(&store),
    );

    let (stop, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(async move {
        node.run("user-1", Box::new(pulse_core::NoBonus), async move {
            let _ = stop_rx.await;
        })
        .await
    });

    wait_until("first connection", || server.connections() == 1).await;
    server.drop_connection();
    wait_until("reconnection", || server.connections() == 2).await;
    wait_until("accrual tick", || store.load().countdown().is_some()).await;

    let _ = stop.send(());
    let outcome = timeout(Duration::from_secs(5), running)
        .await
        .expect("node stops after shutdown")
        .expect("node task");
    assert!(outcome.is_ok());
    assert_eq!(store.load().identity(), Some("user-1"));
    server.shutdown();
}

#[tokio::test]
async fn node_gives_up_at_max_interval() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("listener address");
    drop(listener);

    let (_temp_dir, store) = temp_store();
    let node = Node::with_parts(
        session_config(&format!("ws://{addr}")),
        ReconnectPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(50),
        ),
        Duration::from_secs(1),
        store,
    );

    let outcome = timeout(
        Duration::from_secs(5),
        node.run("user-1", Box::new(pulse_core::NoBonus), std::future::pending()),
    )
    .await
    .expect("node gives up in time");

    assert!(matches!(
        outcome,
        Err(NodeError::ReconnectExhausted { attempts: 4 })
    ));
}

#[tokio::test]
async fn node_stops_after_clean_server_close() {
    let server = NodeServer::start().await;
    let (_temp_dir, store) = temp_store();
    let node = Node::with_parts(
        session_config(&server.base_url),
        ReconnectPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_secs(5),
        ),
        Duration::from_secs(1),
        store,
    );

    let running = tokio::spawn(async move {
        node.run("user-1", Box::new(pulse_core::NoBonus), std::future::pending())
            .await
    });

    wait_until("first connection", || server.connections() == 1).await;
    server.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "unknown identity".into(),
    })));

    let outcome = timeout(Duration::from_secs(5), running)
        .await
        .expect("node stops on its own")
        .expect("node task");
    assert!(outcome.is_ok());

    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connections(), 1);
    server.shutdown();
}
