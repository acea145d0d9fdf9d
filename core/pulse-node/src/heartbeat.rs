//! Keep-alive pings over the open connection.
//!
//! Runs beside the receive loop and never waits on it. A tick while the
//! session is not `Open` is skipped silently; a failed send is logged and the
//! tick skipped, so one dead write never stops the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::SinkExt;
use pulse_core::{fields, Snapshot, StateStore};
use pulse_protocol::ClientMessage;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

use crate::session::{ConnectionState, SharedSink};

pub(crate) async fn run(
    sink: SharedSink,
    state: watch::Receiver<ConnectionState>,
    store: Arc<StateStore>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // First ping goes out one full period after the connection opens.
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        if *state.borrow() != ConnectionState::Open {
            debug!("Heartbeat skipped; session not open");
            continue;
        }

        if let Err(err) = send_ping(&sink).await {
            warn!(error = %err, "Heartbeat send failed; skipping tick");
            continue;
        }

        let patch = Snapshot::new().with_timestamp(fields::LAST_PING_AT, Utc::now());
        if let Err(err) = store.merge(&patch) {
            warn!(error = %err, "Failed to record ping time");
        }
        trace!("Heartbeat sent");
    }

    debug!("Heartbeat stopped");
}

async fn send_ping(sink: &SharedSink) -> Result<(), WsError> {
    let mut sink = sink.lock().await;
    sink.send(Message::Text(ClientMessage::Ping.to_text())).await
}
