//! Node runtime: runs the accrual clock, keeps one session connected, and
//! applies the reconnect policy until shutdown.
//!
//! The session reports connection failures; this supervisor decides what to
//! do about them:
//!
//! - `connect()` error or transport drop → attempt counter +1, wait
//!   [`ReconnectPolicy::delay_for`], retry
//! - clean close from the server → stop without reconnecting
//! - delay reaches the policy ceiling → give up with
//!   [`NodeError::ReconnectExhausted`]
//! - shutdown future resolves → close the session and stop every task

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::time::Duration;

use pulse_core::{
    fields, load_account, save_account, AccountRecord, AgentConfig, BonusSource, PulseError,
    ReconnectPolicy, Snapshot, StateStore, StorageConfig,
};
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthClient, AuthError};
use crate::clock::run_accrual_clock;
use crate::session::{ConnectionState, Session, SessionConfig, SessionError};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("No identity recorded; run `pulse-node login` or `pulse-node set-identity` first")]
    MissingIdentity,

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Storage(#[from] PulseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloginOutcome {
    /// No stored email and password; nothing to do.
    NoCredentials,
    /// Fresh tokens were saved to the account file.
    Refreshed,
    /// The server answered for a different user; nothing was saved.
    IdentityMismatch,
}

/// Periodic login with the credentials in the account file.
#[derive(Debug, Clone)]
pub struct Relogin {
    auth: AuthClient,
    account_path: PathBuf,
    period: Duration,
}

impl Relogin {
    pub fn new(auth: AuthClient, account_path: &Path, period: Duration) -> Self {
        Self {
            auth,
            account_path: account_path.to_path_buf(),
            period,
        }
    }

    /// Logs in once and saves the fresh tokens when the user id still
    /// matches the stored account.
    pub async fn refresh(&self, store: &StateStore) -> Result<ReloginOutcome, NodeError> {
        let Some(account) = load_account(&self.account_path).filter(AccountRecord::can_relogin)
        else {
            return Ok(ReloginOutcome::NoCredentials);
        };

        let fresh = self.auth.login(&account.email, &account.password).await?;
        if fresh.user_id != account.user_id {
            return Ok(ReloginOutcome::IdentityMismatch);
        }

        save_account(&self.account_path, &fresh)?;
        store.merge(&Snapshot::new().with(fields::IDENTITY, fresh.user_id.as_str()))?;
        Ok(ReloginOutcome::Refreshed)
    }
}

pub struct Node {
    session_config: SessionConfig,
    reconnect: ReconnectPolicy,
    accrual_tick: Duration,
    store: Arc<StateStore>,
    relogin: Option<Relogin>,
}

impl Node {
    pub fn new(config: &AgentConfig, storage: &StorageConfig, store: Arc<StateStore>) -> Self {
        let relogin = match AuthClient::new(&config.auth) {
            Ok(auth) => Some(Relogin::new(
                auth,
                &storage.account_file(),
                config.timing.relogin_interval(),
            )),
            Err(err) => {
                debug!(error = %err, "Automatic login disabled");
                None
            }
        };

        Self {
            session_config: SessionConfig::from_agent_config(config),
            reconnect: config.reconnect.policy(),
            accrual_tick: config.timing.accrual_tick(),
            store,
            relogin,
        }
    }

    /// Builds a node with explicit timings and no automatic login.
    pub fn with_parts(
        session_config: SessionConfig,
        reconnect: ReconnectPolicy,
        accrual_tick: Duration,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            session_config,
            reconnect,
            accrual_tick,
            store,
            relogin: None,
        }
    }

    /// Enables periodic login while the node runs.
    #[must_use]
    pub fn with_relogin(mut self, relogin: Relogin) -> Self {
        self.relogin = Some(relogin);
        self
    }

    /// Runs until `shutdown` resolves, the server closes the session cleanly,
    /// or reconnecting is abandoned.
    pub async fn run<F>(
        self,
        identity: &str,
        bonus: Box<dyn BonusSource>,
        shutdown: F,
    ) -> Result<(), NodeError>
    where
        F: Future<Output = ()>,
    {
        let (stop, stop_rx) = watch::channel(false);
        let clock = tokio::spawn(run_accrual_clock(
            Arc::clone(&self.store),
            self.accrual_tick,
            bonus,
            stop_rx.clone(),
        ));
        let relogin = self
            .relogin
            .map(|relogin| tokio::spawn(run_relogin(relogin, Arc::clone(&self.store), stop_rx)));

        let mut session = Session::new(self.session_config, Arc::clone(&self.store));
        let shutdown = pin!(shutdown);
        let outcome = supervise(&mut session, identity, self.reconnect, shutdown).await;

        session.close().await;
        let _ = stop.send(true);
        if let Err(err) = clock.await {
            warn!(error = %err, "Accrual clock task failed");
        }
        if let Some(handle) = relogin {
            if let Err(err) = handle.await {
                warn!(error = %err, "Relogin task failed");
            }
        }
        info!("Node stopped");
        outcome
    }
}

async fn supervise<F>(
    session: &mut Session,
    identity: &str,
    policy: ReconnectPolicy,
    mut shutdown: Pin<&mut F>,
) -> Result<(), NodeError>
where
    F: Future<Output = ()>,
{
    let mut attempts: u32 = 0;

    loop {
        let connected = tokio::select! {
            result = session.connect(identity) => result,
            _ = shutdown.as_mut() => return Ok(()),
        };

        match connected {
            Ok(()) => {
                attempts = 0;
                let mut state = session.subscribe();
                let ended = tokio::select! {
                    ended = state.wait_for(|state| state.is_terminal()) => {
                        ended.map(|state| *state).unwrap_or(ConnectionState::Failed)
                    }
                    _ = shutdown.as_mut() => return Ok(()),
                };
                session.close().await;

                if ended == ConnectionState::Disconnected {
                    info!("Server closed the session cleanly; not reconnecting");
                    return Ok(());
                }
                warn!("Session dropped; reconnecting");
            }
            Err(err @ SessionError::InvalidEndpoint(_)) => return Err(err.into()),
            Err(err) => {
                error!(error = %err, "Connection failed");
            }
        }

        attempts = attempts.saturating_add(1);
        let Some(delay) = policy.delay_for(attempts) else {
            warn!(
                attempts,
                max_interval_secs = policy.max_interval().as_secs(),
                "Max reconnect interval reached; giving up"
            );
            return Err(NodeError::ReconnectExhausted { attempts });
        };

        info!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after delay"
        );
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.as_mut() => return Ok(()),
        }
    }
}

/// Logs in again every period with the stored credentials so the saved
/// tokens stay fresh while the node runs.
async fn run_relogin(relogin: Relogin, store: Arc<StateStore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + relogin.period, relogin.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match relogin.refresh(&store).await {
            Ok(ReloginOutcome::Refreshed) => info!("Automatic login refreshed account tokens"),
            Ok(ReloginOutcome::NoCredentials) => {
                debug!("No stored credentials; skipping automatic login");
            }
            Ok(ReloginOutcome::IdentityMismatch) => {
                warn!("Automatic login returned a different user id; keeping the stored account");
            }
            Err(err) => warn!(error = %err, "Automatic login failed"),
        }
    }
}
