//! Handlers behind the `pulse-node` subcommands.

use std::env;
use std::sync::Arc;

use pulse_core::{
    clear_account, fields, load_config, save_account, AgentConfig, PulseError, RandomBonus,
    Snapshot, StateStore, StorageConfig,
};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::auth::{AuthClient, AuthError};
use crate::node::{Node, NodeError};

const PASSWORD_ENV: &str = "PULSE_PASSWORD";

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Storage(#[from] PulseError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("Failed to read password from stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("{0}")]
    InvalidInput(String),
}

pub async fn login(storage: &StorageConfig, email: &str) -> Result<(), CommandError> {
    let config = load_config(&storage.config_file())?;
    let auth = AuthClient::new(&config.auth)?;
    let password = read_password().await?;

    let account = auth.login(email.trim(), &password).await?;
    save_account(&storage.account_file(), &account)?;
    StateStore::new(&storage.state_file())
        .merge(&Snapshot::new().with(fields::IDENTITY, account.user_id.as_str()))?;

    info!(
        identity = %account.user_id,
        personal_code = account.personal_code.as_deref().unwrap_or("-"),
        "Login succeeded; account saved"
    );
    Ok(())
}

pub fn set_identity(storage: &StorageConfig, identity: &str) -> Result<(), CommandError> {
    let identity = identity.trim();
    if identity.is_empty() {
        return Err(CommandError::InvalidInput(
            "Identity must not be empty".to_string(),
        ));
    }
    StateStore::new(&storage.state_file())
        .merge(&Snapshot::new().with(fields::IDENTITY, identity))?;
    info!(identity = %identity, "Identity recorded");
    Ok(())
}

pub fn logout(storage: &StorageConfig) -> Result<(), CommandError> {
    StateStore::new(&storage.state_file()).clear()?;
    clear_account(&storage.account_file())?;
    info!("Logged out; local state cleared");
    Ok(())
}

pub fn status(storage: &StorageConfig) -> Result<String, CommandError> {
    let snapshot = StateStore::new(&storage.state_file()).load();
    serde_json::to_string_pretty(&snapshot).map_err(|err| {
        CommandError::InvalidInput(format!("Failed to render snapshot: {err}"))
    })
}

pub async fn start(storage: &StorageConfig) -> Result<(), CommandError> {
    let config = load_config(&storage.config_file()).unwrap_or_else(|err| {
        warn!(error = %err, "Failed to load config; using defaults");
        AgentConfig::default()
    });
    let store = Arc::new(StateStore::new(&storage.state_file()));
    let identity = store
        .load()
        .identity()
        .map(str::to_string)
        .ok_or(NodeError::MissingIdentity)?;

    info!(identity = %identity, "Initiating connection to the node");
    let node = Node::new(&config, storage, store);
    node.run(
        &identity,
        Box::new(RandomBonus::from_entropy()),
        shutdown_signal(),
    )
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C; shutting down"),
        Err(err) => {
            warn!(error = %err, "Failed to listen for Ctrl-C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

async fn read_password() -> Result<String, CommandError> {
    if let Ok(password) = env::var(PASSWORD_ENV) {
        if !password.is_empty() {
            return Ok(password);
        }
    }

    let mut line = String::new();
    BufReader::new(io::stdin())
        .read_line(&mut line)
        .await
        .map_err(CommandError::Stdin)?;
    let password = line.trim_end_matches(&['\r', '\n'][..]).to_string();
    if password.is_empty() {
        return Err(CommandError::InvalidInput(format!(
            "No password given; pipe it on stdin or set {PASSWORD_ENV}"
        )));
    }
    Ok(password)
}
