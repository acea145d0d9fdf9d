//! Runtime configuration loaded from `config.toml`.
//!
//! Every section and field is optional; a missing file yields defaults that
//! match the production service.
//!
//! ```toml
//! [endpoint]
//! url = "wss://secure.ws.teneo.pro"
//! connect_timeout_secs = 15
//!
//! [timing]
//! heartbeat_interval_secs = 10
//!
//! [reconnect]
//! max_interval_secs = 300
//!
//! [auth]
//! api_key = "..."
//! ```

use std::env;
use std::path::Path;
use std::time::Duration;

use pulse_protocol::{DEFAULT_ENDPOINT_PATH, DEFAULT_ENDPOINT_URL, PROTOCOL_VERSION};
use serde::Deserialize;

use crate::backoff::ReconnectPolicy;
use crate::error::{PulseError, Result};

pub const API_KEY_ENV: &str = "PULSE_API_KEY";
const DEFAULT_AUTH_BASE_URL: &str = "https://node-community-api.teneo.pro";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointConfig {
    pub url: String,
    pub path: String,
    pub version: String,
    pub connect_timeout_secs: u64,
    pub close_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT_URL.to_string(),
            path: DEFAULT_ENDPOINT_PATH.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            connect_timeout_secs: 15,
            close_timeout_secs: 2,
        }
    }
}

impl EndpointConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_interval_secs: u64,
    pub accrual_tick_millis: u64,
    pub relogin_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            accrual_tick_millis: 1_000,
            relogin_interval_secs: 30 * 60,
        }
    }
}

impl TimingConfig {
    // Zero periods would make tokio intervals panic.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn accrual_tick(&self) -> Duration {
        Duration::from_millis(self.accrual_tick_millis.max(1))
    }

    pub fn relogin_interval(&self) -> Duration {
        Duration::from_secs(self.relogin_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_secs: u64,
    pub step_secs: u64,
    pub max_interval_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            step_secs: 5,
            max_interval_secs: 5 * 60,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_secs(self.base_delay_secs),
            Duration::from_secs(self.step_secs),
            Duration::from_secs(self.max_interval_secs),
        )
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_AUTH_BASE_URL.to_string(),
            api_key: None,
        }
    }
}

impl AuthConfig {
    /// The configured api key, with `PULSE_API_KEY` taking precedence.
    pub fn resolved_api_key(&self) -> Option<String> {
        env::var(API_KEY_ENV)
            .ok()
            .or_else(|| self.api_key.clone())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

/// Loads `config.toml`, returning defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        return Ok(AgentConfig::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| PulseError::io(format!("read config {}", path.display()), err))?;
    toml::from_str::<AgentConfig>(&content).map_err(|err| PulseError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}
