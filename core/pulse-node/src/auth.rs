//! Email/password login against the node community API.
//!
//! Three calls, in order:
//!
//! 1. `POST /auth/v1/token?grant_type=password` → access and refresh tokens
//! 2. `GET /auth/v1/user` → the user id, used verbatim as the session identity
//! 3. `GET /rest/v1/profiles?select=personal_code&id=eq.<id>` → referral code
//!
//! The profile lookup is best-effort; the first two are required.

use std::time::Duration;

use pulse_core::config::AuthConfig;
use pulse_core::AccountRecord;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No api key configured; set PULSE_API_KEY or [auth].api_key in config.toml")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("Login response missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    personal_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl AuthClient {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let api_key = config.resolved_api_key().ok_or(AuthError::MissingApiKey)?;
        Self::with_api_key(&config.base_url, api_key)
    }

    pub fn with_api_key(
        base_url: &str,
        api_key: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AccountRecord, AuthError> {
        let tokens: TokenResponse = expect_success(
            self.http
                .post(format!("{}/auth/v1/token", self.base_url))
                .query(&[("grant_type", "password")])
                .bearer_auth(&self.api_key)
                .header("apikey", &self.api_key)
                .json(&json!({ "email": email, "password": password }))
                .send()
                .await?,
            "token",
        )
        .await?
        .json()
        .await?;
        let access_token = tokens
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingField("access_token"))?;
        debug!("Token exchange succeeded");

        let user: UserResponse = expect_success(
            self.http
                .get(format!("{}/auth/v1/user", self.base_url))
                .bearer_auth(&access_token)
                .header("apikey", &self.api_key)
                .send()
                .await?,
            "user",
        )
        .await?
        .json()
        .await?;
        let user_id = user
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or(AuthError::MissingField("id"))?;

        let personal_code = match self.personal_code(&access_token, &user_id).await {
            Ok(code) => code,
            Err(err) => {
                warn!(error = %err, "Profile lookup failed; continuing without personal code");
                None
            }
        };

        Ok(AccountRecord {
            email: email.to_string(),
            password: password.to_string(),
            access_token,
            refresh_token: tokens.refresh_token.unwrap_or_default(),
            user_id,
            personal_code,
        })
    }

    async fn personal_code(
        &self,
        access_token: &str,
        user_id: &str,
    ) -> Result<Option<String>, AuthError> {
        let rows: Vec<ProfileRow> = expect_success(
            self.http
                .get(format!("{}/rest/v1/profiles", self.base_url))
                .query(&[
                    ("select", "personal_code".to_string()),
                    ("id", format!("eq.{user_id}")),
                ])
                .bearer_auth(access_token)
                .header("apikey", &self.api_key)
                .send()
                .await?,
            "profiles",
        )
        .await?
        .json()
        .await?;
        Ok(rows.into_iter().next().and_then(|row| row.personal_code))
    }
}

async fn expect_success(response: Response, endpoint: &'static str) -> Result<Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AuthError::Status {
        endpoint,
        status,
        body,
    })
}
