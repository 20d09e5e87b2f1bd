//! Remote user directory
//!
//! The wiki exposes an auth service (moinAuthProvider) with two actions:
//! - `list`: all members as `[{"Login": .., "Email": ..}]`
//! - `loginCheck`: verifies `{"login": .., "password": ..}`, answers `{"Result": ..}`
//!
//! Both are POST requests authenticated with the `Auth-Token` header.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::config::OnlineAuthConfig;

/// Query prefix of the auth service, the action name is appended
const PAGE_PARAM: &str = "/?action=authService&do=";

/// How much of an unparsable body ends up in the log
const LOGGED_BODY_CHARS: usize = 20;

/// A member as listed by the directory
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DirectoryUser {
    pub login: String,
    pub email: String,
}

/// Outcome of a remote password check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginCheck {
    Ok,
    UnknownUser,
    WrongPassword,
    /// Any result code the service is not expected to send
    Other(String),
}

impl From<String> for LoginCheck {
    fn from(result: String) -> Self {
        match result.as_str() {
            "ok" => Self::Ok,
            "unknown_user" => Self::UnknownUser,
            "wrong_password" => Self::WrongPassword,
            _ => Self::Other(result),
        }
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    login: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoginResponse {
    result: String,
}

/// Errors talking to the directory
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// The remote authority owning the user directory
#[async_trait]
pub trait Directory: Send + Sync {
    /// Fetch all members
    async fn list_users(&self) -> Result<Vec<DirectoryUser>, DirectoryError>;

    /// Verify a password for a user name
    async fn login_check(&self, login: &str, password: &str) -> Result<LoginCheck, DirectoryError>;
}

/// HTTP client for the wiki auth service
pub struct WikiDirectory {
    action_url: String,
    auth_token: String,
    http_client: reqwest::Client,
}

impl WikiDirectory {
    pub fn new(config: &OnlineAuthConfig) -> Result<Self, DirectoryError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("sesame/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DirectoryError::Network(e.to_string()))?;

        Ok(Self {
            action_url: format!("{}{}", config.wiki_base_url.trim_end_matches('/'), PAGE_PARAM),
            auth_token: config.auth_token.clone(),
            http_client,
        })
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        action: &str,
        body: Option<&T>,
    ) -> Result<(u16, Bytes), DirectoryError> {
        let url = format!("{}{}", self.action_url, action);
        debug!(action, "directory request");

        let mut request = self
            .http_client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header("Auth-Token", &self.auth_token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::Status(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;
        Ok((status.as_u16(), bytes))
    }
}

#[async_trait]
impl Directory for WikiDirectory {
    async fn list_users(&self) -> Result<Vec<DirectoryUser>, DirectoryError> {
        let (status, body) = self.post::<()>("list", None).await?;
        parse_json(status, &body, "Invalid json for user response")
    }

    async fn login_check(&self, login: &str, password: &str) -> Result<LoginCheck, DirectoryError> {
        let request = LoginRequest { login, password };
        let (status, body) = self.post("loginCheck", Some(&request)).await?;
        let response: LoginResponse = parse_json(status, &body, "Invalid json for login")?;
        Ok(LoginCheck::from(response.result))
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(
    status: u16,
    body: &[u8],
    context: &str,
) -> Result<T, DirectoryError> {
    serde_json::from_slice(body).map_err(|e| {
        let text = String::from_utf8_lossy(body);
        error!(http = status, data = %abbr(&text, LOGGED_BODY_CHARS), error = %e, "{context}");
        DirectoryError::InvalidResponse(e.to_string())
    })
}

fn abbr(msg: &str, max_chars: usize) -> String {
    if msg.chars().count() <= max_chars {
        return msg.to_string();
    }
    let head: String = msg.chars().take(max_chars).collect();
    format!("{head}...")
}
