//! Remote state port and its HTTP adapter
//!
//! [`RemoteStateApi`] is the boundary to the hosted backend. The sync engine
//! only needs to fetch the current state document, push a new one with the
//! version it was based on, and (optionally) apply generic table mutations.
//! Conflict resolution is the backend's business: reported conflicts are
//! passed through untouched.

use async_trait::async_trait;
use reqwest::{Client as ReqwestClient, Method, Response as ReqwestResponse, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Remote store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Request never produced a response (connection refused, timeout, ...)
    #[error("Network error: {0}")]
    Network(String),

    /// Backend answered with a non-success status
    #[error("Remote error {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Error message from the backend
        message: String,
    },

    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),

    /// The adapter cannot apply mutations to this table
    #[error("Unsupported mutation target: {0}")]
    Unsupported(String),

    /// Adapter misconfiguration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RemoteError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Status { status, .. } => {
                matches!(status, 408 | 425 | 429 | 500..=599)
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            RemoteError::Status {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

/// The remote copy of a user's state document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteState {
    /// Opaque state payload
    pub state: Value,
    /// Authoritative version
    pub version: u64,
}

/// Discrepancy reported by the backend for a push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Which part of the document conflicted
    pub key: String,
    /// Value the client pushed
    #[serde(default)]
    pub local: Option<Value>,
    /// Value the backend holds
    #[serde(default)]
    pub remote: Option<Value>,
    /// Human-readable explanation
    #[serde(default)]
    pub message: Option<String>,
}

/// Backend's answer to an accepted push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    /// State the backend stored
    pub state: Value,
    /// Conflicts detected against the pushed version
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    /// New authoritative version
    pub version: u64,
}

/// Kind of generic table mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    /// Insert a record
    Create,
    /// Modify a record
    Update,
    /// Remove a record
    Delete,
}

/// A mutation against a backend table other than the state document
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMutation {
    /// Target table
    pub table: String,
    /// Mutation kind
    pub kind: MutationKind,
    /// Payload
    pub data: Value,
}

/// Port to the remote source of truth
#[async_trait]
pub trait RemoteStateApi: Send + Sync {
    /// Fetch the user's state document, `None` if the backend has none yet
    async fn fetch_remote_state(&self, user_id: &str) -> Result<Option<RemoteState>, RemoteError>;

    /// Push a new state document based on `version`
    async fn push_remote_state(
        &self,
        user_id: &str,
        state: &Value,
        version: Option<u64>,
    ) -> Result<PushOutcome, RemoteError>;

    /// Apply a generic table mutation
    async fn apply_mutation(
        &self,
        _user_id: &str,
        mutation: &RemoteMutation,
    ) -> Result<(), RemoteError> {
        Err(RemoteError::Unsupported(mutation.table.clone()))
    }
}

/// Configuration for [`HttpRemoteState`]
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL of the backend REST API
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321/rest/v1".to_string(),
            timeout: Duration::from_secs(15),
            user_agent: format!("petcare-sync/{}", env!("CARGO_PKG_VERSION")),
            auth_token: None,
        }
    }
}

impl RemoteConfig {
    /// Create a configuration for the given base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the bearer token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// REST adapter for the hosted backend
///
/// Endpoints, relative to `base_url`:
/// - `GET /sync/{user}`: current state document (404 when none)
/// - `PUT /sync/{user}`: push `{state, version}`
/// - `POST|PATCH|DELETE /tables/{table}`: generic mutations
#[derive(Debug, Clone)]
pub struct HttpRemoteState {
    client: ReqwestClient,
    config: RemoteConfig,
}

impl HttpRemoteState {
    /// Create a new adapter
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let client = ReqwestClient::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| RemoteError::Config(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Get the adapter configuration
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| RemoteError::Config(format!("invalid base url: {}", e)))?;

        url.path_segments_mut()
            .map_err(|_| RemoteError::Config(format!("cannot extend {}", self.config.base_url)))?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<ReqwestResponse, RemoteError> {
        let mut req = self.client.request(method, url);

        if let Some(token) = &self.config.auth_token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = &body {
            req = req.json(body);
        }

        Ok(req.send().await?)
    }

    async fn check(response: ReqwestResponse) -> Result<ReqwestResponse, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|b| b.message.or(b.error))
            .unwrap_or(text);

        Err(RemoteError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl RemoteStateApi for HttpRemoteState {
    async fn fetch_remote_state(&self, user_id: &str) -> Result<Option<RemoteState>, RemoteError> {
        let url = self.endpoint(&["sync", user_id])?;
        let response = self.send(Method::GET, url, None).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = Self::check(response).await?;
        Ok(Some(response.json::<RemoteState>().await?))
    }

    async fn push_remote_state(
        &self,
        user_id: &str,
        state: &Value,
        version: Option<u64>,
    ) -> Result<PushOutcome, RemoteError> {
        let url = self.endpoint(&["sync", user_id])?;
        let body = json!({ "state": state, "version": version });

        let response = self.send(Method::PUT, url, Some(body)).await?;
        let response = Self::check(response).await?;
        Ok(response.json::<PushOutcome>().await?)
    }

    async fn apply_mutation(
        &self,
        user_id: &str,
        mutation: &RemoteMutation,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(&["tables", &mutation.table])?;
        let method = match mutation.kind {
            MutationKind::Create => Method::POST,
            MutationKind::Update => Method::PATCH,
            MutationKind::Delete => Method::DELETE,
        };
        let body = json!({ "userId": user_id, "data": mutation.data });

        let response = self.send(method, url, Some(body)).await?;
        Self::check(response).await?;
        Ok(())
    }
}
