//! HTTP client for the companion relay service.
//!
//! Every call returns a uniform `Result<T, ApiError>`: transport failures,
//! rate limiting, non-JSON bodies, structured server errors, and sealed
//! payload decryption all collapse into one taxonomy so callers can decide
//! between "retry on the next poll" and "the session is gone".

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use shared::crypto::{self, CryptoError};
use shared::{
    CommandAck, CommandRequest, ConnectionResponse, DisconnectRequest, DisplayNameResponse,
    DownloadCommand, DownloadsResponse, FriendsResponse, NotificationsResponse, VerifyCodeRequest,
};
use std::sync::Arc;
use thiserror::Error;

use crate::session::SessionStore;

const SESSION_HEADER: &str = "X-Session-ID";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No active session. Connect with a pairing code first.")]
    NoSession,

    #[error("Pairing code rejected: {0}")]
    InvalidCode(String),

    #[error("Rate limit exceeded. Please wait before trying again.")]
    RateLimited,

    #[error("Cannot reach server: {0}")]
    Connection(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Failed to decrypt payload. The encryption key does not match this session.")]
    Decryption,

    #[error("Session was revoked or expired")]
    SessionInvalidated,
}

impl ApiError {
    /// Errors that end the session. Polling must stop on these.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Self::NoSession | Self::SessionInvalidated)
    }

    /// Errors that are expected to clear up on a later poll.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Connection(_) | Self::Server(_) | Self::Request(_)
        )
    }
}

/// Classify a failing response from its status and parsed JSON body.
fn classify_failure(status: StatusCode, body: &serde_json::Value) -> ApiError {
    let message = body
        .get("error")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()));

    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || message.contains("Unauthorized")
        || message.contains("session")
    {
        return ApiError::SessionInvalidated;
    }

    ApiError::Request(message)
}

fn crypto_to_api(e: CryptoError) -> ApiError {
    match e {
        CryptoError::DecryptionFailed => ApiError::Decryption,
        other => ApiError::Server(other.to_string()),
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    session: Arc<SessionStore>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, session: Arc<SessionStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            session,
        }
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    fn require_user_id(&self) -> Result<String, ApiError> {
        self.session.user_id().ok_or(ApiError::NoSession)
    }

    /// Issue a request and normalize every failure mode into `ApiError`.
    /// Returns the raw JSON body; sealed bodies are unwrapped by the caller.
    async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<serde_json::Value, ApiError> {
        let url = format!("{}{}", self.base_url, endpoint);
        tracing::debug!("{} {}", method, url);

        let mut builder = self.http.request(method, &url);
        if let Some(session_id) = self.session.session_id() {
            builder = builder.header(SESSION_HEADER, session_id);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Connection(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::RateLimited);
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Err(ApiError::Server(format!(
                "{} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("unexpected response")
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ApiError::Server(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_failure(status, &json));
        }

        Ok(json)
    }

    /// Unwrap a possibly-sealed body with the caller's user id.
    fn open<T: serde::de::DeserializeOwned>(
        body: serde_json::Value,
        user_id: &str,
    ) -> Result<T, ApiError> {
        crypto::open_body(body, user_id).map_err(crypto_to_api)
    }

    /// Verify a 6-digit pairing code. On success the session credentials are
    /// stored, and all subsequent user-scoped calls resolve against them.
    pub async fn verify_code(&self, code: &str) -> Result<ConnectionResponse, ApiError> {
        let body = VerifyCodeRequest {
            code: code.to_string(),
        };
        let json = self
            .request(Method::POST, "/verify-code", Some(&body))
            .await
            .map_err(|e| match e {
                // An expired or unknown code comes back as a structured error
                ApiError::Request(msg) | ApiError::InvalidCode(msg) => ApiError::InvalidCode(msg),
                other => other,
            })?;

        let conn: ConnectionResponse =
            serde_json::from_value(json).map_err(|e| ApiError::Server(e.to_string()))?;
        self.session.set(&conn.session_id, &conn.user_id);
        tracing::info!("Paired as {} ({})", conn.display_name, conn.user_id);
        Ok(conn)
    }

    pub async fn list_downloads(&self) -> Result<DownloadsResponse, ApiError> {
        let user_id = self.require_user_id()?;
        let json = self
            .request::<()>(Method::GET, &format!("/downloads/{}", user_id), None)
            .await?;
        Self::open(json, &user_id)
    }

    pub async fn get_display_name(&self) -> Result<DisplayNameResponse, ApiError> {
        let user_id = self.require_user_id()?;
        let json = self.request::<()>(Method::GET, "/getusername", None).await?;
        Self::open(json, &user_id)
    }

    pub async fn list_friends(&self) -> Result<FriendsResponse, ApiError> {
        let user_id = self.require_user_id()?;
        let json = self
            .request(Method::POST, "/get-friends", Some(&serde_json::json!({})))
            .await?;
        Self::open(json, &user_id)
    }

    pub async fn check_notifications(&self) -> Result<NotificationsResponse, ApiError> {
        let user_id = self.require_user_id()?;
        let json = self
            .request::<()>(Method::GET, "/downloads/check-notifications", None)
            .await?;
        Self::open(json, &user_id)
    }

    /// Fire-and-forget: the acknowledgment only means the desktop app was
    /// told. The state change shows up on a later downloads poll.
    pub async fn send_command(
        &self,
        command: DownloadCommand,
        download_id: &str,
    ) -> Result<CommandAck, ApiError> {
        let body = CommandRequest {
            command,
            download_id: download_id.to_string(),
        };
        let json = self
            .request(Method::POST, "/downloads/command", Some(&body))
            .await?;
        serde_json::from_value(json).map_err(|e| ApiError::Server(e.to_string()))
    }

    /// Revoke this device server-side. The local session is cleared whether
    /// or not the server accepted the revocation.
    pub async fn disconnect(&self) -> Result<CommandAck, ApiError> {
        let session = self.session.get().ok_or(ApiError::NoSession)?;
        let body = DisconnectRequest {
            session_id: session.session_id,
            user_id: session.user_id,
        };

        let result = self
            .request(Method::POST, "/disconnect-device", Some(&body))
            .await;
        self.session.clear();

        let json = result?;
        serde_json::from_value(json).map_err(|e| ApiError::Server(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_status_invalidates_session() {
        let body = serde_json::json!({"error": "nope"});
        let err = classify_failure(StatusCode::UNAUTHORIZED, &body);
        assert!(matches!(err, ApiError::SessionInvalidated));
    }

    #[test]
    fn test_session_worded_error_invalidates_session() {
        let body = serde_json::json!({"error": "Unauthorized device"});
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, &body),
            ApiError::SessionInvalidated
        ));

        let body = serde_json::json!({"error": "session expired, reconnect"});
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, &body),
            ApiError::SessionInvalidated
        ));
    }

    #[test]
    fn test_structured_error_maps_to_request_failed() {
        let body = serde_json::json!({"error": "download not found"});
        match classify_failure(StatusCode::NOT_FOUND, &body) {
            ApiError::Request(msg) => assert_eq!(msg, "download not found"),
            other => panic!("expected Request, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_error_field_uses_status() {
        let body = serde_json::json!({});
        match classify_failure(StatusCode::INTERNAL_SERVER_ERROR, &body) {
            ApiError::Request(msg) => assert!(msg.contains("500")),
            other => panic!("expected Request, got {:?}", other),
        }
    }

    #[test]
    fn test_transient_vs_fatal_split() {
        assert!(ApiError::RateLimited.is_transient());
        assert!(ApiError::Connection("refused".into()).is_transient());
        assert!(ApiError::Server("502 Bad Gateway".into()).is_transient());
        assert!(!ApiError::SessionInvalidated.is_transient());
        assert!(!ApiError::Decryption.is_transient());

        assert!(ApiError::NoSession.invalidates_session());
        assert!(ApiError::SessionInvalidated.invalidates_session());
        assert!(!ApiError::RateLimited.invalidates_session());
    }

    #[test]
    fn test_decryption_error_mapping() {
        assert!(matches!(
            crypto_to_api(CryptoError::DecryptionFailed),
            ApiError::Decryption
        ));
        assert!(matches!(
            crypto_to_api(CryptoError::MalformedEnvelope("x".into())),
            ApiError::Server(_)
        ));
    }

    #[tokio::test]
    async fn test_user_scoped_calls_short_circuit_without_session() {
        let session = Arc::new(SessionStore::new(None));
        // Unroutable base URL: a network call would fail differently, so a
        // NoSession result proves the call never left the client.
        let api = ApiClient::new("http://127.0.0.1:1", session);

        assert!(matches!(
            api.list_downloads().await,
            Err(ApiError::NoSession)
        ));
        assert!(matches!(
            api.list_friends().await,
            Err(ApiError::NoSession)
        ));
        assert!(matches!(
            api.get_display_name().await,
            Err(ApiError::NoSession)
        ));
        assert!(matches!(
            api.check_notifications().await,
            Err(ApiError::NoSession)
        ));
        assert!(matches!(api.disconnect().await, Err(ApiError::NoSession)));
    }
}
