//! Embedded OAuth 2.1 authorization server.
//!
//! Issues and validates the bearer tokens that protect the MCP endpoint.
//! Grants: Authorization Code with mandatory S256 PKCE, Client Credentials,
//! and Refresh Token with rotation. Clients are pre-registered from config or
//! arrive through RFC 7591 dynamic registration; users come from the
//! configured identity providers.
//!
//! Clients and tokens persist through the state store. Authorization codes
//! and pending login sessions are process-local maps with a ten-minute TTL,
//! evicted lazily and by a timer so expiry does not depend on traffic.

mod authorize;
mod dcr;
mod discovery;
mod token;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use mcpbox_core::config::{GrantType, OAuthSettings};
use mcpbox_storage::{StateStore, StoredClient};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::crypto;
use crate::idp::{AuthenticatedUser, IdentityProvider};

pub use dcr::RegistrationRequest;
pub use token::TokenResponse;

/// Access token lifetime.
pub const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(3600);
/// Refresh token lifetime (90 days).
pub const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(90 * 24 * 3600);
/// Authorization codes and pending sessions live at most this long.
pub const CODE_TTL: Duration = Duration::from_secs(600);

/// Scope granted when a client does not ask for one.
pub const DEFAULT_SCOPE: &str = "mcp:tools";

/// A one-shot authorization code awaiting exchange.
#[derive(Debug, Clone)]
pub struct AuthCode {
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub user_id: String,
}

/// A browser part-way through login.
#[derive(Debug, Clone)]
pub struct PendingSession {
    pub client_id: String,
    pub client_name: Option<String>,
    pub redirect_uri: String,
    pub state: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub scope: Option<String>,
    /// Set when the session belongs to one redirect provider's flow.
    pub provider_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// RFC 6749 §5.2 error response; doubles as the handler error type.
#[derive(Debug)]
pub struct OAuthError {
    pub status: StatusCode,
    pub error: &'static str,
    pub description: Option<String>,
}

impl OAuthError {
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "invalid_request",
            description: Some(description.into()),
        }
    }

    pub fn invalid_client(status: StatusCode) -> Self {
        Self {
            status,
            error: "invalid_client",
            description: None,
        }
    }

    pub fn invalid_grant() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "invalid_grant",
            description: None,
        }
    }

    pub fn unauthorized_client() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "unauthorized_client",
            description: None,
        }
    }

    pub fn unsupported_grant_type() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "unsupported_grant_type",
            description: None,
        }
    }

    pub fn server_error(description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "server_error",
            description: Some(description.into()),
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.error });
        if let Some(description) = self.description {
            body["error_description"] = json!(description);
        }
        (self.status, Json(body)).into_response()
    }
}

/// The authorization server. One per process, shared through `Arc`.
pub struct OAuthServer {
    issuer: String,
    providers: Vec<IdentityProvider>,
    store: Arc<dyn StateStore>,
    dynamic_registration: bool,
    /// Whether any pre-registered client may use client_credentials; feeds
    /// the metadata document.
    advertises_client_credentials: bool,
    codes: Mutex<HashMap<String, AuthCode>>,
    sessions: Mutex<HashMap<String, PendingSession>>,
}

impl OAuthServer {
    /// Build the server and seed pre-registered clients into the store.
    pub async fn new(
        settings: &OAuthSettings,
        port: u16,
        store: Arc<dyn StateStore>,
    ) -> anyhow::Result<Arc<Self>> {
        let issuer = settings.effective_issuer(port);

        for client in &settings.clients {
            let stored = StoredClient {
                client_id: client.client_id.clone(),
                client_secret_hash: client.client_secret.as_deref().map(crypto::sha256_hex),
                client_name: client.client_name.clone(),
                redirect_uris: client.redirect_uris.clone(),
                grant_types: match client.grant_type {
                    GrantType::AuthorizationCode => vec![
                        "authorization_code".to_string(),
                        "refresh_token".to_string(),
                    ],
                    GrantType::ClientCredentials => vec!["client_credentials".to_string()],
                },
                response_types: vec!["code".to_string()],
                token_endpoint_auth_method: if client.client_secret.is_some() {
                    "client_secret_post".to_string()
                } else {
                    "none".to_string()
                },
                created_at: Utc::now(),
                is_dynamic: false,
            };
            store.save_client(stored).await?;
        }

        let providers = settings
            .identity_providers
            .iter()
            .map(IdentityProvider::from_config)
            .collect::<Vec<_>>();

        info!(
            issuer = %issuer,
            providers = providers.len(),
            clients = settings.clients.len(),
            dynamic_registration = settings.dynamic_registration,
            "oauth server ready"
        );

        Ok(Arc::new(Self {
            issuer,
            providers,
            store,
            dynamic_registration: settings.dynamic_registration,
            advertises_client_credentials: settings
                .clients
                .iter()
                .any(|c| c.grant_type == GrantType::ClientCredentials),
            codes: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }))
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn has_identity_providers(&self) -> bool {
        !self.providers.is_empty()
    }

    pub fn dynamic_registration_enabled(&self) -> bool {
        self.dynamic_registration
    }

    pub(crate) fn advertises_client_credentials(&self) -> bool {
        self.advertises_client_credentials
    }

    pub(crate) fn providers(&self) -> &[IdentityProvider] {
        &self.providers
    }

    pub(crate) fn provider(&self, id: &str) -> Option<&IdentityProvider> {
        self.providers.iter().find(|p| p.id() == id)
    }

    /// Record a pending login session; returns its id.
    pub(crate) fn create_session(&self, mut session: PendingSession) -> String {
        let session_id = crypto::random_token();
        session.expires_at = Utc::now() + chrono::Duration::from_std(CODE_TTL).unwrap();
        self.sessions.lock().insert(session_id.clone(), session);
        session_id
    }

    /// Look up a live session without consuming it.
    pub(crate) fn get_session(&self, session_id: &str) -> Option<PendingSession> {
        let mut sessions = self.sessions.lock();
        let expired = sessions
            .get(session_id)
            .is_some_and(|s| s.expires_at <= Utc::now());
        if expired {
            sessions.remove(session_id);
            return None;
        }
        sessions.get(session_id).cloned()
    }

    pub(crate) fn remove_session(&self, session_id: &str) -> Option<PendingSession> {
        self.sessions.lock().remove(session_id)
    }

    /// Mint an authorization code for `user` and consume the session.
    ///
    /// Returns the redirect target `redirect_uri?code=..[&state=..]`.
    pub(crate) fn issue_code(
        &self,
        session_id: &str,
        session: &PendingSession,
        user: &AuthenticatedUser,
    ) -> String {
        let code = crypto::random_token();
        self.codes.lock().insert(
            code.clone(),
            AuthCode {
                client_id: session.client_id.clone(),
                redirect_uri: session.redirect_uri.clone(),
                code_challenge: session.code_challenge.clone(),
                code_challenge_method: session.code_challenge_method.clone(),
                scope: session.scope.clone(),
                expires_at: Utc::now() + chrono::Duration::from_std(CODE_TTL).unwrap(),
                user_id: user.id.clone(),
            },
        );
        self.remove_session(session_id);

        debug!(client_id = %session.client_id, user = %user.id, "authorization code issued");

        let mut target = format!(
            "{}?code={}",
            session.redirect_uri,
            urlencode(&code)
        );
        if let Some(state) = &session.state {
            target.push_str("&state=");
            target.push_str(&urlencode(state));
        }
        target
    }

    /// Take an authorization code out of the cache (single use).
    pub(crate) fn take_code(&self, code: &str) -> Option<AuthCode> {
        self.codes.lock().remove(code)
    }

    /// Validate a bearer `Authorization` header; returns the token's user id.
    pub async fn validate_bearer(&self, header: Option<&str>) -> Option<String> {
        let token = extract_bearer(header?)?;
        let hash = crypto::sha256_hex(token);
        match self.store.get_access_token(&hash).await {
            Ok(Some(record)) => Some(record.user_id),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "token lookup failed");
                None
            }
        }
    }

    /// `WWW-Authenticate` challenge pointing at the resource metadata.
    pub fn challenge_header(&self) -> String {
        format!(
            r#"Bearer resource_metadata="{}/.well-known/oauth-protected-resource""#,
            self.issuer
        )
    }

    /// Drop expired codes and sessions. Called by the timer task.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.codes.lock().retain(|_, code| code.expires_at > now);
        self.sessions
            .lock()
            .retain(|_, session| session.expires_at > now);
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every minute.
    pub fn spawn_expiry_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                server.sweep_expired();
            }
        })
    }
}

/// Pull the token out of `Bearer <token>` (scheme case-insensitive).
fn extract_bearer(header: &str) -> Option<&str> {
    let rest = header
        .strip_prefix("Bearer")
        .or_else(|| header.strip_prefix("bearer"))
        .or_else(|| header.strip_prefix("BEARER"))
        .or_else(|| {
            // Mixed-case schemes are rare but legal.
            let (scheme, rest) = header.split_at(header.len().min(6));
            scheme.eq_ignore_ascii_case("bearer").then_some(rest)
        })?;
    let token = rest.trim_start();
    if token.is_empty() || rest == token {
        // No whitespace after the scheme means this was not a bearer header.
        return None;
    }
    Some(token)
}

/// Percent-encode a query component.
fn urlencode(input: &str) -> String {
    url::form_urlencoded::byte_serialize(input.as_bytes()).collect()
}

/// Mount every OAuth route onto a fresh router.
pub fn router(server: Arc<OAuthServer>) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route(
            "/.well-known/oauth-protected-resource",
            get(discovery::protected_resource_metadata),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get(discovery::authorization_server_metadata),
        )
        .route(
            "/authorize",
            get(authorize::authorize_get).post(authorize::authorize_post),
        )
        .route("/callback/{provider_id}", get(authorize::callback))
        .route("/token", post(token::token))
        .route("/register", post(dcr::register))
        .with_state(server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("BeArEr   abc"), Some("abc"));
        assert_eq!(extract_bearer("Basic abc"), None);
        assert_eq!(extract_bearer("Bearer"), None);
        assert_eq!(extract_bearer("Bearerabc"), None);
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("a b&c"), "a+b%26c");
        assert_eq!(urlencode("plain"), "plain");
    }
}
