//! Request authentication middleware.
//!
//! Three modes, fixed at startup from configuration: passthrough, shared API
//! key, or bearer tokens issued by the embedded OAuth server. Only the
//! protected routes (`/status`, `POST /`, `POST /mcp`) pass through here.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

use super::AppState;
use crate::crypto;
use crate::oauth::OAuthServer;

/// How requests are authenticated, per configuration.
#[derive(Clone)]
pub enum AuthMode {
    None,
    ApiKey(String),
    OAuth(Arc<OAuthServer>),
}

/// The authenticated principal, available to downstream handlers.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    match &state.auth {
        AuthMode::None => next.run(request).await,
        AuthMode::ApiKey(expected) => {
            if api_key_matches(&request, expected) {
                next.run(request).await
            } else {
                debug!("api key rejected");
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": "unauthorized" })),
                )
                    .into_response()
            }
        }
        AuthMode::OAuth(oauth) => {
            let header = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            match oauth.validate_bearer(header).await {
                Some(user_id) => {
                    request.extensions_mut().insert(AuthContext { user_id });
                    next.run(request).await
                }
                None => {
                    debug!("bearer token rejected");
                    (
                        StatusCode::UNAUTHORIZED,
                        [(header::WWW_AUTHENTICATE, oauth.challenge_header())],
                        Json(json!({ "error": "unauthorized" })),
                    )
                        .into_response()
                }
            }
        }
    }
}

/// `X-API-Key: <key>` or `Authorization: Bearer|ApiKey <key>`, compared in
/// constant time.
fn api_key_matches(request: &Request<Body>, expected: &str) -> bool {
    if let Some(provided) = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        return crypto::constant_time_eq(provided, expected);
    }

    let Some(authorization) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    for scheme in ["Bearer ", "ApiKey "] {
        if authorization.len() > scheme.len()
            && authorization[..scheme.len()].eq_ignore_ascii_case(scheme)
        {
            return crypto::constant_time_eq(&authorization[scheme.len()..], expected);
        }
    }
    false
}
