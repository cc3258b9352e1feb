//! Dynamic client registration (RFC 7591).
//!
//! An unknown client POSTs its metadata and receives a freshly minted
//! `client_id`. Registered clients are public (`token_endpoint_auth_method:
//! "none"`) unless they bring their own grants; secrets are never issued
//! here.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use mcpbox_storage::StoredClient;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{OAuthError, OAuthServer};

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationRequest {
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub grant_types: Vec<String>,
    #[serde(default)]
    pub response_types: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_method: Option<String>,
}

/// `POST /register`
pub(super) async fn register(
    State(server): State<Arc<OAuthServer>>,
    body: String,
) -> Result<Response, OAuthError> {
    if !server.dynamic_registration_enabled() {
        return Err(OAuthError {
            status: StatusCode::NOT_FOUND,
            error: "registration_not_supported",
            description: None,
        });
    }

    let request: RegistrationRequest = serde_json::from_str(&body)
        .map_err(|e| OAuthError::invalid_request(format!("invalid JSON: {e}")))?;

    if request.redirect_uris.is_empty() {
        return Err(OAuthError {
            status: StatusCode::BAD_REQUEST,
            error: "invalid_redirect_uri",
            description: Some("redirect_uris must be non-empty".to_string()),
        });
    }
    for uri in &request.redirect_uris {
        if url::Url::parse(uri).is_err() {
            return Err(OAuthError {
                status: StatusCode::BAD_REQUEST,
                error: "invalid_redirect_uri",
                description: Some(format!("'{uri}' is not an absolute URL")),
            });
        }
    }

    let client = StoredClient {
        client_id: Uuid::new_v4().to_string(),
        client_secret_hash: None,
        client_name: request.client_name,
        redirect_uris: request.redirect_uris,
        grant_types: non_empty_or(request.grant_types, &["authorization_code"]),
        response_types: non_empty_or(request.response_types, &["code"]),
        token_endpoint_auth_method: request
            .token_endpoint_auth_method
            .unwrap_or_else(|| "none".to_string()),
        created_at: Utc::now(),
        is_dynamic: true,
    };

    server
        .store()
        .save_client(client.clone())
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?;

    info!(
        client_id = %client.client_id,
        client_name = client.client_name.as_deref().unwrap_or("-"),
        "dynamic client registered"
    );

    let body = json!({
        "client_id": client.client_id,
        "client_name": client.client_name,
        "redirect_uris": client.redirect_uris,
        "grant_types": client.grant_types,
        "response_types": client.response_types,
        "token_endpoint_auth_method": client.token_endpoint_auth_method,
        "client_id_issued_at": client.created_at.timestamp(),
    });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

fn non_empty_or(values: Vec<String>, default: &[&str]) -> Vec<String> {
    if values.is_empty() {
        default.iter().map(|s| s.to_string()).collect()
    } else {
        values
    }
}
