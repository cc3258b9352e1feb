//! Token endpoint: authorization_code, client_credentials, refresh_token.
//!
//! Every happy path mints a fresh 32-byte access token (1 h TTL); the
//! authorization-code and refresh grants also mint a refresh token (90 d
//! TTL, rotated atomically on every use). Only hashes reach the store; the
//! plaintext goes to the client exactly once, with `Cache-Control: no-store`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use chrono::{Duration, Utc};
use mcpbox_storage::{StoredAccessToken, StoredClient, StoredRefreshToken};
use serde::Serialize;
use tracing::{debug, info};

use super::{OAuthError, OAuthServer, ACCESS_TOKEN_TTL, DEFAULT_SCOPE, REFRESH_TOKEN_TTL};
use crate::crypto;

/// Successful token response. `scope` serialises as `null` when absent so
/// clients see the field either way.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub scope: Option<String>,
}

impl IntoResponse for TokenResponse {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        (StatusCode::OK, headers, axum::Json(self)).into_response()
    }
}

/// `POST /token`
pub(super) async fn token(
    State(server): State<Arc<OAuthServer>>,
    Form(params): Form<HashMap<String, String>>,
) -> Result<TokenResponse, OAuthError> {
    match params.get("grant_type").map(String::as_str) {
        Some("authorization_code") => grant_authorization_code(&server, &params).await,
        Some("client_credentials") => grant_client_credentials(&server, &params).await,
        Some("refresh_token") => grant_refresh_token(&server, &params).await,
        _ => Err(OAuthError::unsupported_grant_type()),
    }
}

fn require<'a>(
    params: &'a HashMap<String, String>,
    key: &str,
) -> Result<&'a str, OAuthError> {
    params
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::invalid_request(format!("{key} is required")))
}

/// Verify the posted secret against the stored hash, when the client has one.
fn check_client_secret(
    client: &StoredClient,
    params: &HashMap<String, String>,
) -> Result<(), OAuthError> {
    if let Some(stored_hash) = &client.client_secret_hash {
        let Some(secret) = params.get("client_secret") else {
            return Err(OAuthError::invalid_client(StatusCode::UNAUTHORIZED));
        };
        if !crypto::constant_time_eq(&crypto::sha256_hex(secret), stored_hash) {
            return Err(OAuthError::invalid_client(StatusCode::UNAUTHORIZED));
        }
    }
    Ok(())
}

async fn grant_authorization_code(
    server: &OAuthServer,
    params: &HashMap<String, String>,
) -> Result<TokenResponse, OAuthError> {
    let code = require(params, "code")?;
    let client_id = require(params, "client_id")?;

    let client = server
        .store()
        .get_client(client_id)
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?
        .ok_or_else(|| OAuthError::invalid_client(StatusCode::BAD_REQUEST))?;

    check_client_secret(&client, params)?;

    // Single use: the code leaves the cache here and never goes back.
    let Some(stored) = server.take_code(code) else {
        return Err(OAuthError::invalid_grant());
    };
    if stored.expires_at <= Utc::now() {
        return Err(OAuthError::invalid_grant());
    }
    if stored.client_id != client_id {
        return Err(OAuthError::invalid_grant());
    }
    if let Some(redirect_uri) = params.get("redirect_uri") {
        if *redirect_uri != stored.redirect_uri {
            return Err(OAuthError::invalid_grant());
        }
    }

    // /authorize only accepts S256, so anything else means a corrupted record.
    if stored.code_challenge_method != "S256" {
        return Err(OAuthError::invalid_request(
            "Only S256 code_challenge_method supported",
        ));
    }
    let Some(verifier) = params.get("code_verifier") else {
        return Err(OAuthError::invalid_grant());
    };
    if !crypto::verify_pkce_s256(verifier, &stored.code_challenge) {
        return Err(OAuthError::invalid_grant());
    }

    let response = mint_token_pair(server, client_id, stored.scope, stored.user_id).await?;
    info!(client_id, "authorization_code grant");
    Ok(response)
}

async fn grant_client_credentials(
    server: &OAuthServer,
    params: &HashMap<String, String>,
) -> Result<TokenResponse, OAuthError> {
    let client_id = require(params, "client_id")?;
    require(params, "client_secret")?;

    let client = server
        .store()
        .get_client(client_id)
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?
        .ok_or_else(|| OAuthError::invalid_client(StatusCode::UNAUTHORIZED))?;

    if !client.grant_types.iter().any(|g| g == "client_credentials") {
        return Err(OAuthError::unauthorized_client());
    }

    check_client_secret(&client, params)?;

    let scope = params
        .get("scope")
        .cloned()
        .or_else(|| Some(DEFAULT_SCOPE.to_string()));
    let user_id = format!("client:{client_id}");

    let access_token = crypto::random_token();
    server
        .store()
        .save_access_token(StoredAccessToken {
            token_hash: crypto::sha256_hex(&access_token),
            client_id: client_id.to_string(),
            scope: scope.clone(),
            expires_at: Utc::now() + Duration::from_std(ACCESS_TOKEN_TTL).unwrap(),
            user_id,
        })
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?;

    info!(client_id, "client_credentials grant");
    Ok(TokenResponse {
        access_token,
        refresh_token: None,
        token_type: "Bearer",
        expires_in: ACCESS_TOKEN_TTL.as_secs(),
        scope,
    })
}

async fn grant_refresh_token(
    server: &OAuthServer,
    params: &HashMap<String, String>,
) -> Result<TokenResponse, OAuthError> {
    let refresh_token = require(params, "refresh_token")?;
    let client_id = require(params, "client_id")?;

    let old_hash = crypto::sha256_hex(refresh_token);
    let stored = server
        .store()
        .get_refresh_token(&old_hash)
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?
        .ok_or_else(OAuthError::invalid_grant)?;

    if stored.client_id != client_id {
        return Err(OAuthError::invalid_grant());
    }

    let client = server
        .store()
        .get_client(client_id)
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?
        .ok_or_else(|| OAuthError::invalid_client(StatusCode::BAD_REQUEST))?;
    check_client_secret(&client, params)?;

    // Rotation: old hash out, new hash in, one transaction.
    let new_refresh = crypto::random_token();
    server
        .store()
        .rotate_refresh_token(
            &old_hash,
            StoredRefreshToken {
                token_hash: crypto::sha256_hex(&new_refresh),
                client_id: stored.client_id.clone(),
                scope: stored.scope.clone(),
                expires_at: Utc::now() + Duration::from_std(REFRESH_TOKEN_TTL).unwrap(),
                user_id: stored.user_id.clone(),
            },
        )
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?;

    let access_token = crypto::random_token();
    server
        .store()
        .save_access_token(StoredAccessToken {
            token_hash: crypto::sha256_hex(&access_token),
            client_id: stored.client_id.clone(),
            scope: stored.scope.clone(),
            expires_at: Utc::now() + Duration::from_std(ACCESS_TOKEN_TTL).unwrap(),
            user_id: stored.user_id,
        })
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?;

    debug!(client_id, "refresh token rotated");
    Ok(TokenResponse {
        access_token,
        refresh_token: Some(new_refresh),
        token_type: "Bearer",
        expires_in: ACCESS_TOKEN_TTL.as_secs(),
        scope: stored.scope,
    })
}

/// Mint the access + refresh pair for the authorization-code grant.
async fn mint_token_pair(
    server: &OAuthServer,
    client_id: &str,
    scope: Option<String>,
    user_id: String,
) -> Result<TokenResponse, OAuthError> {
    let access_token = crypto::random_token();
    let refresh_token = crypto::random_token();

    server
        .store()
        .save_access_token(StoredAccessToken {
            token_hash: crypto::sha256_hex(&access_token),
            client_id: client_id.to_string(),
            scope: scope.clone(),
            expires_at: Utc::now() + Duration::from_std(ACCESS_TOKEN_TTL).unwrap(),
            user_id: user_id.clone(),
        })
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?;

    server
        .store()
        .save_refresh_token(StoredRefreshToken {
            token_hash: crypto::sha256_hex(&refresh_token),
            client_id: client_id.to_string(),
            scope: scope.clone(),
            expires_at: Utc::now() + Duration::from_std(REFRESH_TOKEN_TTL).unwrap(),
            user_id,
        })
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?;

    Ok(TokenResponse {
        access_token,
        refresh_token: Some(refresh_token),
        token_type: "Bearer",
        expires_in: ACCESS_TOKEN_TTL.as_secs(),
        scope,
    })
}
