//! Discovery metadata (RFC 8414, RFC 9728).
//!
//! Both documents are derived from live configuration: grants only appear
//! when something in the config can actually exercise them, and the
//! registration endpoint is only advertised when dynamic registration is on.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::{OAuthServer, DEFAULT_SCOPE};

/// `GET /.well-known/oauth-protected-resource`
pub(super) async fn protected_resource_metadata(
    State(server): State<Arc<OAuthServer>>,
) -> Json<Value> {
    let issuer = server.issuer();
    Json(json!({
        "resource": issuer,
        "authorization_servers": [issuer],
        "scopes_supported": [DEFAULT_SCOPE],
        "bearer_methods_supported": ["header"],
        "logo_uri": format!("{issuer}/logo.png"),
    }))
}

/// `GET /.well-known/oauth-authorization-server`
pub(super) async fn authorization_server_metadata(
    State(server): State<Arc<OAuthServer>>,
) -> Json<Value> {
    let issuer = server.issuer();

    let mut grant_types = Vec::new();
    if server.has_identity_providers() {
        grant_types.push("authorization_code");
        grant_types.push("refresh_token");
    }
    if server.advertises_client_credentials() {
        grant_types.push("client_credentials");
    }

    let mut metadata = json!({
        "issuer": issuer,
        "token_endpoint": format!("{issuer}/token"),
        "grant_types_supported": grant_types,
        "token_endpoint_auth_methods_supported": ["none", "client_secret_post"],
        "scopes_supported": [DEFAULT_SCOPE],
    });

    if server.has_identity_providers() {
        metadata["authorization_endpoint"] = json!(format!("{issuer}/authorize"));
        metadata["response_types_supported"] = json!(["code"]);
        metadata["code_challenge_methods_supported"] = json!(["S256"]);
    }

    if server.dynamic_registration_enabled() {
        metadata["registration_endpoint"] = json!(format!("{issuer}/register"));
    }

    Json(metadata)
}
