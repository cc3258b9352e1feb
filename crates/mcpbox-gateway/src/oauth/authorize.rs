//! Authorization endpoint, login page, and external-provider callback.
//!
//! `GET /authorize` validates the request, then either bounces the browser to
//! a redirect provider or renders the login form. `POST /authorize` consumes
//! the form. `GET /callback/<provider>` receives the external provider's
//! redirect. All three converge on code issuance.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{OAuthError, OAuthServer, PendingSession};
use crate::idp::IdentityProvider;

/// 302 redirect; the OAuth flows specify Found rather than See Other.
fn found(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `GET /authorize`
pub(super) async fn authorize_get(
    State(server): State<Arc<OAuthServer>>,
    RawQuery(raw_query): RawQuery,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, OAuthError> {
    if !server.has_identity_providers() {
        return Err(OAuthError::invalid_request(
            "Authorization Code flow not available",
        ));
    }

    let session = validate_authorize_params(&server, &params).await?;
    let raw_query = raw_query.unwrap_or_default();

    // Explicit provider choice via `idp=`.
    if let Some(idp) = params.get("idp") {
        if let Some(provider) = server.provider(idp).and_then(IdentityProvider::as_redirect) {
            let session_id = server.create_session(PendingSession {
                provider_id: Some(idp.clone()),
                ..session
            });
            let callback = format!("{}/callback/{}", server.issuer(), idp);
            return Ok(found(&provider.authorization_url(&callback, &session_id)));
        }
    }

    // A single redirect provider and nothing else: skip the chooser.
    let redirect_providers: Vec<_> = server
        .providers()
        .iter()
        .filter_map(|p| p.as_redirect().map(|r| (p.id().to_string(), r.clone())))
        .collect();
    let has_form_provider = server
        .providers()
        .iter()
        .any(|p| matches!(p, IdentityProvider::Form(_)));

    if redirect_providers.len() == 1 && !has_form_provider {
        let (id, provider) = &redirect_providers[0];
        let session_id = server.create_session(PendingSession {
            provider_id: Some(id.clone()),
            ..session
        });
        let callback = format!("{}/callback/{}", server.issuer(), id);
        return Ok(found(&provider.authorization_url(&callback, &session_id)));
    }

    let client_name = session.client_name.clone();
    let session_id = server.create_session(session);
    Ok(render_login_page(
        &server,
        &session_id,
        &raw_query,
        client_name.as_deref(),
        None,
    )
    .into_response())
}

/// Check the query parameters and build the (not yet stored) session.
async fn validate_authorize_params(
    server: &OAuthServer,
    params: &HashMap<String, String>,
) -> Result<PendingSession, OAuthError> {
    let client_id = params
        .get("client_id")
        .ok_or_else(|| OAuthError::invalid_request("client_id is required"))?;
    let redirect_uri = params
        .get("redirect_uri")
        .ok_or_else(|| OAuthError::invalid_request("redirect_uri is required"))?;
    let response_type = params
        .get("response_type")
        .ok_or_else(|| OAuthError::invalid_request("response_type is required"))?;
    let code_challenge = params
        .get("code_challenge")
        .ok_or_else(|| OAuthError::invalid_request("code_challenge is required"))?;
    let code_challenge_method = params
        .get("code_challenge_method")
        .ok_or_else(|| OAuthError::invalid_request("code_challenge_method is required"))?;

    if response_type != "code" {
        return Err(OAuthError::invalid_request(
            "only response_type=code is supported",
        ));
    }
    if code_challenge_method != "S256" {
        return Err(OAuthError::invalid_request(
            "only code_challenge_method=S256 is supported",
        ));
    }

    let client = server
        .store()
        .get_client(client_id)
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?
        .ok_or_else(|| OAuthError::invalid_client(StatusCode::BAD_REQUEST))?;

    // Byte-for-byte match; no normalisation of trailing slashes or case.
    if !client.redirect_uris.iter().any(|u| u == redirect_uri) {
        return Err(OAuthError::invalid_request("Invalid redirect_uri"));
    }

    Ok(PendingSession {
        client_id: client.client_id,
        client_name: client.client_name,
        redirect_uri: redirect_uri.clone(),
        state: params.get("state").cloned(),
        code_challenge: code_challenge.clone(),
        code_challenge_method: code_challenge_method.clone(),
        scope: params.get("scope").cloned(),
        provider_id: None,
        expires_at: chrono::Utc::now(), // set for real by create_session
    })
}

#[derive(Debug, Deserialize)]
pub(super) struct LoginForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    session_id: String,
}

/// `POST /authorize`: login form submission.
pub(super) async fn authorize_post(
    State(server): State<Arc<OAuthServer>>,
    RawQuery(raw_query): RawQuery,
    axum::Form(form): axum::Form<LoginForm>,
) -> Result<Response, OAuthError> {
    if form.session_id.is_empty() {
        return Err(OAuthError::invalid_request("session_id is required"));
    }
    let Some(session) = server.get_session(&form.session_id) else {
        return Err(OAuthError::invalid_request("unknown or expired session"));
    };

    // First matching form provider wins, in configuration order.
    for provider in server.providers() {
        if let IdentityProvider::Form(form_provider) = provider {
            if let Some(user) = form_provider.validate(&form.username, &form.password).await {
                let target = server.issue_code(&form.session_id, &session, &user);
                return Ok(found(&target));
            }
        }
    }

    debug!(username = %form.username, "login rejected");
    let raw_query = raw_query.unwrap_or_default();
    Ok(render_login_page(
        &server,
        &form.session_id,
        &raw_query,
        session.client_name.as_deref(),
        Some("Invalid username or password."),
    )
    .into_response())
}

/// `GET /callback/<provider_id>`: external provider redirect target.
pub(super) async fn callback(
    State(server): State<Arc<OAuthServer>>,
    Path(provider_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, OAuthError> {
    let session_id = query
        .get("state")
        .ok_or_else(|| OAuthError::invalid_request("state is required"))?;
    let Some(session) = server.get_session(session_id) else {
        return Err(OAuthError::invalid_request("unknown or expired session"));
    };

    if session.provider_id.as_deref() != Some(provider_id.as_str()) {
        return Err(OAuthError::invalid_request("session provider mismatch"));
    }

    let Some(provider) = server
        .provider(&provider_id)
        .and_then(IdentityProvider::as_redirect)
    else {
        return Err(OAuthError::invalid_request("unknown identity provider"));
    };

    match provider.handle_callback(&query).await {
        Some(user) => {
            let target = server.issue_code(session_id, &session, &user);
            Ok(found(&target))
        }
        None => {
            warn!(provider = %provider_id, "external login denied");
            server.remove_session(session_id);
            Err(OAuthError {
                status: StatusCode::FORBIDDEN,
                error: "access_denied",
                description: None,
            })
        }
    }
}

/// Server-rendered login page.
///
/// The contract the tests and clients rely on: a hidden `session_id` input,
/// the form POSTs back to `/authorize` with the original query string, and
/// one link per redirect provider carrying `idp=<id>`.
fn render_login_page(
    server: &OAuthServer,
    session_id: &str,
    raw_query: &str,
    client_name: Option<&str>,
    error: Option<&str>,
) -> Html<String> {
    let heading = match client_name {
        Some(name) => format!("Sign in to {}", html_escape(name)),
        None => "Sign in".to_string(),
    };

    let error_html = match error {
        Some(message) => format!(r#"<p class="error">{}</p>"#, html_escape(message)),
        None => String::new(),
    };

    let mut provider_buttons = String::new();
    for provider in server.providers() {
        if provider.as_redirect().is_some() {
            let id = provider.id();
            provider_buttons.push_str(&format!(
                r#"<a class="idp" href="/authorize?{}&idp={}">Continue with {}</a>"#,
                html_escape(raw_query),
                html_escape(id),
                html_escape(id),
            ));
        }
    }

    let has_form_provider = server
        .providers()
        .iter()
        .any(|p| matches!(p, IdentityProvider::Form(_)));

    let form_html = if has_form_provider {
        format!(
            r#"<form method="post" action="/authorize?{query}">
  <input type="hidden" name="session_id" value="{session_id}">
  <label>Username <input type="text" name="username" autofocus></label>
  <label>Password <input type="password" name="password"></label>
  <button type="submit">Sign in</button>
</form>"#,
            query = html_escape(raw_query),
            session_id = html_escape(session_id),
        )
    } else {
        String::new()
    };

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{heading}</title>
<style>
body {{ font-family: system-ui, sans-serif; max-width: 24rem; margin: 4rem auto; }}
label {{ display: block; margin: 0.5rem 0; }}
.error {{ color: #b00020; }}
.idp {{ display: block; margin: 0.5rem 0; }}
</style>
</head>
<body>
<h1>{heading}</h1>
{error_html}
{provider_buttons}
{form_html}
</body>
</html>"#
    ))
}
