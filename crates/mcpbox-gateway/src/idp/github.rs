//! GitHub redirect provider.
//!
//! Standard OAuth web flow against github.com: send the browser to the
//! authorize page, exchange the returned `code` for an access token, then
//! fetch `/user` to learn who logged in. Optional allowlists restrict access
//! by login name or by organisation membership (both case-insensitive).

use std::collections::HashMap;

use async_trait::async_trait;
use mcpbox_core::config::GithubIdpSettings;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AuthenticatedUser, RedirectProvider};

const AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const API_BASE: &str = "https://api.github.com";

pub struct GithubProvider {
    settings: GithubIdpSettings,
    http: reqwest::Client,
    token_url: String,
    api_base: String,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct GithubUser {
    id: u64,
    login: String,
}

#[derive(Deserialize)]
struct GithubOrg {
    login: String,
}

impl GithubProvider {
    pub fn new(settings: GithubIdpSettings) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
            token_url: TOKEN_URL.to_string(),
            api_base: API_BASE.to_string(),
        }
    }

    /// Point the token/API endpoints somewhere else (tests).
    #[doc(hidden)]
    pub fn with_endpoints(mut self, token_url: String, api_base: String) -> Self {
        self.token_url = token_url;
        self.api_base = api_base;
        self
    }

    async fn exchange_code(&self, code: &str) -> Option<String> {
        let response = self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
                ("code", code),
            ])
            .send()
            .await
            .ok()?;

        let body: AccessTokenResponse = response.json().await.ok()?;
        body.access_token
    }

    async fn fetch_user(&self, access_token: &str) -> Option<GithubUser> {
        self.http
            .get(format!("{}/user", self.api_base))
            .bearer_auth(access_token)
            .header("User-Agent", mcpbox_core::GATEWAY_NAME)
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()
    }

    async fn user_in_allowed_org(&self, access_token: &str) -> bool {
        let orgs: Vec<GithubOrg> = match self
            .http
            .get(format!("{}/user/orgs?per_page=100", self.api_base))
            .bearer_auth(access_token)
            .header("User-Agent", mcpbox_core::GATEWAY_NAME)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => match response.json().await {
                Ok(orgs) => orgs,
                Err(e) => {
                    warn!(error = %e, "failed to decode org list");
                    return false;
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to fetch org list");
                return false;
            }
        };

        orgs.iter().any(|org| {
            self.settings
                .allowed_orgs
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&org.login))
        })
    }
}

#[async_trait]
impl RedirectProvider for GithubProvider {
    fn id(&self) -> &str {
        "github"
    }

    fn authorization_url(&self, callback_url: &str, state: &str) -> String {
        let mut url = url::Url::parse(AUTHORIZE_URL).expect("static URL parses");
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.settings.client_id);
            query.append_pair("redirect_uri", callback_url);
            query.append_pair("state", state);
            // Org membership checks need the read:org scope.
            if !self.settings.allowed_orgs.is_empty() {
                query.append_pair("scope", "read:org");
            }
        }
        url.into()
    }

    async fn handle_callback(&self, query: &HashMap<String, String>) -> Option<AuthenticatedUser> {
        let code = query.get("code")?;

        let access_token = self.exchange_code(code).await?;
        let user = self.fetch_user(&access_token).await?;

        if !self.settings.allowed_users.is_empty()
            && !self
                .settings
                .allowed_users
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&user.login))
        {
            warn!(login = %user.login, "github user not in allowlist");
            return None;
        }

        if !self.settings.allowed_orgs.is_empty() && !self.user_in_allowed_org(&access_token).await
        {
            warn!(login = %user.login, "github user not in any allowed org");
            return None;
        }

        debug!(login = %user.login, "github login accepted");
        Some(AuthenticatedUser {
            id: format!("github:{}", user.id),
            display_name: user.login,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(orgs: Vec<&str>) -> GithubIdpSettings {
        GithubIdpSettings {
            client_id: "gh-client".to_string(),
            client_secret: "gh-secret".to_string(),
            allowed_orgs: orgs.into_iter().map(String::from).collect(),
            allowed_users: vec![],
        }
    }

    #[test]
    fn test_authorization_url() {
        let provider = GithubProvider::new(settings(vec![]));
        let url = provider.authorization_url("http://localhost:8080/callback/github", "sess-1");
        assert!(url.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(url.contains("client_id=gh-client"));
        assert!(url.contains("state=sess-1"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fcallback%2Fgithub"));
        assert!(!url.contains("scope="));
    }

    #[test]
    fn test_authorization_url_requests_org_scope() {
        let provider = GithubProvider::new(settings(vec!["acme"]));
        let url = provider.authorization_url("http://localhost:8080/callback/github", "s");
        assert!(url.contains("scope=read%3Aorg"));
    }

    #[tokio::test]
    async fn test_callback_without_code_denied() {
        let provider = GithubProvider::new(settings(vec![]));
        assert!(provider.handle_callback(&HashMap::new()).await.is_none());
    }
}
