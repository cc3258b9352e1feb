//! Identity providers.
//!
//! Two shapes of login exist: form providers take credentials directly
//! (username/password posted to the authorize endpoint) and redirect
//! providers bounce the browser to an external OAuth service and consume its
//! callback. They stay distinct trait shapes rather than one interface with
//! optional methods; the OAuth server matches on the sum type.

mod github;
mod local;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mcpbox_core::config::IdentityProviderConfig;

pub use github::GithubProvider;
pub use local::LocalProvider;

/// A user some provider vouched for.
///
/// The id is `"<provider>:<local id>"` so that users from different sources
/// never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
    pub display_name: String,
}

/// Direct credential check (login form).
#[async_trait]
pub trait FormProvider: Send + Sync {
    fn id(&self) -> &str;
    /// `None` means the credentials were not accepted; the caller decides
    /// whether another provider gets a turn.
    async fn validate(&self, username: &str, password: &str) -> Option<AuthenticatedUser>;
}

/// Browser redirect to an external authority.
#[async_trait]
pub trait RedirectProvider: Send + Sync {
    fn id(&self) -> &str;
    /// Where to send the browser. `state` is the pending-session id and must
    /// round-trip through the external service.
    fn authorization_url(&self, callback_url: &str, state: &str) -> String;
    /// Consume the callback query string; `None` denies access.
    async fn handle_callback(&self, query: &HashMap<String, String>) -> Option<AuthenticatedUser>;
}

/// A configured provider of either shape.
#[derive(Clone)]
pub enum IdentityProvider {
    Form(Arc<dyn FormProvider>),
    Redirect(Arc<dyn RedirectProvider>),
}

impl IdentityProvider {
    pub fn from_config(config: &IdentityProviderConfig) -> Self {
        match config {
            IdentityProviderConfig::Local(local) => {
                IdentityProvider::Form(Arc::new(LocalProvider::new(local.clone())))
            }
            IdentityProviderConfig::Github(github) => {
                IdentityProvider::Redirect(Arc::new(GithubProvider::new(github.clone())))
            }
        }
    }

    pub fn id(&self) -> &str {
        match self {
            IdentityProvider::Form(p) => p.id(),
            IdentityProvider::Redirect(p) => p.id(),
        }
    }

    pub fn as_redirect(&self) -> Option<&Arc<dyn RedirectProvider>> {
        match self {
            IdentityProvider::Redirect(p) => Some(p),
            IdentityProvider::Form(_) => None,
        }
    }
}
