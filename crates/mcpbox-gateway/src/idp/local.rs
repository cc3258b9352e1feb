//! Local username/password provider.
//!
//! Users come straight from configuration. Passwords are either bcrypt
//! digests (recognised by prefix) or plaintext compared in constant time.
//! The plaintext form is for lab setups, not production, but the comparison
//! is hardened anyway.

use async_trait::async_trait;
use mcpbox_core::config::LocalIdpSettings;
use tracing::debug;

use super::{AuthenticatedUser, FormProvider};
use crate::crypto;

pub struct LocalProvider {
    settings: LocalIdpSettings,
}

impl LocalProvider {
    pub fn new(settings: LocalIdpSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl FormProvider for LocalProvider {
    fn id(&self) -> &str {
        "local"
    }

    async fn validate(&self, username: &str, password: &str) -> Option<AuthenticatedUser> {
        let user = self
            .settings
            .users
            .iter()
            .find(|u| u.username == username)?;

        if !crypto::verify_password(password, &user.password) {
            debug!(username, "password mismatch");
            return None;
        }

        Some(AuthenticatedUser {
            id: format!("local:{}", user.username),
            display_name: user.username.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpbox_core::config::LocalUserConfig;

    fn provider(users: Vec<(&str, &str)>) -> LocalProvider {
        LocalProvider::new(LocalIdpSettings {
            users: users
                .into_iter()
                .map(|(u, p)| LocalUserConfig {
                    username: u.to_string(),
                    password: p.to_string(),
                })
                .collect(),
        })
    }

    #[tokio::test]
    async fn test_plaintext_login() {
        let provider = provider(vec![("testuser", "testpass")]);
        let user = provider.validate("testuser", "testpass").await.unwrap();
        assert_eq!(user.id, "local:testuser");
        assert_eq!(user.display_name, "testuser");
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let provider = provider(vec![("testuser", "testpass")]);
        assert!(provider.validate("testuser", "nope").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_user_rejected() {
        let provider = provider(vec![("testuser", "testpass")]);
        assert!(provider.validate("ghost", "testpass").await.is_none());
    }

    #[tokio::test]
    async fn test_bcrypt_digest_login() {
        let digest = bcrypt::hash("hunter2", 4).unwrap();
        let provider = provider(vec![("admin", digest.as_str())]);
        assert!(provider.validate("admin", "hunter2").await.is_some());
        assert!(provider.validate("admin", "hunter3").await.is_none());
    }
}
