//! Gateway configuration: deserialization, `${VAR}` substitution, validation.
//!
//! The configuration is a single JSON document. Unknown keys fail parsing at
//! every level. Every string value may reference process environment with
//! `${VAR}`; an unresolved variable aborts the load. Validation collects all
//! violations and reports them together, so a broken config is fixed in one
//! pass rather than one restart per mistake.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Default HTTP listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "mcpbox.json";

/// Errors produced while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unresolved environment variable '${{{0}}}' in config")]
    UnresolvedVar(String),

    /// One line per violation, reported together.
    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_true")]
    pub redact_secrets: bool,
    #[serde(default)]
    pub mcp_debug: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: LogFormat::default(),
            redact_secrets: true,
            mcp_debug: false,
        }
    }
}

impl LogConfig {
    /// Configured level, else the `LOG_LEVEL` environment variable, else
    /// `info`.
    pub fn effective_level(&self) -> String {
        self.level
            .map(|l| l.as_str().to_string())
            .or_else(|| std::env::var("LOG_LEVEL").ok())
            .unwrap_or_else(|| "info".to_string())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Authentication mode, discriminated by `type`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Apikey(ApiKeySettings),
    Oauth(OAuthSettings),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiKeySettings {
    pub api_key: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OAuthSettings {
    /// Public base URL of this gateway. Defaults to `http://localhost:<port>`.
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub identity_providers: Vec<IdentityProviderConfig>,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
    #[serde(default)]
    pub dynamic_registration: bool,
}

impl OAuthSettings {
    /// Issuer with the port-derived default applied.
    pub fn effective_issuer(&self, port: u16) -> String {
        match &self.issuer {
            Some(issuer) => issuer.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{port}"),
        }
    }
}

/// Identity provider entry, discriminated by `type`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IdentityProviderConfig {
    Local(LocalIdpSettings),
    Github(GithubIdpSettings),
}

impl IdentityProviderConfig {
    /// Stable id used in `idp=` query parameters and callback paths.
    pub fn id(&self) -> &'static str {
        match self {
            IdentityProviderConfig::Local(_) => "local",
            IdentityProviderConfig::Github(_) => "github",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalIdpSettings {
    #[serde(default)]
    pub users: Vec<LocalUserConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalUserConfig {
    pub username: String,
    /// Plaintext or a bcrypt digest (`$2a$`/`$2b$`/`$2y$` prefix).
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GithubIdpSettings {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub allowed_orgs: Vec<String>,
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

/// Pre-registered OAuth client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    pub grant_type: GrantType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    ClientCredentials,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::ClientCredentials => "client_credentials",
        }
    }
}

/// Persistence backend, discriminated by `type`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Sqlite(SqliteSettings),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SqliteSettings {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

/// Spawn instructions for one managed MCP server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Allowlist of original tool names; absent means expose everything.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

impl AppConfig {
    /// Load, substitute `${VAR}` references, deserialize, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&raw)
    }

    /// Parse a config document from a string (used by `load` and tests).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(raw: &str) -> Result<Self, ConfigError> {
        let mut value: Value = serde_json::from_str(raw)?;
        substitute_env(&mut value)?;
        let config: AppConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic rules, collecting every violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.server.port == 0 {
            problems.push("server.port: must be between 1 and 65535".to_string());
        }

        match &self.auth {
            Some(AuthConfig::Apikey(apikey)) => {
                let key = &apikey.api_key;
                let valid_len = (16..=128).contains(&key.len());
                let valid_chars = key
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
                if !valid_len || !valid_chars {
                    problems.push("auth.apiKey: must match [A-Za-z0-9_-]{16,128}".to_string());
                }
            }
            Some(AuthConfig::Oauth(oauth)) => {
                validate_oauth(oauth, &mut problems);
            }
            None => {}
        }

        for (name, server) in &self.mcp_servers {
            if name.is_empty() {
                problems.push("mcpServers: server name must be non-empty".to_string());
            }
            if name.contains(crate::namespace::SEPARATOR) {
                problems.push(format!(
                    "mcpServers.{name}: server name must not contain '__'"
                ));
            }
            if server.command.trim().is_empty() {
                problems.push(format!("mcpServers.{name}.command: must be non-empty"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

fn validate_oauth(oauth: &OAuthSettings, problems: &mut Vec<String>) {
    if let Some(issuer) = &oauth.issuer {
        if url::Url::parse(issuer).is_err() {
            problems.push(format!("auth.issuer: '{issuer}' is not an absolute URL"));
        }
    }

    if oauth.identity_providers.is_empty()
        && oauth.clients.is_empty()
        && !oauth.dynamic_registration
    {
        problems.push(
            "auth: oauth mode requires identityProviders, clients, or dynamicRegistration"
                .to_string(),
        );
    }

    if oauth.dynamic_registration && oauth.identity_providers.is_empty() {
        problems.push(
            "auth.dynamicRegistration: requires at least one identity provider".to_string(),
        );
    }

    let mut seen_provider_ids = Vec::new();
    for provider in &oauth.identity_providers {
        let id = provider.id();
        if seen_provider_ids.contains(&id) {
            problems.push(format!("auth.identityProviders: duplicate provider '{id}'"));
        }
        seen_provider_ids.push(id);

        if let IdentityProviderConfig::Local(local) = provider {
            if local.users.is_empty() {
                problems
                    .push("auth.identityProviders[local].users: must be non-empty".to_string());
            }
        }
    }

    for client in &oauth.clients {
        match client.grant_type {
            GrantType::ClientCredentials if client.client_secret.is_none() => {
                problems.push(format!(
                    "auth.clients.{}: client_credentials grant requires clientSecret",
                    client.client_id
                ));
            }
            GrantType::AuthorizationCode if client.redirect_uris.is_empty() => {
                problems.push(format!(
                    "auth.clients.{}: authorization_code grant requires at least one redirectUri",
                    client.client_id
                ));
            }
            _ => {}
        }
    }
}

/// Replace `${VAR}` references in every string leaf with process environment
/// values. Fails on the first unresolved variable.
fn substitute_env(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = substitute_str(s)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter_mut().try_for_each(substitute_env),
        Value::Object(map) => map.values_mut().try_for_each(substitute_env),
        _ => Ok(()),
    }
}

fn substitute_str(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // No closing brace: keep the literal text.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let var = &after[..end];
        match std::env::var(var) {
            Ok(resolved) => out.push_str(&resolved),
            Err(_) => return Err(ConfigError::UnresolvedVar(var.to_string())),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(json: &str) -> Result<AppConfig, ConfigError> {
        AppConfig::from_str(json)
    }

    #[test]
    fn test_minimal_config() {
        let config = parse("{}").unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.log.level, None);
        assert!(config.log.redact_secrets);
        assert!(config.auth.is_none());
        assert!(matches!(config.storage, StorageConfig::Memory));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(parse(r#"{"serverz": {}}"#).is_err());
        assert!(parse(r#"{"server": {"port": 1, "host": "x"}}"#).is_err());
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"{
                "server": {"port": 9090},
                "log": {"level": "debug", "format": "json", "mcpDebug": true},
                "auth": {
                    "type": "oauth",
                    "identityProviders": [
                        {"type": "local", "users": [{"username": "u", "password": "p"}]}
                    ],
                    "clients": [
                        {
                            "clientId": "public-client",
                            "redirectUris": ["http://localhost:3000/callback"],
                            "grantType": "authorization_code"
                        }
                    ],
                    "dynamicRegistration": true
                },
                "storage": {"type": "sqlite", "path": "/tmp/mcpbox.db"},
                "mcpServers": {
                    "mock": {"command": "mock-server", "args": ["--fast"], "tools": ["echo"]}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.log.format, LogFormat::Json);
        assert!(config.log.mcp_debug);
        let Some(AuthConfig::Oauth(oauth)) = &config.auth else {
            panic!("expected oauth auth config");
        };
        assert_eq!(oauth.identity_providers.len(), 1);
        assert!(oauth.dynamic_registration);
        assert_eq!(
            config.mcp_servers["mock"].tools.as_deref(),
            Some(&["echo".to_string()][..])
        );
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("MCPBOX_TEST_SECRET", "resolved-secret");
        let config =
            parse(r#"{"auth": {"type": "apikey", "apiKey": "${MCPBOX_TEST_SECRET}xxxx"}}"#)
                .unwrap();
        std::env::remove_var("MCPBOX_TEST_SECRET");
        let Some(AuthConfig::Apikey(apikey)) = &config.auth else {
            panic!("expected apikey auth config");
        };
        assert_eq!(apikey.api_key, "resolved-secretxxxx");
    }

    #[test]
    fn test_env_substitution_unresolved_aborts() {
        let err = parse(r#"{"auth": {"type": "apikey", "apiKey": "${MCPBOX_NO_SUCH_VAR}"}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedVar(v) if v == "MCPBOX_NO_SUCH_VAR"));
    }

    #[test]
    fn test_api_key_shape() {
        assert!(parse(r#"{"auth": {"type": "apikey", "apiKey": "short"}}"#).is_err());
        assert!(
            parse(r#"{"auth": {"type": "apikey", "apiKey": "has spaces here pad pad"}}"#).is_err()
        );
        assert!(parse(r#"{"auth": {"type": "apikey", "apiKey": "valid_key-0123456789"}}"#).is_ok());
    }

    #[test]
    fn test_oauth_requires_some_content() {
        let err = parse(r#"{"auth": {"type": "oauth"}}"#).unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("expected validation failure");
        };
        assert!(problems.iter().any(|p| p.contains("oauth mode requires")));
    }

    #[test]
    fn test_dynamic_registration_needs_idp() {
        let err =
            parse(r#"{"auth": {"type": "oauth", "dynamicRegistration": true}}"#).unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("expected validation failure");
        };
        assert!(problems
            .iter()
            .any(|p| p.contains("requires at least one identity provider")));
    }

    #[test]
    fn test_client_grant_rules() {
        // client_credentials without a secret
        let err = parse(
            r#"{"auth": {"type": "oauth", "clients": [
                {"clientId": "m2m", "grantType": "client_credentials"}
            ]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires clientSecret"));

        // authorization_code without redirect URIs
        let err = parse(
            r#"{"auth": {"type": "oauth", "clients": [
                {"clientId": "app", "grantType": "authorization_code"}
            ]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one redirectUri"));
    }

    #[test]
    fn test_server_name_with_separator_rejected() {
        let err = parse(r#"{"mcpServers": {"a__b": {"command": "x"}}}"#).unwrap_err();
        assert!(err.to_string().contains("must not contain '__'"));
    }

    #[test]
    fn test_port_zero_rejected() {
        let err = parse(r#"{"server": {"port": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("server.port"));
    }

    #[test]
    fn test_effective_log_level() {
        let config = parse(r#"{"log": {"level": "warn"}}"#).unwrap();
        assert_eq!(config.log.effective_level(), "warn");
    }

    #[test]
    fn test_effective_issuer_default() {
        let oauth = OAuthSettings::default();
        assert_eq!(oauth.effective_issuer(8080), "http://localhost:8080");
        let oauth = OAuthSettings {
            issuer: Some("https://mcp.example.com/".to_string()),
            ..Default::default()
        };
        assert_eq!(oauth.effective_issuer(8080), "https://mcp.example.com");
    }

    #[test]
    fn test_validation_collects_multiple_problems() {
        let err = parse(
            r#"{
                "server": {"port": 0},
                "mcpServers": {"bad__name": {"command": ""}}
            }"#,
        )
        .unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("expected validation failure");
        };
        assert!(problems.len() >= 3, "{problems:?}");
    }
}
