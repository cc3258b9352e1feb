//! Core types for the mcpbox gateway.
//!
//! Holds everything the other crates agree on but that performs no I/O of its
//! own: the configuration schema and loader, the `server__name` namespace
//! codec, and log redaction helpers.

pub mod config;
pub mod namespace;
pub mod redact;

pub use config::{AppConfig, ConfigError};

/// Name reported to MCP servers and clients during the handshake.
pub const GATEWAY_NAME: &str = "mcpbox";

/// MCP protocol revision this gateway speaks.
pub const PROTOCOL_VERSION: &str = "2025-11-25";

/// Environment variable that disables tool/resource/prompt namespacing.
///
/// Conformance-suite switch only; not part of the configuration surface.
pub const SKIP_NAMESPACE_ENV: &str = "__MCPBOX_SKIP_NAMESPACE";
