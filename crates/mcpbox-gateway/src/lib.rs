//! mcpbox gateway internals.
//!
//! Three tightly coupled subsystems behind one HTTP endpoint:
//!
//! - [`mux`]: supervises the configured MCP child processes, merges their
//!   catalogues under namespaced identifiers, and routes calls back to the
//!   owning child over line-delimited JSON-RPC on stdio.
//! - [`oauth`]: an embedded OAuth 2.1 authorization server (authorization
//!   code + PKCE, client credentials, refresh rotation, RFC 7591 dynamic
//!   registration) backed by the pluggable state store.
//! - [`server`]: the axum router: discovery and auth endpoints, health, and
//!   the request/response Streamable-HTTP MCP dispatch.

pub mod crypto;
pub mod idp;
pub mod jsonrpc;
pub mod mux;
pub mod oauth;
pub mod server;

pub use mux::Multiplexer;
pub use oauth::OAuthServer;
pub use server::{build_router, AuthMode};
