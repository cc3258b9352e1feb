//! HTTP surface of the gateway.
//!
//! Route layout:
//!
//! | route | auth | handler |
//! |---|---|---|
//! | `GET /health` | none | liveness probe |
//! | `GET /logo.png` &c. | none | cached PNG |
//! | `GET /.well-known/*`, `/authorize`, `/token`, `/register`, `/callback/*` | none | OAuth server (when configured) |
//! | `GET /status` | protected | per-child health |
//! | `POST /`, `POST /mcp` | protected | JSON-RPC dispatch |
//! | anything else | - | 404 JSON |

mod auth;
mod handlers;
mod rate_limit;
mod trace;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::{Extension, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::mux::Multiplexer;
use crate::oauth::OAuthServer;

pub use auth::{AuthContext, AuthMode};
pub use rate_limit::{default_oauth_rate_limiter, RateLimiter};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub mux: Arc<Multiplexer>,
    pub auth: AuthMode,
}

/// Assemble the full router.
pub fn build_router(
    mux: Arc<Multiplexer>,
    auth: AuthMode,
    oauth: Option<Arc<OAuthServer>>,
) -> Router {
    let state = AppState { mux, auth };

    let protected = Router::new()
        .route("/", post(handlers::mcp))
        .route("/mcp", post(handlers::mcp))
        .route("/status", get(handlers::status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .with_state(state);

    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/logo.png", get(handlers::icon))
        .route("/favicon.ico", get(handlers::icon))
        .route("/icon.png", get(handlers::icon))
        .route("/favicon.png", get(handlers::icon));

    let mut router = public.merge(protected);
    if let Some(oauth) = oauth {
        router = router.merge(crate::oauth::router(oauth));
    }

    router
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace::http_logging_middleware))
        .layer(middleware::from_fn(rate_limit::rate_limit_middleware))
        .layer(Extension(rate_limit::default_oauth_rate_limiter()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
