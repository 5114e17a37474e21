//! HTTP gateway: authentication, session routes and event streams.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ TLS  ┌───────────────┐      ┌─────────────────┐
//! │ Mobile/Web   │─────▶│ GatewayServer │─────▶│   axum Router   │
//! │   client     │      │ (accept loop) │      │ protocol + auth │
//! └──────────────┘      └───────┬───────┘      └────────┬────────┘
//!                               │ current               │
//!                               │ ServerConfig          ▼
//!                       ┌───────┴────────┐     ┌─────────────────┐
//!                       │ Certificate    │     │ RegistryHandle  │
//!                       │ Manager        │     └────────┬────────┘
//!                       └───────┬────────┘              │ attach
//!                               │ changes               ▼
//!                       ┌───────┴────────┐     ┌─────────────────┐
//!                       │   EventHub     │     │ SessionFeed SSE │
//!                       │  GET /events   │     │ /session/{id}/… │
//!                       └────────────────┘     └─────────────────┘
//! ```
//!
//! | route | auth | success |
//! |---|---|---|
//! | `POST /session` | yes | 201 (200 when resuming by id) |
//! | `GET /sessions` | yes | 200 |
//! | `GET /session/{id}` | yes | 200 |
//! | `GET /session/{id}/events` | yes | 200 SSE |
//! | `POST /session/{id}/input` | yes | 202 |
//! | `DELETE /session/{id}` | yes | 204 |
//! | `GET /events` | yes | 200 SSE |
//! | `POST /certificate/reload` | yes | 200 |
//! | `GET /certificate` | no | 200 |
//! | `GET /health` | no | 200 |

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::{middleware, Router};

mod auth;
mod error;
mod hub;
mod routes;
mod server;
mod stream;

pub use auth::{authenticate, Authenticated, API_KEY_HEADER, DEVICE_ID_HEADER};
pub use error::ApiError;
pub use hub::{spawn_certificate_watcher, EventHub};
pub use server::{GatewayServer, ServerError};
pub use stream::{session_frames, to_sse};

use crate::certs::CertificateManager;
use crate::registry::RegistryHandle;

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Shared secret every authenticated request must present
    pub api_key: String,
    /// Period of heartbeat frames on event streams
    pub heartbeat_interval: Duration,
    /// Minimum spacing of global events with the same name
    pub event_rate_limit: Duration,
}

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub config: Arc<GatewayConfig>,
    pub certs: Arc<CertificateManager>,
    pub hub: EventHub,
    pub started: Instant,
}

impl AppState {
    pub fn new(registry: RegistryHandle, config: GatewayConfig, certs: Arc<CertificateManager>) -> Self {
        let hub = EventHub::new(config.event_rate_limit);
        Self {
            registry,
            config: Arc::new(config),
            certs,
            hub,
            started: Instant::now(),
        }
    }
}

/// Builds the router with all routes and middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/session", post(routes::create_session))
        .route("/sessions", get(routes::list_sessions))
        .route(
            "/session/{id}",
            get(routes::get_session).delete(routes::terminate_session),
        )
        .route("/session/{id}/events", get(routes::session_events))
        .route("/session/{id}/input", post(routes::send_input))
        .route("/events", get(routes::global_events))
        .route("/health", get(routes::health))
        .route("/certificate", get(routes::certificate))
        .route("/certificate/reload", post(routes::reload_certificate))
        .layer(middleware::from_fn(auth::protocol_version))
        .with_state(state)
}
