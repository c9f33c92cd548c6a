//! keel-gateway — HTTP bridge between the bus and the outside world.
//!
//! Ingress: the fleet health monitor (or anything else) POSTs raw payloads
//! which are published on the bus. Egress: [`FleetForwarder`] relays every
//! fleet command published on the bus to the fleet's HTTP command receiver.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/feedback` | Publish health monitor feedback |
//! | POST | `/api/v1/subjects/{subject}` | Publish a raw payload on a subject |
//! | GET | `/api/v1/subjects/{subject}` | Subscriber count for a subject |
//! | GET | `/healthz` | Liveness |

pub mod error;
pub mod forwarder;
pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use keel_bus::MessageBus;
use keel_core::config::BusConfig;

pub use error::ForwardError;
pub use forwarder::{FleetForwarder, post_command};

/// Shared state for gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub bus: MessageBus,
    pub feedback_subject: String,
}

/// Build the gateway router.
pub fn build_router(bus: MessageBus, config: &BusConfig) -> Router {
    let state = GatewayState {
        bus,
        feedback_subject: config.feedback_subject.clone(),
    };

    let api_routes = Router::new()
        .route("/feedback", post(handlers::post_feedback))
        .route(
            "/subjects/{subject}",
            get(handlers::subject_info).post(handlers::publish),
        )
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
