pub mod settlements;
pub mod webhooks;

use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::health::{self, HealthChecker};
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::services::settlement_orchestrator::SettlementOrchestrator;
use crate::services::webhook_processor::WebhookProcessor;

/// Everything the HTTP surface needs
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SettlementOrchestrator>,
    pub webhooks: Arc<WebhookProcessor>,
    pub callback_token: Option<String>,
    pub health: HealthChecker,
}

/// Full application router with request-id and logging layers
pub fn router(state: AppState) -> Router {
    let settlement_routes = settlements::routes(settlements::SettlementState {
        orchestrator: state.orchestrator,
    });
    let webhook_routes = webhooks::routes(webhooks::WebhookState {
        processor: state.webhooks,
        callback_token: state.callback_token,
    });

    Router::new()
        .merge(health::routes(state.health))
        .merge(settlement_routes)
        .merge(webhook_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
