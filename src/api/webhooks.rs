use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::database::webhook_inbox::WebhookFlow;
use crate::payments::providers::mpesa::callback_paths;
use crate::payments::utils::secure_eq;
use crate::services::webhook_processor::{WebhookProcessor, WebhookProcessorError};

pub struct WebhookState {
    pub processor: Arc<WebhookProcessor>,
    /// Expected `?token=` value; `None` disables the check
    pub callback_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub token: Option<String>,
}

pub fn routes(state: WebhookState) -> Router {
    Router::new()
        .route(callback_paths::COLLECTION_RESULT, post(collection_result))
        .route(callback_paths::COLLECTION_TIMEOUT, post(collection_timeout))
        .route(callback_paths::DISBURSEMENT_RESULT, post(disbursement_result))
        .route(callback_paths::DISBURSEMENT_TIMEOUT, post(disbursement_timeout))
        .with_state(Arc::new(state))
}

/// POST /webhooks/mpesa/collection/result
pub async fn collection_result(
    State(state): State<Arc<WebhookState>>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> Response {
    handle_webhook(&state, WebhookFlow::CollectionResult, query, &body).await
}

/// POST /webhooks/mpesa/collection/timeout
pub async fn collection_timeout(
    State(state): State<Arc<WebhookState>>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> Response {
    handle_webhook(&state, WebhookFlow::CollectionTimeout, query, &body).await
}

/// POST /webhooks/mpesa/disbursement/result
pub async fn disbursement_result(
    State(state): State<Arc<WebhookState>>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> Response {
    handle_webhook(&state, WebhookFlow::DisbursementResult, query, &body).await
}

/// POST /webhooks/mpesa/disbursement/timeout
pub async fn disbursement_timeout(
    State(state): State<Arc<WebhookState>>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> Response {
    handle_webhook(&state, WebhookFlow::DisbursementTimeout, query, &body).await
}

/// The gateway redelivers on anything but 2xx, so every parseable callback is
/// acknowledged. Failures stay in the inbox for the retry worker.
async fn handle_webhook(
    state: &WebhookState,
    flow: WebhookFlow,
    query: CallbackQuery,
    body: &str,
) -> Response {
    info!(flow = flow.as_str(), "Received webhook");

    if let Some(expected) = &state.callback_token {
        let authorised = query
            .token
            .as_deref()
            .is_some_and(|token| secure_eq(token.as_bytes(), expected.as_bytes()));
        if !authorised {
            warn!(flow = flow.as_str(), "Webhook with missing or invalid callback token");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"ResultCode": 1, "ResultDesc": "Unauthorized"})),
            )
                .into_response();
        }
    }

    let payload: JsonValue = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(e) => {
            error!(flow = flow.as_str(), error = %e, "Invalid JSON payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"ResultCode": 1, "ResultDesc": "Invalid JSON"})),
            )
                .into_response();
        }
    };

    match state.processor.process_webhook(flow, &payload).await {
        Ok(receipt) => {
            info!(flow = flow.as_str(), receipt = ?receipt, "Webhook handled");
        }
        Err(WebhookProcessorError::Malformed(e)) => {
            warn!(flow = flow.as_str(), error = %e, payload = %payload, "Unusable webhook payload");
        }
        Err(e) => {
            error!(flow = flow.as_str(), error = %e, "Webhook processing failed");
        }
    }

    accepted()
}

fn accepted() -> Response {
    (
        StatusCode::OK,
        Json(json!({"ResultCode": 0, "ResultDesc": "Accepted"})),
    )
        .into_response()
}
