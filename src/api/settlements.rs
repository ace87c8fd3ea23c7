//! Settlement endpoints: collections, refunds, owner payouts, retries and
//! the per-booking status view.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::intent::{IntentBreakdown, IntentKind, IntentState};
use crate::error::AppError;
use crate::middleware::error::{get_request_id_from_headers, ErrorResponse};
use crate::services::amount_policy::{parse_timestamp, RefundQuote};
use crate::services::settlement_orchestrator::{
    FlowResult, OrchestratorError, SettlementOrchestrator, SettlementStatus,
};

#[derive(Clone)]
pub struct SettlementState {
    pub orchestrator: Arc<SettlementOrchestrator>,
}

pub fn routes(state: SettlementState) -> Router {
    Router::new()
        .route("/api/settlements/collections", post(create_collection))
        .route("/api/settlements/refunds", post(create_refund))
        .route("/api/settlements/payouts", post(create_payout))
        .route(
            "/api/settlements/disbursements/{intent_id}/retry",
            post(retry_disbursement),
        )
        .route("/api/settlements/bookings/{booking_id}", get(get_settlement_status))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CollectionRequest {
    pub booking_id: i64,
    pub phone: String,
    /// Must equal the booking total when given
    pub amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub booking_id: i64,
    /// RFC 3339 or naive UTC; defaults to the booking's cancellation time, then now
    pub cancelled_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PayoutRequest {
    pub booking_id: i64,
    pub owner_phone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FlowResponse {
    pub success: bool,
    pub status: IntentState,
    pub intent_id: Uuid,
    pub booking_id: i64,
    pub kind: IntentKind,
    pub amount: Decimal,
    pub currency: String,
    pub attempt: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<Uuid>,
    pub breakdown: IntentBreakdown,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund: Option<RefundQuote>,
}

impl From<FlowResult> for FlowResponse {
    fn from(result: FlowResult) -> Self {
        let intent = result.intent;
        Self {
            success: true,
            status: intent.state,
            intent_id: intent.id,
            booking_id: intent.booking_id,
            kind: intent.kind,
            amount: intent.amount,
            currency: intent.currency,
            attempt: intent.attempt,
            retry_of: intent.retry_of,
            breakdown: intent.breakdown,
            message: result.customer_message,
            refund: result.refund,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub success: bool,
    #[serde(flatten)]
    pub settlement: SettlementStatus,
}

/// POST /api/settlements/collections
pub async fn create_collection(
    State(state): State<SettlementState>,
    headers: HeaderMap,
    Json(request): Json<CollectionRequest>,
) -> Response {
    info!(booking_id = request.booking_id, "Collection requested");
    let result = state
        .orchestrator
        .collect(request.booking_id, &request.phone, request.amount)
        .await;
    flow_response(result, &headers)
}

/// POST /api/settlements/refunds
pub async fn create_refund(
    State(state): State<SettlementState>,
    headers: HeaderMap,
    Json(request): Json<RefundRequest>,
) -> Response {
    info!(booking_id = request.booking_id, "Refund requested");
    let cancelled_at = match request.cancelled_at.as_deref().map(parse_timestamp) {
        Some(Ok(at)) => Some(at),
        Some(Err(e)) => return error_response(e.into(), &headers),
        None => None,
    };
    let result = state
        .orchestrator
        .refund(request.booking_id, cancelled_at)
        .await;
    flow_response(result, &headers)
}

/// POST /api/settlements/payouts
pub async fn create_payout(
    State(state): State<SettlementState>,
    headers: HeaderMap,
    Json(request): Json<PayoutRequest>,
) -> Response {
    info!(booking_id = request.booking_id, "Owner payout requested");
    let result = state
        .orchestrator
        .pay_owner(request.booking_id, request.owner_phone.as_deref())
        .await;
    flow_response(result, &headers)
}

/// POST /api/settlements/disbursements/{intent_id}/retry
pub async fn retry_disbursement(
    State(state): State<SettlementState>,
    headers: HeaderMap,
    Path(intent_id): Path<Uuid>,
) -> Response {
    info!(intent_id = %intent_id, "Disbursement retry requested");
    let result = state.orchestrator.retry_disbursement(intent_id).await;
    flow_response(result, &headers)
}

/// GET /api/settlements/bookings/{booking_id}
pub async fn get_settlement_status(
    State(state): State<SettlementState>,
    headers: HeaderMap,
    Path(booking_id): Path<i64>,
) -> Response {
    match state.orchestrator.settlement_status(booking_id).await {
        Ok(settlement) => Json(StatusResponse {
            success: true,
            settlement,
        })
        .into_response(),
        Err(e) => orchestrator_error(e, &headers),
    }
}

fn flow_response(result: Result<FlowResult, OrchestratorError>, headers: &HeaderMap) -> Response {
    match result {
        Ok(result) => {
            // Non-terminal means the gateway still owes us a result
            let status = if result.intent.is_terminal() {
                StatusCode::OK
            } else {
                StatusCode::ACCEPTED
            };
            (status, Json(FlowResponse::from(result))).into_response()
        }
        Err(e) => orchestrator_error(e, headers),
    }
}

/// Submission failures also name the intent so the caller can retry it.
fn orchestrator_error(err: OrchestratorError, headers: &HeaderMap) -> Response {
    let intent_id = match &err {
        OrchestratorError::Submission { intent_id, .. } => Some(*intent_id),
        _ => None,
    };
    let app_error: AppError = err.into();

    match intent_id {
        Some(intent_id) => {
            let app_error = with_request_id(app_error, headers);
            warn!(
                intent_id = %intent_id,
                request_id = ?app_error.request_id,
                error = %app_error,
                "Gateway submission failed"
            );
            let status = StatusCode::from_u16(app_error.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = ErrorResponse::from_app_error(&app_error)
                .with_details(serde_json::json!({ "intent_id": intent_id }));
            (status, Json(body)).into_response()
        }
        None => error_response(app_error, headers),
    }
}

fn error_response(err: AppError, headers: &HeaderMap) -> Response {
    with_request_id(err, headers).into_response()
}

fn with_request_id(err: AppError, headers: &HeaderMap) -> AppError {
    match get_request_id_from_headers(headers) {
        Some(request_id) => err.with_request_id(request_id),
        None => err,
    }
}
