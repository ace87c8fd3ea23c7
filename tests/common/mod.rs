#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use booking_settlement::api::{self, AppState};
use booking_settlement::config::SettlementConfig;
use booking_settlement::database::booking_repository::{
    Booking, BookingRepository, BookingStatus, InMemoryBookingRepository, PayoutStatus,
    RefundStatus,
};
use booking_settlement::database::error::DatabaseError;
use booking_settlement::database::intent::Intent;
use booking_settlement::database::ledger::Ledger;
use booking_settlement::database::memory_ledger::MemoryLedger;
use booking_settlement::database::webhook_inbox::MemoryWebhookInbox;
use booking_settlement::health::HealthChecker;
use booking_settlement::payments::error::{GatewayError, GatewayResult};
use booking_settlement::payments::provider::{CollectionGateway, DisbursementGateway};
use booking_settlement::payments::types::{
    CollectionAck, CollectionRequest, CollectionStatus, DisbursementAck, DisbursementRequest,
};
use booking_settlement::services::notification::{
    Notification, NotificationDispatcher, NotificationTemplate,
};
use booking_settlement::services::{OrchestratorDeps, SettlementOrchestrator, WebhookProcessor};

pub const GUEST_PHONE: &str = "254712345678";
pub const OWNER_PHONE: &str = "254722000111";

/// Gateway double. Answers are scripted per call; unscripted calls succeed
/// with generated identifiers.
#[derive(Default)]
pub struct FakeGateway {
    collection_answers: Mutex<VecDeque<GatewayResult<CollectionAck>>>,
    disbursement_answers: Mutex<VecDeque<GatewayResult<DisbursementAck>>>,
    status_answers: Mutex<VecDeque<GatewayResult<CollectionStatus>>>,
    pub collections: Mutex<Vec<CollectionRequest>>,
    pub disbursements: Mutex<Vec<DisbursementRequest>>,
    pub status_queries: Mutex<Vec<String>>,
}

impl FakeGateway {
    pub fn script_collection(&self, answer: GatewayResult<CollectionAck>) {
        self.collection_answers.lock().unwrap().push_back(answer);
    }

    pub fn script_disbursement(&self, answer: GatewayResult<DisbursementAck>) {
        self.disbursement_answers.lock().unwrap().push_back(answer);
    }

    pub fn script_status(&self, answer: GatewayResult<CollectionStatus>) {
        self.status_answers.lock().unwrap().push_back(answer);
    }

    pub fn collection_count(&self) -> usize {
        self.collections.lock().unwrap().len()
    }

    pub fn disbursement_count(&self) -> usize {
        self.disbursements.lock().unwrap().len()
    }

    pub fn last_disbursement(&self) -> DisbursementRequest {
        self.disbursements
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no disbursement sent")
    }
}

#[async_trait]
impl CollectionGateway for FakeGateway {
    async fn request_collection(&self, request: CollectionRequest) -> GatewayResult<CollectionAck> {
        let n = {
            let mut sent = self.collections.lock().unwrap();
            sent.push(request);
            sent.len()
        };
        self.collection_answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(collection_ack(n)))
    }

    async fn query_collection_status(
        &self,
        checkout_request_id: &str,
    ) -> GatewayResult<CollectionStatus> {
        self.status_queries
            .lock()
            .unwrap()
            .push(checkout_request_id.to_string());
        self.status_answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(CollectionStatus::Pending))
    }
}

#[async_trait]
impl DisbursementGateway for FakeGateway {
    async fn send_disbursement(
        &self,
        request: DisbursementRequest,
    ) -> GatewayResult<DisbursementAck> {
        let originator = request.originator_conversation_id.clone();
        let n = {
            let mut sent = self.disbursements.lock().unwrap();
            sent.push(request);
            sent.len()
        };
        self.disbursement_answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(DisbursementAck {
                    conversation_id: format!("AG_2026_{:04}", n),
                    originator_conversation_id: originator,
                    response_description: Some("Accept the service request successfully.".to_string()),
                })
            })
    }
}

/// Booking store whose next writes can be made to fail
#[derive(Default)]
pub struct FailingBookings {
    inner: Arc<InMemoryBookingRepository>,
    failing_writes: AtomicUsize,
}

impl FailingBookings {
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), DatabaseError> {
        let left = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match left {
            Ok(_) => Err(DatabaseError::unknown("connection reset".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl BookingRepository for FailingBookings {
    async fn get_booking(&self, booking_id: i64) -> Result<Option<Booking>, DatabaseError> {
        self.inner.get_booking(booking_id).await
    }

    async fn confirm_booking(&self, booking_id: i64) -> Result<bool, DatabaseError> {
        self.check_write()?;
        self.inner.confirm_booking(booking_id).await
    }

    async fn update_payout_status(
        &self,
        booking_id: i64,
        status: PayoutStatus,
    ) -> Result<bool, DatabaseError> {
        self.check_write()?;
        self.inner.update_payout_status(booking_id, status).await
    }

    async fn update_refund_status(
        &self,
        booking_id: i64,
        status: RefundStatus,
    ) -> Result<bool, DatabaseError> {
        self.check_write()?;
        self.inner.update_refund_status(booking_id, status).await
    }
}

pub fn collection_ack(n: usize) -> CollectionAck {
    CollectionAck {
        merchant_request_id: format!("29115-{}", n),
        checkout_request_id: format!("ws_CO_{:04}", n),
        customer_message: Some("Success. Request accepted for processing".to_string()),
    }
}

pub fn rejected(code: &str, message: &str) -> GatewayError {
    GatewayError::Rejected {
        code: Some(code.to_string()),
        message: message.to_string(),
    }
}

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub bookings: Arc<InMemoryBookingRepository>,
    pub booking_faults: Arc<FailingBookings>,
    pub inbox: Arc<MemoryWebhookInbox>,
    pub gateway: Arc<FakeGateway>,
    pub orchestrator: Arc<SettlementOrchestrator>,
    pub processor: Arc<WebhookProcessor>,
    notifications: mpsc::Receiver<Notification>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SettlementConfig::default())
    }

    pub fn with_config(config: SettlementConfig) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let bookings = Arc::new(InMemoryBookingRepository::new());
        let booking_faults = Arc::new(FailingBookings {
            inner: bookings.clone(),
            failing_writes: AtomicUsize::new(0),
        });
        let inbox = Arc::new(MemoryWebhookInbox::new());
        let gateway = Arc::new(FakeGateway::default());
        let (dispatcher, notifications) = NotificationDispatcher::new(256);

        let orchestrator = Arc::new(SettlementOrchestrator::new(
            OrchestratorDeps {
                ledger: ledger.clone(),
                bookings: booking_faults.clone(),
                payees: bookings.clone(),
                collections: gateway.clone(),
                disbursements: gateway.clone(),
                notifications: dispatcher,
            },
            config,
        ));
        let processor = Arc::new(WebhookProcessor::new(inbox.clone(), orchestrator.clone()));

        Self {
            ledger,
            bookings,
            booking_faults,
            inbox,
            gateway,
            orchestrator,
            processor,
            notifications,
        }
    }

    pub fn router(&self, callback_token: Option<&str>) -> Router {
        api::router(AppState {
            orchestrator: self.orchestrator.clone(),
            webhooks: self.processor.clone(),
            callback_token: callback_token.map(str::to_string),
            health: HealthChecker::new(None),
        })
    }

    /// Everything enqueued so far
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut drained = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            drained.push(n);
        }
        drained
    }

    pub fn templates(&mut self) -> Vec<NotificationTemplate> {
        self.drain_notifications()
            .into_iter()
            .map(|n| n.template)
            .collect()
    }

    pub async fn booking(&self, id: i64) -> Booking {
        self.bookings
            .get_booking(id)
            .await
            .unwrap()
            .expect("booking exists")
    }

    pub async fn ledger_intent(&self, intent_id: Uuid) -> Intent {
        self.ledger
            .get_intent(intent_id)
            .await
            .unwrap()
            .expect("intent exists")
    }

    pub async fn insert(&self, booking: Booking) {
        self.bookings.insert(booking).await;
    }

    /// The booking service cancelling a booking
    pub async fn cancel(&self, id: i64, at: DateTime<Utc>) {
        let mut booking = self.booking(id).await;
        booking.status = BookingStatus::Cancelled;
        booking.cancelled_at = Some(at);
        self.insert(booking).await;
    }

    pub fn count(&mut self, template: NotificationTemplate) -> usize {
        self.drain_notifications()
            .into_iter()
            .filter(|n| n.template == template)
            .count()
    }
}

pub fn booking(id: i64, status: BookingStatus, total: Decimal) -> Booking {
    Booking {
        id,
        guest_id: 100 + id,
        guest_phone: Some(GUEST_PHONE.to_string()),
        property_id: 200 + id,
        owner_id: 300 + id,
        total_amount: Some(total),
        check_in: Utc::now() + Duration::days(10),
        status,
        payout_status: PayoutStatus::Pending,
        refund_status: RefundStatus::None,
        is_deleted: false,
        cancelled_at: None,
    }
}

pub fn check_in_in_hours(mut booking: Booking, hours: i64, from: DateTime<Utc>) -> Booking {
    booking.check_in = from + Duration::hours(hours);
    booking
}

pub fn stk_success(checkout: &str, merchant: &str, amount: u64, receipt: &str) -> JsonValue {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": merchant,
                "CheckoutRequestID": checkout,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        {"Name": "Amount", "Value": amount},
                        {"Name": "MpesaReceiptNumber", "Value": receipt},
                        {"Name": "TransactionDate", "Value": 20260318101500u64},
                        {"Name": "PhoneNumber", "Value": 254712345678u64}
                    ]
                }
            }
        }
    })
}

pub fn stk_failure(checkout: &str, merchant: &str, code: i64, desc: &str) -> JsonValue {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": merchant,
                "CheckoutRequestID": checkout,
                "ResultCode": code,
                "ResultDesc": desc
            }
        }
    })
}

pub fn b2c_result(originator: &str, conversation: &str, code: i64, desc: &str) -> JsonValue {
    let mut result = json!({
        "Result": {
            "ResultType": 0,
            "ResultCode": code,
            "ResultDesc": desc,
            "OriginatorConversationID": originator,
            "ConversationID": conversation,
            "TransactionID": "NLJ41HAY6Q"
        }
    });
    if code == 0 {
        result["Result"]["ResultParameters"] = json!({
            "ResultParameter": [
                {"Key": "TransactionAmount", "Value": 9000},
                {"Key": "TransactionReceipt", "Value": "NLJ41HAY6Q"},
                {"Key": "ReceiverPartyPublicName", "Value": "254722000111 - Jane Doe"}
            ]
        });
    }
    result
}

pub fn queue_timeout(originator: &str) -> JsonValue {
    json!({
        "Result": {
            "ResultType": 1,
            "ResultCode": 1,
            "ResultDesc": "The service request timed out.",
            "OriginatorConversationID": originator
        }
    })
}
