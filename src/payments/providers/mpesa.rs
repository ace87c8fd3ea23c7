use crate::config::MpesaConfig;
use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::provider::{CollectionGateway, DisbursementGateway};
use crate::payments::token::{AccessTokenCache, FetchedToken};
use crate::payments::types::{
    to_gateway_amount, CollectionAck, CollectionRequest, CollectionStatus, DisbursementAck,
    DisbursementRequest,
};
use crate::payments::utils::{PaymentHttpClient, RequestAuth};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Webhook routes the gateway is told to call back on
pub mod callback_paths {
    pub const COLLECTION_RESULT: &str = "/webhooks/mpesa/collection/result";
    pub const COLLECTION_TIMEOUT: &str = "/webhooks/mpesa/collection/timeout";
    pub const DISBURSEMENT_RESULT: &str = "/webhooks/mpesa/disbursement/result";
    pub const DISBURSEMENT_TIMEOUT: &str = "/webhooks/mpesa/disbursement/timeout";
}

const TOKEN_PATH: &str = "/oauth/v1/generate?grant_type=client_credentials";
const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const STK_QUERY_PATH: &str = "/mpesa/stkpushquery/v1/query";
const B2C_PATH: &str = "/mpesa/b2c/v3/paymentrequest";

/// Error code the status query returns while the payer has not answered yet
const QUERY_PENDING_CODE: &str = "500.001.1001";

const ACCOUNT_REFERENCE_MAX: usize = 12;
const TRANSACTION_DESC_MAX: usize = 13;
const REMARKS_MAX: usize = 100;

pub struct MpesaGateway {
    config: MpesaConfig,
    http: PaymentHttpClient,
    tokens: AccessTokenCache,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig) -> GatewayResult<Self> {
        let http = PaymentHttpClient::new(config.request_timeout, config.max_retries)?;
        let tokens = AccessTokenCache::new(config.token_safety_margin);
        Ok(Self {
            config,
            http,
            tokens,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    pub async fn access_token(&self) -> GatewayResult<String> {
        self.tokens.get_or_refresh(|| self.fetch_token()).await
    }

    async fn fetch_token(&self) -> GatewayResult<FetchedToken> {
        let raw: TokenResponse = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(TOKEN_PATH),
                RequestAuth::Basic {
                    username: &self.config.consumer_key,
                    password: &self.config.consumer_secret,
                },
                None,
            )
            .await
            .map_err(|e| match e {
                GatewayError::Rejected { message, .. } => GatewayError::Auth { message },
                other => other,
            })?;

        let expires_in = value_text(raw.expires_in.as_ref())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3599);

        Ok(FetchedToken {
            access_token: raw.access_token,
            expires_in: Duration::from_secs(expires_in),
        })
    }

    /// Run `call` with a bearer token. A 401 invalidates the token and retries
    /// once with a fresh one; a second 401 is reported as gateway unavailable.
    async fn with_auth_retry<T, F, Fut>(&self, call: F) -> GatewayResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        call_with_token_refresh(&self.tokens, || self.fetch_token(), call).await
    }

    fn password(&self, timestamp: &str) -> String {
        STANDARD.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ))
    }

    pub(crate) fn stk_push_payload(
        &self,
        request: &CollectionRequest,
        now: DateTime<Utc>,
    ) -> GatewayResult<JsonValue> {
        let amount = to_gateway_amount(request.amount)?;
        let timestamp = gateway_timestamp(now);
        Ok(serde_json::json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount,
            "PartyA": request.payer_phone.as_str(),
            "PartyB": self.config.shortcode,
            "PhoneNumber": request.payer_phone.as_str(),
            "CallBackURL": self.config.callback_url(callback_paths::COLLECTION_RESULT),
            "AccountReference": truncate(&request.account_reference, ACCOUNT_REFERENCE_MAX),
            "TransactionDesc": truncate(&request.description, TRANSACTION_DESC_MAX),
        }))
    }

    pub(crate) fn stk_query_payload(&self, checkout_request_id: &str, now: DateTime<Utc>) -> JsonValue {
        let timestamp = gateway_timestamp(now);
        serde_json::json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "CheckoutRequestID": checkout_request_id,
        })
    }

    pub(crate) fn b2c_payload(&self, request: &DisbursementRequest) -> GatewayResult<JsonValue> {
        let amount = to_gateway_amount(request.amount)?;
        Ok(serde_json::json!({
            "OriginatorConversationID": request.originator_conversation_id,
            "InitiatorName": self.config.initiator_name,
            "SecurityCredential": self.config.security_credential,
            "CommandID": self.config.b2c_command_id,
            "Amount": amount,
            "PartyA": self.config.shortcode,
            "PartyB": request.payee_phone.as_str(),
            "Remarks": truncate(&request.remarks, REMARKS_MAX),
            "QueueTimeOutURL": self.config.callback_url(callback_paths::DISBURSEMENT_TIMEOUT),
            "ResultURL": self.config.callback_url(callback_paths::DISBURSEMENT_RESULT),
            "Occasion": request.occasion.clone().unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl CollectionGateway for MpesaGateway {
    async fn request_collection(
        &self,
        request: CollectionRequest,
    ) -> GatewayResult<CollectionAck> {
        let payload = self.stk_push_payload(&request, Utc::now())?;
        let url = self.endpoint(STK_PUSH_PATH);

        let raw: StkPushResponse = self
            .with_auth_retry(|token| {
                let (url, payload) = (&url, &payload);
                async move {
                    self.http
                        .submit_json(url, RequestAuth::Bearer(&token), payload)
                        .await
                }
            })
            .await?;

        let code = value_text(raw.response_code.as_ref()).unwrap_or_default();
        if code != "0" {
            return Err(GatewayError::Rejected {
                code: Some(code),
                message: raw
                    .response_description
                    .unwrap_or_else(|| "push request declined".to_string()),
            });
        }

        let checkout_request_id = raw.checkout_request_id.ok_or(GatewayError::InvalidResponse {
            message: "push response has no CheckoutRequestID".to_string(),
        })?;
        info!(
            checkout_request_id = %checkout_request_id,
            account_reference = %request.account_reference,
            "push collection accepted"
        );

        Ok(CollectionAck {
            merchant_request_id: raw.merchant_request_id.unwrap_or_default(),
            checkout_request_id,
            customer_message: raw.customer_message,
        })
    }

    async fn query_collection_status(
        &self,
        checkout_request_id: &str,
    ) -> GatewayResult<CollectionStatus> {
        let payload = self.stk_query_payload(checkout_request_id, Utc::now());
        let url = self.endpoint(STK_QUERY_PATH);

        let result: GatewayResult<StkQueryResponse> = self
            .with_auth_retry(|token| {
                let (url, payload) = (&url, &payload);
                async move {
                    self.http
                        .request_json(
                            reqwest::Method::POST,
                            url,
                            RequestAuth::Bearer(&token),
                            Some(payload),
                        )
                        .await
                }
            })
            .await;

        let raw = match result {
            Ok(raw) => raw,
            Err(GatewayError::Rejected { code, .. }) if code.as_deref() == Some(QUERY_PENDING_CODE) => {
                return Ok(CollectionStatus::Pending)
            }
            Err(GatewayError::Unavailable { message }) if is_still_processing(&message) => {
                return Ok(CollectionStatus::Pending)
            }
            Err(e) => return Err(e),
        };

        Ok(match value_text(raw.result_code.as_ref()) {
            Some(code) if code == "0" => CollectionStatus::Succeeded,
            Some(code) => CollectionStatus::Failed {
                code,
                reason: raw.result_desc.unwrap_or_default(),
            },
            None => CollectionStatus::Pending,
        })
    }
}

#[async_trait]
impl DisbursementGateway for MpesaGateway {
    async fn send_disbursement(
        &self,
        request: DisbursementRequest,
    ) -> GatewayResult<DisbursementAck> {
        let payload = self.b2c_payload(&request)?;
        let url = self.endpoint(B2C_PATH);

        let raw: B2cResponse = self
            .with_auth_retry(|token| {
                let (url, payload) = (&url, &payload);
                async move {
                    self.http
                        .submit_json(url, RequestAuth::Bearer(&token), payload)
                        .await
                }
            })
            .await?;

        let code = value_text(raw.response_code.as_ref()).unwrap_or_default();
        if code != "0" {
            return Err(GatewayError::Rejected {
                code: Some(code),
                message: raw
                    .response_description
                    .unwrap_or_else(|| "disbursement declined".to_string()),
            });
        }

        let conversation_id = raw.conversation_id.ok_or(GatewayError::InvalidResponse {
            message: "disbursement response has no ConversationID".to_string(),
        })?;
        info!(
            conversation_id = %conversation_id,
            originator_conversation_id = %request.originator_conversation_id,
            "disbursement accepted"
        );

        Ok(DisbursementAck {
            conversation_id,
            originator_conversation_id: raw
                .originator_conversation_id
                .unwrap_or(request.originator_conversation_id),
            response_description: raw.response_description,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    response_code: Option<JsonValue>,
    response_description: Option<String>,
    customer_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryResponse {
    result_code: Option<JsonValue>,
    result_desc: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct B2cResponse {
    #[serde(rename = "ConversationID")]
    conversation_id: Option<String>,
    #[serde(rename = "OriginatorConversationID")]
    originator_conversation_id: Option<String>,
    response_code: Option<JsonValue>,
    response_description: Option<String>,
}

async fn call_with_token_refresh<T, Tok, TokFut, F, Fut>(
    tokens: &AccessTokenCache,
    fetch: Tok,
    call: F,
) -> GatewayResult<T>
where
    Tok: Fn() -> TokFut,
    TokFut: Future<Output = GatewayResult<FetchedToken>>,
    F: Fn(String) -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let token = tokens.get_or_refresh(&fetch).await?;
    match call(token.clone()).await {
        Err(GatewayError::Auth { message }) => {
            warn!(reason = %message, "gateway rejected access token, refreshing");
            tokens.invalidate(&token).await;
            let fresh = tokens.get_or_refresh(&fetch).await?;
            call(fresh).await.map_err(|e| match e {
                GatewayError::Auth { message } => GatewayError::Unavailable {
                    message: format!("gateway rejected refreshed token: {}", message),
                },
                other => other,
            })
        }
        other => other,
    }
}

/// `YYYYMMDDHHMMSS` in East Africa Time (UTC+3)
pub fn gateway_timestamp(now: DateTime<Utc>) -> String {
    (now + ChronoDuration::hours(3))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

fn is_still_processing(message: &str) -> bool {
    message.to_ascii_lowercase().contains("being processed")
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn value_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::Msisdn;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn gateway() -> MpesaGateway {
        MpesaGateway::new(MpesaConfig {
            consumer_key: "key".to_string(),
            consumer_secret: "secret".to_string(),
            shortcode: "174379".to_string(),
            passkey: "passkey".to_string(),
            initiator_name: "testapi".to_string(),
            security_credential: "cred".to_string(),
            callback_base_url: "https://hooks.example.com/".to_string(),
            callback_token: Some("s3cret".to_string()),
            ..MpesaConfig::default()
        })
        .unwrap()
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 21, 30, 5).unwrap()
    }

    #[test]
    fn timestamp_is_east_africa_time() {
        assert_eq!(gateway_timestamp(fixed_now()), "20260302003005");
    }

    #[test]
    fn password_is_base64_of_shortcode_passkey_timestamp() {
        let gw = gateway();
        let decoded = STANDARD.decode(gw.password("20260302003005")).unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "174379passkey20260302003005"
        );
    }

    #[test]
    fn stk_push_payload_has_expected_fields() {
        let gw = gateway();
        let request = CollectionRequest {
            payer_phone: Msisdn::parse("0712345678", "254").unwrap(),
            amount: dec!(2500.50),
            account_reference: "BOOKING-000123".to_string(),
            description: "Booking payment".to_string(),
        };
        let payload = gw.stk_push_payload(&request, fixed_now()).unwrap();

        assert_eq!(payload["BusinessShortCode"], "174379");
        assert_eq!(payload["Timestamp"], "20260302003005");
        assert_eq!(payload["TransactionType"], "CustomerPayBillOnline");
        assert_eq!(payload["Amount"], 2501);
        assert_eq!(payload["PartyA"], "254712345678");
        assert_eq!(payload["PartyB"], "174379");
        assert_eq!(payload["PhoneNumber"], "254712345678");
        assert_eq!(
            payload["CallBackURL"],
            "https://hooks.example.com/webhooks/mpesa/collection/result?token=s3cret"
        );
        assert_eq!(payload["AccountReference"], "BOOKING-0001");
        assert_eq!(payload["TransactionDesc"], "Booking payme");
    }

    #[test]
    fn stk_push_rejects_zero_amount() {
        let gw = gateway();
        let request = CollectionRequest {
            payer_phone: Msisdn::parse("0712345678", "254").unwrap(),
            amount: dec!(0),
            account_reference: "BK1".to_string(),
            description: "Booking".to_string(),
        };
        assert!(matches!(
            gw.stk_push_payload(&request, fixed_now()),
            Err(GatewayError::Validation { .. })
        ));
    }

    #[test]
    fn b2c_payload_carries_originator_id_and_callbacks() {
        let gw = gateway();
        let request = DisbursementRequest {
            payee_phone: Msisdn::parse("+254700000001", "254").unwrap(),
            amount: dec!(9000),
            remarks: "Owner payout".to_string(),
            originator_conversation_id: "intent-42".to_string(),
            occasion: Some("BK42".to_string()),
        };
        let payload = gw.b2c_payload(&request).unwrap();

        assert_eq!(payload["OriginatorConversationID"], "intent-42");
        assert_eq!(payload["InitiatorName"], "testapi");
        assert_eq!(payload["CommandID"], "BusinessPayment");
        assert_eq!(payload["Amount"], 9000);
        assert_eq!(payload["PartyA"], "174379");
        assert_eq!(payload["PartyB"], "254700000001");
        assert_eq!(payload["Occasion"], "BK42");
        assert_eq!(
            payload["ResultURL"],
            "https://hooks.example.com/webhooks/mpesa/disbursement/result?token=s3cret"
        );
        assert_eq!(
            payload["QueueTimeOutURL"],
            "https://hooks.example.com/webhooks/mpesa/disbursement/timeout?token=s3cret"
        );
    }

    #[test]
    fn query_payload_reuses_password_scheme() {
        let gw = gateway();
        let payload = gw.stk_query_payload("ws_CO_1", fixed_now());
        assert_eq!(payload["CheckoutRequestID"], "ws_CO_1");
        assert_eq!(payload["Password"], gw.password("20260302003005"));
    }

    #[test]
    fn response_structs_accept_numeric_codes() {
        let raw: StkQueryResponse =
            serde_json::from_str(r#"{"ResponseCode":"0","ResultCode":1032,"ResultDesc":"Request cancelled by user"}"#)
                .unwrap();
        assert_eq!(value_text(raw.result_code.as_ref()).as_deref(), Some("1032"));

        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","expires_in":"3599"}"#).unwrap();
        assert_eq!(value_text(token.expires_in.as_ref()).as_deref(), Some("3599"));
    }

    fn counting_fetch(
        fetches: &AtomicUsize,
    ) -> impl Fn() -> std::future::Ready<GatewayResult<FetchedToken>> + '_ {
        move || {
            let n = fetches.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(Ok(FetchedToken {
                access_token: format!("tok-{}", n),
                expires_in: Duration::from_secs(3599),
            }))
        }
    }

    /// Rejects the first `rejections` tokens it is called with
    fn rejecting_call(
        seen: &StdMutex<Vec<String>>,
        rejections: usize,
    ) -> impl Fn(String) -> std::future::Ready<GatewayResult<String>> + '_ {
        move |token| {
            let mut seen = seen.lock().unwrap();
            seen.push(token.clone());
            let result = if seen.len() <= rejections {
                Err(GatewayError::Auth {
                    message: "Invalid Access Token".to_string(),
                })
            } else {
                Ok(token)
            };
            std::future::ready(result)
        }
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_and_call_retried_once() {
        let tokens = AccessTokenCache::new(Duration::from_secs(60));
        let fetches = AtomicUsize::new(0);
        let seen = StdMutex::new(Vec::new());

        let result =
            call_with_token_refresh(&tokens, counting_fetch(&fetches), rejecting_call(&seen, 1))
                .await
                .unwrap();

        assert_eq!(result, "tok-2");
        assert_eq!(*seen.lock().unwrap(), vec!["tok-1".to_string(), "tok-2".to_string()]);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);

        // The refreshed token replaced the rejected one
        let cached = tokens.get_or_refresh(counting_fetch(&fetches)).await.unwrap();
        assert_eq!(cached, "tok-2");
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_rejection_reports_gateway_unavailable() {
        let tokens = AccessTokenCache::new(Duration::from_secs(60));
        let fetches = AtomicUsize::new(0);
        let seen = StdMutex::new(Vec::new());

        let err =
            call_with_token_refresh(&tokens, counting_fetch(&fetches), rejecting_call(&seen, 2))
                .await
                .unwrap_err();

        assert!(matches!(err, GatewayError::Unavailable { .. }), "got {err:?}");
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let tokens = AccessTokenCache::new(Duration::from_secs(60));
        let fetches = AtomicUsize::new(0);
        let calls = AtomicUsize::new(0);

        let err = call_with_token_refresh(&tokens, counting_fetch(&fetches), |_token| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<(), _>(GatewayError::Timeout { timeout_secs: 30 }))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, GatewayError::Timeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }
}
