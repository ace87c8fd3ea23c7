//! Parsing of gateway result callbacks.
//!
//! Callbacks arrive at least once and sometimes with missing or oddly typed
//! fields. A bad field blanks that field only; a payload is rejected only when
//! it carries no correlation key at all.

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use thiserror::Error;

/// Result code the gateway uses for success
pub const SUCCESS_RESULT_CODE: &str = "0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("malformed callback: {0}")]
    Malformed(String),

    #[error("callback carries no correlation key")]
    MissingCorrelationKey,
}

/// Push-collection result (`Body.stkCallback`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionCallback {
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub result_code: String,
    pub result_desc: String,
    pub receipt_number: Option<String>,
    pub amount: Option<Decimal>,
    pub phone_number: Option<String>,
    pub transaction_date: Option<String>,
}

impl CollectionCallback {
    pub fn is_success(&self) -> bool {
        self.result_code == SUCCESS_RESULT_CODE
    }

    /// Keys to look the intent up by, most specific first
    pub fn correlation_keys(&self) -> Vec<String> {
        [&self.checkout_request_id, &self.merchant_request_id]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Disbursement result (`Result`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisbursementCallback {
    pub conversation_id: Option<String>,
    pub originator_conversation_id: Option<String>,
    pub result_code: String,
    pub result_desc: String,
    pub transaction_id: Option<String>,
    pub receipt_number: Option<String>,
    pub amount: Option<Decimal>,
    pub receiver: Option<String>,
    pub completed_at: Option<String>,
}

impl DisbursementCallback {
    pub fn is_success(&self) -> bool {
        self.result_code == SUCCESS_RESULT_CODE
    }

    /// Receipt to store: the explicit receipt parameter, else the transaction id
    pub fn receipt(&self) -> Option<String> {
        self.receipt_number
            .clone()
            .or_else(|| self.transaction_id.clone())
    }

    /// The originator id is generated locally and registered before submission,
    /// so it is tried first.
    pub fn correlation_keys(&self) -> Vec<String> {
        [&self.originator_conversation_id, &self.conversation_id]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Queue-timeout notification for either flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueTimeoutCallback {
    pub correlation_keys: Vec<String>,
    pub description: String,
}

pub fn parse_collection_callback(payload: &JsonValue) -> Result<CollectionCallback, CallbackError> {
    let callback = payload
        .pointer("/Body/stkCallback")
        .or_else(|| payload.get("stkCallback"))
        .ok_or_else(|| CallbackError::Malformed("missing Body.stkCallback".to_string()))?;

    let items = metadata_items(callback.pointer("/CallbackMetadata/Item"), "Name");
    let parsed = CollectionCallback {
        merchant_request_id: text(callback.get("MerchantRequestID")),
        checkout_request_id: text(callback.get("CheckoutRequestID")),
        result_code: text(callback.get("ResultCode"))
            .ok_or_else(|| CallbackError::Malformed("missing ResultCode".to_string()))?,
        result_desc: text(callback.get("ResultDesc")).unwrap_or_default(),
        receipt_number: text(lookup(&items, "MpesaReceiptNumber")),
        amount: lookup(&items, "Amount").and_then(decimal),
        phone_number: text(lookup(&items, "PhoneNumber")),
        transaction_date: text(lookup(&items, "TransactionDate")),
    };

    if parsed.correlation_keys().is_empty() {
        return Err(CallbackError::MissingCorrelationKey);
    }
    Ok(parsed)
}

pub fn parse_disbursement_callback(
    payload: &JsonValue,
) -> Result<DisbursementCallback, CallbackError> {
    let result = payload
        .get("Result")
        .ok_or_else(|| CallbackError::Malformed("missing Result".to_string()))?;

    let params = metadata_items(result.pointer("/ResultParameters/ResultParameter"), "Key");
    let parsed = DisbursementCallback {
        conversation_id: text(result.get("ConversationID")),
        originator_conversation_id: text(result.get("OriginatorConversationID")),
        result_code: text(result.get("ResultCode"))
            .ok_or_else(|| CallbackError::Malformed("missing ResultCode".to_string()))?,
        result_desc: text(result.get("ResultDesc")).unwrap_or_default(),
        transaction_id: text(result.get("TransactionID")),
        receipt_number: text(lookup(&params, "TransactionReceipt")),
        amount: lookup(&params, "TransactionAmount").and_then(decimal),
        receiver: text(lookup(&params, "ReceiverPartyPublicName")),
        completed_at: text(lookup(&params, "TransactionCompletedDateTime")),
    };

    if parsed.correlation_keys().is_empty() {
        return Err(CallbackError::MissingCorrelationKey);
    }
    Ok(parsed)
}

/// Queue timeouts come either in the regular result envelope or as a flat object.
pub fn parse_queue_timeout(payload: &JsonValue) -> Result<QueueTimeoutCallback, CallbackError> {
    let body = payload
        .get("Result")
        .or_else(|| payload.pointer("/Body/stkCallback"))
        .unwrap_or(payload);

    let correlation_keys: Vec<String> = [
        "OriginatorConversationID",
        "ConversationID",
        "CheckoutRequestID",
        "MerchantRequestID",
    ]
    .iter()
    .filter_map(|key| text(body.get(*key)))
    .collect();

    if correlation_keys.is_empty() {
        return Err(CallbackError::MissingCorrelationKey);
    }

    Ok(QueueTimeoutCallback {
        correlation_keys,
        description: text(body.get("ResultDesc"))
            .unwrap_or_else(|| "request timed out in gateway queue".to_string()),
    })
}

fn metadata_items<'a>(items: Option<&'a JsonValue>, name_key: &str) -> Vec<(String, &'a JsonValue)> {
    items
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let name = item.get(name_key)?.as_str()?.to_string();
                    let value = item.get("Value")?;
                    Some((name, value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn lookup<'a>(items: &[(String, &'a JsonValue)], name: &str) -> Option<&'a JsonValue> {
    items
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| *value)
}

fn text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decimal(value: &JsonValue) -> Option<Decimal> {
    match value {
        JsonValue::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        JsonValue::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn stk_success() -> JsonValue {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "Amount", "Value": 1.00},
                            {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                            {"Name": "Balance"},
                            {"Name": "TransactionDate", "Value": 20191219102115u64},
                            {"Name": "PhoneNumber", "Value": 254708374149u64}
                        ]
                    }
                }
            }
        })
    }

    #[test]
    fn parses_successful_collection() {
        let parsed = parse_collection_callback(&stk_success()).unwrap();
        assert!(parsed.is_success());
        assert_eq!(parsed.receipt_number.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(parsed.amount, Some(dec!(1)));
        assert_eq!(parsed.phone_number.as_deref(), Some("254708374149"));
        assert_eq!(parsed.transaction_date.as_deref(), Some("20191219102115"));
        assert_eq!(
            parsed.correlation_keys(),
            vec![
                "ws_CO_191220191020363925".to_string(),
                "29115-34620561-1".to_string()
            ]
        );
    }

    #[test]
    fn parses_failed_collection_without_metadata() {
        let payload = json!({
            "Body": {"stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_1",
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user"
            }}
        });
        let parsed = parse_collection_callback(&payload).unwrap();
        assert!(!parsed.is_success());
        assert_eq!(parsed.result_code, "1032");
        assert_eq!(parsed.result_desc, "Request cancelled by user");
        assert!(parsed.receipt_number.is_none());
    }

    #[test]
    fn malformed_metadata_items_only_blank_their_field() {
        let payload = json!({
            "Body": {"stkCallback": {
                "CheckoutRequestID": "ws_CO_2",
                "ResultCode": "0",
                "ResultDesc": "ok",
                "CallbackMetadata": {"Item": [
                    {"Name": "Amount", "Value": "not-a-number"},
                    {"Value": "orphan"},
                    {"Name": "MpesaReceiptNumber", "Value": "QWE123"}
                ]}
            }}
        });
        let parsed = parse_collection_callback(&payload).unwrap();
        assert!(parsed.is_success());
        assert!(parsed.amount.is_none());
        assert_eq!(parsed.receipt_number.as_deref(), Some("QWE123"));
    }

    #[test]
    fn collection_without_keys_is_rejected() {
        let payload = json!({"Body": {"stkCallback": {"ResultCode": 0}}});
        assert_eq!(
            parse_collection_callback(&payload).unwrap_err(),
            CallbackError::MissingCorrelationKey
        );
        assert!(matches!(
            parse_collection_callback(&json!({"foo": 1})),
            Err(CallbackError::Malformed(_))
        ));
    }

    #[test]
    fn parses_disbursement_result() {
        let payload = json!({
            "Result": {
                "ResultType": 0,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "OriginatorConversationID": "orig-123",
                "ConversationID": "AG_20191219_00005797af5d7d75f652",
                "TransactionID": "NLJ41HAY6Q",
                "ResultParameters": {"ResultParameter": [
                    {"Key": "TransactionAmount", "Value": 10},
                    {"Key": "TransactionReceipt", "Value": "NLJ41HAY6Q"},
                    {"Key": "ReceiverPartyPublicName", "Value": "254708374149 - John Doe"},
                    {"Key": "TransactionCompletedDateTime", "Value": "19.12.2019 11:45:50"}
                ]}
            }
        });
        let parsed = parse_disbursement_callback(&payload).unwrap();
        assert!(parsed.is_success());
        assert_eq!(parsed.amount, Some(dec!(10)));
        assert_eq!(parsed.receipt().as_deref(), Some("NLJ41HAY6Q"));
        assert_eq!(parsed.correlation_keys()[0], "orig-123");
    }

    #[test]
    fn failed_disbursement_keeps_description_verbatim() {
        let payload = json!({
            "Result": {
                "ResultCode": 2001,
                "ResultDesc": "The initiator information is invalid.",
                "ConversationID": "AG_1"
            }
        });
        let parsed = parse_disbursement_callback(&payload).unwrap();
        assert!(!parsed.is_success());
        assert_eq!(parsed.result_desc, "The initiator information is invalid.");
        assert_eq!(parsed.correlation_keys(), vec!["AG_1".to_string()]);
    }

    #[test]
    fn parses_queue_timeouts_in_both_shapes() {
        let wrapped = json!({"Result": {"ConversationID": "AG_9", "ResultDesc": "Queue timeout"}});
        let parsed = parse_queue_timeout(&wrapped).unwrap();
        assert_eq!(parsed.correlation_keys, vec!["AG_9".to_string()]);
        assert_eq!(parsed.description, "Queue timeout");

        let flat = json!({"CheckoutRequestID": "ws_CO_9"});
        let parsed = parse_queue_timeout(&flat).unwrap();
        assert_eq!(parsed.correlation_keys, vec!["ws_CO_9".to_string()]);

        assert!(parse_queue_timeout(&json!({})).is_err());
    }
}
