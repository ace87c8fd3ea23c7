use crate::payments::error::{GatewayError, GatewayResult};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, warn};

/// How a request authenticates against the gateway
#[derive(Debug, Clone, Copy)]
pub enum RequestAuth<'a> {
    None,
    Basic { username: &'a str, password: &'a str },
    Bearer(&'a str),
}

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(timeout: Duration, max_retries: u32) -> GatewayResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| GatewayError::Network {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            timeout,
            max_retries,
        })
    }

    /// Idempotent request (token, status query): retried on 429, 5xx and network errors.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        auth: RequestAuth<'_>,
        body: Option<&JsonValue>,
    ) -> GatewayResult<T> {
        self.send_with_retries(method, url, auth, body, self.max_retries)
            .await
    }

    /// Money-moving request: sent exactly once.
    pub async fn submit_json<T: DeserializeOwned>(
        &self,
        url: &str,
        auth: RequestAuth<'_>,
        body: &JsonValue,
    ) -> GatewayResult<T> {
        self.send_with_retries(reqwest::Method::POST, url, auth, Some(body), 0)
            .await
    }

    async fn send_with_retries<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        auth: RequestAuth<'_>,
        body: Option<&JsonValue>,
        max_retries: u32,
    ) -> GatewayResult<T> {
        let mut last_error = None;
        for attempt in 0..=max_retries {
            let mut request = self.client.request(method.clone(), url);
            request = request.timeout(self.timeout);

            request = match auth {
                RequestAuth::None => request,
                RequestAuth::Basic { username, password } => {
                    request.basic_auth(username, Some(password))
                }
                RequestAuth::Bearer(token) => request.bearer_auth(token),
            };
            if let Some(payload) = body {
                request = request.json(payload);
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout {
                        timeout_secs: self.timeout.as_secs(),
                    }
                } else {
                    GatewayError::Network {
                        message: format!("gateway request failed: {}", e),
                    }
                }
            });

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        debug!(url = %url, status = %status, "gateway call succeeded");
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            GatewayError::InvalidResponse {
                                message: format!("invalid gateway JSON response: {}", e),
                            }
                        });
                    }

                    let retryable = status == StatusCode::TOO_MANY_REQUESTS
                        || status.is_server_error();
                    if retryable && attempt < max_retries {
                        warn!(
                            status = %status,
                            attempt = attempt + 1,
                            "gateway error, retrying"
                        );
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }

                    return Err(classify_status(status, &text));
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < max_retries {
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(GatewayError::Network {
            message: "gateway request failed".to_string(),
        }))
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(5))
}

/// Map a non-2xx gateway answer onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let (code, message) = extract_gateway_error(body);
    let message = message.unwrap_or_else(|| format!("HTTP {}", status));

    if status == StatusCode::UNAUTHORIZED {
        return GatewayError::Auth { message };
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return GatewayError::Unavailable { message };
    }
    GatewayError::Rejected {
        code: code.or_else(|| Some(status.as_u16().to_string())),
        message,
    }
}

/// Pull `errorCode` / `errorMessage` out of a gateway error body.
pub fn extract_gateway_error(body: &str) -> (Option<String>, Option<String>) {
    let parsed: JsonValue = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return (None, None),
    };
    let text = |key: &str| {
        parsed.get(key).and_then(|v| match v {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };
    (
        text("errorCode").or_else(|| text("ResponseCode")),
        text("errorMessage").or_else(|| text("ResponseDescription")),
    )
}

/// Constant-time byte comparison for shared secrets
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
