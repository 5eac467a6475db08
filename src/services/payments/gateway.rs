use super::{Charge, ChargeRequest, GatewayError, PaymentGateway};
use crate::config::PaymentConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

/// Processor error codes that mean "try again shortly"
const RETRYABLE_CODES: &[&str] = &["lock_timeout", "rate_limit"];
const RETRYABLE_TYPES: &[&str] = &["api_connection_error", "api_error"];

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

/// Decides whether a failed processor response is worth retrying.
fn classify(status: StatusCode, body: &str) -> GatewayError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error)
        .unwrap_or_default();
    let message = parsed
        .message
        .clone()
        .unwrap_or_else(|| format!("processor returned {}", status));

    let retryable_code = parsed
        .code
        .as_deref()
        .map_or(false, |c| RETRYABLE_CODES.contains(&c));
    let retryable_type = parsed
        .kind
        .as_deref()
        .map_or(false, |t| RETRYABLE_TYPES.contains(&t));

    if status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
        || retryable_code
        || retryable_type
    {
        GatewayError::Transient(message)
    } else {
        GatewayError::Terminal(message)
    }
}

/// Charges through a Stripe-compatible HTTP API.
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    secret_key: String,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    /// Each request is bounded by the overall charge deadline.
    pub fn from_config(cfg: &PaymentConfig) -> Result<Self, reqwest::Error> {
        Self::new(&cfg.base_url, &cfg.secret_key, cfg.charge_timeout())
    }

    fn form(request: &ChargeRequest) -> Vec<(String, String)> {
        let mut form = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.clone()),
            ("description".to_string(), request.description.clone()),
        ];
        if let Some(email) = &request.receipt_email {
            form.push(("receipt_email".to_string(), email.clone()));
        }
        form.extend(
            request
                .metadata
                .iter()
                .map(|(k, v)| (format!("metadata[{}]", k), v.clone())),
        );
        form
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(idempotency_key = %request.idempotency_key))]
    async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge, GatewayError> {
        let response = self
            .client
            .post(format!("{}/v1/charges", self.base_url))
            .bearer_auth(&self.secret_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&Self::form(request))
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("reading response failed: {}", e)))?;

        if !status.is_success() {
            debug!(%status, "Processor rejected charge request");
            return Err(classify(status, &body));
        }

        serde_json::from_str::<Charge>(&body)
            .map_err(|e| GatewayError::Terminal(format!("malformed charge response: {}", e)))
    }
}
