//! Payment coordination: charges an order through the processor with a deadline,
//! bounded retries and a stable idempotency key, then reconciles the ledger.
//!
//! The attempt loop runs on its own task and reports once over a oneshot channel.
//! The caller races that channel against the deadline. Only the caller writes to the
//! ledger, and only after it has won the race, so a worker that finishes late has no
//! shared state to touch: its send fails and the result is logged and dropped. A charge
//! that settles after the deadline is picked up by the next attempt with the same key,
//! which the processor answers with the original charge.

pub mod gateway;
pub mod ledger;

use crate::{
    config::PaymentConfig,
    entities::{order, payment},
    errors::ServiceError,
    events::{Event, EventSender},
};
use async_trait::async_trait;
use metrics::counter;
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use self::gateway::HttpPaymentGateway;
pub use self::ledger::{PaymentLedger, PaymentRecord, SeaOrmPaymentLedger};

/// One charge as sent to the processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeRequest {
    /// Amount in minor units (cents)
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub idempotency_key: String,
    pub receipt_email: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Processor-side charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Worth retrying: connectivity, processor overload, lock contention
    #[error("transient processor error: {0}")]
    Transient(String),
    /// Retrying cannot help: declines, invalid requests
    #[error("processor rejected charge: {0}")]
    Terminal(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge, GatewayError>;
}

/// Client-supplied payment details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Client transaction id. Doubles as the idempotency key.
    pub transaction_id: Option<String>,
    pub payment_method: String,
    pub receipt_email: Option<String>,
}

impl PaymentRequest {
    /// The client transaction id, if one was given
    pub fn client_key(&self) -> Option<&str> {
        self.transaction_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn idempotency_key(&self, order_id: Uuid) -> String {
        self.client_key()
            .map(str::to_string)
            .unwrap_or_else(|| format!("order-{}", order_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Budget for the whole charge, every attempt and delay included
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            deadline: Duration::from_secs(10),
        }
    }
}

impl From<&PaymentConfig> for RetryPolicy {
    fn from(cfg: &PaymentConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            retry_delay: cfg.retry_delay(),
            deadline: cfg.charge_timeout(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment failed after {attempts} attempt(s): {reason}")]
    Failed { reason: String, attempts: u32 },
    #[error("payment timed out after {0:?}")]
    TimedOut(Duration),
    #[error("invalid charge amount: {0}")]
    InvalidAmount(Decimal),
    /// The key already settled a charge for a different order
    #[error("transaction id {key} already used for order {order_id}")]
    KeyInUse { key: String, order_id: Uuid },
    #[error(transparent)]
    Ledger(#[from] ServiceError),
}

impl From<PaymentError> for ServiceError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Failed { reason, .. } => ServiceError::PaymentFailed {
                message: reason,
                order_id: None,
            },
            PaymentError::TimedOut(timeout) => ServiceError::PaymentTimeout {
                timeout,
                order_id: None,
            },
            PaymentError::InvalidAmount(amount) => ServiceError::PaymentFailed {
                message: format!("Cannot charge amount {}", amount),
                order_id: None,
            },
            PaymentError::KeyInUse { .. } => ServiceError::Conflict(
                "Transaction id already used for another order".to_string(),
            ),
            PaymentError::Ledger(e) => e,
        }
    }
}

/// Result of a successful `charge`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeOutcome {
    pub payment: payment::Model,
    pub attempts: u32,
    /// True when the ledger already held a settled charge for the key
    pub replayed: bool,
}

/// Converts a decimal amount to minor units, rounding half away from zero.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

struct AttemptReport {
    result: Result<Charge, GatewayError>,
    attempts: u32,
}

async fn run_attempts(
    gateway: Arc<dyn PaymentGateway>,
    request: ChargeRequest,
    policy: RetryPolicy,
    mut reply: oneshot::Sender<AttemptReport>,
) {
    let mut attempts = 0;
    let result = loop {
        attempts += 1;
        match gateway.create_charge(&request).await {
            Ok(charge) => break Ok(charge),
            Err(e) if e.is_transient() && attempts < policy.max_attempts => {
                warn!(
                    idempotency_key = %request.idempotency_key,
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Charge attempt failed; retrying"
                );
                counter!("storefront.payments.retries", 1);
                tokio::select! {
                    _ = tokio::time::sleep(policy.retry_delay) => {}
                    _ = reply.closed() => {
                        debug!(idempotency_key = %request.idempotency_key, "Caller gave up; stopping retries");
                        return;
                    }
                }
            }
            Err(e) => break Err(e),
        }
    };

    if reply.send(AttemptReport { result, attempts }).is_err() {
        warn!(
            idempotency_key = %request.idempotency_key,
            attempts,
            "Charge finished after the caller's deadline; result dropped"
        );
    }
}

#[derive(Clone)]
pub struct PaymentCoordinator {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn PaymentLedger>,
    event_sender: Arc<EventSender>,
    policy: RetryPolicy,
    currency: String,
}

impl PaymentCoordinator {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn PaymentLedger>,
        event_sender: Arc<EventSender>,
        policy: RetryPolicy,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            ledger,
            event_sender,
            policy,
            currency: currency.into(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Rejects a client transaction id that already settled a charge. Meant for callers
    /// about to create a new order, which no existing payment can belong to.
    pub async fn ensure_key_unused(&self, request: &PaymentRequest) -> Result<(), PaymentError> {
        let Some(key) = request.client_key() else {
            return Ok(());
        };
        match self.ledger.find_succeeded(key).await? {
            Some(existing) => Err(PaymentError::KeyInUse {
                key: key.to_string(),
                order_id: existing.order_id,
            }),
            None => Ok(()),
        }
    }

    fn charge_request(
        &self,
        order: &order::Model,
        request: &PaymentRequest,
        idempotency_key: &str,
    ) -> Result<ChargeRequest, PaymentError> {
        let amount = to_minor_units(order.total_amount)
            .filter(|cents| *cents > 0)
            .ok_or(PaymentError::InvalidAmount(order.total_amount))?;

        let mut metadata = BTreeMap::new();
        metadata.insert("order_id".to_string(), order.id.to_string());
        metadata.insert("transaction_id".to_string(), idempotency_key.to_string());
        metadata.insert("payment_method".to_string(), request.payment_method.clone());
        if let Some(address) = &order.shipping_address {
            metadata.insert("shipping_address".to_string(), address.clone());
        }

        Ok(ChargeRequest {
            amount,
            currency: self.currency.clone(),
            description: format!("Charge for order {}", order.id),
            idempotency_key: idempotency_key.to_string(),
            receipt_email: request.receipt_email.clone(),
            metadata,
        })
    }

    /// Charges `order` and records the result.
    ///
    /// Returns within the policy deadline whether or not the processor has answered.
    #[instrument(skip(self, order, request), fields(order_id = %order.id))]
    pub async fn charge(
        &self,
        order: &order::Model,
        request: &PaymentRequest,
    ) -> Result<ChargeOutcome, PaymentError> {
        let idempotency_key = request.idempotency_key(order.id);

        if let Some(existing) = self.ledger.find_succeeded(&idempotency_key).await? {
            if existing.order_id != order.id {
                warn!(%idempotency_key, paid_order = %existing.order_id, "Idempotency key belongs to another order");
                return Err(PaymentError::KeyInUse {
                    key: idempotency_key,
                    order_id: existing.order_id,
                });
            }
            info!(%idempotency_key, "Returning existing payment for idempotency key");
            return Ok(ChargeOutcome {
                payment: existing,
                attempts: 0,
                replayed: true,
            });
        }

        let charge_request = self.charge_request(order, request, &idempotency_key)?;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(run_attempts(
            Arc::clone(&self.gateway),
            charge_request.clone(),
            self.policy,
            tx,
        ));

        let report = match tokio::time::timeout(self.policy.deadline, rx).await {
            Ok(Ok(report)) => report,
            Ok(Err(_)) => {
                return Err(self
                    .fail(order.id, "charge worker stopped before reporting".to_string(), 0)
                    .await)
            }
            Err(_) => {
                warn!(%idempotency_key, deadline = ?self.policy.deadline, "Charge timed out");
                counter!("storefront.payments.timeouts", 1);
                self.event_sender
                    .send_or_log(Event::PaymentFailed {
                        order_id: order.id,
                        reason: "timed out".to_string(),
                    })
                    .await;
                return Err(PaymentError::TimedOut(self.policy.deadline));
            }
        };

        let charge = match report.result {
            Ok(charge) => charge,
            Err(e) => return Err(self.fail(order.id, e.to_string(), report.attempts).await),
        };

        let payment = self
            .ledger
            .record_success(PaymentRecord {
                order_id: order.id,
                idempotency_key,
                transaction_id: charge.id.clone(),
                amount: order.total_amount,
                currency: charge_request.currency,
                status: charge.status,
                payment_method: request.payment_method.clone(),
                attempts: report.attempts,
            })
            .await?;

        info!(
            transaction_id = %payment.transaction_id,
            attempts = report.attempts,
            "Payment captured"
        );
        counter!("storefront.payments.captured", 1);
        self.event_sender
            .send_or_log(Event::PaymentCaptured {
                order_id: order.id,
                transaction_id: payment.transaction_id.clone(),
                attempts: report.attempts,
            })
            .await;

        Ok(ChargeOutcome {
            payment,
            attempts: report.attempts,
            replayed: false,
        })
    }

    async fn fail(&self, order_id: Uuid, reason: String, attempts: u32) -> PaymentError {
        warn!(%order_id, attempts, %reason, "Payment failed");
        counter!("storefront.payments.failed", 1);
        self.event_sender
            .send_or_log(Event::PaymentFailed {
                order_id,
                reason: reason.clone(),
            })
            .await;
        PaymentError::Failed { reason, attempts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn minor_units_round_half_away_from_zero() {
        assert_eq!(to_minor_units(dec!(125.00)), Some(12500));
        assert_eq!(to_minor_units(dec!(19.995)), Some(2000));
        assert_eq!(to_minor_units(dec!(0.004)), Some(0));
    }

    #[test]
    fn idempotency_key_prefers_transaction_id() {
        let order_id = Uuid::new_v4();
        let explicit = PaymentRequest {
            transaction_id: Some("txn-42".into()),
            ..Default::default()
        };
        assert_eq!(explicit.idempotency_key(order_id), "txn-42");

        let blank = PaymentRequest {
            transaction_id: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(blank.idempotency_key(order_id), format!("order-{}", order_id));
    }

    #[test]
    fn retry_policy_follows_config() {
        let cfg = PaymentConfig {
            max_attempts: 0,
            retry_delay_ms: 15,
            charge_timeout_secs: 4,
            ..PaymentConfig::default()
        };
        let policy = RetryPolicy::from(&cfg);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.retry_delay, Duration::from_millis(15));
        assert_eq!(policy.deadline, Duration::from_secs(4));
    }

    #[test]
    fn payment_errors_map_to_distinct_statuses() {
        use axum::http::StatusCode;

        let failed: ServiceError = PaymentError::Failed {
            reason: "card_declined".into(),
            attempts: 1,
        }
        .into();
        let timed_out: ServiceError = PaymentError::TimedOut(Duration::from_secs(10)).into();

        assert_eq!(failed.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(timed_out.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }
}
