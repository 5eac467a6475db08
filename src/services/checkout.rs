use crate::{
    config::PaymentFailurePolicy,
    entities::{order, payment},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        notifications::{NotificationDispatcher, Recipient},
        orders::{OrderDetails, OrderStore, OrderWithItems},
        payments::{PaymentCoordinator, PaymentError, PaymentRequest},
        users::UserDirectory,
    },
};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Optional payment details supplied at checkout
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct CheckoutPayment {
    pub transaction_id: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    #[validate(length(min = 1, max = 50))]
    pub payment_method: String,
    #[validate(length(max = 1000))]
    pub shipping_address: Option<String>,
    #[validate(length(max = 1000))]
    pub delivery_notes: Option<String>,
    #[serde(default)]
    #[validate]
    pub payment: Option<CheckoutPayment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub order: OrderWithItems,
    /// Present when the order was charged during checkout
    pub payment: Option<payment::Model>,
    /// Non-fatal problems, such as an undelivered confirmation
    pub warnings: Vec<String>,
}

/// Admits at most one in-flight checkout per user within this process.
#[derive(Debug, Clone, Default)]
pub struct CheckoutGuard {
    inflight: Arc<DashMap<Uuid, ()>>,
}

/// Held for the duration of a checkout; releases the user on drop.
#[derive(Debug)]
pub struct CheckoutPermit {
    inflight: Arc<DashMap<Uuid, ()>>,
    user_id: Uuid,
}

impl CheckoutGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, user_id: Uuid) -> Option<CheckoutPermit> {
        match self.inflight.entry(user_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(CheckoutPermit {
                    inflight: Arc::clone(&self.inflight),
                    user_id,
                })
            }
        }
    }

    pub fn is_busy(&self, user_id: Uuid) -> bool {
        self.inflight.contains_key(&user_id)
    }
}

impl Drop for CheckoutPermit {
    fn drop(&mut self) {
        self.inflight.remove(&self.user_id);
    }
}

/// Runs checkout: cart to order, optional charge, confirmation.
#[derive(Clone)]
pub struct CheckoutService {
    users: Arc<dyn UserDirectory>,
    orders: Arc<dyn OrderStore>,
    payments: Option<Arc<PaymentCoordinator>>,
    notifications: Arc<NotificationDispatcher>,
    event_sender: Arc<EventSender>,
    failure_policy: PaymentFailurePolicy,
    guard: CheckoutGuard,
}

impl CheckoutService {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        orders: Arc<dyn OrderStore>,
        payments: Option<Arc<PaymentCoordinator>>,
        notifications: Arc<NotificationDispatcher>,
        event_sender: Arc<EventSender>,
        failure_policy: PaymentFailurePolicy,
    ) -> Self {
        Self {
            users,
            orders,
            payments,
            notifications,
            event_sender,
            failure_policy,
            guard: CheckoutGuard::new(),
        }
    }

    /// Converts the user's cart into an order, charges it when payments are enabled, and
    /// sends the confirmation.
    ///
    /// # Arguments
    /// * `request` - The user, payment method and delivery details
    ///
    /// # Returns
    /// The persisted order, the payment if one was taken, and any delivery warnings.
    /// A payment error names the order it left behind.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutResponse, ServiceError> {
        request.validate()?;

        let _permit = self.guard.try_acquire(request.user_id).ok_or_else(|| {
            ServiceError::Conflict("A checkout is already in progress for this user".to_string())
        })?;

        let user = self
            .users
            .find_user(request.user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User", request.user_id))?;

        let payment_request = PaymentRequest {
            transaction_id: request.payment.as_ref().and_then(|p| p.transaction_id.clone()),
            payment_method: request.payment_method.clone(),
            receipt_email: request
                .payment
                .as_ref()
                .and_then(|p| p.email.clone())
                .or_else(|| Some(user.email.clone())),
        };
        if let Some(coordinator) = &self.payments {
            coordinator
                .ensure_key_unused(&payment_request)
                .await
                .map_err(ServiceError::from)?;
        }

        let mut order = self
            .orders
            .build_order(
                user.id,
                OrderDetails {
                    payment_method: request.payment_method.clone(),
                    shipping_address: request.shipping_address.clone(),
                    delivery_notes: request.delivery_notes.clone(),
                },
            )
            .await?;
        let order_id = order.order.id;
        counter!("storefront.checkout.orders", 1);

        let payment = match &self.payments {
            Some(_) if order.order.total_amount.is_zero() => {
                match self
                    .orders
                    .set_payment_status(order_id, order::PAYMENT_STATUS_NOT_REQUIRED)
                    .await
                {
                    Ok(()) => {
                        order.order.payment_status =
                            order::PAYMENT_STATUS_NOT_REQUIRED.to_string();
                        info!(%order_id, "Order total is zero; no charge taken");
                    }
                    Err(e) => {
                        error!(%order_id, error = %e, "Failed to record that no payment is due");
                    }
                }
                None
            }
            Some(coordinator) => {
                match coordinator.charge(&order.order, &payment_request).await {
                    Ok(outcome) => {
                        order.order.payment_status = outcome.payment.status.clone();
                        order.order.transaction_id = Some(outcome.payment.transaction_id.clone());
                        Some(outcome.payment)
                    }
                    Err(e) => {
                        self.apply_failure_policy(order_id, &e).await;
                        return Err(ServiceError::from(e).for_order(order_id));
                    }
                }
            }
            None => None,
        };

        let mut warnings = Vec::new();
        if let Err(e) = self
            .notifications
            .send_order_confirmation(&Recipient::from(&user), &order.order)
            .await
        {
            warn!(%order_id, error = %e, "Order confirmation not delivered");
            warnings.push(format!("Order confirmation not delivered: {}", e));
            self.event_sender
                .send_or_log(Event::NotificationFailed {
                    order_id,
                    reason: e.to_string(),
                })
                .await;
        }

        info!(%order_id, total = %order.order.total_amount, paid = payment.is_some(), "Checkout complete");
        Ok(CheckoutResponse {
            order_id,
            order,
            payment,
            warnings,
        })
    }

    async fn apply_failure_policy(&self, order_id: Uuid, error: &PaymentError) {
        // No charge was attempted for this order
        if matches!(error, PaymentError::KeyInUse { .. }) {
            return;
        }
        match self.failure_policy {
            PaymentFailurePolicy::KeepPending => {
                info!(%order_id, "Payment failed; order left pending for reconciliation");
            }
            PaymentFailurePolicy::MarkFailed => {
                if let Err(e) = self
                    .orders
                    .set_payment_status(order_id, order::PAYMENT_STATUS_FAILED)
                    .await
                {
                    error!(%order_id, error = %e, "Failed to mark order payment as failed");
                }
            }
        }
    }

    /// Charges an existing order outside checkout, e.g. a retry after a timeout.
    #[instrument(skip(self, request))]
    pub async fn pay_order(
        &self,
        order_id: Uuid,
        request: PaymentRequest,
    ) -> Result<payment::Model, ServiceError> {
        let coordinator = self.payments.as_ref().ok_or_else(|| {
            ServiceError::ServiceUnavailable("Payments are not enabled".to_string())
        })?;
        let order = self.orders.get_order(order_id).await?;
        if order.order.total_amount.is_zero() {
            return Err(ServiceError::BadRequest(format!(
                "Order {} has nothing to charge",
                order_id
            )));
        }

        match coordinator.charge(&order.order, &request).await {
            Ok(outcome) => Ok(outcome.payment),
            Err(e) => {
                self.apply_failure_policy(order_id, &e).await;
                Err(ServiceError::from(e).for_order(order_id))
            }
        }
    }

    pub async fn confirm_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.orders.confirm_order(order_id).await
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        self.orders.get_order(order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{
        order::{OrderStatus, PAYMENT_STATUS_PENDING},
        user::{self, UserRole},
    };
    use crate::services::{
        notifications::{MockNotifier, NotificationError, Notifier},
        orders::MockOrderStore,
        payments::{
            ledger::MockPaymentLedger, Charge, GatewayError, MockPaymentGateway, RetryPolicy,
        },
        users::MockUserDirectory,
    };
    use chrono::Utc;
    use mockall::predicate::eq;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn user(id: Uuid) -> user::Model {
        let now = Utc::now();
        user::Model {
            id,
            name: "Ada".into(),
            email: "ada@example.com".into(),
            password_hash: None,
            role: UserRole::Customer,
            device_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn built_order(user_id: Uuid) -> OrderWithItems {
        let now = Utc::now();
        OrderWithItems {
            order: order::Model {
                id: Uuid::new_v4(),
                user_id,
                order_time: now,
                total_amount: dec!(125.00),
                payment_method: "card".into(),
                status: OrderStatus::Pending,
                payment_status: PAYMENT_STATUS_PENDING.into(),
                transaction_id: None,
                shipping_address: None,
                delivery_notes: None,
                created_at: now,
                updated_at: now,
            },
            items: Vec::new(),
        }
    }

    fn request(user_id: Uuid) -> CheckoutRequest {
        CheckoutRequest {
            user_id,
            payment_method: "card".into(),
            shipping_address: Some("1 Main St".into()),
            delivery_notes: None,
            payment: None,
        }
    }

    fn events() -> Arc<EventSender> {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Arc::new(EventSender::new(tx))
    }

    fn users_with(id: Uuid) -> Arc<dyn UserDirectory> {
        let mut users = MockUserDirectory::new();
        users
            .expect_find_user()
            .with(eq(id))
            .returning(|id| Ok(Some(user(id))));
        Arc::new(users)
    }

    fn failing_coordinator(events: Arc<EventSender>) -> Arc<PaymentCoordinator> {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_create_charge()
            .times(1)
            .returning(|_| Err(GatewayError::Terminal("card_declined".into())));
        let mut ledger = MockPaymentLedger::new();
        ledger.expect_find_succeeded().returning(|_| Ok(None));
        ledger.expect_record_success().never();

        Arc::new(PaymentCoordinator::new(
            Arc::new(gateway),
            Arc::new(ledger),
            events,
            RetryPolicy {
                max_attempts: 3,
                retry_delay: Duration::from_millis(1),
                deadline: Duration::from_secs(1),
            },
            "usd",
        ))
    }

    #[tokio::test]
    async fn unknown_user_is_rejected_before_building_an_order() {
        let mut users = MockUserDirectory::new();
        users.expect_find_user().returning(|_| Ok(None));
        let mut orders = MockOrderStore::new();
        orders.expect_build_order().never();

        let service = CheckoutService::new(
            Arc::new(users),
            Arc::new(orders),
            None,
            Arc::new(NotificationDispatcher::disabled()),
            events(),
            PaymentFailurePolicy::default(),
        );

        let err = service.checkout(request(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_cart_stops_the_pipeline() {
        let user_id = Uuid::new_v4();
        let mut orders = MockOrderStore::new();
        orders
            .expect_build_order()
            .returning(|_, _| Err(ServiceError::EmptyCart));

        let mut notifier = MockNotifier::new();
        notifier.expect_send().never();
        notifier.expect_channel().return_const("email");

        let service = CheckoutService::new(
            users_with(user_id),
            Arc::new(orders),
            None,
            Arc::new(NotificationDispatcher::new(
                vec![Arc::new(notifier) as Arc<dyn Notifier>],
                Duration::from_secs(1),
            )),
            events(),
            PaymentFailurePolicy::default(),
        );

        let err = service.checkout(request(user_id)).await.unwrap_err();
        assert!(matches!(err, ServiceError::EmptyCart));
        assert!(!service.guard.is_busy(user_id));
    }

    #[tokio::test]
    async fn notification_failure_becomes_a_warning() {
        let user_id = Uuid::new_v4();
        let mut orders = MockOrderStore::new();
        orders
            .expect_build_order()
            .returning(|user_id, _| Ok(built_order(user_id)));

        let mut notifier = MockNotifier::new();
        notifier.expect_channel().return_const("email");
        notifier
            .expect_send()
            .returning(|_, _| Err(NotificationError::DeliveryFailed("smtp down".into())));

        let service = CheckoutService::new(
            users_with(user_id),
            Arc::new(orders),
            None,
            Arc::new(NotificationDispatcher::new(
                vec![Arc::new(notifier) as Arc<dyn Notifier>],
                Duration::from_secs(1),
            )),
            events(),
            PaymentFailurePolicy::default(),
        );

        let response = service.checkout(request(user_id)).await.unwrap();
        assert_eq!(response.order_id, response.order.order.id);
        assert_eq!(response.warnings.len(), 1);
        assert!(response.payment.is_none());
    }

    #[tokio::test]
    async fn keep_pending_leaves_order_untouched_on_payment_failure() {
        let user_id = Uuid::new_v4();
        let events = events();
        let mut orders = MockOrderStore::new();
        orders
            .expect_build_order()
            .returning(|user_id, _| Ok(built_order(user_id)));
        orders.expect_set_payment_status().never();

        let service = CheckoutService::new(
            users_with(user_id),
            Arc::new(orders),
            Some(failing_coordinator(events.clone())),
            Arc::new(NotificationDispatcher::disabled()),
            events,
            PaymentFailurePolicy::KeepPending,
        );

        let err = service.checkout(request(user_id)).await.unwrap_err();
        assert!(matches!(err, ServiceError::PaymentFailed { order_id: Some(_), .. }));
    }

    #[tokio::test]
    async fn mark_failed_records_failed_payment_status() {
        let user_id = Uuid::new_v4();
        let events = events();
        let mut orders = MockOrderStore::new();
        orders
            .expect_build_order()
            .returning(|user_id, _| Ok(built_order(user_id)));
        orders
            .expect_set_payment_status()
            .withf(|_, status| status.to_string() == order::PAYMENT_STATUS_FAILED)
            .times(1)
            .returning(|_, _| Ok(()));

        let service = CheckoutService::new(
            users_with(user_id),
            Arc::new(orders),
            Some(failing_coordinator(events.clone())),
            Arc::new(NotificationDispatcher::disabled()),
            events,
            PaymentFailurePolicy::MarkFailed,
        );

        let err = service.checkout(request(user_id)).await.unwrap_err();
        assert!(err.order_id().is_some());
    }

    #[tokio::test]
    async fn successful_charge_is_reflected_in_response() {
        let user_id = Uuid::new_v4();
        let events = events();
        let mut orders = MockOrderStore::new();
        orders
            .expect_build_order()
            .returning(|user_id, _| Ok(built_order(user_id)));

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_create_charge()
            .withf(|req| req.amount == 12500 && req.idempotency_key.starts_with("order-"))
            .times(1)
            .returning(|_| {
                Ok(Charge {
                    id: "ch_1".into(),
                    status: "succeeded".into(),
                })
            });
        let mut ledger = MockPaymentLedger::new();
        ledger.expect_find_succeeded().returning(|_| Ok(None));
        ledger.expect_record_success().returning(|record| {
            let now = Utc::now();
            Ok(payment::Model {
                id: Uuid::new_v4(),
                order_id: record.order_id,
                idempotency_key: record.idempotency_key,
                transaction_id: record.transaction_id,
                amount: record.amount,
                currency: record.currency,
                status: record.status,
                payment_method: record.payment_method,
                attempts: record.attempts as i32,
                created_at: now,
                updated_at: now,
            })
        });
        let coordinator = PaymentCoordinator::new(
            Arc::new(gateway),
            Arc::new(ledger),
            events.clone(),
            RetryPolicy::default(),
            "usd",
        );

        let service = CheckoutService::new(
            users_with(user_id),
            Arc::new(orders),
            Some(Arc::new(coordinator)),
            Arc::new(NotificationDispatcher::disabled()),
            events,
            PaymentFailurePolicy::default(),
        );

        let response = service.checkout(request(user_id)).await.unwrap();
        let payment = response.payment.expect("payment recorded");
        assert_eq!(payment.transaction_id, "ch_1");
        assert_eq!(response.order.order.payment_status, "succeeded");
        assert!(response.warnings.is_empty());
    }

    fn coordinator_with(
        gateway: MockPaymentGateway,
        ledger: MockPaymentLedger,
        events: Arc<EventSender>,
    ) -> Arc<PaymentCoordinator> {
        Arc::new(PaymentCoordinator::new(
            Arc::new(gateway),
            Arc::new(ledger),
            events,
            RetryPolicy::default(),
            "usd",
        ))
    }

    #[tokio::test]
    async fn free_order_skips_the_processor() {
        let user_id = Uuid::new_v4();
        let events = events();
        let mut orders = MockOrderStore::new();
        orders.expect_build_order().returning(|user_id, _| {
            let mut order = built_order(user_id);
            order.order.total_amount = dec!(0.00);
            Ok(order)
        });
        orders
            .expect_set_payment_status()
            .withf(|_, status| status.to_string() == order::PAYMENT_STATUS_NOT_REQUIRED)
            .times(1)
            .returning(|_, _| Ok(()));
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_charge().never();
        let mut ledger = MockPaymentLedger::new();
        ledger.expect_find_succeeded().never();

        let service = CheckoutService::new(
            users_with(user_id),
            Arc::new(orders),
            Some(coordinator_with(gateway, ledger, events.clone())),
            Arc::new(NotificationDispatcher::disabled()),
            events,
            PaymentFailurePolicy::MarkFailed,
        );

        let response = service.checkout(request(user_id)).await.unwrap();
        assert!(response.payment.is_none());
        assert_eq!(
            response.order.order.payment_status,
            order::PAYMENT_STATUS_NOT_REQUIRED
        );
    }

    #[tokio::test]
    async fn reused_transaction_id_is_rejected_before_building_an_order() {
        let user_id = Uuid::new_v4();
        let events = events();
        let mut orders = MockOrderStore::new();
        orders.expect_build_order().never();
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_charge().never();
        let mut ledger = MockPaymentLedger::new();
        ledger
            .expect_find_succeeded()
            .withf(|key| key == "txn-shared")
            .returning(|key| {
                let now = Utc::now();
                Ok(Some(payment::Model {
                    id: Uuid::new_v4(),
                    order_id: Uuid::new_v4(),
                    idempotency_key: key.to_string(),
                    transaction_id: "ch_other".into(),
                    amount: dec!(10.00),
                    currency: "usd".into(),
                    status: payment::STATUS_SUCCEEDED.into(),
                    payment_method: "card".into(),
                    attempts: 1,
                    created_at: now,
                    updated_at: now,
                }))
            });

        let service = CheckoutService::new(
            users_with(user_id),
            Arc::new(orders),
            Some(coordinator_with(gateway, ledger, events.clone())),
            Arc::new(NotificationDispatcher::disabled()),
            events,
            PaymentFailurePolicy::KeepPending,
        );

        let mut req = request(user_id);
        req.payment = Some(CheckoutPayment {
            transaction_id: Some("txn-shared".into()),
            email: None,
        });
        let err = service.checkout(req).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn guard_admits_one_checkout_per_user() {
        let guard = CheckoutGuard::new();
        let user_id = Uuid::new_v4();

        let permit = guard.try_acquire(user_id);
        assert!(permit.is_some());
        assert!(guard.try_acquire(user_id).is_none());
        assert!(guard.try_acquire(Uuid::new_v4()).is_some());

        drop(permit);
        assert!(guard.try_acquire(user_id).is_some());
    }
}
