pub mod carts;
pub mod categories;
pub mod checkout;
pub mod common;
pub mod products;
pub mod users;

use crate::cache::CacheBackend;
use crate::config::AppConfig;
use crate::events::EventSender;
use crate::services::{
    cart::CartService,
    catalog::CatalogService,
    checkout::CheckoutService,
    notifications::NotificationDispatcher,
    orders::OrderService,
    payments::{HttpPaymentGateway, PaymentCoordinator, PaymentGateway, RetryPolicy, SeaOrmPaymentLedger},
    users::UserService,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tracing::info;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub catalog: Arc<CatalogService>,
    pub cart: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub users: Arc<UserService>,
    pub checkout: Arc<CheckoutService>,
}

impl AppServices {
    /// Wires every service from explicit collaborators. `gateway` is `None` when payments
    /// are disabled.
    pub fn new(
        config: &AppConfig,
        db: Arc<DatabaseConnection>,
        cache: Arc<dyn CacheBackend>,
        event_sender: Arc<EventSender>,
        gateway: Option<Arc<dyn PaymentGateway>>,
        notifications: Arc<NotificationDispatcher>,
    ) -> Self {
        let catalog = Arc::new(CatalogService::new(
            db.clone(),
            cache,
            config.cache.catalog_ttl(),
        ));
        let cart = Arc::new(CartService::new(db.clone(), catalog.clone()));
        let orders = Arc::new(OrderService::new(db.clone(), event_sender.clone()));
        let users = Arc::new(UserService::new(db.clone()));

        let payments = gateway.map(|gateway| {
            Arc::new(PaymentCoordinator::new(
                gateway,
                Arc::new(SeaOrmPaymentLedger::new(db.clone())),
                event_sender.clone(),
                RetryPolicy::from(&config.payment),
                config.payment.currency.clone(),
            ))
        });

        let checkout = Arc::new(CheckoutService::new(
            users.clone(),
            orders.clone(),
            payments,
            notifications,
            event_sender,
            config.payment.failure_policy,
        ));

        Self {
            catalog,
            cart,
            orders,
            users,
            checkout,
        }
    }

    /// Builds the external clients named in `config`: the HTTP payment gateway when payments
    /// are enabled, and whichever notification channels have credentials.
    pub fn from_config(
        config: &AppConfig,
        db: Arc<DatabaseConnection>,
        cache: Arc<dyn CacheBackend>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self, reqwest::Error> {
        let gateway: Option<Arc<dyn PaymentGateway>> = if config.payment.enabled {
            info!(base_url = %config.payment.base_url, "Payments enabled");
            Some(Arc::new(HttpPaymentGateway::from_config(&config.payment)?))
        } else {
            info!("Payments disabled; checkout creates unpaid orders");
            None
        };
        let notifications = Arc::new(NotificationDispatcher::from_config(&config.notifications)?);

        Ok(Self::new(config, db, cache, event_sender, gateway, notifications))
    }
}
