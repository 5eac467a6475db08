#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    Router,
};
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use serde_json::Value;
use storefront_api::{
    cache::{CacheBackend, CacheError, InMemoryCache},
    config::{AppConfig, PaymentFailurePolicy},
    db::{self, DbConfig},
    entities::{category, product, user},
    events::{self, EventSender},
    handlers::AppServices,
    health::HealthState,
    services::{
        cart::CartStore,
        catalog::{CreateCategoryInput, CreateProductInput},
        notifications::{Message, NotificationDispatcher, NotificationError, Notifier, Recipient},
        payments::{Charge, ChargeRequest, GatewayError, PaymentGateway},
        users::NewUser,
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

/// Knobs for building a test application
pub struct TestOptions {
    pub gateway: Option<Arc<dyn PaymentGateway>>,
    pub notifiers: Vec<Arc<dyn Notifier>>,
    pub cache: Arc<dyn CacheBackend>,
    pub failure_policy: PaymentFailurePolicy,
    pub charge_timeout_secs: u64,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            gateway: None,
            notifiers: Vec::new(),
            cache: Arc::new(InMemoryCache::new()),
            failure_policy: PaymentFailurePolicy::KeepPending,
            charge_timeout_secs: 2,
        }
    }
}

/// Helper harness for spinning up an application backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub db: Arc<DatabaseConnection>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_options(options: TestOptions) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.payment.enabled = options.gateway.is_some();
        cfg.payment.secret_key = "sk_test".to_string();
        cfg.payment.charge_timeout_secs = options.charge_timeout_secs;
        cfg.payment.retry_delay_ms = 10;
        cfg.payment.failure_policy = options.failure_policy;

        let pool = db::establish_connection_with_config(&DbConfig::sqlite_memory())
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));
        let event_sender = Arc::new(EventSender::new(event_tx));

        let notifications = Arc::new(NotificationDispatcher::new(
            options.notifiers,
            Duration::from_secs(1),
        ));
        let services = AppServices::new(
            &cfg,
            db.clone(),
            options.cache.clone(),
            event_sender,
            options.gateway,
            notifications,
        );

        let state = AppState {
            config: Arc::new(cfg),
            services,
        };
        let health = Arc::new(HealthState::new(db.clone(), options.cache));
        let router = storefront_api::build_router(state.clone(), health);

        Self {
            router,
            state,
            db,
            _event_task: event_task,
        }
    }

    /// Send a request against the router.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn seed_user(&self, email: &str) -> user::Model {
        self.state
            .services
            .users
            .create_user(NewUser {
                name: "Test User".to_string(),
                email: email.to_string(),
                role: Default::default(),
            })
            .await
            .expect("seed user")
    }

    pub async fn seed_category(&self, name: &str) -> category::Model {
        self.state
            .services
            .catalog
            .create_category(CreateCategoryInput {
                name: name.to_string(),
                description: None,
            })
            .await
            .expect("seed category")
    }

    pub async fn seed_product(
        &self,
        sku: &str,
        price: Decimal,
        category_id: Option<Uuid>,
    ) -> product::Model {
        self.state
            .services
            .catalog
            .create_product(CreateProductInput {
                name: format!("Product {}", sku),
                description: None,
                price,
                quantity: 100,
                category_id,
                sku: sku.to_string(),
                brand: None,
                discount: Decimal::ZERO,
            })
            .await
            .expect("seed product")
    }

    pub async fn add_to_cart(&self, user_id: Uuid, product_id: Uuid, quantity: i32) {
        self.state
            .services
            .cart
            .add_item(user_id, product_id, quantity)
            .await
            .expect("add to cart");
    }

    pub async fn cart_item_count(&self, user_id: Uuid) -> usize {
        self.state
            .services
            .cart
            .items_for_user(user_id)
            .await
            .expect("cart items")
            .len()
    }
}

pub async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

/// Reads a decimal that was serialized as a JSON string or number.
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a decimal: {other}"),
    }
}

pub fn succeeded(id: &str) -> Result<Charge, GatewayError> {
    Ok(Charge {
        id: id.to_string(),
        status: "succeeded".to_string(),
    })
}

/// Gateway that replays a fixed script of responses and counts calls.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Result<Charge, GatewayError>>>,
    calls: AtomicU32,
    requests: Mutex<Vec<ChargeRequest>>,
}

impl ScriptedGateway {
    pub fn new(script: Vec<Result<Charge, GatewayError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChargeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::Terminal("script exhausted".to_string())))
    }
}

/// Gateway that never answers within any reasonable deadline.
#[derive(Default)]
pub struct StallingGateway {
    calls: AtomicU32,
}

impl StallingGateway {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for StallingGateway {
    async fn create_charge(&self, _request: &ChargeRequest) -> Result<Charge, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        succeeded("ch_too_late")
    }
}

/// Notifier whose every delivery fails.
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    fn channel(&self) -> &'static str {
        "email"
    }

    async fn send(&self, _recipient: &Recipient, _message: &Message) -> Result<(), NotificationError> {
        Err(NotificationError::DeliveryFailed("mail provider unavailable".to_string()))
    }
}

/// Cache backend whose every operation fails.
pub struct FailingCache;

#[async_trait]
impl CacheBackend for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::OperationFailed("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), CacheError> {
        Err(CacheError::OperationFailed("connection refused".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::OperationFailed("connection refused".to_string()))
    }
}
