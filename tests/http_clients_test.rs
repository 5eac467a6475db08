use std::collections::BTreeMap;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use storefront_api::config::NotificationConfig;
use storefront_api::services::{
    notifications::{Message, NotificationDispatcher, NotificationError, Recipient},
    payments::{ChargeRequest, GatewayError, HttpPaymentGateway, PaymentGateway},
};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn charge_request() -> ChargeRequest {
    let mut metadata = BTreeMap::new();
    metadata.insert("order_id".to_string(), "o-1".to_string());
    ChargeRequest {
        amount: 12500,
        currency: "usd".to_string(),
        description: "Charge for order o-1".to_string(),
        idempotency_key: "order-o-1".to_string(),
        receipt_email: Some("buyer@example.com".to_string()),
        metadata,
    }
}

fn gateway(server: &MockServer) -> HttpPaymentGateway {
    HttpPaymentGateway::new(server.uri(), "sk_test_123", Duration::from_secs(2))
        .expect("client builds")
}

#[tokio::test]
async fn charge_is_posted_with_key_and_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .and(header("authorization", "Bearer sk_test_123"))
        .and(header("idempotency-key", "order-o-1"))
        .and(body_string_contains("amount=12500"))
        .and(body_string_contains("currency=usd"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ch_123",
            "object": "charge",
            "status": "succeeded"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let charge = gateway(&server)
        .create_charge(&charge_request())
        .await
        .expect("charge succeeds");
    assert_eq!(charge.id, "ch_123");
    assert_eq!(charge.status, "succeeded");
}

#[tokio::test]
async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = gateway(&server)
        .create_charge(&charge_request())
        .await
        .unwrap_err();
    assert_matches!(err, GatewayError::Transient(_));
}

#[tokio::test]
async fn declines_are_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "error": {
                "type": "card_error",
                "code": "card_declined",
                "message": "Your card was declined."
            }
        })))
        .mount(&server)
        .await;

    let err = gateway(&server)
        .create_charge(&charge_request())
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Terminal("Your card was declined.".to_string()));
}

#[tokio::test]
async fn unreachable_processor_is_transient() {
    let gateway = HttpPaymentGateway::new("http://127.0.0.1:9", "sk", Duration::from_millis(500))
        .expect("client builds");
    let err = gateway.create_charge(&charge_request()).await.unwrap_err();
    assert!(err.is_transient());
}

fn recipient(device_token: Option<&str>) -> Recipient {
    Recipient {
        name: "Buyer".to_string(),
        email: "buyer@example.com".to_string(),
        device_token: device_token.map(str::to_string),
    }
}

fn message() -> Message {
    Message {
        subject: "Order Confirmation".to_string(),
        body: "Thank you for your order!".to_string(),
    }
}

fn notification_config(server: &MockServer) -> NotificationConfig {
    NotificationConfig {
        mailgun_domain: Some("mg.example.com".to_string()),
        mailgun_api_key: Some("key-123".to_string()),
        mailgun_base_url: server.uri(),
        fcm_server_key: Some("fcm-key".to_string()),
        fcm_url: format!("{}/fcm/send", server.uri()),
        timeout_secs: 2,
        ..NotificationConfig::default()
    }
}

#[tokio::test]
async fn confirmation_goes_to_email_and_push() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/mg.example.com/messages"))
        .and(body_string_contains("subject=Order+Confirmation"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fcm/send"))
        .and(header("authorization", "key=fcm-key"))
        .and(body_string_contains("device-abc"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = NotificationDispatcher::from_config(&notification_config(&server)).unwrap();
    assert_eq!(dispatcher.channel_count(), 2);
    dispatcher
        .send(&recipient(Some("device-abc")), &message())
        .await
        .expect("both channels deliver");
}

#[tokio::test]
async fn provider_rejection_is_delivery_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/mg.example.com/messages"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let dispatcher = NotificationDispatcher::from_config(&notification_config(&server)).unwrap();
    let err = dispatcher.send(&recipient(None), &message()).await.unwrap_err();
    assert_matches!(err, NotificationError::DeliveryFailed(reason) if reason.contains("email"));
}

#[tokio::test]
async fn slow_provider_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let config = NotificationConfig {
        fcm_server_key: None,
        timeout_secs: 1,
        ..notification_config(&server)
    };
    let dispatcher = NotificationDispatcher::from_config(&config).unwrap();
    let err = dispatcher.send(&recipient(None), &message()).await.unwrap_err();
    assert_matches!(err, NotificationError::Timeout(_));
}
