mod common;

use axum::http::{Method, StatusCode};
use common::{decimal, json_body, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::entities::user;
use sea_orm::EntityTrait;
use uuid::Uuid;

#[tokio::test]
async fn repeated_adds_merge_into_one_line() {
    let app = TestApp::new().await;
    let user = app.seed_user("cart@example.com").await;
    let product = app.seed_product("MUG-1", dec!(12.5), None).await;

    for quantity in [1, 2] {
        let response = app
            .request(
                Method::POST,
                "/api/v1/cart/items",
                Some(json!({
                    "user_id": user.id,
                    "product_id": product.id,
                    "quantity": quantity
                })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let cart = json_body(
        app.request(Method::GET, &format!("/api/v1/cart/{}", user.id), None)
            .await,
    )
    .await;
    let items = cart["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["quantity"], 3);
    assert_eq!(decimal(&cart["total"]), dec!(37.5));
    assert_eq!(cart["total_items"], 3);
}

#[tokio::test]
async fn zero_quantity_update_removes_the_line() {
    let app = TestApp::new().await;
    let user = app.seed_user("remove@example.com").await;
    let product = app.seed_product("PEN-1", dec!(2), None).await;
    app.add_to_cart(user.id, product.id, 4).await;

    let cart = json_body(
        app.request(Method::GET, &format!("/api/v1/cart/{}", user.id), None)
            .await,
    )
    .await;
    let item_id = cart["items"][0]["id"].as_str().unwrap().to_string();

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/cart/{}/items/{}", user.id, item_id),
            Some(json!({ "quantity": 0 })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.cart_item_count(user.id).await, 0);
}

#[tokio::test]
async fn cart_rejects_unknown_product_and_bad_quantity() {
    let app = TestApp::new().await;
    let user = app.seed_user("strict@example.com").await;

    let unknown = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({
                "user_id": user.id,
                "product_id": Uuid::new_v4(),
                "quantity": 1
            })),
        )
        .await;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let product = app.seed_product("NOTE-1", dec!(3), None).await;
    let invalid = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({
                "user_id": user.id,
                "product_id": product.id,
                "quantity": 0
            })),
        )
        .await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deleting_the_cart_removes_it() {
    let app = TestApp::new().await;
    let user = app.seed_user("delete@example.com").await;
    let product = app.seed_product("BAG-1", dec!(40), None).await;
    app.add_to_cart(user.id, product.id, 1).await;

    let uri = format!("/api/v1/cart/{}", user.id);
    let response = app.request(Method::DELETE, &uri, None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let missing = app.request(Method::GET, &uri, None).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn device_token_is_stored_on_the_user() {
    let app = TestApp::new().await;
    let user = app.seed_user("push@example.com").await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/store-device-token",
            Some(json!({ "user_id": user.id, "device_token": "device-xyz" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let stored = user::Entity::find_by_id(user.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.device_token.as_deref(), Some("device-xyz"));
}
