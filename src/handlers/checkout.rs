use crate::handlers::common::{created_response, map_service_error, success_response, validate_input};
use crate::{
    errors::ApiError,
    services::{checkout::CheckoutRequest, payments::PaymentRequest},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Checkout, order and payment endpoints
pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(checkout))
        .route("/order/confirm/:order_id", post(confirm_order))
        .route("/orders/:order_id", get(get_order))
        .route("/payment", post(pay_order))
}

/// Turns the user's cart into an order. Responds 201 even if the confirmation could not be
/// delivered; see `warnings`.
async fn checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let response = state
        .services
        .checkout
        .checkout(payload)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(response))
}

async fn confirm_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .checkout
        .confirm_order(order_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(order))
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .checkout
        .get_order(order_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(order))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct PayOrderRequest {
    pub order_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub transaction_id: Option<String>,
    #[validate(length(min = 1, max = 50))]
    pub payment_method: String,
    #[validate(email)]
    pub email: Option<String>,
}

/// Charges an existing order. Reusing a transaction id returns the original charge.
async fn pay_order(
    State(state): State<AppState>,
    Json(payload): Json<PayOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let payment = state
        .services
        .checkout
        .pay_order(
            payload.order_id,
            PaymentRequest {
                transaction_id: payload.transaction_id,
                payment_method: payload.payment_method,
                receipt_email: payload.email,
            },
        )
        .await
        .map_err(map_service_error)?;

    Ok(success_response(payment))
}
