use crate::handlers::common::{
    map_service_error, no_content_response, success_response, validate_input,
};
use crate::{errors::ApiError, services::cart::CartStore, AppState};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<AppState> {
    Router::new()
        .route("/items", post(add_to_cart))
        .route("/:user_id", get(get_cart).delete(delete_cart))
        .route("/:user_id/items/:item_id", put(update_cart_item))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct AddItemRequest {
    pub user_id: Uuid,
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct UpdateQuantityRequest {
    /// Zero removes the line
    #[validate(range(min = 0, max = 10000))]
    pub quantity: i32,
}

/// Add item to the user's cart, creating the cart on first use
async fn add_to_cart(
    State(state): State<AppState>,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .cart
        .add_item(payload.user_id, payload.product_id, payload.quantity)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Get cart with items
async fn get_cart(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .get_cart(user_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Update cart item quantity
async fn update_cart_item(
    State(state): State<AppState>,
    Path((user_id, item_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .cart
        .update_item(user_id, item_id, payload.quantity)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn delete_cart(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .services
        .cart
        .delete_cart(user_id)
        .await
        .map_err(map_service_error)?;

    Ok(no_content_response())
}
