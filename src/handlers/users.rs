use crate::handlers::common::{created_response, map_service_error, success_response, validate_input};
use crate::{
    errors::ApiError,
    services::users::{NewUser, StoreDeviceTokenRequest},
    AppState,
};
use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::post,
    Router,
};
use serde_json::json;

pub fn users_routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(create_user))
        .route("/store-device-token", post(store_device_token))
}

async fn create_user(
    State(state): State<AppState>,
    Json(payload): Json<NewUser>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let user = state
        .services
        .users
        .create_user(payload)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(user))
}

async fn store_device_token(
    State(state): State<AppState>,
    Json(payload): Json<StoreDeviceTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let user = state
        .services
        .users
        .store_device_token(payload)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(json!({
        "message": "Device token stored",
        "user_id": user.id,
    })))
}
