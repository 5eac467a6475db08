use crate::handlers::common::{
    created_response, map_service_error, no_content_response, success_response, validate_input,
};
use crate::{
    errors::ApiError,
    services::catalog::{
        CatalogReader, CreateProductInput, ProductQuery, UpdateProductInput,
    },
    AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

/// Creates the router for product endpoints
pub fn products_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_products).post(create_product))
        .route(
            "/:id",
            get(get_product).put(update_product).delete(delete_product),
        )
}

/// Query string for product listings
#[derive(Debug, Default, Deserialize)]
pub struct ProductListParams {
    #[serde(default)]
    pub page: u64,
    #[serde(default)]
    pub limit: u64,
    /// Unrecognised fields sort by name
    pub sort_by: Option<String>,
    /// `desc` in any case sorts descending; anything else ascending
    pub order: Option<String>,
    pub category_id: Option<Uuid>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub search: Option<String>,
}

impl From<ProductListParams> for ProductQuery {
    fn from(params: ProductListParams) -> Self {
        ProductQuery {
            page: params.page,
            limit: params.limit,
            sort_by: lenient(params.sort_by.as_deref()),
            order: lenient(params.order.as_deref()),
            category_id: params.category_id,
            min_price: params.min_price,
            max_price: params.max_price,
            search: params.search,
        }
    }
}

fn lenient<T: std::str::FromStr + Default>(value: Option<&str>) -> T {
    value
        .and_then(|v| v.trim().to_ascii_lowercase().parse().ok())
        .unwrap_or_default()
}

async fn list_products(
    State(state): State<AppState>,
    Query(params): Query<ProductListParams>,
) -> Result<impl IntoResponse, ApiError> {
    if let (Some(min), Some(max)) = (params.min_price, params.max_price) {
        if min > max {
            return Err(ApiError::BadRequest(
                "min_price must not exceed max_price".to_string(),
            ));
        }
    }

    let page = state
        .services
        .catalog
        .list_products(params.into())
        .await
        .map_err(map_service_error)?;

    Ok(success_response(page))
}

async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let product = state
        .services
        .catalog
        .get_product(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(product))
}

async fn create_product(
    State(state): State<AppState>,
    Json(payload): Json<CreateProductInput>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let product = state
        .services
        .catalog
        .create_product(payload)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(product))
}

async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateProductInput>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let product = state
        .services
        .catalog
        .update_product(id, payload)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(product))
}

async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .services
        .catalog
        .delete_product(id)
        .await
        .map_err(map_service_error)?;

    Ok(no_content_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::catalog::{SortField, SortOrder};

    fn query(sort_by: Option<&str>, order: Option<&str>) -> ProductQuery {
        ProductListParams {
            sort_by: sort_by.map(str::to_string),
            order: order.map(str::to_string),
            ..Default::default()
        }
        .into()
    }

    #[test]
    fn unknown_sort_field_falls_back_to_name() {
        assert_eq!(query(Some("bogus"), None).sort_by, SortField::Name);
        assert_eq!(query(Some("Price"), None).sort_by, SortField::Price);
        assert_eq!(query(None, None).sort_by, SortField::Name);
    }

    #[test]
    fn order_is_case_insensitive_and_defaults_to_ascending() {
        assert_eq!(query(None, Some("DESC")).order, SortOrder::Desc);
        assert_eq!(query(None, Some("sideways")).order, SortOrder::Asc);
        assert_eq!(query(None, None).order, SortOrder::Asc);
    }
}
