//! Storefront API Library
//!
//! Catalog, carts, and the checkout pipeline (order assembly, payment and confirmation)
//! behind an axum HTTP surface.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod health;
pub mod migrator;
pub mod services;

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub services: handlers::AppServices,
}

/// Routes served under `/api/v1`
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .nest("/products", handlers::products::products_routes())
        .nest("/categories", handlers::categories::categories_routes())
        .nest("/cart", handlers::carts::carts_routes())
        .merge(handlers::checkout::checkout_routes())
        .merge(handlers::users::users_routes())
}

/// Full application router: health endpoints plus the versioned API, with request tracing.
pub fn build_router(state: AppState, health: Arc<health::HealthState>) -> Router {
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .with_state(state)
        .nest("/health", health::health_routes(health))
        .layer(TraceLayer::new_for_http())
}
