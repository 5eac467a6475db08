//! SeaORM entities for the storefront schema.

pub mod cart;
pub mod cart_item;
pub mod category;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod product;
pub mod user;
