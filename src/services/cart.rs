use crate::{
    entities::{cart, cart_item, user},
    errors::ServiceError,
    services::catalog::CatalogReader,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// A user's cart with its line items and derived totals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartWithItems {
    pub cart: cart::Model,
    pub items: Vec<cart_item::Model>,
    pub total: Decimal,
    pub total_items: i64,
}

impl CartWithItems {
    fn new(cart: cart::Model, items: Vec<cart_item::Model>) -> Self {
        let total = items.iter().map(|i| i.total).sum();
        let total_items = items.iter().map(|i| i64::from(i.quantity)).sum();
        Self {
            cart,
            items,
            total,
            total_items,
        }
    }
}

/// Per-user cart storage
#[async_trait]
pub trait CartStore: Send + Sync {
    /// Adds `quantity` of a product, merging with an existing line for the same product.
    async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartWithItems, ServiceError>;

    async fn get_cart(&self, user_id: Uuid) -> Result<CartWithItems, ServiceError>;

    /// Sets a line's quantity; zero or less removes the line.
    async fn update_item(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartWithItems, ServiceError>;

    async fn clear_items(&self, user_id: Uuid) -> Result<u64, ServiceError>;

    async fn delete_cart(&self, user_id: Uuid) -> Result<(), ServiceError>;

    async fn items_for_user(&self, user_id: Uuid) -> Result<Vec<cart_item::Model>, ServiceError>;
}

fn line_total(price: Decimal, quantity: i32) -> Result<Decimal, ServiceError> {
    price
        .checked_mul(Decimal::from(quantity))
        .ok_or_else(|| ServiceError::ValidationError("Line total out of range".to_string()))
}

async fn find_cart<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<Option<cart::Model>, ServiceError> {
    Ok(cart::Entity::find()
        .filter(cart::Column::UserId.eq(user_id))
        .one(conn)
        .await?)
}

async fn load_items<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<cart_item::Model>, ServiceError> {
    Ok(cart_item::Entity::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .all(conn)
        .await?)
}

/// Cart service backed by the `carts` / `cart_items` tables.
///
/// Unit prices are captured from the catalog when a product is added; later price
/// changes do not reprice lines already in a cart.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn CatalogReader>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, catalog: Arc<dyn CatalogReader>) -> Self {
        Self { db, catalog }
    }

    async fn require_cart(&self, user_id: Uuid) -> Result<cart::Model, ServiceError> {
        find_cart(&*self.db, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart for user {} not found", user_id)))
    }
}

#[async_trait]
impl CartStore for CartService {
    #[instrument(skip(self))]
    async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartWithItems, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Quantity must be greater than zero".to_string(),
            ));
        }

        if user::Entity::find_by_id(user_id).one(&*self.db).await?.is_none() {
            return Err(ServiceError::not_found("User", user_id));
        }
        let product = self.catalog.get_product(product_id).await?;

        let txn = self.db.begin().await?;
        let now = Utc::now();

        let cart = match find_cart(&txn, user_id).await? {
            Some(cart) => cart,
            None => {
                cart::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(user_id),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?
            }
        };

        let existing = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?;

        match existing {
            Some(item) => {
                let new_quantity = item.quantity.checked_add(quantity).ok_or_else(|| {
                    ServiceError::ValidationError("Quantity out of range".to_string())
                })?;
                let mut item: cart_item::ActiveModel = item.into();
                item.quantity = Set(new_quantity);
                item.price = Set(product.price);
                item.total = Set(line_total(product.price, new_quantity)?);
                item.updated_at = Set(now);
                item.update(&txn).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product_id),
                    quantity: Set(quantity),
                    price: Set(product.price),
                    total: Set(line_total(product.price, quantity)?),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
            }
        }

        let items = load_items(&txn, cart.id).await?;
        txn.commit().await?;

        info!(%user_id, %product_id, quantity, "Item added to cart");
        Ok(CartWithItems::new(cart, items))
    }

    #[instrument(skip(self))]
    async fn get_cart(&self, user_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let cart = self.require_cart(user_id).await?;
        let items = load_items(&*self.db, cart.id).await?;
        Ok(CartWithItems::new(cart, items))
    }

    #[instrument(skip(self))]
    async fn update_item(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartWithItems, ServiceError> {
        let cart = self.require_cart(user_id).await?;

        let item = cart_item::Entity::find_by_id(item_id)
            .filter(cart_item::Column::CartId.eq(cart.id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::not_found("Cart item", item_id))?;

        if quantity <= 0 {
            cart_item::Entity::delete_by_id(item.id)
                .exec(&*self.db)
                .await?;
            info!(%user_id, %item_id, "Cart item removed");
        } else {
            let price = item.price;
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(quantity);
            item.total = Set(line_total(price, quantity)?);
            item.updated_at = Set(Utc::now());
            item.update(&*self.db).await?;
            info!(%user_id, %item_id, quantity, "Cart item updated");
        }

        let items = load_items(&*self.db, cart.id).await?;
        Ok(CartWithItems::new(cart, items))
    }

    #[instrument(skip(self))]
    async fn clear_items(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        let cart = self.require_cart(user_id).await?;
        let result = cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }

    #[instrument(skip(self))]
    async fn delete_cart(&self, user_id: Uuid) -> Result<(), ServiceError> {
        let cart = self.require_cart(user_id).await?;

        let txn = self.db.begin().await?;
        cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
        cart::Entity::delete_by_id(cart.id).exec(&txn).await?;
        txn.commit().await?;

        info!(%user_id, "Cart deleted");
        Ok(())
    }

    async fn items_for_user(&self, user_id: Uuid) -> Result<Vec<cart_item::Model>, ServiceError> {
        match find_cart(&*self.db, user_id).await? {
            Some(cart) => load_items(&*self.db, cart.id).await,
            None => Ok(Vec::new()),
        }
    }
}
