use crate::{
    entities::{
        cart, cart_item,
        order::{self, OrderStatus, PAYMENT_STATUS_PENDING},
        order_item,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Checkout details copied onto the order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub payment_method: String,
    pub shipping_address: Option<String>,
    pub delivery_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// A cart line as seen by order assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineInput {
    pub product_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
}

impl From<&cart_item::Model> for LineInput {
    fn from(item: &cart_item::Model) -> Self {
        Self {
            product_id: item.product_id,
            quantity: item.quantity,
            price: item.price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTotal {
    pub product_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
    pub total: Decimal,
}

/// Prices each line and sums the order. Fails on a non-positive quantity, a negative
/// price, or arithmetic overflow; never rounds.
pub fn price_lines(lines: &[LineInput]) -> Result<(Vec<LineTotal>, Decimal), ServiceError> {
    let mut grand_total = Decimal::ZERO;
    let mut priced = Vec::with_capacity(lines.len());

    for line in lines {
        if line.quantity <= 0 {
            return Err(ServiceError::ComputeFailure(format!(
                "non-positive quantity {} for product {}",
                line.quantity, line.product_id
            )));
        }
        if line.price.is_sign_negative() {
            return Err(ServiceError::ComputeFailure(format!(
                "negative price for product {}",
                line.product_id
            )));
        }
        let total = line
            .price
            .checked_mul(Decimal::from(line.quantity))
            .ok_or_else(|| ServiceError::ComputeFailure("line total overflow".to_string()))?;
        grand_total = grand_total
            .checked_add(total)
            .ok_or_else(|| ServiceError::ComputeFailure("order total overflow".to_string()))?;

        priced.push(LineTotal {
            product_id: line.product_id,
            quantity: line.quantity,
            price: line.price,
            total,
        });
    }

    Ok((priced, grand_total))
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Converts the user's cart into an order and empties the cart, atomically.
    async fn build_order(
        &self,
        user_id: Uuid,
        details: OrderDetails,
    ) -> Result<OrderWithItems, ServiceError>;

    async fn get_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError>;

    /// Marks the order completed. Completing a completed order is a no-op.
    async fn confirm_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError>;

    async fn set_payment_status(&self, order_id: Uuid, status: &str) -> Result<(), ServiceError>;
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }
}

#[async_trait]
impl OrderStore for OrderService {
    #[instrument(skip(self, details))]
    async fn build_order(
        &self,
        user_id: Uuid,
        details: OrderDetails,
    ) -> Result<OrderWithItems, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = cart::Entity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&txn)
            .await?;
        let items = match &cart {
            Some(cart) => {
                cart_item::Entity::find()
                    .filter(cart_item::Column::CartId.eq(cart.id))
                    .all(&txn)
                    .await?
            }
            None => Vec::new(),
        };
        if items.is_empty() {
            txn.rollback().await?;
            return Err(ServiceError::EmptyCart);
        }

        let lines: Vec<LineInput> = items.iter().map(LineInput::from).collect();
        let (priced, total_amount) = match price_lines(&lines) {
            Ok(priced) => priced,
            Err(e) => {
                txn.rollback().await?;
                return Err(e);
            }
        };

        let now = Utc::now();
        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            order_time: Set(now),
            total_amount: Set(total_amount),
            payment_method: Set(details.payment_method),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PAYMENT_STATUS_PENDING.to_string()),
            transaction_id: Set(None),
            shipping_address: Set(details.shipping_address),
            delivery_notes: Set(details.delivery_notes),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let order_items: Vec<order_item::Model> = priced
            .into_iter()
            .map(|line| order_item::Model {
                id: Uuid::new_v4(),
                order_id: order.id,
                product_id: line.product_id,
                quantity: line.quantity,
                price: line.price,
                total: line.total,
            })
            .collect();
        order_item::Entity::insert_many(order_items.iter().map(|item| order_item::ActiveModel {
            id: Set(item.id),
            order_id: Set(item.order_id),
            product_id: Set(item.product_id),
            quantity: Set(item.quantity),
            price: Set(item.price),
            total: Set(item.total),
        }))
        .exec_without_returning(&txn)
        .await?;

        // Remove exactly the snapshotted lines. A shortfall means another request
        // touched the cart since it was read.
        let item_ids: Vec<Uuid> = items.iter().map(|i| i.id).collect();
        let deleted = cart_item::Entity::delete_many()
            .filter(cart_item::Column::Id.is_in(item_ids))
            .exec(&txn)
            .await?
            .rows_affected;
        if deleted != items.len() as u64 {
            warn!(%user_id, expected = items.len(), deleted, "Cart changed during checkout");
            txn.rollback().await?;
            return Err(ServiceError::Conflict(
                "Cart changed during checkout; please retry".to_string(),
            ));
        }

        txn.commit().await?;

        info!(
            order_id = %order.id,
            %user_id,
            total = %order.total_amount,
            items = order_items.len(),
            "Order created from cart"
        );
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                user_id,
                total: order.total_amount,
            })
            .await;
        self.event_sender
            .send_or_log(Event::CartCleared {
                user_id,
                items: items.len(),
            })
            .await;

        Ok(OrderWithItems {
            order,
            items: order_items,
        })
    }

    #[instrument(skip(self))]
    async fn get_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::not_found("Order", order_id))?;
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::ProductId)
            .all(&*self.db)
            .await?;
        Ok(OrderWithItems { order, items })
    }

    #[instrument(skip(self))]
    async fn confirm_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::not_found("Order", order_id))?;

        if order.status == OrderStatus::Completed {
            return Ok(order);
        }

        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::Completed);
        active.updated_at = Set(Utc::now());
        let order = active.update(&*self.db).await?;

        info!(%order_id, "Order completed");
        self.event_sender
            .send_or_log(Event::OrderCompleted(order_id))
            .await;
        Ok(order)
    }

    #[instrument(skip(self))]
    async fn set_payment_status(&self, order_id: Uuid, status: &str) -> Result<(), ServiceError> {
        let result = order::Entity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(status))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::not_found("Order", order_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn line(quantity: i32, price: Decimal) -> LineInput {
        LineInput {
            product_id: Uuid::new_v4(),
            quantity,
            price,
        }
    }

    #[test]
    fn prices_each_line_and_sums() {
        let (lines, total) =
            price_lines(&[line(2, dec!(50.00)), line(1, dec!(25.00))]).unwrap();
        assert_eq!(lines[0].total, dec!(100.00));
        assert_eq!(lines[1].total, dec!(25.00));
        assert_eq!(total, dec!(125.00));
    }

    #[test]
    fn keeps_sub_cent_precision() {
        let (_, total) = price_lines(&[line(3, dec!(0.333))]).unwrap();
        assert_eq!(total, dec!(0.999));
    }

    #[test]
    fn rejects_bad_lines() {
        assert!(matches!(
            price_lines(&[line(0, dec!(1))]),
            Err(ServiceError::ComputeFailure(_))
        ));
        assert!(matches!(
            price_lines(&[line(1, dec!(-1))]),
            Err(ServiceError::ComputeFailure(_))
        ));
        assert!(matches!(
            price_lines(&[line(i32::MAX, Decimal::MAX)]),
            Err(ServiceError::ComputeFailure(_))
        ));
    }
}
