use crate::{
    entities::{order, payment},
    errors::ServiceError,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// A settled charge to be recorded against its order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub order_id: Uuid,
    pub idempotency_key: String,
    pub transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub payment_method: String,
    pub attempts: u32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn find_succeeded(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<payment::Model>, ServiceError>;

    /// Upserts the payment row for the record's key and stamps the order, atomically.
    /// A key already bound to a different order is a `Conflict` and changes nothing.
    async fn record_success(&self, record: PaymentRecord) -> Result<payment::Model, ServiceError>;
}

#[derive(Clone)]
pub struct SeaOrmPaymentLedger {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmPaymentLedger {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn payments_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<payment::Model>, ServiceError> {
        Ok(payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?)
    }
}

#[async_trait]
impl PaymentLedger for SeaOrmPaymentLedger {
    async fn find_succeeded(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<payment::Model>, ServiceError> {
        Ok(payment::Entity::find()
            .filter(payment::Column::IdempotencyKey.eq(idempotency_key))
            .filter(payment::Column::Status.eq(payment::STATUS_SUCCEEDED))
            .one(&*self.db)
            .await?)
    }

    #[instrument(skip(self, record), fields(order_id = %record.order_id))]
    async fn record_success(&self, record: PaymentRecord) -> Result<payment::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let now = Utc::now();
        let attempts = i32::try_from(record.attempts).unwrap_or(i32::MAX);

        let row = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(record.order_id),
            idempotency_key: Set(record.idempotency_key.clone()),
            transaction_id: Set(record.transaction_id.clone()),
            amount: Set(record.amount),
            currency: Set(record.currency),
            status: Set(record.status.clone()),
            payment_method: Set(record.payment_method),
            attempts: Set(attempts),
            created_at: Set(now),
            updated_at: Set(now),
        };
        payment::Entity::insert(row)
            .on_conflict(
                OnConflict::column(payment::Column::IdempotencyKey)
                    .update_columns([
                        payment::Column::TransactionId,
                        payment::Column::Status,
                        payment::Column::Attempts,
                        payment::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&txn)
            .await?;

        let updated = order::Entity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(record.status))
            .col_expr(
                order::Column::TransactionId,
                Expr::value(Some(record.transaction_id)),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(record.order_id))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            txn.rollback().await?;
            return Err(ServiceError::not_found("Order", record.order_id));
        }

        let payment = payment::Entity::find()
            .filter(payment::Column::IdempotencyKey.eq(record.idempotency_key.as_str()))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "payment row for key {} missing after upsert",
                    record.idempotency_key
                ))
            })?;
        if payment.order_id != record.order_id {
            txn.rollback().await?;
            return Err(ServiceError::Conflict(format!(
                "Transaction id {} already used for another order",
                record.idempotency_key
            )));
        }

        txn.commit().await?;
        Ok(payment)
    }
}
