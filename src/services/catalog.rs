use crate::{
    cache::{CacheBackend, CacheKey},
    entities::{category, product},
    errors::ServiceError,
};
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, Func, LikeExpr},
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, Order, PaginatorTrait,
    QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

pub const DEFAULT_PAGE_SIZE: u64 = 10;
pub const MAX_PAGE_SIZE: u64 = 100;

const PRODUCT_KEY: &str = "product";
const PRODUCT_LIST_KEY: &str = "products:list";
const CATEGORY_KEY: &str = "category";
const CATEGORY_LIST_KEY: &str = "categories:list";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SortField {
    #[default]
    Name,
    Price,
    CreatedAt,
    AverageRating,
}

impl SortField {
    fn column(self) -> product::Column {
        match self {
            SortField::Name => product::Column::Name,
            SortField::Price => product::Column::Price,
            SortField::CreatedAt => product::Column::CreatedAt,
            SortField::AverageRating => product::Column::AverageRating,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Normalized product listing request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductQuery {
    pub page: u64,
    pub limit: u64,
    pub sort_by: SortField,
    pub order: SortOrder,
    pub category_id: Option<Uuid>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub search: Option<String>,
}

impl ProductQuery {
    /// Clamps paging into range and drops blank search terms, so equivalent requests
    /// share a cache entry.
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.limit = match self.limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        self.search = self
            .search
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        self
    }

    fn cache_key(&self) -> String {
        CacheKey::new(PRODUCT_LIST_KEY)
            .part("page", self.page)
            .part("limit", self.limit)
            .part("sort_by", self.sort_by)
            .part("order", self.order)
            .opt_part("category", self.category_id)
            .opt_part("min_price", self.min_price.map(|p| p.normalize()))
            .opt_part("max_price", self.max_price.map(|p| p.normalize()))
            .opt_part("search", self.search.as_deref())
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

/// Read side of the catalog
#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn get_product(&self, id: Uuid) -> Result<product::Model, ServiceError>;
    async fn list_products(&self, query: ProductQuery) -> Result<Page<product::Model>, ServiceError>;
    async fn get_category(&self, id: Uuid) -> Result<category::Model, ServiceError>;
    async fn list_categories(&self) -> Result<Vec<category::Model>, ServiceError>;
}

fn validate_non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() {
        return Err(ValidationError::new("must_not_be_negative"));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateProductInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub description: Option<String>,
    #[validate(custom = "validate_non_negative")]
    pub price: Decimal,
    #[validate(range(min = 0))]
    #[serde(default)]
    pub quantity: i32,
    pub category_id: Option<Uuid>,
    #[validate(length(min = 1, max = 64))]
    pub sku: String,
    pub brand: Option<String>,
    #[validate(custom = "validate_non_negative")]
    #[serde(default)]
    pub discount: Decimal,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateProductInput {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[validate(custom = "validate_non_negative")]
    pub price: Option<Decimal>,
    #[validate(range(min = 0))]
    pub quantity: Option<i32>,
    pub category_id: Option<Uuid>,
    pub brand: Option<String>,
    #[validate(custom = "validate_non_negative")]
    pub discount: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateCategoryInput {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub description: Option<String>,
}

fn conflict_on_unique(err: DbErr, what: &str) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            ServiceError::Conflict(format!("{} already exists", what))
        }
        _ => ServiceError::DatabaseError(err),
    }
}

/// Catalog service with a cache-aside read path.
///
/// Reads try the cache first. A miss, a backend error, or an undecodable entry falls
/// through to the database, and the fresh result is written back in the background.
/// Writes go to the database and evict the affected single-item entries; listings age
/// out with their TTL.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
    cache: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>, cache: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { db, cache, ttl }
    }

    async fn read_through<T, F, Fut>(&self, key: String, load: F) -> Result<T, ServiceError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    debug!(%key, "Catalog cache hit");
                    counter!("storefront.catalog.cache_hits", 1);
                    return Ok(value);
                }
                Err(e) => warn!(%key, error = %e, "Discarding undecodable cache entry"),
            },
            Ok(None) => debug!(%key, "Catalog cache miss"),
            Err(e) => {
                warn!(%key, error = %e, "Cache read failed; serving from database");
                counter!("storefront.catalog.cache_errors", 1);
            }
        }
        counter!("storefront.catalog.cache_misses", 1);

        let value = load().await?;
        self.populate(key, &value);
        Ok(value)
    }

    /// Best-effort write-back. Never affects the response.
    fn populate<T: Serialize>(&self, key: String, value: &T) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%key, error = %e, "Failed to serialize value for cache");
                return;
            }
        };
        let cache = Arc::clone(&self.cache);
        let ttl = self.ttl;
        tokio::spawn(async move {
            if let Err(e) = cache.set(&key, &payload, Some(ttl)).await {
                warn!(%key, error = %e, "Cache write failed");
            }
        });
    }

    async fn evict(&self, key: String) {
        if let Err(e) = self.cache.delete(&key).await {
            warn!(%key, error = %e, "Cache eviction failed");
        }
    }

    async fn load_products(&self, query: &ProductQuery) -> Result<Page<product::Model>, ServiceError> {
        let mut select = product::Entity::find();

        if let Some(category_id) = query.category_id {
            select = select.filter(product::Column::CategoryId.eq(category_id));
        }
        if let Some(min) = query.min_price {
            select = select.filter(product::Column::Price.gte(min));
        }
        if let Some(max) = query.max_price {
            select = select.filter(product::Column::Price.lte(max));
        }
        if let Some(search) = &query.search {
            let escaped = search
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            select = select.filter(
                Expr::expr(Func::lower(Expr::col(product::Column::Name)))
                    .like(LikeExpr::new(format!("%{}%", escaped)).escape('\\')),
            );
        }

        let order = match query.order {
            SortOrder::Asc => Order::Asc,
            SortOrder::Desc => Order::Desc,
        };
        let select = select
            .order_by(query.sort_by.column(), order)
            .order_by_asc(product::Column::Id);

        let paginator = select.paginate(&*self.db, query.limit);
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(query.page - 1).await?;

        Ok(Page {
            items,
            total,
            page: query.page,
            limit: query.limit,
            total_pages: total.div_ceil(query.limit),
        })
    }

    #[instrument(skip(self, input), fields(sku = %input.sku))]
    pub async fn create_product(&self, input: CreateProductInput) -> Result<product::Model, ServiceError> {
        input.validate()?;
        if let Some(category_id) = input.category_id {
            self.get_category(category_id).await?;
        }

        let now = Utc::now();
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(input.name),
            description: Set(input.description),
            price: Set(input.price),
            quantity: Set(input.quantity),
            category_id: Set(input.category_id),
            sku: Set(input.sku),
            brand: Set(input.brand),
            discount: Set(input.discount),
            average_rating: Set(Decimal::ZERO),
            number_of_ratings: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(|e| conflict_on_unique(e, "Product SKU"))?;

        info!(product_id = %model.id, "Product created");
        Ok(model)
    }

    #[instrument(skip(self, input))]
    pub async fn update_product(
        &self,
        id: Uuid,
        input: UpdateProductInput,
    ) -> Result<product::Model, ServiceError> {
        input.validate()?;
        if let Some(category_id) = input.category_id {
            self.get_category(category_id).await?;
        }

        let existing = product::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::not_found("Product", id))?;

        let mut model: product::ActiveModel = existing.into();
        if let Some(name) = input.name {
            model.name = Set(name);
        }
        if let Some(description) = input.description {
            model.description = Set(Some(description));
        }
        if let Some(price) = input.price {
            model.price = Set(price);
        }
        if let Some(quantity) = input.quantity {
            model.quantity = Set(quantity);
        }
        if let Some(category_id) = input.category_id {
            model.category_id = Set(Some(category_id));
        }
        if let Some(brand) = input.brand {
            model.brand = Set(Some(brand));
        }
        if let Some(discount) = input.discount {
            model.discount = Set(discount);
        }
        model.updated_at = Set(Utc::now());

        let updated = model.update(&*self.db).await?;
        self.evict(CacheKey::entity(PRODUCT_KEY, id)).await;

        info!(product_id = %id, "Product updated");
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn delete_product(&self, id: Uuid) -> Result<(), ServiceError> {
        let result = product::Entity::delete_by_id(id).exec(&*self.db).await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::not_found("Product", id));
        }
        self.evict(CacheKey::entity(PRODUCT_KEY, id)).await;

        info!(product_id = %id, "Product deleted");
        Ok(())
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_category(
        &self,
        input: CreateCategoryInput,
    ) -> Result<category::Model, ServiceError> {
        input.validate()?;

        let now = Utc::now();
        let model = category::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(input.name),
            description: Set(input.description),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(|e| conflict_on_unique(e, "Category name"))?;

        self.evict(CATEGORY_LIST_KEY.to_string()).await;
        info!(category_id = %model.id, "Category created");
        Ok(model)
    }

    /// Deletes a category. Its products stay in the catalog, uncategorized.
    #[instrument(skip(self))]
    pub async fn delete_category(&self, id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let orphaned: Vec<Uuid> = product::Entity::find()
            .filter(product::Column::CategoryId.eq(id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        product::Entity::update_many()
            .col_expr(product::Column::CategoryId, Expr::value(Option::<Uuid>::None))
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::CategoryId.eq(id))
            .exec(&txn)
            .await?;

        let result = category::Entity::delete_by_id(id).exec(&txn).await?;
        if result.rows_affected == 0 {
            txn.rollback().await?;
            return Err(ServiceError::not_found("Category", id));
        }
        txn.commit().await?;

        self.evict(CacheKey::entity(CATEGORY_KEY, id)).await;
        self.evict(CATEGORY_LIST_KEY.to_string()).await;
        for product_id in &orphaned {
            self.evict(CacheKey::entity(PRODUCT_KEY, product_id)).await;
        }

        info!(category_id = %id, products = orphaned.len(), "Category deleted");
        Ok(())
    }
}

#[async_trait]
impl CatalogReader for CatalogService {
    #[instrument(skip(self))]
    async fn get_product(&self, id: Uuid) -> Result<product::Model, ServiceError> {
        self.read_through(CacheKey::entity(PRODUCT_KEY, id), || async move {
            product::Entity::find_by_id(id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| ServiceError::not_found("Product", id))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_products(&self, query: ProductQuery) -> Result<Page<product::Model>, ServiceError> {
        let query = query.normalized();
        let key = query.cache_key();
        self.read_through(key, || self.load_products(&query)).await
    }

    #[instrument(skip(self))]
    async fn get_category(&self, id: Uuid) -> Result<category::Model, ServiceError> {
        self.read_through(CacheKey::entity(CATEGORY_KEY, id), || async move {
            category::Entity::find_by_id(id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| ServiceError::not_found("Category", id))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_categories(&self) -> Result<Vec<category::Model>, ServiceError> {
        self.read_through(CATEGORY_LIST_KEY.to_string(), || async move {
            Ok(category::Entity::find()
                .order_by_asc(category::Column::Name)
                .all(&*self.db)
                .await?)
        })
        .await
    }
}
