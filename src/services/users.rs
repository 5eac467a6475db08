use crate::{
    entities::user::{self, UserRole},
    errors::ServiceError,
};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set, SqlErr};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Lookup of the users checkout acts on. Identity itself is managed elsewhere.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<user::Model>, ServiceError>;
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewUser {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[serde(default)]
    pub role: UserRole,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StoreDeviceTokenRequest {
    pub user_id: Uuid,
    #[validate(length(min = 1, max = 4096))]
    pub device_token: String,
}

#[derive(Clone)]
pub struct UserService {
    db: Arc<DatabaseConnection>,
}

impl UserService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, input), fields(email = %input.email))]
    pub async fn create_user(&self, input: NewUser) -> Result<user::Model, ServiceError> {
        input.validate()?;

        let now = Utc::now();
        let user = user::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(input.name),
            email: Set(input.email),
            password_hash: Set(None),
            role: Set(input.role),
            device_token: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(|e| match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                ServiceError::Conflict("Email already registered".to_string())
            }
            _ => ServiceError::DatabaseError(e),
        })?;

        info!(user_id = %user.id, "User created");
        Ok(user)
    }

    /// Registers the push notification token for a user's device.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn store_device_token(
        &self,
        request: StoreDeviceTokenRequest,
    ) -> Result<user::Model, ServiceError> {
        request.validate()?;

        let user = self
            .find_user(request.user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User", request.user_id))?;

        let mut active: user::ActiveModel = user.into();
        active.device_token = Set(Some(request.device_token));
        active.updated_at = Set(Utc::now());
        let user = active.update(&*self.db).await?;

        info!(user_id = %user.id, "Device token stored");
        Ok(user)
    }
}

#[async_trait]
impl UserDirectory for UserService {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<user::Model>, ServiceError> {
        Ok(user::Entity::find_by_id(user_id).one(&*self.db).await?)
    }
}
