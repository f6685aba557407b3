//! Device-side key/value store for the offline queue, the device fingerprint
//! and the encrypted credential blob.

use crate::error::AppError;
use async_trait::async_trait;
use chrono::Utc;
use db::models::local_cache_entry::{self, Entity as CacheEntry};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, DatabaseConnection, EntityTrait};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;

#[async_trait]
pub trait LocalCache: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn set_raw(&self, key: &str, value: String) -> Result<(), AppError>;
    async fn remove(&self, key: &str) -> Result<(), AppError>;
}

/// Typed access on top of any [`LocalCache`], values stored as JSON.
pub trait LocalCacheExt: LocalCache {
    fn get<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<T>, AppError>> + Send {
        async move {
            match self.get_raw(key).await? {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        }
    }

    fn set<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> impl Future<Output = Result<(), AppError>> + Send {
        async move {
            let raw = serde_json::to_string(value)?;
            self.set_raw(key, raw).await
        }
    }
}

impl<C: LocalCache + ?Sized> LocalCacheExt for C {}

/// [`LocalCache`] over the `local_cache` table.
#[derive(Clone)]
pub struct SqlLocalCache {
    db: DatabaseConnection,
}

impl SqlLocalCache {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LocalCache for SqlLocalCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(CacheEntry::find_by_id(key.to_owned())
            .one(&self.db)
            .await?
            .map(|row| row.value))
    }

    async fn set_raw(&self, key: &str, value: String) -> Result<(), AppError> {
        let row = local_cache_entry::ActiveModel {
            key: Set(key.to_owned()),
            value: Set(value),
            updated_at: Set(Utc::now()),
        };
        CacheEntry::insert(row)
            .on_conflict(
                OnConflict::column(local_cache_entry::Column::Key)
                    .update_columns([
                        local_cache_entry::Column::Value,
                        local_cache_entry::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AppError> {
        CacheEntry::delete_by_id(key.to_owned())
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
