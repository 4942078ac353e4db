//! Local persistent key-value store consumed by the optimistic store.
//!
//! [`LocalStore`] is the seam: the engine only needs named stores of JSON
//! values. [`SqliteLocalStore`] keeps them in the `local_kv` table of the
//! same database as the mutation queue.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::{AppError, Result};

use super::db::Database;
use super::format_ts;

/// Named-store key-value persistence.
///
/// Every method is atomic with respect to the keys it touches. Failures
/// surface as [`AppError::Storage`].
pub trait LocalStore: Send + Sync {
    /// All keys in `store`, sorted.
    fn get_all_keys<'a>(&'a self, store: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Value under `key`, or `None`.
    fn get_item<'a>(&'a self, store: &'a str, key: &'a str)
        -> BoxFuture<'a, Result<Option<Value>>>;

    /// Insert or overwrite one value.
    fn set_item<'a>(&'a self, store: &'a str, key: &'a str, value: Value)
        -> BoxFuture<'a, Result<()>>;

    /// Remove one value; removing a missing key is not an error.
    fn remove_item<'a>(&'a self, store: &'a str, key: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Insert or overwrite many values in one transaction.
    fn bulk_set<'a>(&'a self, store: &'a str, entries: Vec<(String, Value)>)
        -> BoxFuture<'a, Result<()>>;

    /// Replace the whole content of `store` in one transaction.
    fn replace_all<'a>(
        &'a self,
        store: &'a str,
        entries: Vec<(String, Value)>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Move a value from `from` to `to` (overwriting `value`) in one transaction.
    fn rekey<'a>(
        &'a self,
        store: &'a str,
        from: &'a str,
        to: &'a str,
        value: Value,
    ) -> BoxFuture<'a, Result<()>>;
}

/// [`LocalStore`] backed by the `local_kv` table.
#[derive(Clone)]
pub struct SqliteLocalStore {
    db: Arc<Database>,
}

impl SqliteLocalStore {
    /// Create a new store instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

fn storage_err(err: impl std::fmt::Display) -> AppError {
    AppError::Storage(err.to_string())
}

const UPSERT: &str = "INSERT INTO local_kv (store, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT(store, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

impl LocalStore for SqliteLocalStore {
    fn get_all_keys<'a>(&'a self, store: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let keys: Vec<(String,)> =
                sqlx::query_as("SELECT key FROM local_kv WHERE store = ?1 ORDER BY key ASC")
                    .bind(store)
                    .fetch_all(self.db.as_ref())
                    .await
                    .map_err(storage_err)?;
            Ok(keys.into_iter().map(|(key,)| key).collect())
        })
    }

    fn get_item<'a>(
        &'a self,
        store: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move {
            let raw: Option<(String,)> =
                sqlx::query_as("SELECT value FROM local_kv WHERE store = ?1 AND key = ?2")
                    .bind(store)
                    .bind(key)
                    .fetch_optional(self.db.as_ref())
                    .await
                    .map_err(storage_err)?;
            raw.map(|(value,)| serde_json::from_str(&value).map_err(storage_err))
                .transpose()
        })
    }

    fn set_item<'a>(
        &'a self,
        store: &'a str,
        key: &'a str,
        value: Value,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::query(UPSERT)
                .bind(store)
                .bind(key)
                .bind(value.to_string())
                .bind(format_ts(Utc::now()))
                .execute(self.db.as_ref())
                .await
                .map_err(storage_err)?;
            Ok(())
        })
    }

    fn remove_item<'a>(&'a self, store: &'a str, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM local_kv WHERE store = ?1 AND key = ?2")
                .bind(store)
                .bind(key)
                .execute(self.db.as_ref())
                .await
                .map_err(storage_err)?;
            Ok(())
        })
    }

    fn bulk_set<'a>(
        &'a self,
        store: &'a str,
        entries: Vec<(String, Value)>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let now = format_ts(Utc::now());
            let mut tx = self.db.begin().await.map_err(storage_err)?;
            for (key, value) in entries {
                sqlx::query(UPSERT)
                    .bind(store)
                    .bind(&key)
                    .bind(value.to_string())
                    .bind(&now)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
            }
            tx.commit().await.map_err(storage_err)
        })
    }

    fn replace_all<'a>(
        &'a self,
        store: &'a str,
        entries: Vec<(String, Value)>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let now = format_ts(Utc::now());
            let mut tx = self.db.begin().await.map_err(storage_err)?;
            sqlx::query("DELETE FROM local_kv WHERE store = ?1")
                .bind(store)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            for (key, value) in entries {
                sqlx::query(UPSERT)
                    .bind(store)
                    .bind(&key)
                    .bind(value.to_string())
                    .bind(&now)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
            }
            tx.commit().await.map_err(storage_err)
        })
    }

    fn rekey<'a>(
        &'a self,
        store: &'a str,
        from: &'a str,
        to: &'a str,
        value: Value,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut tx = self.db.begin().await.map_err(storage_err)?;
            sqlx::query("DELETE FROM local_kv WHERE store = ?1 AND key = ?2")
                .bind(store)
                .bind(from)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            sqlx::query(UPSERT)
                .bind(store)
                .bind(to)
                .bind(value.to_string())
                .bind(format_ts(Utc::now()))
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            tx.commit().await.map_err(storage_err)
        })
    }
}
