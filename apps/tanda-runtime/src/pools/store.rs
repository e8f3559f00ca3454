use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tanda_core::Pool;
use tokio::sync::Mutex;

use crate::db::TandaDb;

#[derive(Debug, thiserror::Error)]
pub enum PoolStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Persistence for the pool aggregate. Every write is conditional on the
/// version the caller read, so concurrent commits cannot both land.
#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn insert_pool(&self, pool: Pool) -> Result<Pool, PoolStoreError>;
    async fn get_pool(&self, pool_id: &str) -> Result<Option<Pool>, PoolStoreError>;
    async fn get_pools(&self, pool_ids: &[String]) -> Result<Vec<Pool>, PoolStoreError>;

    /// Writes `pool` if the stored version still equals `expected_version`
    /// and returns it at the next version; `Conflict` otherwise.
    async fn commit_pool(&self, pool: Pool, expected_version: u64) -> Result<Pool, PoolStoreError>;
}

pub fn memory() -> Arc<dyn PoolStore> {
    Arc::new(MemoryPoolStore::default())
}

pub fn postgres(db: Arc<TandaDb>) -> Arc<dyn PoolStore> {
    Arc::new(PostgresPoolStore { db })
}

#[derive(Default)]
struct MemoryPoolStore {
    inner: Mutex<MemoryPoolInner>,
}

#[derive(Default)]
struct MemoryPoolInner {
    pools: HashMap<String, Pool>,
}

#[async_trait]
impl PoolStore for MemoryPoolStore {
    async fn insert_pool(&self, pool: Pool) -> Result<Pool, PoolStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.pools.contains_key(&pool.pool_id) {
            return Err(PoolStoreError::Conflict(format!(
                "pool {} already exists",
                pool.pool_id
            )));
        }
        let pool = Pool { version: 0, ..pool };
        inner.pools.insert(pool.pool_id.clone(), pool.clone());
        Ok(pool)
    }

    async fn get_pool(&self, pool_id: &str) -> Result<Option<Pool>, PoolStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.pools.get(pool_id).cloned())
    }

    async fn get_pools(&self, pool_ids: &[String]) -> Result<Vec<Pool>, PoolStoreError> {
        let inner = self.inner.lock().await;
        Ok(pool_ids
            .iter()
            .filter_map(|pool_id| inner.pools.get(pool_id).cloned())
            .collect())
    }

    async fn commit_pool(&self, pool: Pool, expected_version: u64) -> Result<Pool, PoolStoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .pools
            .get_mut(&pool.pool_id)
            .ok_or_else(|| PoolStoreError::NotFound(pool.pool_id.clone()))?;
        if stored.version != expected_version {
            return Err(PoolStoreError::Conflict(format!(
                "pool {} is at version {}, expected {expected_version}",
                pool.pool_id, stored.version
            )));
        }
        let pool = Pool {
            version: expected_version + 1,
            ..pool
        };
        *stored = pool.clone();
        Ok(pool)
    }
}

struct PostgresPoolStore {
    db: Arc<TandaDb>,
}

#[async_trait]
impl PoolStore for PostgresPoolStore {
    async fn insert_pool(&self, pool: Pool) -> Result<Pool, PoolStoreError> {
        let pool = Pool { version: 0, ..pool };
        let document = pool_document(&pool)?;
        let client = self.db.client();
        let client = client.lock().await;
        let inserted = client
            .execute(
                r#"
                INSERT INTO tanda.pools (
                  pool_id,
                  created_by,
                  document,
                  version,
                  created_at,
                  updated_at
                )
                VALUES ($1,$2,$3,0,$4,$5)
                ON CONFLICT (pool_id) DO NOTHING
                "#,
                &[
                    &pool.pool_id,
                    &pool.created_by,
                    &document,
                    &pool.created_at,
                    &pool.updated_at,
                ],
            )
            .await
            .map_err(|error| PoolStoreError::Db(error.to_string()))?;
        if inserted == 0 {
            return Err(PoolStoreError::Conflict(format!(
                "pool {} already exists",
                pool.pool_id
            )));
        }
        Ok(pool)
    }

    async fn get_pool(&self, pool_id: &str) -> Result<Option<Pool>, PoolStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT document, version FROM tanda.pools WHERE pool_id = $1",
                &[&pool_id],
            )
            .await
            .map_err(|error| PoolStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(map_pool_row(&row).map_err(PoolStoreError::Db)?))
    }

    async fn get_pools(&self, pool_ids: &[String]) -> Result<Vec<Pool>, PoolStoreError> {
        if pool_ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT document, version
                  FROM tanda.pools
                 WHERE pool_id = ANY($1)
                 ORDER BY created_at ASC
                "#,
                &[&pool_ids],
            )
            .await
            .map_err(|error| PoolStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(|row| map_pool_row(row).map_err(PoolStoreError::Db))
            .collect()
    }

    async fn commit_pool(&self, pool: Pool, expected_version: u64) -> Result<Pool, PoolStoreError> {
        let next_version = expected_version + 1;
        let pool = Pool {
            version: next_version,
            ..pool
        };
        let document = pool_document(&pool)?;
        let expected = i64::try_from(expected_version)
            .map_err(|error| PoolStoreError::Db(error.to_string()))?;

        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| PoolStoreError::Db(error.to_string()))?;
        let updated = tx
            .execute(
                r#"
                UPDATE tanda.pools
                   SET document = $3,
                       version = version + 1,
                       updated_at = $4
                 WHERE pool_id = $1
                   AND version = $2
                "#,
                &[&pool.pool_id, &expected, &document, &pool.updated_at],
            )
            .await
            .map_err(|error| PoolStoreError::Db(error.to_string()))?;
        if updated == 0 {
            let exists = tx
                .query_opt(
                    "SELECT version FROM tanda.pools WHERE pool_id = $1",
                    &[&pool.pool_id],
                )
                .await
                .map_err(|error| PoolStoreError::Db(error.to_string()))?;
            return Err(match exists {
                Some(_) => PoolStoreError::Conflict(format!(
                    "pool {} changed since version {expected_version}",
                    pool.pool_id
                )),
                None => PoolStoreError::NotFound(pool.pool_id.clone()),
            });
        }
        tx.commit()
            .await
            .map_err(|error| PoolStoreError::Db(error.to_string()))?;
        Ok(pool)
    }
}

fn pool_document(pool: &Pool) -> Result<serde_json::Value, PoolStoreError> {
    serde_json::to_value(pool).map_err(|error| PoolStoreError::Db(error.to_string()))
}

/// The `version` column wins over whatever the document carries.
fn map_pool_row(row: &tokio_postgres::Row) -> Result<Pool, String> {
    let document: serde_json::Value = row.get("document");
    let version: i64 = row.get("version");
    let mut pool: Pool = serde_json::from_value(document).map_err(|error| error.to_string())?;
    pool.version = u64::try_from(version).map_err(|error| error.to_string())?;
    Ok(pool)
}
