use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tanda_core::MfaPolicy;
use tokio::sync::Mutex;

use crate::accounts::types::{SessionRecord, UserRecord};
use crate::db::TandaDb;

#[derive(Debug, thiserror::Error)]
pub enum AccountStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fails `Conflict` when the email is already registered.
    async fn insert_user(&self, user: UserRecord) -> Result<UserRecord, AccountStoreError>;
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, AccountStoreError>;
    async fn find_user_by_email(&self, email: &str)
    -> Result<Option<UserRecord>, AccountStoreError>;

    /// Conditional write keyed on `expected_version`; the stored version is
    /// bumped on success.
    async fn commit_user(
        &self,
        user: UserRecord,
        expected_version: u64,
    ) -> Result<UserRecord, AccountStoreError>;

    /// Increment-and-read of the MFA failure counter. Also bumps the user
    /// version so an in-flight success write based on the old state fails.
    async fn record_failed_attempt(
        &self,
        user_id: &str,
        policy: &MfaPolicy,
        at: DateTime<Utc>,
    ) -> Result<u32, AccountStoreError>;

    async fn reset_failed_attempts(&self, user_id: &str) -> Result<(), AccountStoreError>;

    /// Idempotent: adding a pool already on the list is a no-op.
    async fn add_pool_to_user(&self, user_id: &str, pool_id: &str)
    -> Result<(), AccountStoreError>;

    async fn insert_session(&self, session: SessionRecord) -> Result<(), AccountStoreError>;
    async fn get_session(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRecord>, AccountStoreError>;
    async fn mark_session_verified(&self, session_id: &str) -> Result<(), AccountStoreError>;
}

pub fn memory() -> Arc<dyn AccountStore> {
    Arc::new(MemoryAccountStore::default())
}

pub fn postgres(db: Arc<TandaDb>) -> Arc<dyn AccountStore> {
    Arc::new(PostgresAccountStore { db })
}

#[derive(Default)]
struct MemoryAccountStore {
    inner: Mutex<MemoryAccountInner>,
}

#[derive(Default)]
struct MemoryAccountInner {
    users: HashMap<String, UserRecord>,
    user_by_email: HashMap<String, String>,
    sessions: HashMap<String, SessionRecord>,
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn insert_user(&self, user: UserRecord) -> Result<UserRecord, AccountStoreError> {
        let mut inner = self.inner.lock().await;
        let email_key = user.email.to_lowercase();
        if inner.user_by_email.contains_key(&email_key) {
            return Err(AccountStoreError::Conflict(
                "email is already registered".to_string(),
            ));
        }
        inner
            .user_by_email
            .insert(email_key, user.user_id.clone());
        inner.users.insert(user.user_id.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, AccountStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.get(user_id).cloned())
    }

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserRecord>, AccountStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .user_by_email
            .get(&email.to_lowercase())
            .and_then(|user_id| inner.users.get(user_id))
            .cloned())
    }

    async fn commit_user(
        &self,
        mut user: UserRecord,
        expected_version: u64,
    ) -> Result<UserRecord, AccountStoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .users
            .get_mut(&user.user_id)
            .ok_or_else(|| AccountStoreError::NotFound(user.user_id.clone()))?;
        if stored.version != expected_version {
            return Err(AccountStoreError::Conflict(format!(
                "user {} changed since it was read",
                user.user_id
            )));
        }
        user.version = expected_version + 1;
        *stored = user.clone();
        Ok(user)
    }

    async fn record_failed_attempt(
        &self,
        user_id: &str,
        policy: &MfaPolicy,
        at: DateTime<Utc>,
    ) -> Result<u32, AccountStoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| AccountStoreError::NotFound(user_id.to_string()))?;
        let attempts = stored.mfa.record_failure(policy, at);
        stored.version += 1;
        Ok(attempts)
    }

    async fn reset_failed_attempts(&self, user_id: &str) -> Result<(), AccountStoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| AccountStoreError::NotFound(user_id.to_string()))?;
        stored.mfa.reset_failures();
        stored.version += 1;
        Ok(())
    }

    async fn add_pool_to_user(
        &self,
        user_id: &str,
        pool_id: &str,
    ) -> Result<(), AccountStoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| AccountStoreError::NotFound(user_id.to_string()))?;
        if !stored.pool_ids.iter().any(|existing| existing == pool_id) {
            stored.pool_ids.push(pool_id.to_string());
            stored.version += 1;
        }
        Ok(())
    }

    async fn insert_session(&self, session: SessionRecord) -> Result<(), AccountStoreError> {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(session.token_hash.clone(), session);
        Ok(())
    }

    async fn get_session(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRecord>, AccountStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.sessions.get(token_hash).cloned())
    }

    async fn mark_session_verified(&self, session_id: &str) -> Result<(), AccountStoreError> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .values_mut()
            .find(|session| session.session_id == session_id)
            .ok_or_else(|| AccountStoreError::NotFound(session_id.to_string()))?;
        session.mfa_verified = true;
        Ok(())
    }
}

struct PostgresAccountStore {
    db: Arc<TandaDb>,
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    async fn insert_user(&self, user: UserRecord) -> Result<UserRecord, AccountStoreError> {
        let document = user_document(&user)?;
        let client = self.db.client();
        let client = client.lock().await;
        let inserted = client
            .execute(
                r#"
                INSERT INTO tanda.users (
                  user_id,
                  email,
                  name,
                  document,
                  failed_attempts,
                  last_failed_at,
                  version,
                  created_at
                )
                VALUES ($1,$2,$3,$4,0,NULL,0,$5)
                ON CONFLICT DO NOTHING
                "#,
                &[
                    &user.user_id,
                    &user.email,
                    &user.name,
                    &document,
                    &user.created_at,
                ],
            )
            .await
            .map_err(|error| AccountStoreError::Db(error.to_string()))?;
        if inserted == 0 {
            return Err(AccountStoreError::Conflict(
                "email is already registered".to_string(),
            ));
        }
        Ok(UserRecord { version: 0, ..user })
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, AccountStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT document, failed_attempts, last_failed_at, version
                  FROM tanda.users
                 WHERE user_id = $1
                "#,
                &[&user_id],
            )
            .await
            .map_err(|error| AccountStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(map_user_row(&row).map_err(AccountStoreError::Db)?))
    }

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserRecord>, AccountStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT document, failed_attempts, last_failed_at, version
                  FROM tanda.users
                 WHERE lower(email) = lower($1)
                "#,
                &[&email],
            )
            .await
            .map_err(|error| AccountStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(map_user_row(&row).map_err(AccountStoreError::Db)?))
    }

    async fn commit_user(
        &self,
        user: UserRecord,
        expected_version: u64,
    ) -> Result<UserRecord, AccountStoreError> {
        let document = user_document(&user)?;
        let failed_attempts = i32::try_from(user.mfa.failed_attempts).unwrap_or(i32::MAX);
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                UPDATE tanda.users
                   SET document = $3,
                       failed_attempts = $4,
                       last_failed_at = $5,
                       version = version + 1
                 WHERE user_id = $1
                   AND version = $2
                RETURNING version
                "#,
                &[
                    &user.user_id,
                    &version_param(expected_version),
                    &document,
                    &failed_attempts,
                    &user.mfa.last_failed_at,
                ],
            )
            .await
            .map_err(|error| AccountStoreError::Db(error.to_string()))?;
        match row {
            Some(row) => {
                let version: i64 = row.get("version");
                Ok(UserRecord {
                    version: version as u64,
                    ..user
                })
            }
            None => Err(AccountStoreError::Conflict(format!(
                "user {} changed since it was read",
                user.user_id
            ))),
        }
    }

    async fn record_failed_attempt(
        &self,
        user_id: &str,
        policy: &MfaPolicy,
        at: DateTime<Utc>,
    ) -> Result<u32, AccountStoreError> {
        let max_attempts = i32::try_from(policy.max_failed_attempts).unwrap_or(i32::MAX);
        let cooled_down_before = at - policy.lockout;
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                UPDATE tanda.users
                   SET failed_attempts = CASE
                         WHEN failed_attempts >= $2
                          AND (last_failed_at IS NULL OR last_failed_at <= $3)
                         THEN 1
                         ELSE failed_attempts + 1
                       END,
                       last_failed_at = $4,
                       version = version + 1
                 WHERE user_id = $1
                RETURNING failed_attempts
                "#,
                &[&user_id, &max_attempts, &cooled_down_before, &at],
            )
            .await
            .map_err(|error| AccountStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Err(AccountStoreError::NotFound(user_id.to_string()));
        };
        let attempts: i32 = row.get("failed_attempts");
        Ok(attempts.max(0) as u32)
    }

    async fn reset_failed_attempts(&self, user_id: &str) -> Result<(), AccountStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                r#"
                UPDATE tanda.users
                   SET failed_attempts = 0,
                       last_failed_at = NULL,
                       version = version + 1
                 WHERE user_id = $1
                "#,
                &[&user_id],
            )
            .await
            .map_err(|error| AccountStoreError::Db(error.to_string()))?;
        if updated == 0 {
            return Err(AccountStoreError::NotFound(user_id.to_string()));
        }
        Ok(())
    }

    async fn add_pool_to_user(
        &self,
        user_id: &str,
        pool_id: &str,
    ) -> Result<(), AccountStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                r#"
                UPDATE tanda.users
                   SET document = jsonb_set(
                         document,
                         '{pool_ids}',
                         COALESCE(document->'pool_ids', '[]'::jsonb) || to_jsonb($2::text)
                       ),
                       version = version + 1
                 WHERE user_id = $1
                   AND NOT COALESCE(document->'pool_ids', '[]'::jsonb) ? $2
                "#,
                &[&user_id, &pool_id],
            )
            .await
            .map_err(|error| AccountStoreError::Db(error.to_string()))?;
        if updated == 0 {
            let exists = client
                .query_opt("SELECT 1 FROM tanda.users WHERE user_id = $1", &[&user_id])
                .await
                .map_err(|error| AccountStoreError::Db(error.to_string()))?;
            if exists.is_none() {
                return Err(AccountStoreError::NotFound(user_id.to_string()));
            }
        }
        Ok(())
    }

    async fn insert_session(&self, session: SessionRecord) -> Result<(), AccountStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO tanda.sessions (
                  token_hash,
                  session_id,
                  user_id,
                  mfa_verified,
                  created_at,
                  expires_at
                )
                VALUES ($1,$2,$3,$4,$5,$6)
                "#,
                &[
                    &session.token_hash,
                    &session.session_id,
                    &session.user_id,
                    &session.mfa_verified,
                    &session.created_at,
                    &session.expires_at,
                ],
            )
            .await
            .map_err(|error| AccountStoreError::Db(error.to_string()))?;
        Ok(())
    }

    async fn get_session(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRecord>, AccountStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT token_hash, session_id, user_id, mfa_verified, created_at, expires_at
                  FROM tanda.sessions
                 WHERE token_hash = $1
                "#,
                &[&token_hash],
            )
            .await
            .map_err(|error| AccountStoreError::Db(error.to_string()))?;
        Ok(row.map(|row| SessionRecord {
            session_id: row.get("session_id"),
            token_hash: row.get("token_hash"),
            user_id: row.get("user_id"),
            mfa_verified: row.get("mfa_verified"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn mark_session_verified(&self, session_id: &str) -> Result<(), AccountStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                "UPDATE tanda.sessions SET mfa_verified = TRUE WHERE session_id = $1",
                &[&session_id],
            )
            .await
            .map_err(|error| AccountStoreError::Db(error.to_string()))?;
        if updated == 0 {
            return Err(AccountStoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }
}

fn user_document(user: &UserRecord) -> Result<serde_json::Value, AccountStoreError> {
    serde_json::to_value(user).map_err(|error| AccountStoreError::Db(error.to_string()))
}

fn version_param(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

/// The counter columns are authoritative over the copy inside the document.
fn map_user_row(row: &tokio_postgres::Row) -> Result<UserRecord, String> {
    let document: serde_json::Value = row.get("document");
    let mut user: UserRecord =
        serde_json::from_value(document).map_err(|error| error.to_string())?;
    let failed_attempts: i32 = row.get("failed_attempts");
    let version: i64 = row.get("version");
    user.mfa.failed_attempts = failed_attempts.max(0) as u32;
    user.mfa.last_failed_at = row.get("last_failed_at");
    user.version = version.max(0) as u64;
    Ok(user)
}
