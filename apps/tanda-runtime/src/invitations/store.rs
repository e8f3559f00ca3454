use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tanda_core::{Invitation, InvitationStatus};
use tokio::sync::Mutex;

use crate::db::TandaDb;

#[derive(Debug, thiserror::Error)]
pub enum InvitationStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

#[async_trait]
pub trait InvitationStore: Send + Sync {
    /// Fails `Conflict` when a pending invitation already exists for the
    /// same pool and email.
    async fn insert_invitation(
        &self,
        invitation: Invitation,
    ) -> Result<Invitation, InvitationStoreError>;

    async fn get_by_token(&self, token: &str) -> Result<Option<Invitation>, InvitationStoreError>;

    async fn find_pending(
        &self,
        pool_id: &str,
        email: &str,
    ) -> Result<Option<Invitation>, InvitationStoreError>;

    /// Compare-and-set on status: the write lands only while the stored
    /// invitation is still in `expected_status`.
    async fn update_invitation(
        &self,
        invitation: Invitation,
        expected_status: InvitationStatus,
    ) -> Result<Invitation, InvitationStoreError>;

    /// Flips every pending invitation past its expiry. Returns how many
    /// changed; a second run with the same `now` returns zero.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize, InvitationStoreError>;
}

pub fn memory() -> Arc<dyn InvitationStore> {
    Arc::new(MemoryInvitationStore::default())
}

pub fn postgres(db: Arc<TandaDb>) -> Arc<dyn InvitationStore> {
    Arc::new(PostgresInvitationStore { db })
}

#[derive(Default)]
struct MemoryInvitationStore {
    inner: Mutex<MemoryInvitationInner>,
}

#[derive(Default)]
struct MemoryInvitationInner {
    invitations: HashMap<String, Invitation>,
    by_token: HashMap<String, String>,
}

impl MemoryInvitationInner {
    fn pending_for(&self, pool_id: &str, email: &str) -> Option<&Invitation> {
        self.invitations.values().find(|invitation| {
            invitation.status == InvitationStatus::Pending
                && invitation.pool_id == pool_id
                && invitation.email.eq_ignore_ascii_case(email)
        })
    }
}

#[async_trait]
impl InvitationStore for MemoryInvitationStore {
    async fn insert_invitation(
        &self,
        invitation: Invitation,
    ) -> Result<Invitation, InvitationStoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .pending_for(&invitation.pool_id, &invitation.email)
            .is_some()
        {
            return Err(InvitationStoreError::Conflict(format!(
                "pending invitation exists for {}",
                invitation.email
            )));
        }
        if inner.by_token.contains_key(&invitation.token) {
            return Err(InvitationStoreError::Conflict(
                "invitation token collision".to_string(),
            ));
        }
        inner
            .by_token
            .insert(invitation.token.clone(), invitation.invitation_id.clone());
        inner
            .invitations
            .insert(invitation.invitation_id.clone(), invitation.clone());
        Ok(invitation)
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<Invitation>, InvitationStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_token
            .get(token)
            .and_then(|invitation_id| inner.invitations.get(invitation_id))
            .cloned())
    }

    async fn find_pending(
        &self,
        pool_id: &str,
        email: &str,
    ) -> Result<Option<Invitation>, InvitationStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.pending_for(pool_id, email).cloned())
    }

    async fn update_invitation(
        &self,
        invitation: Invitation,
        expected_status: InvitationStatus,
    ) -> Result<Invitation, InvitationStoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .invitations
            .get_mut(&invitation.invitation_id)
            .ok_or_else(|| InvitationStoreError::NotFound(invitation.invitation_id.clone()))?;
        if stored.status != expected_status {
            return Err(InvitationStoreError::Conflict(format!(
                "invitation is {}, expected {}",
                stored.status.as_str(),
                expected_status.as_str()
            )));
        }
        *stored = invitation.clone();
        Ok(invitation)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize, InvitationStoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .invitations
            .values_mut()
            .map(|invitation| invitation.expire_if_due(now))
            .filter(|expired| *expired)
            .count())
    }
}

struct PostgresInvitationStore {
    db: Arc<TandaDb>,
}

const INVITATION_COLUMNS: &str = r#"
  invitation_id,
  pool_id,
  pool_name,
  email,
  invited_by,
  token,
  status,
  created_at,
  expires_at,
  accepted_by,
  accepted_at,
  rejected_at,
  rejection_reason
"#;

#[async_trait]
impl InvitationStore for PostgresInvitationStore {
    async fn insert_invitation(
        &self,
        invitation: Invitation,
    ) -> Result<Invitation, InvitationStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let inserted = client
            .execute(
                r#"
                INSERT INTO tanda.invitations (
                  invitation_id,
                  pool_id,
                  pool_name,
                  email,
                  invited_by,
                  token,
                  status,
                  created_at,
                  expires_at
                )
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
                ON CONFLICT DO NOTHING
                "#,
                &[
                    &invitation.invitation_id,
                    &invitation.pool_id,
                    &invitation.pool_name,
                    &invitation.email,
                    &invitation.invited_by,
                    &invitation.token,
                    &invitation.status.as_str(),
                    &invitation.created_at,
                    &invitation.expires_at,
                ],
            )
            .await
            .map_err(|error| InvitationStoreError::Db(error.to_string()))?;
        if inserted == 0 {
            return Err(InvitationStoreError::Conflict(format!(
                "pending invitation exists for {}",
                invitation.email
            )));
        }
        Ok(invitation)
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<Invitation>, InvitationStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let statement =
            format!("SELECT {INVITATION_COLUMNS} FROM tanda.invitations WHERE token = $1");
        let row = client
            .query_opt(statement.as_str(), &[&token])
            .await
            .map_err(|error| InvitationStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_invitation_row)
            .transpose()
            .map_err(InvitationStoreError::Db)
    }

    async fn find_pending(
        &self,
        pool_id: &str,
        email: &str,
    ) -> Result<Option<Invitation>, InvitationStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let statement = format!(
            "SELECT {INVITATION_COLUMNS} FROM tanda.invitations \
             WHERE pool_id = $1 AND lower(email) = lower($2) AND status = 'pending'"
        );
        let row = client
            .query_opt(statement.as_str(), &[&pool_id, &email])
            .await
            .map_err(|error| InvitationStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_invitation_row)
            .transpose()
            .map_err(InvitationStoreError::Db)
    }

    async fn update_invitation(
        &self,
        invitation: Invitation,
        expected_status: InvitationStatus,
    ) -> Result<Invitation, InvitationStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                r#"
                UPDATE tanda.invitations
                   SET status = $3,
                       accepted_by = $4,
                       accepted_at = $5,
                       rejected_at = $6,
                       rejection_reason = $7
                 WHERE invitation_id = $1
                   AND status = $2
                "#,
                &[
                    &invitation.invitation_id,
                    &expected_status.as_str(),
                    &invitation.status.as_str(),
                    &invitation.accepted_by,
                    &invitation.accepted_at,
                    &invitation.rejected_at,
                    &invitation.rejection_reason,
                ],
            )
            .await
            .map_err(|error| InvitationStoreError::Db(error.to_string()))?;
        if updated == 0 {
            return Err(InvitationStoreError::Conflict(format!(
                "invitation {} is no longer {}",
                invitation.invitation_id,
                expected_status.as_str()
            )));
        }
        Ok(invitation)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize, InvitationStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                r#"
                UPDATE tanda.invitations
                   SET status = 'expired'
                 WHERE status = 'pending'
                   AND expires_at <= $1
                "#,
                &[&now],
            )
            .await
            .map_err(|error| InvitationStoreError::Db(error.to_string()))?;
        Ok(updated as usize)
    }
}

fn map_invitation_row(row: &tokio_postgres::Row) -> Result<Invitation, String> {
    let status: String = row.get("status");
    let status = InvitationStatus::parse(&status)
        .ok_or_else(|| format!("unknown invitation status: {status}"))?;
    Ok(Invitation {
        invitation_id: row.get("invitation_id"),
        pool_id: row.get("pool_id"),
        pool_name: row.get("pool_name"),
        email: row.get("email"),
        invited_by: row.get("invited_by"),
        token: row.get("token"),
        status,
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        accepted_by: row.get("accepted_by"),
        accepted_at: row.get("accepted_at"),
        rejected_at: row.get("rejected_at"),
        rejection_reason: row.get("rejection_reason"),
    })
}
