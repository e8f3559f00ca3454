use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tanda_core::invitation::validate_token_format;
use tanda_core::{EngineError, Invitation, InvitationStatus, NotificationIntent, Outcome};

use crate::accounts::service::map_store_error as map_account_store_error;
use crate::accounts::store::AccountStore;
use crate::accounts::types::Principal;
use crate::clock::Clock;
use crate::invitations::store::{InvitationStore, InvitationStoreError};
use crate::invitations::types::{
    AcceptedInvitation, CleanupReport, InvitationView, IssueInvitationRequest, IssuedInvitation,
    RejectInvitationRequest,
};
use crate::notifications::NotificationDispatcher;
use crate::pools::PoolService;

#[derive(Clone)]
pub struct InvitationService {
    store: Arc<dyn InvitationStore>,
    pools: PoolService,
    accounts: Arc<dyn AccountStore>,
    clock: Arc<dyn Clock>,
    notifications: NotificationDispatcher,
    ttl: Duration,
}

impl InvitationService {
    pub fn new(
        store: Arc<dyn InvitationStore>,
        pools: PoolService,
        accounts: Arc<dyn AccountStore>,
        clock: Arc<dyn Clock>,
        notifications: NotificationDispatcher,
    ) -> Self {
        let ttl = pools.policy().invitation_ttl;
        Self {
            store,
            pools,
            accounts,
            clock,
            notifications,
            ttl,
        }
    }

    pub fn store(&self) -> Arc<dyn InvitationStore> {
        self.store.clone()
    }

    /// Admin-only. Fails when the email already belongs to a member or holds
    /// a live invitation; a stale pending one is expired first.
    pub async fn issue(
        &self,
        principal: &Principal,
        pool_id: &str,
        request: IssueInvitationRequest,
    ) -> Result<IssuedInvitation, EngineError> {
        let pool = self.pools.load_pool(pool_id).await?;
        let now = self.clock.now();
        let invitation = Invitation::issue(&pool, &request.email, &principal.user_id, self.ttl, now)?;

        if let Some(existing) = self
            .store
            .find_pending(pool_id, &invitation.email)
            .await
            .map_err(map_store_error)?
        {
            if !self.expire_lazily(existing, now).await? {
                return Err(EngineError::DuplicateInvitation {
                    email: invitation.email,
                });
            }
        }

        let email = invitation.email.clone();
        let invitation = self
            .store
            .insert_invitation(invitation)
            .await
            .map_err(|error| match error {
                InvitationStoreError::Conflict(_) => EngineError::DuplicateInvitation { email },
                other => map_store_error(other),
            })?;
        tracing::info!(
            pool_id = %invitation.pool_id,
            invitation_id = %invitation.invitation_id,
            user_id = %principal.user_id,
            "invitation issued"
        );
        let intent = NotificationIntent::InvitationIssued {
            pool_id: invitation.pool_id.clone(),
            pool_name: invitation.pool_name.clone(),
            email: invitation.email.clone(),
            token: invitation.token.clone(),
            expires_at: invitation.expires_at,
        };
        let issued = IssuedInvitation::from(invitation);
        Ok(self.publish(Outcome::new(issued).with_intent(intent)))
    }

    /// Returns the invitation while it is still pending and unexpired. An
    /// expired pending invitation is moved to `Expired` on this read.
    pub async fn validate(&self, token: &str) -> Result<InvitationView, EngineError> {
        let invitation = self.acceptable(token).await?;
        Ok(InvitationView::from(&invitation))
    }

    /// Joins the invited user to the pool. The member is added first; the
    /// invitation and the user's pool list follow. A retry after a partial
    /// failure finds the member already present and completes the rest.
    pub async fn accept(
        &self,
        principal: &Principal,
        token: &str,
    ) -> Result<AcceptedInvitation, EngineError> {
        let mut invitation = self.find_by_token(token).await?;
        if !invitation.email.eq_ignore_ascii_case(&principal.email) {
            return Err(EngineError::Forbidden(
                "invitation was issued to a different email".to_string(),
            ));
        }

        let now = self.clock.now();
        let already_member = self
            .pools
            .load_pool(&invitation.pool_id)
            .await?
            .member_by_user(&principal.user_id)
            .is_some();
        if !already_member {
            self.check_acceptable(&mut invitation, now).await?;
        } else if invitation.status == InvitationStatus::Accepted {
            self.add_pool_to_user(principal, &invitation.pool_id).await?;
            return Err(EngineError::AlreadyResolved {
                status: InvitationStatus::Accepted.as_str(),
            });
        }

        let member = self
            .pools
            .admit_member(&invitation.pool_id, &principal.identity())
            .await?;
        let invitation = self.record_acceptance(invitation, principal, now).await?;
        self.add_pool_to_user(principal, &invitation.pool_id).await?;

        let mut outcome = Outcome::new(AcceptedInvitation {
            pool_id: invitation.pool_id.clone(),
            member: member.clone(),
            invitation_status: invitation.status,
        });
        if invitation.status == InvitationStatus::Accepted {
            tracing::info!(
                pool_id = %invitation.pool_id,
                invitation_id = %invitation.invitation_id,
                member_id = %member.member_id,
                position = member.position,
                "invitation accepted"
            );
            outcome = outcome.with_intent(NotificationIntent::InvitationAccepted {
                pool_id: invitation.pool_id.clone(),
                email: invitation.email.clone(),
                member_id: member.member_id.clone(),
            });
        } else {
            tracing::warn!(
                pool_id = %invitation.pool_id,
                invitation_id = %invitation.invitation_id,
                member_id = %member.member_id,
                status = invitation.status.as_str(),
                "member admitted but invitation resolved elsewhere"
            );
        }
        Ok(self.publish(outcome))
    }

    pub async fn reject(
        &self,
        token: &str,
        request: RejectInvitationRequest,
    ) -> Result<InvitationView, EngineError> {
        let mut invitation = self.acceptable(token).await?;
        invitation.mark_rejected(request.reason, self.clock.now())?;
        let invitation = self
            .store
            .update_invitation(invitation, InvitationStatus::Pending)
            .await
            .map_err(|error| match error {
                InvitationStoreError::Conflict(_) => EngineError::AlreadyResolved {
                    status: "resolved",
                },
                other => map_store_error(other),
            })?;
        tracing::info!(
            pool_id = %invitation.pool_id,
            invitation_id = %invitation.invitation_id,
            "invitation rejected"
        );
        let intent = NotificationIntent::InvitationRejected {
            pool_id: invitation.pool_id.clone(),
            email: invitation.email.clone(),
        };
        let view = InvitationView::from(&invitation);
        Ok(self.publish(Outcome::new(view).with_intent(intent)))
    }

    /// Maintenance sweep; safe to run any number of times.
    pub async fn cleanup_expired(&self) -> Result<CleanupReport, EngineError> {
        let expired = self
            .store
            .expire_due(self.clock.now())
            .await
            .map_err(map_store_error)?;
        tracing::info!(expired, "expired invitations swept");
        Ok(CleanupReport { expired })
    }

    async fn acceptable(&self, token: &str) -> Result<Invitation, EngineError> {
        let mut invitation = self.find_by_token(token).await?;
        self.check_acceptable(&mut invitation, self.clock.now()).await?;
        Ok(invitation)
    }

    async fn find_by_token(&self, token: &str) -> Result<Invitation, EngineError> {
        validate_token_format(token)?;
        self.store
            .get_by_token(token)
            .await
            .map_err(map_store_error)?
            .ok_or(EngineError::NotFound("invitation"))
    }

    async fn check_acceptable(
        &self,
        invitation: &mut Invitation,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if invitation.status == InvitationStatus::Pending && !invitation.is_live(now) {
            self.expire_lazily(invitation.clone(), now).await?;
        }
        invitation.ensure_acceptable(now)
    }

    /// Persists the expiry of a stale pending invitation. Returns whether it
    /// was stale. Losing the write to a concurrent resolution is fine.
    async fn expire_lazily(
        &self,
        mut invitation: Invitation,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        if !invitation.expire_if_due(now) {
            return Ok(false);
        }
        match self
            .store
            .update_invitation(invitation, InvitationStatus::Pending)
            .await
        {
            Ok(expired) => {
                tracing::info!(
                    pool_id = %expired.pool_id,
                    invitation_id = %expired.invitation_id,
                    "invitation expired on read"
                );
                Ok(true)
            }
            Err(InvitationStoreError::Conflict(_)) => Ok(true),
            Err(error) => Err(map_store_error(error)),
        }
    }

    /// Marks a still-pending invitation accepted. The member already exists
    /// at this point, so losing the write to a concurrent resolution is
    /// reported through the returned status rather than as an error.
    async fn record_acceptance(
        &self,
        mut invitation: Invitation,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<Invitation, EngineError> {
        if invitation.status != InvitationStatus::Pending {
            return Ok(invitation);
        }
        invitation.mark_accepted(&principal.user_id, now)?;
        match self
            .store
            .update_invitation(invitation.clone(), InvitationStatus::Pending)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(InvitationStoreError::Conflict(_)) => self
                .store
                .get_by_token(&invitation.token)
                .await
                .map_err(map_store_error)?
                .ok_or(EngineError::NotFound("invitation")),
            Err(error) => Err(map_store_error(error)),
        }
    }

    async fn add_pool_to_user(
        &self,
        principal: &Principal,
        pool_id: &str,
    ) -> Result<(), EngineError> {
        self.accounts
            .add_pool_to_user(&principal.user_id, pool_id)
            .await
            .map_err(map_account_store_error)
    }

    fn publish<T>(&self, outcome: Outcome<T>) -> T {
        self.notifications.emit(outcome.intents);
        outcome.value
    }
}

fn map_store_error(error: InvitationStoreError) -> EngineError {
    match error {
        InvitationStoreError::Conflict(message) => EngineError::Conflict(message),
        InvitationStoreError::NotFound(_) => EngineError::NotFound("invitation"),
        InvitationStoreError::Db(message) => EngineError::StoreUnavailable(message),
    }
}
