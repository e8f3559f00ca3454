use std::sync::Arc;

use chrono::{DateTime, Utc};
use tanda_core::{
    ContributionRecord, ContributionVerification, EngineError, Frequency, Member, MemberIdentity,
    NewPool, NotificationIntent, Outcome, PaymentDisplay, PaymentMethod, PayoutReceipt, Pool,
    PoolPolicy, payment_display,
};

use crate::accounts::service::map_store_error as map_account_store_error;
use crate::accounts::store::AccountStore;
use crate::accounts::types::Principal;
use crate::clock::Clock;
use crate::notifications::NotificationDispatcher;
use crate::pools::store::{PoolStore, PoolStoreError};
use crate::pools::types::{
    ConfirmContributionRequest, CreatePoolRequest, PaymentDisplayQuery, PoolList, PoolSummary,
    PoolView, ProcessPayoutRequest,
};
use crate::retry::{Idempotency, RetryPolicy};

#[derive(Clone)]
pub struct PoolService {
    store: Arc<dyn PoolStore>,
    accounts: Arc<dyn AccountStore>,
    clock: Arc<dyn Clock>,
    notifications: NotificationDispatcher,
    retry: RetryPolicy,
    policy: PoolPolicy,
}

impl PoolService {
    pub fn new(
        store: Arc<dyn PoolStore>,
        accounts: Arc<dyn AccountStore>,
        clock: Arc<dyn Clock>,
        notifications: NotificationDispatcher,
        retry: RetryPolicy,
        policy: PoolPolicy,
    ) -> Self {
        Self {
            store,
            accounts,
            clock,
            notifications,
            retry,
            policy,
        }
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub async fn create_pool(
        &self,
        principal: &Principal,
        request: CreatePoolRequest,
    ) -> Result<PoolView, EngineError> {
        let frequency = Frequency::parse(&request.frequency)?;
        let now = self.clock.now();
        let pool = Pool::create(
            NewPool {
                name: request.name,
                contribution_amount_minor: request.contribution_amount_minor,
                total_members: request.total_members,
                frequency,
            },
            principal.identity(),
            &self.policy,
            now,
        )?;

        // The user's pool list tolerates ids without a stored pool, so it is
        // written first.
        self.accounts
            .add_pool_to_user(&principal.user_id, &pool.pool_id)
            .await
            .map_err(map_account_store_error)?;
        let pool = self
            .store
            .insert_pool(pool)
            .await
            .map_err(map_store_error)?;
        tracing::info!(
            pool_id = %pool.pool_id,
            user_id = %principal.user_id,
            total_members = pool.total_members,
            contribution_amount_minor = pool.contribution_amount_minor,
            "pool created"
        );
        Ok(PoolView::from_pool(pool))
    }

    /// Members only.
    pub async fn get_pool(
        &self,
        principal: &Principal,
        pool_id: &str,
    ) -> Result<PoolView, EngineError> {
        let pool = self.read_pool(pool_id).await?;
        pool.require_member(&principal.user_id)?;
        Ok(PoolView::from_pool(pool))
    }

    pub async fn pools_for_user(&self, principal: &Principal) -> Result<PoolList, EngineError> {
        let user = self
            .accounts
            .get_user(&principal.user_id)
            .await
            .map_err(map_account_store_error)?
            .ok_or(EngineError::NotFound("user"))?;
        let store = &self.store;
        let pool_ids = &user.pool_ids;
        let pools = self
            .retry
            .run("pools_for_user", Idempotency::Idempotent, move || async move {
                store.get_pools(pool_ids).await.map_err(map_store_error)
            })
            .await?;
        Ok(PoolList {
            pools: pools
                .iter()
                .filter(|pool| pool.member_by_user(&principal.user_id).is_some())
                .map(PoolSummary::from_pool)
                .collect(),
        })
    }

    pub async fn confirm_contribution(
        &self,
        principal: &Principal,
        pool_id: &str,
        request: ConfirmContributionRequest,
    ) -> Result<ContributionRecord, EngineError> {
        let method = PaymentMethod::parse(&request.payment_method)?;
        let verification = self.policy.verification;
        let (pool, record) = self
            .mutate("confirm_contribution", pool_id, |pool, now| {
                pool.confirm_contribution(&principal.user_id, method, verification, now)
            })
            .await?;

        let member_id = record.member_id.clone();
        let mut outcome = Outcome::new(record).with_intent(NotificationIntent::ContributionConfirmed {
            pool_id: pool.pool_id.clone(),
            round: pool.current_round,
            member_id: member_id.clone(),
            amount_minor: pool.contribution_amount_minor,
        });
        if verification == ContributionVerification::AutoVerify {
            outcome = outcome.with_intent(NotificationIntent::ContributionVerified {
                pool_id: pool.pool_id.clone(),
                round: pool.current_round,
                member_id: member_id.clone(),
                amount_minor: pool.contribution_amount_minor,
            });
        }
        tracing::info!(
            pool_id = %pool.pool_id,
            round = pool.current_round,
            member_id = %member_id,
            payment_method = method.as_str(),
            "contribution confirmed"
        );
        Ok(self.publish(outcome))
    }

    pub async fn verify_contribution(
        &self,
        principal: &Principal,
        pool_id: &str,
        member_id: &str,
    ) -> Result<ContributionRecord, EngineError> {
        let (pool, record) = self
            .mutate("verify_contribution", pool_id, |pool, now| {
                pool.verify_contribution(&principal.user_id, member_id, now)
            })
            .await?;
        tracing::info!(pool_id = %pool.pool_id, round = pool.current_round, member_id, "contribution verified");
        let intent = NotificationIntent::ContributionVerified {
            pool_id: pool.pool_id.clone(),
            round: pool.current_round,
            member_id: member_id.to_string(),
            amount_minor: pool.contribution_amount_minor,
        };
        Ok(self.publish(Outcome::new(record).with_intent(intent)))
    }

    pub async fn undo_contribution(
        &self,
        principal: &Principal,
        pool_id: &str,
        member_id: &str,
    ) -> Result<ContributionRecord, EngineError> {
        let (pool, record) = self
            .mutate("undo_contribution", pool_id, |pool, now| {
                pool.undo_contribution(&principal.user_id, member_id, now)
            })
            .await?;
        tracing::info!(
            pool_id = %pool.pool_id,
            round = pool.current_round,
            member_id,
            user_id = %principal.user_id,
            "contribution undone"
        );
        Ok(record)
    }

    /// Pays the current recipient and advances the round in one conditional
    /// write. A losing concurrent caller re-reads, finds the payout entry and
    /// gets `AlreadyPaidOut`.
    pub async fn process_payout(
        &self,
        principal: &Principal,
        pool_id: &str,
        request: ProcessPayoutRequest,
    ) -> Result<PayoutReceipt, EngineError> {
        let this = self;
        let (_, receipt) = self
            .retry
            .run("process_payout", Idempotency::Idempotent, move || async move {
                this.try_commit(pool_id, |pool, now| {
                    pool.commit_payout_and_advance(&principal.user_id, request.round, now)
                })
                .await
            })
            .await?;

        tracing::info!(
            pool_id = %receipt.pool_id,
            round = receipt.round,
            member_id = %receipt.recipient_member_id,
            amount_minor = receipt.amount_minor,
            transaction_id = %receipt.transaction_id,
            "payout committed"
        );
        let mut outcome = Outcome::new(receipt.clone()).with_intent(
            NotificationIntent::PayoutProcessed {
                pool_id: receipt.pool_id.clone(),
                round: receipt.round,
                recipient_member_id: receipt.recipient_member_id.clone(),
                recipient_email: receipt.recipient_email.clone(),
                amount_minor: receipt.amount_minor,
            },
        );
        if receipt.pool_completed {
            tracing::info!(pool_id = %receipt.pool_id, rounds = receipt.round, "pool completed");
            outcome = outcome.with_intent(NotificationIntent::PoolCompleted {
                pool_id: receipt.pool_id.clone(),
            });
        } else {
            tracing::info!(pool_id = %receipt.pool_id, round = receipt.next_round, "round advanced");
        }
        Ok(self.publish(outcome))
    }

    /// Deep link and instructions for paying this round's contribution.
    /// Display only; paying through it records nothing.
    pub async fn payment_display(
        &self,
        principal: &Principal,
        pool_id: &str,
        query: PaymentDisplayQuery,
    ) -> Result<PaymentDisplay, EngineError> {
        let method = PaymentMethod::parse(&query.method)?;
        let pool = self.read_pool(pool_id).await?;
        pool.require_member(&principal.user_id)?;
        if pool.is_completed() {
            return Err(EngineError::PoolCompleted);
        }
        let memo = format!("{} round {}", pool.name, pool.current_round);
        payment_display(
            method,
            query.handle.as_deref(),
            pool.contribution_amount_minor,
            &memo,
        )
    }

    /// Adds the user as a member. Re-admitting an existing member returns
    /// the stored member without a write.
    pub async fn admit_member(
        &self,
        pool_id: &str,
        identity: &MemberIdentity,
    ) -> Result<Member, EngineError> {
        let this = self;
        self.retry
            .run("admit_member", Idempotency::Idempotent, move || async move {
                let mut pool = this.load_pool(pool_id).await?;
                if let Some(member) = pool.member_by_user(&identity.user_id) {
                    return Ok(member.clone());
                }
                let expected_version = pool.version;
                let now = this.clock.now();
                let member = pool.add_member(identity.clone(), now)?.clone();
                let pool = this
                    .store
                    .commit_pool(pool, expected_version)
                    .await
                    .map_err(map_store_error)?;
                tracing::info!(
                    pool_id = %pool.pool_id,
                    member_id = %member.member_id,
                    position = member.position,
                    "member admitted"
                );
                Ok(member)
            })
            .await
    }

    /// Unfiltered read for collaborating services.
    pub async fn load_pool(&self, pool_id: &str) -> Result<Pool, EngineError> {
        self.store
            .get_pool(pool_id)
            .await
            .map_err(map_store_error)?
            .ok_or(EngineError::NotFound("pool"))
    }

    async fn read_pool(&self, pool_id: &str) -> Result<Pool, EngineError> {
        let this = self;
        self.retry
            .run("read_pool", Idempotency::Idempotent, move || async move {
                this.load_pool(pool_id).await
            })
            .await
    }

    /// Load, apply and conditionally commit, retried on version conflicts.
    /// A conflict re-runs `apply` against the fresh snapshot, so every rule
    /// is re-checked.
    async fn mutate<T, F>(
        &self,
        operation: &'static str,
        pool_id: &str,
        apply: F,
    ) -> Result<(Pool, T), EngineError>
    where
        F: Fn(&mut Pool, DateTime<Utc>) -> Result<T, EngineError>,
    {
        let this = self;
        let apply = &apply;
        self.retry
            .run(operation, Idempotency::NotIdempotent, move || async move {
                this.try_commit(pool_id, apply).await
            })
            .await
    }

    async fn try_commit<T, F>(&self, pool_id: &str, apply: F) -> Result<(Pool, T), EngineError>
    where
        F: Fn(&mut Pool, DateTime<Utc>) -> Result<T, EngineError>,
    {
        let mut pool = self.load_pool(pool_id).await?;
        let expected_version = pool.version;
        let value = apply(&mut pool, self.clock.now())?;
        let pool = self
            .store
            .commit_pool(pool, expected_version)
            .await
            .map_err(map_store_error)?;
        Ok((pool, value))
    }

    fn publish<T>(&self, outcome: Outcome<T>) -> T {
        self.notifications.emit(outcome.intents);
        outcome.value
    }
}

fn map_store_error(error: PoolStoreError) -> EngineError {
    match error {
        PoolStoreError::Conflict(message) => EngineError::Conflict(message),
        PoolStoreError::NotFound(_) => EngineError::NotFound("pool"),
        PoolStoreError::Db(message) => EngineError::StoreUnavailable(message),
    }
}
