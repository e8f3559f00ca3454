use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use tanda_core::NotificationIntent;

use crate::accounts::AccountService;
use crate::accounts::types::{Principal, RegisterRequest};
use crate::clock::{Clock, ManualClock};
use crate::config::Config;
use crate::invitations::InvitationService;
use crate::invitations::types::IssueInvitationRequest;
use crate::notifications::RecordingNotifier;
use crate::pools::PoolService;
use crate::pools::types::{ConfirmContributionRequest, CreatePoolRequest};
use crate::server::AppState;
use crate::{Stores, assemble_state};

/// In-memory runtime with a hand-driven clock and a notifier that records
/// every delivered intent.
pub(crate) struct Harness {
    pub config: Config,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub state: AppState,
    pub accounts: AccountService,
    pub pools: PoolService,
    pub invitations: InvitationService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::local())
    }

    pub fn with_config(config: Config) -> Self {
        let start = Utc
            .with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let clock = ManualClock::new(start);
        let notifier = Arc::new(RecordingNotifier::default());
        let state = assemble_state(
            config.clone(),
            Stores::memory(),
            clock.clone(),
            notifier.clone(),
        );
        Self {
            accounts: state.accounts().clone(),
            pools: state.pools().clone(),
            invitations: state.invitations().clone(),
            config,
            clock,
            notifier,
            state,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The `n`th MFA code (1-based) delivered to `email`.
    pub async fn nth_code(&self, email: &str, n: usize) -> Result<String> {
        for _ in 0..100 {
            let codes: Vec<String> = self
                .notifier
                .delivered()
                .await
                .into_iter()
                .filter_map(|intent| match intent {
                    NotificationIntent::MfaCodeIssued {
                        email: to, code, ..
                    } if to == email => Some(code),
                    _ => None,
                })
                .collect();
            if let Some(code) = codes.get(n - 1) {
                return Ok(code.clone());
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        Err(anyhow!("no code #{n} delivered to {email}"))
    }

    /// Latest invitation token delivered to `email`.
    pub async fn invitation_token(&self, email: &str) -> Result<String> {
        self.notifier
            .wait_for(|intent| {
                matches!(intent, NotificationIntent::InvitationIssued { email: to, .. } if to == email)
            })
            .await
            .and_then(|intent| match intent {
                NotificationIntent::InvitationIssued { token, .. } => Some(token),
                _ => None,
            })
            .ok_or_else(|| anyhow!("no invitation delivered to {email}"))
    }

    /// Registers `{user}@example.com`, completes email MFA and returns the
    /// verified session token with its principal.
    pub async fn verified_session(&self, user: &str) -> Result<(String, Principal)> {
        let email = format!("{user}@example.com");
        let started = self
            .accounts
            .register(RegisterRequest {
                email: email.clone(),
                name: user.to_string(),
                password: "correct horse battery".to_string(),
                mfa_method: None,
            })
            .await?;
        let code = self.nth_code(&email, 1).await?;
        self.accounts
            .verify_session_mfa(&started.session_token, &code)
            .await?;
        let principal = self
            .accounts
            .require_verified_session(&started.session_token)
            .await?;
        Ok((started.session_token, principal))
    }

    /// A pool created by `user_1` and filled through accepted invitations.
    /// Principals come back in position order, admin first.
    pub async fn filled_pool(
        &self,
        total_members: u32,
        contribution_amount_minor: i64,
    ) -> Result<(String, Vec<Principal>)> {
        let (_, admin) = self.verified_session("user_1").await?;
        let pool = self
            .pools
            .create_pool(
                &admin,
                CreatePoolRequest {
                    name: "Family tanda".to_string(),
                    contribution_amount_minor,
                    total_members,
                    frequency: "monthly".to_string(),
                },
            )
            .await?;
        let pool_id = pool.summary.pool_id;

        let mut members = vec![admin.clone()];
        for index in 2..=total_members {
            let (_, member) = self.verified_session(&format!("user_{index}")).await?;
            let issued = self
                .invitations
                .issue(
                    &admin,
                    &pool_id,
                    IssueInvitationRequest {
                        email: member.email.clone(),
                    },
                )
                .await?;
            self.invitations.accept(&member, &issued.token).await?;
            members.push(member);
        }
        Ok((pool_id, members))
    }

    /// Every member confirms and the admin verifies each confirmation.
    pub async fn fund_round(&self, pool_id: &str, members: &[Principal]) -> Result<()> {
        for member in members {
            let record = self
                .pools
                .confirm_contribution(
                    member,
                    pool_id,
                    ConfirmContributionRequest {
                        payment_method: "zelle".to_string(),
                    },
                )
                .await?;
            self.pools
                .verify_contribution(&members[0], pool_id, &record.member_id)
                .await?;
        }
        Ok(())
    }
}
