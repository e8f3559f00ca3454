use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::policy::ContributionVerification;
use crate::pool::{LedgerTransaction, Pool, TransactionKind, TransactionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributionStatus {
    Pending,
    MemberConfirmed,
    AdminVerified,
}

impl ContributionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::MemberConfirmed => "member_confirmed",
            Self::AdminVerified => "admin_verified",
        }
    }
}

impl fmt::Display for ContributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Venmo,
    CashApp,
    PayPal,
    Zelle,
    Cash,
    Other,
}

impl PaymentMethod {
    pub const ALL: [Self; 6] = [
        Self::Venmo,
        Self::CashApp,
        Self::PayPal,
        Self::Zelle,
        Self::Cash,
        Self::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Venmo => "venmo",
            Self::CashApp => "cashapp",
            Self::PayPal => "paypal",
            Self::Zelle => "zelle",
            Self::Cash => "cash",
            Self::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|method| method.as_str() == normalized)
            .ok_or_else(|| EngineError::InvalidPaymentMethod(raw.trim().to_string()))
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Round-scoped status of one member's contribution. Past rounds keep no
/// records; their evidence is the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub member_id: String,
    pub round: u32,
    pub amount_minor: i64,
    pub status: ContributionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_via: Option<PaymentMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_by: Option<String>,
    /// Open-round ledger entry backing this record, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl ContributionRecord {
    pub(crate) fn pending(member_id: &str, round: u32, amount_minor: i64) -> Self {
        Self {
            member_id: member_id.to_string(),
            round,
            amount_minor,
            status: ContributionStatus::Pending,
            confirmed_via: None,
            confirmed_at: None,
            verified_at: None,
            verified_by: None,
            transaction_id: None,
        }
    }
}

impl Pool {
    pub fn contribution(&self, member_id: &str) -> Option<&ContributionRecord> {
        self.contributions
            .iter()
            .find(|record| record.member_id == member_id && record.round == self.current_round)
    }

    fn contribution_index(&self, member_id: &str) -> Result<usize, EngineError> {
        if self.member(member_id).is_none() {
            return Err(EngineError::NotFound("member"));
        }
        self.contributions
            .iter()
            .position(|record| record.member_id == member_id && record.round == self.current_round)
            .ok_or(EngineError::NotFound("contribution"))
    }

    fn ensure_round_open(&self) -> Result<(), EngineError> {
        if self.is_completed() {
            return Err(EngineError::PoolCompleted);
        }
        if self.payout_for_round(self.current_round).is_some() {
            return Err(EngineError::AlreadyPaidOut {
                pool_id: self.pool_id.clone(),
                round: self.current_round,
            });
        }
        Ok(())
    }

    /// Member self-reports payment for the current round. Under
    /// `AutoVerify` the record passes straight through `MemberConfirmed` to
    /// `AdminVerified` and the ledger entry is recorded as completed.
    pub fn confirm_contribution(
        &mut self,
        actor_user_id: &str,
        method: PaymentMethod,
        verification: ContributionVerification,
        now: DateTime<Utc>,
    ) -> Result<ContributionRecord, EngineError> {
        self.ensure_round_open()?;
        let member_id = self.require_member(actor_user_id)?.member_id.clone();
        let index = self.contribution_index(&member_id)?;

        let current = self.contributions[index].status;
        if current != ContributionStatus::Pending {
            return Err(EngineError::InvalidTransition {
                from: current,
                to: ContributionStatus::MemberConfirmed,
            });
        }

        let (status, entry_status) = match verification {
            ContributionVerification::RequireAdmin => {
                (ContributionStatus::MemberConfirmed, TransactionStatus::Pending)
            }
            ContributionVerification::AutoVerify => {
                (ContributionStatus::AdminVerified, TransactionStatus::Completed)
            }
        };
        let entry = LedgerTransaction::new(
            TransactionKind::Contribution,
            self.contribution_amount_minor,
            &member_id,
            actor_user_id,
            self.current_round,
            entry_status,
            Some(method),
            now,
        );

        let record = &mut self.contributions[index];
        record.status = status;
        record.confirmed_via = Some(method);
        record.confirmed_at = Some(now);
        record.transaction_id = Some(entry.transaction_id.clone());
        if status == ContributionStatus::AdminVerified {
            record.verified_at = Some(now);
            record.verified_by = Some(actor_user_id.to_string());
        }
        let snapshot = record.clone();

        self.transactions.push(entry);
        self.updated_at = now;
        Ok(snapshot)
    }

    /// Admin promotes a member confirmation. The provisional ledger entry is
    /// retracted and a completed one appended in its place.
    pub fn verify_contribution(
        &mut self,
        admin_user_id: &str,
        member_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ContributionRecord, EngineError> {
        self.ensure_round_open()?;
        self.require_admin(admin_user_id)?;
        let index = self.contribution_index(member_id)?;

        let current = self.contributions[index].status;
        if current != ContributionStatus::MemberConfirmed {
            return Err(EngineError::InvalidTransition {
                from: current,
                to: ContributionStatus::AdminVerified,
            });
        }

        let provisional = self.contributions[index].transaction_id.clone();
        let method = self.contributions[index].confirmed_via;
        let contributor = self
            .member(member_id)
            .and_then(|member| member.user_id.clone())
            .unwrap_or_else(|| admin_user_id.to_string());
        self.retract_entry(provisional.as_deref());

        let entry = LedgerTransaction::new(
            TransactionKind::Contribution,
            self.contribution_amount_minor,
            member_id,
            &contributor,
            self.current_round,
            TransactionStatus::Completed,
            method,
            now,
        );

        let record = &mut self.contributions[index];
        record.status = ContributionStatus::AdminVerified;
        record.verified_at = Some(now);
        record.verified_by = Some(admin_user_id.to_string());
        record.transaction_id = Some(entry.transaction_id.clone());
        let snapshot = record.clone();

        self.transactions.push(entry);
        self.updated_at = now;
        Ok(snapshot)
    }

    /// Returns a contribution to `Pending` and drops its open-round ledger
    /// entry. A member may retract their own unverified confirmation; a
    /// verified contribution can only be retracted by the admin, and only
    /// while the round has not been paid out.
    pub fn undo_contribution(
        &mut self,
        actor_user_id: &str,
        member_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ContributionRecord, EngineError> {
        self.ensure_round_open()?;
        let actor = self.require_member(actor_user_id)?;
        let actor_is_admin = self.is_admin(actor_user_id);
        let actor_owns_record = actor.member_id == member_id;
        let index = self.contribution_index(member_id)?;

        match self.contributions[index].status {
            ContributionStatus::Pending => {
                return Err(EngineError::validation(
                    "member_id",
                    "no contribution recorded for this round",
                ));
            }
            ContributionStatus::MemberConfirmed => {
                if !actor_owns_record && !actor_is_admin {
                    return Err(EngineError::Forbidden(
                        "only the contributor or the pool admin may undo a confirmation".to_string(),
                    ));
                }
            }
            ContributionStatus::AdminVerified => {
                if !actor_is_admin {
                    return Err(EngineError::Forbidden(
                        "only the pool admin may undo a verified contribution".to_string(),
                    ));
                }
            }
        }

        let entry = self.contributions[index].transaction_id.clone();
        self.retract_entry(entry.as_deref());

        let record = &mut self.contributions[index];
        *record = ContributionRecord::pending(member_id, record.round, record.amount_minor);
        let snapshot = record.clone();
        self.updated_at = now;
        Ok(snapshot)
    }

    fn retract_entry(&mut self, transaction_id: Option<&str>) {
        let Some(transaction_id) = transaction_id else {
            return;
        };
        let round = self.current_round;
        self.transactions.retain(|entry| {
            !(entry.transaction_id == transaction_id
                && entry.round == round
                && entry.kind == TransactionKind::Contribution)
        });
    }

    pub fn contributions_received(&self) -> usize {
        self.contributions
            .iter()
            .filter(|record| {
                record.round == self.current_round
                    && record.status == ContributionStatus::AdminVerified
            })
            .count()
    }
}
