use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contribution::ContributionRecord;
use crate::errors::EngineError;
use crate::pool::{LedgerTransaction, MemberStatus, Pool, TransactionKind, TransactionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub pool_id: String,
    pub round: u32,
    pub recipient_member_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_user_id: Option<String>,
    pub recipient_email: String,
    pub amount_minor: i64,
    pub transaction_id: String,
    /// Round after advancement; exceeds `total_rounds` once the pool completes.
    pub next_round: u32,
    pub pool_completed: bool,
}

impl Pool {
    /// `contribution × total_members`, never the count of members who paid.
    pub fn payout_amount(&self) -> Result<i64, EngineError> {
        self.contribution_amount_minor
            .checked_mul(i64::from(self.total_members))
            .ok_or_else(|| EngineError::Internal("payout amount overflow".to_string()))
    }

    /// Members who have no completed CONTRIBUTION entry for `round`.
    pub fn missing_contributions(&self, round: u32) -> usize {
        self.members
            .iter()
            .filter(|member| {
                !self.transactions.iter().any(|entry| {
                    entry.kind == TransactionKind::Contribution
                        && entry.round == round
                        && entry.member_id == member.member_id
                        && entry.status == TransactionStatus::Completed
                })
            })
            .count()
    }

    /// Ledger-based completeness for the current round. The recipient is not
    /// exempt.
    pub fn all_contributions_received(&self) -> bool {
        self.members.len() == self.total_members as usize
            && self.missing_contributions(self.current_round) == 0
    }

    /// Checks every payout rule against this snapshot and, when all hold,
    /// applies the payout entry, round advancement and contribution reset as
    /// one mutation. `expected_round` pins the round the caller observed so
    /// that a retry after a concurrent commit reports `AlreadyPaidOut`.
    pub fn commit_payout_and_advance(
        &mut self,
        actor_user_id: &str,
        expected_round: u32,
        now: DateTime<Utc>,
    ) -> Result<PayoutReceipt, EngineError> {
        self.require_admin(actor_user_id)?;

        if self.payout_for_round(expected_round).is_some() {
            return Err(EngineError::AlreadyPaidOut {
                pool_id: self.pool_id.clone(),
                round: expected_round,
            });
        }
        if expected_round != self.current_round {
            return Err(EngineError::RoundMismatch {
                current: self.current_round,
                requested: expected_round,
            });
        }
        if self.is_completed() {
            return Err(EngineError::PoolCompleted);
        }

        let missing = self.missing_contributions(self.current_round)
            + (self.total_members as usize).saturating_sub(self.members.len());
        if missing > 0 {
            return Err(EngineError::ContributionsIncomplete {
                round: self.current_round,
                missing,
            });
        }

        let amount_minor = self.payout_amount()?;
        let recipient = self
            .find_recipient()
            .cloned()
            .ok_or_else(|| EngineError::Internal("no member holds the current position".to_string()))?;

        let round = self.current_round;
        let entry = LedgerTransaction::new(
            TransactionKind::Payout,
            amount_minor,
            &recipient.member_id,
            actor_user_id,
            round,
            TransactionStatus::Completed,
            None,
            now,
        );
        let transaction_id = entry.transaction_id.clone();
        self.transactions.push(entry);

        self.current_round += 1;
        let next_round = self.current_round;
        let completed = self.is_completed();
        for member in &mut self.members {
            member.status = if member.position < next_round {
                MemberStatus::Completed
            } else if member.position == next_round {
                MemberStatus::Current
            } else {
                MemberStatus::Active
            };
        }
        self.contributions = if completed {
            Vec::new()
        } else {
            self.members
                .iter()
                .map(|member| {
                    ContributionRecord::pending(
                        &member.member_id,
                        next_round,
                        self.contribution_amount_minor,
                    )
                })
                .collect()
        };
        self.updated_at = now;

        Ok(PayoutReceipt {
            pool_id: self.pool_id.clone(),
            round,
            recipient_member_id: recipient.member_id,
            recipient_user_id: recipient.user_id,
            recipient_email: recipient.email,
            amount_minor,
            transaction_id,
            next_round,
            pool_completed: completed,
        })
    }
}
