use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contribution::{ContributionRecord, PaymentMethod};
use crate::errors::EngineError;
use crate::policy::PoolPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Weekly,
    Biweekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Biweekly => "biweekly",
            Self::Monthly => "monthly",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "weekly" => Ok(Self::Weekly),
            "biweekly" => Ok(Self::Biweekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(EngineError::validation(
                "frequency",
                format!("unsupported frequency: {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// Receives the payout of the current round.
    Current,
    Active,
    /// Already received their payout.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Forming,
    Active,
    Completed,
}

impl PoolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forming => "forming",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub member_id: String,
    pub user_id: Option<String>,
    pub name: String,
    pub email: String,
    pub role: MemberRole,
    pub position: u32,
    pub status: MemberStatus,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Contribution,
    Payout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Open-round contribution awaiting admin verification.
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub transaction_id: String,
    pub kind: TransactionKind,
    pub amount_minor: i64,
    /// Contributor for CONTRIBUTION entries, recipient for PAYOUT entries.
    pub member_id: String,
    pub actor_user_id: String,
    pub round: u32,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethod>,
    pub created_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub(crate) fn new(
        kind: TransactionKind,
        amount_minor: i64,
        member_id: &str,
        actor_user_id: &str,
        round: u32,
        status: TransactionStatus,
        payment_method: Option<PaymentMethod>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: format!("txn_{}", Uuid::new_v4().simple()),
            kind,
            amount_minor,
            member_id: member_id.to_string(),
            actor_user_id: actor_user_id.to_string(),
            round,
            status,
            payment_method,
            created_at: now,
        }
    }
}

/// Identity snapshot copied into a Member when it joins a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberIdentity {
    pub user_id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPool {
    pub name: String,
    pub contribution_amount_minor: i64,
    pub total_members: u32,
    pub frequency: Frequency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub contributed_minor: i64,
    pub paid_out_minor: i64,
    pub payouts: u32,
}

/// Versioned pool aggregate. Members, the open round's contribution records
/// and the ledger live in one document so a payout commit is a single write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub pool_id: String,
    pub name: String,
    pub contribution_amount_minor: i64,
    pub total_members: u32,
    pub frequency: Frequency,
    pub current_round: u32,
    pub total_rounds: u32,
    pub members: Vec<Member>,
    pub contributions: Vec<ContributionRecord>,
    pub transactions: Vec<LedgerTransaction>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Pool {
    pub fn create(
        request: NewPool,
        admin: MemberIdentity,
        policy: &PoolPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::validation("name", "pool name is required"));
        }
        if request.contribution_amount_minor < policy.min_contribution_minor
            || request.contribution_amount_minor > policy.max_contribution_minor
        {
            return Err(EngineError::validation(
                "contribution_amount_minor",
                format!(
                    "contribution must be between {} and {} minor units",
                    policy.min_contribution_minor, policy.max_contribution_minor
                ),
            ));
        }
        if request.total_members < policy.min_members
            || request.total_members > policy.max_members
        {
            return Err(EngineError::validation(
                "total_members",
                format!(
                    "total_members must be between {} and {}",
                    policy.min_members, policy.max_members
                ),
            ));
        }

        let mut pool = Self {
            pool_id: format!("pool_{}", Uuid::new_v4().simple()),
            name,
            contribution_amount_minor: request.contribution_amount_minor,
            total_members: request.total_members,
            frequency: request.frequency,
            current_round: 1,
            total_rounds: request.total_members,
            members: Vec::new(),
            contributions: Vec::new(),
            transactions: Vec::new(),
            created_by: admin.user_id.clone(),
            created_at: now,
            updated_at: now,
            version: 0,
        };
        pool.push_member(admin, MemberRole::Admin, now)?;
        Ok(pool)
    }

    pub fn status(&self) -> PoolStatus {
        if self.is_completed() {
            PoolStatus::Completed
        } else if self.is_full() {
            PoolStatus::Active
        } else {
            PoolStatus::Forming
        }
    }

    pub fn is_completed(&self) -> bool {
        self.current_round > self.total_rounds
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.total_members as usize
    }

    /// The member whose position equals the current round, or `None` once
    /// every round has been paid out.
    pub fn find_recipient(&self) -> Option<&Member> {
        if self.is_completed() {
            return None;
        }
        self.members
            .iter()
            .find(|member| member.position == self.current_round)
    }

    pub fn member(&self, member_id: &str) -> Option<&Member> {
        self.members
            .iter()
            .find(|member| member.member_id == member_id)
    }

    pub fn member_by_user(&self, user_id: &str) -> Option<&Member> {
        self.members
            .iter()
            .find(|member| member.user_id.as_deref() == Some(user_id))
    }

    pub fn member_by_email(&self, email: &str) -> Option<&Member> {
        let email = email.trim();
        self.members
            .iter()
            .find(|member| member.email.eq_ignore_ascii_case(email))
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.member_by_user(user_id)
            .is_some_and(|member| member.role == MemberRole::Admin)
    }

    pub fn require_member(&self, user_id: &str) -> Result<&Member, EngineError> {
        self.member_by_user(user_id)
            .ok_or_else(|| EngineError::Forbidden("not a member of this pool".to_string()))
    }

    pub fn require_admin(&self, user_id: &str) -> Result<&Member, EngineError> {
        match self.member_by_user(user_id) {
            Some(member) if member.role == MemberRole::Admin => Ok(member),
            _ => Err(EngineError::Forbidden(
                "only the pool admin may perform this action".to_string(),
            )),
        }
    }

    /// Appends a member at the next position. Positions are never reused.
    pub fn add_member(
        &mut self,
        identity: MemberIdentity,
        now: DateTime<Utc>,
    ) -> Result<&Member, EngineError> {
        self.push_member(identity, MemberRole::Member, now)
    }

    fn push_member(
        &mut self,
        identity: MemberIdentity,
        role: MemberRole,
        now: DateTime<Utc>,
    ) -> Result<&Member, EngineError> {
        if self.is_full() {
            return Err(EngineError::PoolFull {
                max_members: self.total_members,
            });
        }
        if self.member_by_email(&identity.email).is_some()
            || self.member_by_user(&identity.user_id).is_some()
        {
            return Err(EngineError::DuplicateMember {
                email: identity.email,
            });
        }

        let position = self.members.len() as u32 + 1;
        let status = if position == self.current_round {
            MemberStatus::Current
        } else {
            MemberStatus::Active
        };
        let member = Member {
            member_id: format!("mem_{}", Uuid::new_v4().simple()),
            user_id: Some(identity.user_id),
            name: identity.name,
            email: identity.email.trim().to_ascii_lowercase(),
            role,
            position,
            status,
            joined_at: now,
        };
        if !self.is_completed() {
            self.contributions.push(ContributionRecord::pending(
                &member.member_id,
                self.current_round,
                self.contribution_amount_minor,
            ));
        }
        self.members.push(member);
        self.updated_at = now;

        let index = self.members.len() - 1;
        Ok(&self.members[index])
    }

    pub fn ledger_for_round(&self, round: u32) -> impl Iterator<Item = &LedgerTransaction> {
        self.transactions
            .iter()
            .filter(move |entry| entry.round == round)
    }

    pub fn payout_for_round(&self, round: u32) -> Option<&LedgerTransaction> {
        self.ledger_for_round(round)
            .find(|entry| entry.kind == TransactionKind::Payout)
    }

    /// Totals derived from completed ledger entries only.
    pub fn ledger_totals(&self) -> LedgerTotals {
        let mut totals = LedgerTotals {
            contributed_minor: 0,
            paid_out_minor: 0,
            payouts: 0,
        };
        for entry in &self.transactions {
            if entry.status != TransactionStatus::Completed {
                continue;
            }
            match entry.kind {
                TransactionKind::Contribution => {
                    totals.contributed_minor =
                        totals.contributed_minor.saturating_add(entry.amount_minor);
                }
                TransactionKind::Payout => {
                    totals.paid_out_minor =
                        totals.paid_out_minor.saturating_add(entry.amount_minor);
                    totals.payouts += 1;
                }
            }
        }
        totals
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeZone;

    use super::*;

    pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_800_000_000 + seconds, 0)
            .single()
            .unwrap_or_default()
    }

    pub(crate) fn identity(user: &str) -> MemberIdentity {
        MemberIdentity {
            user_id: user.to_string(),
            name: user.to_uppercase(),
            email: format!("{user}@example.com"),
        }
    }

    /// Builds a full pool whose admin is `user_1` and members `user_2..=user_n`.
    pub(crate) fn full_pool(total_members: u32, contribution_amount_minor: i64) -> Pool {
        let mut pool = Pool::create(
            NewPool {
                name: "Block savings".to_string(),
                contribution_amount_minor,
                total_members,
                frequency: Frequency::Weekly,
            },
            identity("user_1"),
            &PoolPolicy::default(),
            at(0),
        )
        .expect("pool should be created");
        for index in 2..=total_members {
            pool.add_member(identity(&format!("user_{index}")), at(i64::from(index)))
                .expect("member should join");
        }
        pool
    }

    #[test]
    fn admin_takes_position_one_and_is_first_recipient() {
        let pool = full_pool(3, 1_000);
        assert_eq!(pool.current_round, 1);
        assert_eq!(pool.total_rounds, 3);
        let recipient = pool.find_recipient().expect("recipient");
        assert_eq!(recipient.position, 1);
        assert_eq!(recipient.user_id.as_deref(), Some("user_1"));
        assert_eq!(recipient.role, MemberRole::Admin);
        assert_eq!(recipient.status, MemberStatus::Current);
    }

    #[test]
    fn positions_are_assigned_monotonically() {
        let pool = full_pool(4, 500);
        let positions: Vec<u32> = pool.members.iter().map(|member| member.position).collect();
        assert_eq!(positions, vec![1, 2, 3, 4]);
        assert_eq!(pool.contributions.len(), 4);
        assert_eq!(pool.status(), PoolStatus::Active);
    }

    #[test]
    fn add_member_rejects_full_pool() {
        let mut pool = full_pool(2, 500);
        let error = pool
            .add_member(identity("user_9"), at(10))
            .expect_err("pool is full");
        assert_eq!(error, EngineError::PoolFull { max_members: 2 });
    }

    #[test]
    fn add_member_rejects_duplicate_email_case_insensitively() {
        let mut pool = full_pool(2, 500);
        pool.total_members = 3;
        let mut duplicate = identity("user_7");
        duplicate.email = "USER_2@Example.com".to_string();
        let error = pool
            .add_member(duplicate, at(10))
            .expect_err("email already a member");
        assert!(matches!(error, EngineError::DuplicateMember { .. }));
    }

    #[test]
    fn create_rejects_out_of_bounds_contribution() {
        let error = Pool::create(
            NewPool {
                name: "Too big".to_string(),
                contribution_amount_minor: 2_001,
                total_members: 3,
                frequency: Frequency::Monthly,
            },
            identity("user_1"),
            &PoolPolicy::default(),
            at(0),
        )
        .expect_err("amount above bound");
        assert_eq!(error.code(), "validation_error");
    }

    #[test]
    fn forming_pool_reports_forming_status() {
        let pool = Pool::create(
            NewPool {
                name: "Forming".to_string(),
                contribution_amount_minor: 500,
                total_members: 3,
                frequency: Frequency::Biweekly,
            },
            identity("user_1"),
            &PoolPolicy::default(),
            at(0),
        )
        .expect("pool should be created");
        assert_eq!(pool.status(), PoolStatus::Forming);
    }

    #[test]
    fn pool_document_survives_json_encoding() {
        let pool = full_pool(3, 1_000);
        let encoded = serde_json::to_value(&pool).expect("encode");
        assert_eq!(encoded["frequency"], "weekly");
        let decoded: Pool = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded, pool);
    }
}
