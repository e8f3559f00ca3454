use serde::{Deserialize, Serialize};
use tanda_core::{
    ContributionRecord, Frequency, LedgerTotals, LedgerTransaction, Member, Pool, PoolStatus,
};

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
    pub contribution_amount_minor: i64,
    pub total_members: u32,
    pub frequency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmContributionRequest {
    pub payment_method: String,
}

/// The round the caller saw on screen. A payout for any other round is
/// refused, so the same request can never pay twice.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProcessPayoutRequest {
    pub round: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentDisplayQuery {
    pub method: String,
    #[serde(default)]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipientView {
    pub member_id: String,
    pub name: String,
    pub position: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub pool_id: String,
    pub name: String,
    pub status: PoolStatus,
    pub frequency: Frequency,
    pub contribution_amount_minor: i64,
    pub total_members: u32,
    pub member_count: usize,
    pub current_round: u32,
    pub total_rounds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<RecipientView>,
    pub contributions_received: usize,
    pub expected_payout_minor: i64,
    pub totals: LedgerTotals,
    pub version: u64,
}

impl PoolSummary {
    pub fn from_pool(pool: &Pool) -> Self {
        Self {
            pool_id: pool.pool_id.clone(),
            name: pool.name.clone(),
            status: pool.status(),
            frequency: pool.frequency,
            contribution_amount_minor: pool.contribution_amount_minor,
            total_members: pool.total_members,
            member_count: pool.members.len(),
            current_round: pool.current_round,
            total_rounds: pool.total_rounds,
            recipient: pool.find_recipient().map(|member| RecipientView {
                member_id: member.member_id.clone(),
                name: member.name.clone(),
                position: member.position,
            }),
            contributions_received: pool.contributions_received(),
            expected_payout_minor: pool.payout_amount().unwrap_or_default(),
            totals: pool.ledger_totals(),
            version: pool.version,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolView {
    #[serde(flatten)]
    pub summary: PoolSummary,
    pub members: Vec<Member>,
    pub contributions: Vec<ContributionRecord>,
    pub transactions: Vec<LedgerTransaction>,
}

impl PoolView {
    pub fn from_pool(pool: Pool) -> Self {
        Self {
            summary: PoolSummary::from_pool(&pool),
            members: pool.members,
            contributions: pool.contributions,
            transactions: pool.transactions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolList {
    pub pools: Vec<PoolSummary>,
}
