use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Whether a member's confirmation also counts as the admin verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionVerification {
    RequireAdmin,
    AutoVerify,
}

impl ContributionVerification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequireAdmin => "require_admin",
            Self::AutoVerify => "auto_verify",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "require_admin" => Some(Self::RequireAdmin),
            "auto_verify" => Some(Self::AutoVerify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPolicy {
    /// Amounts are integer minor units (cents).
    pub min_contribution_minor: i64,
    pub max_contribution_minor: i64,
    pub min_members: u32,
    pub max_members: u32,
    pub invitation_ttl: Duration,
    pub verification: ContributionVerification,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            min_contribution_minor: 100,
            max_contribution_minor: 2_000,
            min_members: 2,
            max_members: 20,
            invitation_ttl: Duration::days(7),
            verification: ContributionVerification::RequireAdmin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfaPolicy {
    pub code_ttl: Duration,
    pub max_failed_attempts: u32,
    pub lockout: Duration,
    pub totp_step_seconds: i64,
    pub totp_skew_steps: i64,
    pub backup_code_count: usize,
    pub backup_code_digits: u32,
}

impl Default for MfaPolicy {
    fn default() -> Self {
        Self {
            code_ttl: Duration::minutes(10),
            max_failed_attempts: 5,
            lockout: Duration::minutes(15),
            totp_step_seconds: 30,
            totp_skew_steps: 1,
            backup_code_count: 8,
            backup_code_digits: 8,
        }
    }
}
