use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Side effects the engine asks a delivery worker to perform after a commit.
/// Delivery failure never undoes the commit that produced the intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationIntent {
    InvitationIssued {
        pool_id: String,
        pool_name: String,
        email: String,
        token: String,
        expires_at: DateTime<Utc>,
    },
    InvitationAccepted {
        pool_id: String,
        email: String,
        member_id: String,
    },
    InvitationRejected {
        pool_id: String,
        email: String,
    },
    ContributionConfirmed {
        pool_id: String,
        round: u32,
        member_id: String,
        amount_minor: i64,
    },
    ContributionVerified {
        pool_id: String,
        round: u32,
        member_id: String,
        amount_minor: i64,
    },
    PayoutProcessed {
        pool_id: String,
        round: u32,
        recipient_member_id: String,
        recipient_email: String,
        amount_minor: i64,
    },
    PoolCompleted {
        pool_id: String,
    },
    MfaCodeIssued {
        user_id: String,
        email: String,
        code: String,
        expires_at: DateTime<Utc>,
    },
    MfaLockedOut {
        user_id: String,
        email: String,
    },
}

impl NotificationIntent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvitationIssued { .. } => "invitation_issued",
            Self::InvitationAccepted { .. } => "invitation_accepted",
            Self::InvitationRejected { .. } => "invitation_rejected",
            Self::ContributionConfirmed { .. } => "contribution_confirmed",
            Self::ContributionVerified { .. } => "contribution_verified",
            Self::PayoutProcessed { .. } => "payout_processed",
            Self::PoolCompleted { .. } => "pool_completed",
            Self::MfaCodeIssued { .. } => "mfa_code_issued",
            Self::MfaLockedOut { .. } => "mfa_locked_out",
        }
    }
}

/// Result of an engine operation plus the intents it emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<T> {
    pub value: T,
    pub intents: Vec<NotificationIntent>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            intents: Vec::new(),
        }
    }

    pub fn with_intent(mut self, intent: NotificationIntent) -> Self {
        self.intents.push(intent);
        self
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            intents: self.intents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intents_serialize_with_kind_tag() {
        let intent = NotificationIntent::PoolCompleted {
            pool_id: "pool_1".to_string(),
        };
        let encoded = serde_json::to_value(&intent).expect("encode");
        assert_eq!(encoded["kind"], "pool_completed");
        assert_eq!(encoded["kind"], intent.kind());
    }
}
