use crate::contribution::ContributionStatus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("unsupported payment method: {0}")]
    InvalidPaymentMethod(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("pool is on round {current}, not {requested}")]
    RoundMismatch { current: u32, requested: u32 },
    #[error("round {round} of pool {pool_id} was already paid out")]
    AlreadyPaidOut { pool_id: String, round: u32 },
    #[error("round {round} is missing {missing} contribution(s)")]
    ContributionsIncomplete { round: u32, missing: usize },
    #[error("{0}")]
    Forbidden(String),
    #[error("pool is full ({max_members} members)")]
    PoolFull { max_members: u32 },
    #[error("{email} is already a member of this pool")]
    DuplicateMember { email: String },
    #[error("{email} already has a pending invitation to this pool")]
    DuplicateInvitation { email: String },
    #[error("invitation has expired")]
    ExpiredInvitation,
    #[error("invitation was already {status}")]
    AlreadyResolved { status: &'static str },
    #[error("verification code has expired")]
    ExpiredCode,
    #[error("verification code is invalid")]
    InvalidCode,
    #[error("too many failed verification attempts; retry in {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: i64 },
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("pool has completed all rounds")]
    PoolCompleted,
    #[error("contribution cannot move from {from} to {to}")]
    InvalidTransition {
        from: ContributionStatus,
        to: ContributionStatus,
    },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::InvalidPaymentMethod(_) => "invalid_payment_method",
            Self::Conflict(_) => "conflict",
            Self::RoundMismatch { .. } => "round_mismatch",
            Self::AlreadyPaidOut { .. } => "already_paid_out",
            Self::ContributionsIncomplete { .. } => "contributions_incomplete",
            Self::Forbidden(_) => "forbidden",
            Self::PoolFull { .. } => "pool_full",
            Self::DuplicateMember { .. } => "duplicate_member",
            Self::DuplicateInvitation { .. } => "duplicate_invitation",
            Self::ExpiredInvitation => "expired_invitation",
            Self::AlreadyResolved { .. } => "already_resolved",
            Self::ExpiredCode => "expired_code",
            Self::InvalidCode => "invalid_code",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::PoolCompleted => "pool_completed",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Only transient infrastructure failures are eligible for automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_distinct_from_invalid_code() {
        let limited = EngineError::RateLimited {
            retry_after_seconds: 120,
        };
        assert_eq!(limited.code(), "rate_limited");
        assert_ne!(limited.code(), EngineError::InvalidCode.code());
        assert!(limited.to_string().contains("120s"));
    }

    #[test]
    fn only_store_unavailable_is_retryable() {
        assert!(EngineError::StoreUnavailable("timeout".to_string()).is_retryable());
        assert!(!EngineError::Conflict("stale version".to_string()).is_retryable());
        assert!(
            !EngineError::RoundMismatch {
                current: 1,
                requested: 2,
            }
            .is_retryable()
        );
        assert!(
            !EngineError::AlreadyPaidOut {
                pool_id: "pool_1".to_string(),
                round: 1,
            }
            .is_retryable()
        );
    }
}
