use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::pool::Pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl InvitationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub invitation_id: String,
    pub pool_id: String,
    pub pool_name: String,
    pub email: String,
    pub invited_by: String,
    pub token: String,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl Invitation {
    /// Builds a pending invitation after checking membership rules against
    /// the pool snapshot. The pending-duplicate rule needs the invitation
    /// store and is enforced by the caller.
    pub fn issue(
        pool: &Pool,
        email: &str,
        invited_by: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        pool.require_admin(invited_by)?;
        let email = normalize_email(email)?;
        if pool.is_completed() {
            return Err(EngineError::PoolCompleted);
        }
        if pool.member_by_email(&email).is_some() {
            return Err(EngineError::DuplicateMember { email });
        }
        if pool.is_full() {
            return Err(EngineError::PoolFull {
                max_members: pool.total_members,
            });
        }

        Ok(Self {
            invitation_id: format!("inv_{}", Uuid::new_v4().simple()),
            pool_id: pool.pool_id.clone(),
            pool_name: pool.name.clone(),
            email,
            invited_by: invited_by.to_string(),
            token: generate_invitation_token(),
            status: InvitationStatus::Pending,
            created_at: now,
            expires_at: now + ttl,
            accepted_by: None,
            accepted_at: None,
            rejected_at: None,
            rejection_reason: None,
        })
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == InvitationStatus::Pending && now < self.expires_at
    }

    /// Lazy expiry: flips a stale pending invitation to `Expired`. Returns
    /// whether the status changed.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == InvitationStatus::Pending && now >= self.expires_at {
            self.status = InvitationStatus::Expired;
            return true;
        }
        false
    }

    /// Validation view of the invitation. Expires it first when due.
    pub fn ensure_acceptable(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.expire_if_due(now);
        match self.status {
            InvitationStatus::Pending => Ok(()),
            InvitationStatus::Expired => Err(EngineError::ExpiredInvitation),
            status @ (InvitationStatus::Accepted | InvitationStatus::Rejected) => {
                Err(EngineError::AlreadyResolved {
                    status: status.as_str(),
                })
            }
        }
    }

    /// Records the acceptance of a pending invitation. Expiry is checked
    /// before the member is admitted, so a deadline passing after that point
    /// does not undo the join.
    pub fn mark_accepted(&mut self, user_id: &str, now: DateTime<Utc>) -> Result<(), EngineError> {
        match self.status {
            InvitationStatus::Pending => {}
            InvitationStatus::Expired => return Err(EngineError::ExpiredInvitation),
            status @ (InvitationStatus::Accepted | InvitationStatus::Rejected) => {
                return Err(EngineError::AlreadyResolved {
                    status: status.as_str(),
                });
            }
        }
        self.status = InvitationStatus::Accepted;
        self.accepted_by = Some(user_id.to_string());
        self.accepted_at = Some(now);
        Ok(())
    }

    pub fn mark_rejected(
        &mut self,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.ensure_acceptable(now)?;
        self.status = InvitationStatus::Rejected;
        self.rejected_at = Some(now);
        self.rejection_reason = reason
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Ok(())
    }
}

/// 256 bits from the thread-local CSPRNG, hex encoded.
pub fn generate_invitation_token() -> String {
    let mut bytes = [0_u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Tokens are 64 lowercase hex characters; anything else is malformed.
pub fn validate_token_format(token: &str) -> Result<(), EngineError> {
    let well_formed = token.len() == 64
        && token
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
    if well_formed {
        Ok(())
    } else {
        Err(EngineError::validation("token", "invitation token is malformed"))
    }
}

pub fn normalize_email(raw_email: &str) -> Result<String, EngineError> {
    let email = raw_email.trim().to_lowercase();
    let valid_shape = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
    if !valid_shape || email.len() > 255 {
        return Err(EngineError::validation("email", "enter a valid email address"));
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::{at, full_pool};

    fn open_pool() -> Pool {
        let mut pool = full_pool(2, 500);
        pool.total_members = 4;
        pool.total_rounds = 4;
        pool
    }

    #[test]
    fn issued_invitation_expires_after_ttl() {
        let pool = open_pool();
        let invitation = Invitation::issue(
            &pool,
            " New.Member@Example.com ",
            "user_1",
            Duration::days(7),
            at(0),
        )
        .expect("issue");
        assert_eq!(invitation.email, "new.member@example.com");
        assert_eq!(invitation.expires_at, at(0) + Duration::days(7));
        assert!(validate_token_format(&invitation.token).is_ok());
        assert!(invitation.is_live(at(60)));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(generate_invitation_token(), generate_invitation_token());
    }

    #[test]
    fn existing_member_cannot_be_invited() {
        let pool = open_pool();
        let error = Invitation::issue(&pool, "USER_2@example.com", "user_1", Duration::days(7), at(0))
            .expect_err("already a member");
        assert!(matches!(error, EngineError::DuplicateMember { .. }));
    }

    #[test]
    fn full_pool_cannot_issue() {
        let pool = full_pool(2, 500);
        let error = Invitation::issue(&pool, "late@example.com", "user_1", Duration::days(7), at(0))
            .expect_err("no seats");
        assert_eq!(error, EngineError::PoolFull { max_members: 2 });
    }

    #[test]
    fn only_admin_issues() {
        let pool = open_pool();
        let error = Invitation::issue(&pool, "friend@example.com", "user_2", Duration::days(7), at(0))
            .expect_err("member is not admin");
        assert!(matches!(error, EngineError::Forbidden(_)));
    }

    #[test]
    fn stale_invitation_is_lazily_expired_on_validate() {
        let pool = open_pool();
        let mut invitation =
            Invitation::issue(&pool, "friend@example.com", "user_1", Duration::days(7), at(0))
                .expect("issue");
        let later = at(0) + Duration::days(7);
        let error = invitation
            .ensure_acceptable(later)
            .expect_err("expired at boundary");
        assert_eq!(error, EngineError::ExpiredInvitation);
        assert_eq!(invitation.status, InvitationStatus::Expired);
        assert!(!invitation.expire_if_due(later));
    }

    #[test]
    fn resolved_invitation_cannot_be_accepted_again() {
        let pool = open_pool();
        let mut invitation =
            Invitation::issue(&pool, "friend@example.com", "user_1", Duration::days(7), at(0))
                .expect("issue");
        invitation
            .mark_rejected(Some("  not now ".to_string()), at(10))
            .expect("reject");
        assert_eq!(invitation.rejection_reason.as_deref(), Some("not now"));
        let error = invitation
            .mark_accepted("user_9", at(20))
            .expect_err("already rejected");
        assert_eq!(error, EngineError::AlreadyResolved { status: "rejected" });
    }

    #[test]
    fn acceptance_is_recorded_past_the_deadline_once_admitted() {
        let pool = open_pool();
        let mut invitation =
            Invitation::issue(&pool, "friend@example.com", "user_1", Duration::days(7), at(0))
                .expect("issue");
        let late = at(0) + Duration::days(7) + Duration::seconds(1);
        invitation.mark_accepted("user_9", late).expect("pending");
        assert_eq!(invitation.status, InvitationStatus::Accepted);
        assert_eq!(invitation.accepted_at, Some(late));
    }

    #[test]
    fn malformed_tokens_are_validation_errors() {
        let error = validate_token_format("not-a-token").expect_err("malformed");
        assert_eq!(error.code(), "validation_error");
    }

    #[test]
    fn email_requires_local_and_domain() {
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("someone@").is_err());
        assert_eq!(normalize_email(" A@B.io ").ok().as_deref(), Some("a@b.io"));
    }
}
