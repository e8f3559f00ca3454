use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tanda_core::{Invitation, InvitationStatus, Member};

#[derive(Debug, Clone, Deserialize)]
pub struct IssueInvitationRequest {
    pub email: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RejectInvitationRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Returned to the issuing admin only; carries the join token.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedInvitation {
    pub invitation_id: String,
    pub pool_id: String,
    pub email: String,
    pub token: String,
    pub status: InvitationStatus,
    pub expires_at: DateTime<Utc>,
}

impl From<Invitation> for IssuedInvitation {
    fn from(invitation: Invitation) -> Self {
        Self {
            invitation_id: invitation.invitation_id,
            pool_id: invitation.pool_id,
            email: invitation.email,
            token: invitation.token,
            status: invitation.status,
            expires_at: invitation.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvitationView {
    pub invitation_id: String,
    pub pool_id: String,
    pub pool_name: String,
    pub email: String,
    pub status: InvitationStatus,
    pub expires_at: DateTime<Utc>,
}

impl From<&Invitation> for InvitationView {
    fn from(invitation: &Invitation) -> Self {
        Self {
            invitation_id: invitation.invitation_id.clone(),
            pool_id: invitation.pool_id.clone(),
            pool_name: invitation.pool_name.clone(),
            email: invitation.email.clone(),
            status: invitation.status,
            expires_at: invitation.expires_at,
        }
    }
}

/// `invitation_status` is `Accepted` on the normal path. Any other value
/// means the member was admitted but the invitation was resolved otherwise
/// by a concurrent request.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptedInvitation {
    pub pool_id: String,
    pub member: Member,
    pub invitation_status: InvitationStatus,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CleanupReport {
    pub expired: usize,
}
