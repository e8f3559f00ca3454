use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tanda_core::{MemberIdentity, MfaMethod, MfaState};

/// Stored account. The pool list holds ids only; pools are never embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub credential_salt: String,
    pub credential_hash: String,
    pub mfa: MfaState,
    #[serde(default)]
    pub pool_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl UserRecord {
    /// Registration leaves the account temporary until MFA setup completes.
    pub fn is_temporary(&self) -> bool {
        self.mfa.pending_verification
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub token_hash: String,
    pub user_id: String,
    pub mfa_verified: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Caller identity resolved from a verified session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub session_id: String,
}

impl Principal {
    pub fn identity(&self) -> MemberIdentity {
        MemberIdentity {
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub mfa_method: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotpSetupView {
    pub secret: String,
    pub provisioning_uri: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStarted {
    pub user_id: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub mfa_method: MfaMethod,
    pub mfa_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totp_setup: Option<TotpSetupView>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartSessionRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodeRequest {
    pub code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionVerified {
    pub user_id: String,
    pub session_verified: bool,
    pub setup_completed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backup_codes: Vec<String>,
    pub backup_codes_remaining: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeMfaMethodRequest {
    pub method: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct MfaMethodChanged {
    pub method: MfaMethod,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totp_setup: Option<TotpSetupView>,
}
