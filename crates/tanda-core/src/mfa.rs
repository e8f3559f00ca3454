use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::EngineError;
use crate::policy::MfaPolicy;
use crate::totp;

const EMAIL_CODE_DIGITS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfaMethod {
    Email,
    Totp,
}

impl MfaMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Totp => "totp",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "totp" => Ok(Self::Totp),
            other => Err(EngineError::validation(
                "mfa_method",
                format!("unsupported mfa method: {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfaStatus {
    Unverified,
    CodeIssued,
    Verified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCode {
    pub code_hash: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Per-user second-factor state. `enabled` is never cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaState {
    pub method: MfaMethod,
    pub status: MfaStatus,
    pub enabled: bool,
    /// Set until the first successful verification completes setup.
    pub pending_verification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_code: Option<PendingCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_secret: Option<String>,
    /// Secret awaiting its first code after a switch to TOTP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_totp_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_totp_step: Option<i64>,
    #[serde(default)]
    pub backup_code_hashes: Vec<String>,
    pub failed_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotpEnrollment {
    pub secret: String,
    pub provisioning_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MfaVerification {
    pub setup_completed: bool,
    /// Plaintext backup codes, present only when setup completed in this call.
    pub backup_codes: Vec<String>,
    pub backup_codes_remaining: usize,
}

impl MfaState {
    pub fn new(method: MfaMethod) -> Self {
        Self {
            method,
            status: MfaStatus::Unverified,
            enabled: true,
            pending_verification: true,
            pending_code: None,
            totp_secret: None,
            pending_totp_secret: None,
            last_totp_step: None,
            backup_code_hashes: Vec::new(),
            failed_attempts: 0,
            last_failed_at: None,
        }
    }

    /// TOTP registration: the secret is active immediately and the first
    /// valid code completes setup.
    pub fn new_totp(policy: &MfaPolicy, issuer: &str, account: &str) -> (Self, TotpEnrollment) {
        let mut state = Self::new(MfaMethod::Totp);
        let enrollment = state.enroll_totp(policy, issuer, account);
        state.totp_secret = state.pending_totp_secret.take();
        (state, enrollment)
    }

    pub fn is_verified(&self) -> bool {
        self.status == MfaStatus::Verified && !self.pending_verification
    }

    /// Generates a fresh 6-digit code, replacing any previous one. Returns the
    /// plaintext for delivery; only its hash is retained.
    pub fn issue_email_code(&mut self, policy: &MfaPolicy, now: DateTime<Utc>) -> String {
        let code = random_digits(EMAIL_CODE_DIGITS);
        self.pending_code = Some(PendingCode {
            code_hash: hash_code(&code),
            generated_at: now,
            expires_at: now + policy.code_ttl,
        });
        if self.status == MfaStatus::Unverified {
            self.status = MfaStatus::CodeIssued;
        }
        code
    }

    /// Starts TOTP setup with a new secret the user must confirm.
    pub fn enroll_totp(&mut self, policy: &MfaPolicy, issuer: &str, account: &str) -> TotpEnrollment {
        let secret = totp::generate_totp_secret();
        self.pending_totp_secret = Some(secret.clone());
        TotpEnrollment {
            provisioning_uri: totp::provisioning_uri(
                issuer,
                account,
                &secret,
                policy.totp_step_seconds,
            ),
            secret,
        }
    }

    /// Fails `RateLimited` while the lockout window is active. Once the
    /// cool-down has elapsed the counter starts over.
    pub fn check_lockout(&mut self, policy: &MfaPolicy, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.failed_attempts < policy.max_failed_attempts {
            return Ok(());
        }
        let locked_until = self
            .last_failed_at
            .map(|failed_at| failed_at + policy.lockout)
            .unwrap_or(now);
        if now < locked_until {
            return Err(EngineError::RateLimited {
                retry_after_seconds: (locked_until - now).num_seconds().max(1),
            });
        }
        self.reset_failures();
        Ok(())
    }

    pub fn register_failed_attempt(&mut self, now: DateTime<Utc>) -> u32 {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.last_failed_at = Some(now);
        self.failed_attempts
    }

    /// Failure counting as stores apply it: a failure after an elapsed
    /// cool-down opens a new window instead of extending the old one.
    pub fn record_failure(&mut self, policy: &MfaPolicy, now: DateTime<Utc>) -> u32 {
        let cooled_down = self
            .last_failed_at
            .is_none_or(|failed_at| failed_at + policy.lockout <= now);
        if self.failed_attempts >= policy.max_failed_attempts && cooled_down {
            self.reset_failures();
        }
        self.register_failed_attempt(now)
    }

    pub fn reset_failures(&mut self) {
        self.failed_attempts = 0;
        self.last_failed_at = None;
    }

    /// Verifies a code against the user's configured method. Wrong codes
    /// return `InvalidCode` without touching the counter; the caller records
    /// the failure through its atomic counter path.
    pub fn verify_code(
        &mut self,
        code: &str,
        policy: &MfaPolicy,
        now: DateTime<Utc>,
    ) -> Result<MfaVerification, EngineError> {
        self.check_lockout(policy, now)?;
        match self.method {
            MfaMethod::Email => self.verify_email_code(code, now)?,
            MfaMethod::Totp => self.verify_totp_code(code, policy, now)?,
        }
        Ok(self.on_success(policy))
    }

    fn verify_email_code(&mut self, code: &str, now: DateTime<Utc>) -> Result<(), EngineError> {
        let Some(pending) = self.pending_code.as_ref() else {
            return Err(EngineError::InvalidCode);
        };
        if now >= pending.expires_at {
            return Err(EngineError::ExpiredCode);
        }
        if pending.code_hash != hash_code(code.trim()) {
            return Err(EngineError::InvalidCode);
        }
        self.pending_code = None;
        Ok(())
    }

    fn verify_totp_code(
        &mut self,
        code: &str,
        policy: &MfaPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(secret) = self.totp_secret.as_deref() else {
            return Err(EngineError::InvalidCode);
        };
        let matched = totp::verify_totp(
            secret,
            code,
            now.timestamp(),
            policy.totp_step_seconds,
            policy.totp_skew_steps,
            self.last_totp_step,
        )?;
        match matched {
            Some(step) => {
                self.last_totp_step = Some(step);
                Ok(())
            }
            None => Err(EngineError::InvalidCode),
        }
    }

    /// Confirms a pending TOTP enrollment; the new secret becomes active and
    /// the method switches to TOTP.
    pub fn confirm_totp_enrollment(
        &mut self,
        code: &str,
        policy: &MfaPolicy,
        now: DateTime<Utc>,
    ) -> Result<MfaVerification, EngineError> {
        self.check_lockout(policy, now)?;
        let Some(secret) = self.pending_totp_secret.clone() else {
            return Err(EngineError::validation("code", "no totp enrollment in progress"));
        };
        let matched = totp::verify_totp(
            &secret,
            code,
            now.timestamp(),
            policy.totp_step_seconds,
            policy.totp_skew_steps,
            None,
        )?
        .ok_or(EngineError::InvalidCode)?;

        self.totp_secret = Some(secret);
        self.pending_totp_secret = None;
        self.last_totp_step = Some(matched);
        self.method = MfaMethod::Totp;
        self.pending_code = None;
        Ok(self.on_success(policy))
    }

    pub fn consume_backup_code(
        &mut self,
        code: &str,
        policy: &MfaPolicy,
        now: DateTime<Utc>,
    ) -> Result<MfaVerification, EngineError> {
        self.check_lockout(policy, now)?;
        let hash = hash_code(&code.trim().replace([' ', '-'], ""));
        let Some(index) = self
            .backup_code_hashes
            .iter()
            .position(|candidate| *candidate == hash)
        else {
            return Err(EngineError::InvalidCode);
        };
        self.backup_code_hashes.remove(index);
        Ok(self.on_success(policy))
    }

    /// Switches the second factor. Email takes effect immediately; TOTP
    /// returns an enrollment that stays pending until confirmed. MFA stays
    /// enabled either way.
    pub fn change_method(
        &mut self,
        method: MfaMethod,
        enabled: bool,
        policy: &MfaPolicy,
        issuer: &str,
        account: &str,
    ) -> Result<Option<TotpEnrollment>, EngineError> {
        if !enabled {
            return Err(EngineError::validation(
                "enabled",
                "multi-factor authentication cannot be disabled",
            ));
        }
        self.enabled = true;
        match method {
            MfaMethod::Email => {
                self.method = MfaMethod::Email;
                self.totp_secret = None;
                self.pending_totp_secret = None;
                self.last_totp_step = None;
                Ok(None)
            }
            MfaMethod::Totp => Ok(Some(self.enroll_totp(policy, issuer, account))),
        }
    }

    fn on_success(&mut self, policy: &MfaPolicy) -> MfaVerification {
        self.reset_failures();
        self.status = MfaStatus::Verified;
        let mut backup_codes = Vec::new();
        let setup_completed = self.pending_verification;
        if setup_completed {
            self.pending_verification = false;
            backup_codes = (0..policy.backup_code_count)
                .map(|_| random_digits(policy.backup_code_digits))
                .collect();
            self.backup_code_hashes = backup_codes.iter().map(|code| hash_code(code)).collect();
        }
        MfaVerification {
            setup_completed,
            backup_codes,
            backup_codes_remaining: self.backup_code_hashes.len(),
        }
    }
}

pub fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

fn random_digits(digits: u32) -> String {
    let mut rng = rand::rng();
    (0..digits)
        .map(|_| char::from(b'0' + rng.random_range(0..10_u8)))
        .collect()
}
