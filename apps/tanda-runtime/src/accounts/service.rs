use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tanda_core::{
    EngineError, MfaMethod, MfaPolicy, MfaState, MfaVerification, NotificationIntent, Outcome,
    normalize_email,
};
use uuid::Uuid;

use crate::accounts::store::{AccountStore, AccountStoreError};
use crate::accounts::types::{
    ChangeMfaMethodRequest, MfaMethodChanged, Principal, RegisterRequest, SessionRecord,
    SessionStarted, SessionVerified, StartSessionRequest, TotpSetupView, UserRecord,
};
use crate::clock::Clock;
use crate::notifications::NotificationDispatcher;
use crate::retry::{Idempotency, RetryPolicy};

const SESSION_TOKEN_PREFIX: &str = "tnd_st_";
const MIN_PASSWORD_CHARS: usize = 8;
const MAX_NAME_CHARS: usize = 120;

/// Registration, sessions and the second-factor gate.
#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn AccountStore>,
    clock: Arc<dyn Clock>,
    notifications: NotificationDispatcher,
    retry: RetryPolicy,
    policy: MfaPolicy,
    issuer: String,
    session_ttl: Duration,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn AccountStore>,
        clock: Arc<dyn Clock>,
        notifications: NotificationDispatcher,
        retry: RetryPolicy,
        policy: MfaPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            notifications,
            retry,
            policy,
            issuer: "Tanda".to_string(),
            session_ttl: Duration::hours(12),
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl = Duration::seconds(seconds.max(60));
        self
    }

    pub fn store(&self) -> Arc<dyn AccountStore> {
        self.store.clone()
    }

    /// Creates a temporary account and an unverified session. Email accounts
    /// get their first code immediately; TOTP accounts get the secret to
    /// enrol and complete setup with the first valid code.
    pub async fn register(&self, request: RegisterRequest) -> Result<SessionStarted, EngineError> {
        let email = normalize_email(&request.email)?;
        let name = normalize_name(&request.name)?;
        if request.password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(EngineError::validation(
                "password",
                format!("password must be at least {MIN_PASSWORD_CHARS} characters"),
            ));
        }
        let method = match request.mfa_method.as_deref() {
            Some(raw) => MfaMethod::parse(raw)?,
            None => MfaMethod::Email,
        };

        let now = self.clock.now();
        let (mut mfa, enrollment) = match method {
            MfaMethod::Email => (MfaState::new(MfaMethod::Email), None),
            MfaMethod::Totp => {
                let (state, enrollment) = MfaState::new_totp(&self.policy, &self.issuer, &email);
                (state, Some(enrollment))
            }
        };
        let mut outcome = Outcome::new(());
        let user_id = format!("usr_{}", Uuid::new_v4().simple());
        if method == MfaMethod::Email {
            let code = mfa.issue_email_code(&self.policy, now);
            outcome = outcome.with_intent(NotificationIntent::MfaCodeIssued {
                user_id: user_id.clone(),
                email: email.clone(),
                code,
                expires_at: now + self.policy.code_ttl,
            });
        }

        let salt = random_hex(16);
        let user = UserRecord {
            user_id,
            credential_hash: credential_hash(&salt, &request.password),
            credential_salt: salt,
            email,
            name,
            mfa,
            pool_ids: Vec::new(),
            created_at: now,
            version: 0,
        };
        let user = self
            .store
            .insert_user(user)
            .await
            .map_err(|error| match error {
                AccountStoreError::Conflict(_) => EngineError::Conflict(
                    "an account with this email already exists".to_string(),
                ),
                other => map_store_error(other),
            })?;
        tracing::info!(user_id = %user.user_id, mfa_method = method.as_str(), "account registered");

        let started = self.open_session(&user, now, enrollment.map(totp_view)).await?;
        Ok(self.publish(outcome.map(|()| started)))
    }

    /// Password check only; the returned session stays unverified until a
    /// second factor is presented.
    pub async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> Result<SessionStarted, EngineError> {
        let invalid = || EngineError::Unauthorized("invalid email or password".to_string());
        let email = normalize_email(&request.email).map_err(|_| invalid())?;
        let user = self
            .store
            .find_user_by_email(&email)
            .await
            .map_err(map_store_error)?
            .ok_or_else(invalid)?;
        if credential_hash(&user.credential_salt, &request.password) != user.credential_hash {
            return Err(invalid());
        }

        let now = self.clock.now();
        let user = match user.mfa.method {
            MfaMethod::Email => self.issue_email_code(&user.user_id).await?,
            MfaMethod::Totp => user,
        };
        self.open_session(&user, now, None).await
    }

    /// Issues a fresh email code for the session's user.
    pub async fn resend_code(&self, session_token: &str) -> Result<(), EngineError> {
        let session = self.live_session(session_token).await?;
        let user = self.load_user(&session.user_id).await?;
        if user.mfa.method != MfaMethod::Email {
            return Err(EngineError::validation(
                "mfa_method",
                "codes are only sent for email verification",
            ));
        }
        self.issue_email_code(&user.user_id).await?;
        Ok(())
    }

    /// Verifies the session's second factor with the user's configured
    /// method. Completing setup also returns the one-time backup codes.
    pub async fn verify_session_mfa(
        &self,
        session_token: &str,
        code: &str,
    ) -> Result<SessionVerified, EngineError> {
        let session = self.live_session(session_token).await?;
        let policy = &self.policy;
        let verification = self
            .apply_second_factor("verify_session_mfa", &session.user_id, |mfa, now| {
                mfa.verify_code(code, policy, now)
            })
            .await?;
        self.finish_session(&session, verification).await
    }

    pub async fn use_backup_code(
        &self,
        session_token: &str,
        code: &str,
    ) -> Result<SessionVerified, EngineError> {
        let session = self.live_session(session_token).await?;
        let policy = &self.policy;
        let verification = self
            .apply_second_factor("use_backup_code", &session.user_id, |mfa, now| {
                mfa.consume_backup_code(code, policy, now)
            })
            .await?;
        tracing::info!(user_id = %session.user_id, remaining = verification.backup_codes_remaining, "backup code consumed");
        self.finish_session(&session, verification).await
    }

    /// Switches the second factor for a verified user. Switching to TOTP
    /// returns the new secret; it takes effect once confirmed.
    pub async fn change_mfa_method(
        &self,
        principal: &Principal,
        request: ChangeMfaMethodRequest,
    ) -> Result<MfaMethodChanged, EngineError> {
        let method = MfaMethod::parse(&request.method)?;
        let this = self;
        let request = &request;
        let (user, enrollment) = self
            .retry
            .run("change_mfa_method", Idempotency::NotIdempotent, move || async move {
                let mut user = this.load_user(&principal.user_id).await?;
                let expected_version = user.version;
                let enrollment = user.mfa.change_method(
                    method,
                    request.enabled,
                    &this.policy,
                    &this.issuer,
                    &user.email,
                )?;
                let user = this
                    .store
                    .commit_user(user, expected_version)
                    .await
                    .map_err(map_store_error)?;
                Ok((user, enrollment))
            })
            .await?;
        tracing::info!(user_id = %user.user_id, requested = method.as_str(), active = user.mfa.method.as_str(), "mfa method changed");
        Ok(MfaMethodChanged {
            method: user.mfa.method,
            enabled: user.mfa.enabled,
            totp_setup: enrollment.map(totp_view),
        })
    }

    pub async fn confirm_totp_enrollment(
        &self,
        principal: &Principal,
        code: &str,
    ) -> Result<SessionVerified, EngineError> {
        let policy = &self.policy;
        let verification = self
            .apply_second_factor("confirm_totp_enrollment", &principal.user_id, |mfa, now| {
                mfa.confirm_totp_enrollment(code, policy, now)
            })
            .await?;
        Ok(SessionVerified {
            user_id: principal.user_id.clone(),
            session_verified: true,
            setup_completed: verification.setup_completed,
            backup_codes: verification.backup_codes,
            backup_codes_remaining: verification.backup_codes_remaining,
        })
    }

    /// Gate for every mutating call: the bearer must hold a live session
    /// whose second factor has been verified.
    pub async fn require_verified_session(
        &self,
        session_token: &str,
    ) -> Result<Principal, EngineError> {
        let session = self.live_session(session_token).await?;
        if !session.mfa_verified {
            return Err(EngineError::Unauthorized(
                "session requires mfa verification".to_string(),
            ));
        }
        let user = self
            .load_user(&session.user_id)
            .await
            .map_err(|_| EngineError::Unauthorized("session user no longer exists".to_string()))?;
        Ok(Principal {
            user_id: user.user_id,
            email: user.email,
            name: user.name,
            session_id: session.session_id,
        })
    }

    /// Administrative unlock.
    pub async fn reset_mfa_lockout(&self, email: &str) -> Result<String, EngineError> {
        let email = normalize_email(email)?;
        let user = self
            .store
            .find_user_by_email(&email)
            .await
            .map_err(map_store_error)?
            .ok_or(EngineError::NotFound("user"))?;
        self.store
            .reset_failed_attempts(&user.user_id)
            .await
            .map_err(map_store_error)?;
        tracing::info!(user_id = %user.user_id, "mfa lockout reset");
        Ok(user.user_id)
    }

    /// Runs one second-factor check against a fresh read of the user. A wrong
    /// code goes through the store's atomic counter, never through the
    /// document write.
    async fn apply_second_factor<F>(
        &self,
        operation: &'static str,
        user_id: &str,
        check: F,
    ) -> Result<MfaVerification, EngineError>
    where
        F: Fn(&mut MfaState, DateTime<Utc>) -> Result<MfaVerification, EngineError>,
    {
        let this = self;
        let check = &check;
        self.retry
            .run(operation, Idempotency::NotIdempotent, move || async move {
                let mut user = this.load_user(user_id).await?;
                let expected_version = user.version;
                let now = this.clock.now();
                match check(&mut user.mfa, now) {
                    Ok(verification) => {
                        this.store
                            .commit_user(user, expected_version)
                            .await
                            .map_err(map_store_error)?;
                        Ok(verification)
                    }
                    Err(EngineError::InvalidCode) => Err(this.record_failure(&user, now).await),
                    Err(error) => Err(error),
                }
            })
            .await
    }

    async fn record_failure(&self, user: &UserRecord, now: DateTime<Utc>) -> EngineError {
        let attempts = match self
            .store
            .record_failed_attempt(&user.user_id, &self.policy, now)
            .await
        {
            Ok(attempts) => attempts,
            Err(error) => return map_store_error(error),
        };
        if attempts == self.policy.max_failed_attempts {
            tracing::warn!(user_id = %user.user_id, attempts, "mfa locked out after repeated failures");
            self.publish(Outcome::new(()).with_intent(NotificationIntent::MfaLockedOut {
                user_id: user.user_id.clone(),
                email: user.email.clone(),
            }));
        } else {
            tracing::debug!(user_id = %user.user_id, attempts, "mfa code rejected");
        }
        EngineError::InvalidCode
    }

    async fn issue_email_code(&self, user_id: &str) -> Result<UserRecord, EngineError> {
        let this = self;
        let outcome = self
            .retry
            .run("issue_email_code", Idempotency::NotIdempotent, move || async move {
                let mut user = this.load_user(user_id).await?;
                let expected_version = user.version;
                let now = this.clock.now();
                let code = user.mfa.issue_email_code(&this.policy, now);
                let user = this
                    .store
                    .commit_user(user, expected_version)
                    .await
                    .map_err(map_store_error)?;
                let intent = NotificationIntent::MfaCodeIssued {
                    user_id: user.user_id.clone(),
                    email: user.email.clone(),
                    code,
                    expires_at: now + this.policy.code_ttl,
                };
                Ok(Outcome::new(user).with_intent(intent))
            })
            .await?;
        Ok(self.publish(outcome))
    }

    async fn open_session(
        &self,
        user: &UserRecord,
        now: DateTime<Utc>,
        totp_setup: Option<TotpSetupView>,
    ) -> Result<SessionStarted, EngineError> {
        let token = format!("{SESSION_TOKEN_PREFIX}{}", Uuid::new_v4().simple());
        let session = SessionRecord {
            session_id: format!("ses_{}", Uuid::new_v4().simple()),
            token_hash: token_hash(&token),
            user_id: user.user_id.clone(),
            mfa_verified: false,
            created_at: now,
            expires_at: now + self.session_ttl,
        };
        let expires_at = session.expires_at;
        self.store
            .insert_session(session)
            .await
            .map_err(map_store_error)?;
        Ok(SessionStarted {
            user_id: user.user_id.clone(),
            session_token: token,
            expires_at,
            mfa_method: user.mfa.method,
            mfa_required: true,
            totp_setup,
        })
    }

    async fn finish_session(
        &self,
        session: &SessionRecord,
        verification: MfaVerification,
    ) -> Result<SessionVerified, EngineError> {
        self.store
            .mark_session_verified(&session.session_id)
            .await
            .map_err(map_store_error)?;
        if verification.setup_completed {
            tracing::info!(user_id = %session.user_id, "mfa setup completed");
        }
        Ok(SessionVerified {
            user_id: session.user_id.clone(),
            session_verified: true,
            setup_completed: verification.setup_completed,
            backup_codes: verification.backup_codes,
            backup_codes_remaining: verification.backup_codes_remaining,
        })
    }

    async fn live_session(&self, session_token: &str) -> Result<SessionRecord, EngineError> {
        let token = session_token.trim();
        if !token.starts_with(SESSION_TOKEN_PREFIX) {
            return Err(EngineError::Unauthorized("invalid session token".to_string()));
        }
        let session = self
            .store
            .get_session(&token_hash(token))
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| EngineError::Unauthorized("invalid session token".to_string()))?;
        if self.clock.now() >= session.expires_at {
            return Err(EngineError::Unauthorized("session expired".to_string()));
        }
        Ok(session)
    }

    async fn load_user(&self, user_id: &str) -> Result<UserRecord, EngineError> {
        self.store
            .get_user(user_id)
            .await
            .map_err(map_store_error)?
            .ok_or(EngineError::NotFound("user"))
    }

    fn publish<T>(&self, outcome: Outcome<T>) -> T {
        self.notifications.emit(outcome.intents);
        outcome.value
    }
}

fn totp_view(enrollment: tanda_core::TotpEnrollment) -> TotpSetupView {
    TotpSetupView {
        secret: enrollment.secret,
        provisioning_uri: enrollment.provisioning_uri,
    }
}

fn normalize_name(raw: &str) -> Result<String, EngineError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(EngineError::validation("name", "name is required"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(EngineError::validation(
            "name",
            format!("name must be at most {MAX_NAME_CHARS} characters"),
        ));
    }
    Ok(name.to_string())
}

fn credential_hash(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0_u8; len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) fn map_store_error(error: AccountStoreError) -> EngineError {
    match error {
        AccountStoreError::Conflict(message) => EngineError::Conflict(message),
        AccountStoreError::NotFound(_) => EngineError::NotFound("user"),
        AccountStoreError::Db(message) => EngineError::StoreUnavailable(message),
    }
}
