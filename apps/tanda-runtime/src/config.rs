use std::{
    env,
    net::{AddrParseError, SocketAddr},
};

use chrono::Duration;
use tanda_core::{ContributionVerification, MfaPolicy, PoolPolicy};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub db_url: Option<String>,
    pub request_timeout_ms: u64,
    pub conflict_retry_limit: u32,
    pub store_retry_limit: u32,
    pub store_retry_backoff_ms: u64,
    pub session_ttl_seconds: i64,
    pub notification_queue_capacity: usize,
    pub mfa_issuer: String,
    /// Bearer token for `/internal` routes; those routes are closed when unset.
    pub internal_token: Option<String>,
    pub pool_policy: PoolPolicy,
    pub mfa_policy: MfaPolicy,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TANDA_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid TANDA_REQUEST_TIMEOUT_MS: {0}")]
    InvalidRequestTimeout(String),
    #[error("invalid TANDA_CONFLICT_RETRY_LIMIT: {0}")]
    InvalidConflictRetryLimit(String),
    #[error("invalid TANDA_STORE_RETRY_LIMIT: {0}")]
    InvalidStoreRetryLimit(String),
    #[error("invalid TANDA_STORE_RETRY_BACKOFF_MS: {0}")]
    InvalidStoreRetryBackoff(String),
    #[error("invalid TANDA_SESSION_TTL_SECONDS: {0}")]
    InvalidSessionTtl(String),
    #[error("invalid TANDA_NOTIFICATION_QUEUE_CAPACITY: {0}")]
    InvalidNotificationQueueCapacity(String),
    #[error("invalid pool policy setting: {0}")]
    InvalidPoolPolicy(String),
    #[error("invalid mfa policy setting: {0}")]
    InvalidMfaPolicy(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("TANDA_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:4300".to_string())
            .parse()?;
        let service_name = env::var("TANDA_SERVICE_NAME").unwrap_or_else(|_| "tanda".to_string());
        let db_url = env::var("DB_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let request_timeout_ms = env::var("TANDA_REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "250".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidRequestTimeout(error.to_string()))?
            .clamp(10, 30_000);
        let conflict_retry_limit = env::var("TANDA_CONFLICT_RETRY_LIMIT")
            .unwrap_or_else(|_| "3".to_string())
            .parse::<u32>()
            .map_err(|error| ConfigError::InvalidConflictRetryLimit(error.to_string()))?
            .clamp(1, 10);
        let store_retry_limit = env::var("TANDA_STORE_RETRY_LIMIT")
            .unwrap_or_else(|_| "2".to_string())
            .parse::<u32>()
            .map_err(|error| ConfigError::InvalidStoreRetryLimit(error.to_string()))?
            .min(5);
        let store_retry_backoff_ms = env::var("TANDA_STORE_RETRY_BACKOFF_MS")
            .unwrap_or_else(|_| "20".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidStoreRetryBackoff(error.to_string()))?
            .min(1_000);
        let session_ttl_seconds = env::var("TANDA_SESSION_TTL_SECONDS")
            .unwrap_or_else(|_| "43200".to_string())
            .parse::<i64>()
            .map_err(|error| ConfigError::InvalidSessionTtl(error.to_string()))?
            .clamp(60, 30 * 86_400);
        let notification_queue_capacity = env::var("TANDA_NOTIFICATION_QUEUE_CAPACITY")
            .unwrap_or_else(|_| "1024".to_string())
            .parse::<usize>()
            .map_err(|error| ConfigError::InvalidNotificationQueueCapacity(error.to_string()))?
            .max(1);
        let mfa_issuer = env::var("TANDA_MFA_ISSUER").unwrap_or_else(|_| "Tanda".to_string());
        let internal_token = env::var("TANDA_INTERNAL_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let pool_policy = parse_pool_policy_from_env(|key| env::var(key).ok())?;
        let mfa_policy = parse_mfa_policy_from_env(|key| env::var(key).ok())?;

        Ok(Self {
            service_name,
            bind_addr,
            db_url,
            request_timeout_ms,
            conflict_retry_limit,
            store_retry_limit,
            store_retry_backoff_ms,
            session_ttl_seconds,
            notification_queue_capacity,
            mfa_issuer,
            internal_token,
            pool_policy,
            mfa_policy,
        })
    }

    /// In-memory defaults used by tests and local runs.
    pub fn local() -> Self {
        Self {
            service_name: "tanda".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 4300)),
            db_url: None,
            request_timeout_ms: 250,
            conflict_retry_limit: 3,
            store_retry_limit: 2,
            store_retry_backoff_ms: 20,
            session_ttl_seconds: 43_200,
            notification_queue_capacity: 1024,
            mfa_issuer: "Tanda".to_string(),
            internal_token: None,
            pool_policy: PoolPolicy::default(),
            mfa_policy: MfaPolicy::default(),
        }
    }
}

pub(crate) fn parse_pool_policy_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PoolPolicy, ConfigError> {
    let defaults = PoolPolicy::default();
    let invalid = ConfigError::InvalidPoolPolicy;

    let min_contribution_minor = parse_i64_env_lookup(
        &lookup,
        "TANDA_POOL_MIN_CONTRIBUTION_MINOR",
        defaults.min_contribution_minor,
        1,
        i64::from(u32::MAX),
        invalid,
    )?;
    let max_contribution_minor = parse_i64_env_lookup(
        &lookup,
        "TANDA_POOL_MAX_CONTRIBUTION_MINOR",
        defaults.max_contribution_minor,
        1,
        i64::from(u32::MAX),
        invalid,
    )?;
    if min_contribution_minor > max_contribution_minor {
        return Err(ConfigError::InvalidPoolPolicy(
            "TANDA_POOL_MIN_CONTRIBUTION_MINOR exceeds TANDA_POOL_MAX_CONTRIBUTION_MINOR"
                .to_string(),
        ));
    }
    let min_members = parse_i64_env_lookup(
        &lookup,
        "TANDA_POOL_MIN_MEMBERS",
        i64::from(defaults.min_members),
        2,
        100,
        invalid,
    )? as u32;
    let max_members = parse_i64_env_lookup(
        &lookup,
        "TANDA_POOL_MAX_MEMBERS",
        i64::from(defaults.max_members),
        2,
        100,
        invalid,
    )? as u32;
    if min_members > max_members {
        return Err(ConfigError::InvalidPoolPolicy(
            "TANDA_POOL_MIN_MEMBERS exceeds TANDA_POOL_MAX_MEMBERS".to_string(),
        ));
    }
    let invitation_ttl_seconds = parse_i64_env_lookup(
        &lookup,
        "TANDA_INVITATION_TTL_SECONDS",
        defaults.invitation_ttl.num_seconds(),
        60,
        90 * 86_400,
        invalid,
    )?;
    let verification = parse_with_lookup(
        &lookup,
        "TANDA_CONTRIBUTION_VERIFICATION",
        defaults.verification,
        |raw| {
            ContributionVerification::parse(&raw).ok_or_else(|| {
                ConfigError::InvalidPoolPolicy(format!("TANDA_CONTRIBUTION_VERIFICATION: {raw}"))
            })
        },
    )?;

    Ok(PoolPolicy {
        min_contribution_minor,
        max_contribution_minor,
        min_members,
        max_members,
        invitation_ttl: Duration::seconds(invitation_ttl_seconds),
        verification,
    })
}

pub(crate) fn parse_mfa_policy_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<MfaPolicy, ConfigError> {
    let defaults = MfaPolicy::default();
    let invalid = ConfigError::InvalidMfaPolicy;

    let code_ttl_seconds = parse_i64_env_lookup(
        &lookup,
        "TANDA_MFA_CODE_TTL_SECONDS",
        defaults.code_ttl.num_seconds(),
        60,
        3_600,
        invalid,
    )?;
    let max_failed_attempts = parse_i64_env_lookup(
        &lookup,
        "TANDA_MFA_MAX_FAILED_ATTEMPTS",
        i64::from(defaults.max_failed_attempts),
        1,
        20,
        invalid,
    )? as u32;
    let lockout_seconds = parse_i64_env_lookup(
        &lookup,
        "TANDA_MFA_LOCKOUT_SECONDS",
        defaults.lockout.num_seconds(),
        30,
        86_400,
        invalid,
    )?;
    let totp_step_seconds = parse_i64_env_lookup(
        &lookup,
        "TANDA_MFA_TOTP_STEP_SECONDS",
        defaults.totp_step_seconds,
        15,
        120,
        invalid,
    )?;
    let totp_skew_steps = parse_i64_env_lookup(
        &lookup,
        "TANDA_MFA_TOTP_SKEW_STEPS",
        defaults.totp_skew_steps,
        0,
        3,
        invalid,
    )?;
    let backup_code_count = parse_i64_env_lookup(
        &lookup,
        "TANDA_MFA_BACKUP_CODE_COUNT",
        defaults.backup_code_count as i64,
        1,
        20,
        invalid,
    )? as usize;
    let backup_code_digits = parse_i64_env_lookup(
        &lookup,
        "TANDA_MFA_BACKUP_CODE_DIGITS",
        i64::from(defaults.backup_code_digits),
        6,
        12,
        invalid,
    )? as u32;

    Ok(MfaPolicy {
        code_ttl: Duration::seconds(code_ttl_seconds),
        max_failed_attempts,
        lockout: Duration::seconds(lockout_seconds),
        totp_step_seconds,
        totp_skew_steps,
        backup_code_count,
        backup_code_digits,
    })
}

fn parse_i64_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: i64,
    min: i64,
    max: i64,
    invalid: fn(String) -> ConfigError,
) -> Result<i64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.trim()
            .parse::<i64>()
            .map_err(|error| invalid(format!("{key}: {error}")))
            .map(|value| value.clamp(min, max))
    })
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}
