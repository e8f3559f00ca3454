use anyhow::{Context, Result, anyhow};
use chrono::Duration;
use tanda_core::{EngineError, MfaMethod, NotificationIntent, totp};

use crate::accounts::types::{ChangeMfaMethodRequest, RegisterRequest, StartSessionRequest};
use crate::testing::Harness;

fn register_request(user: &str, mfa_method: Option<&str>) -> RegisterRequest {
    RegisterRequest {
        email: format!("{user}@example.com"),
        name: user.to_string(),
        password: "correct horse battery".to_string(),
        mfa_method: mfa_method.map(ToString::to_string),
    }
}

#[tokio::test]
async fn email_registration_verifies_on_first_code() -> Result<()> {
    let harness = Harness::new();
    let started = harness
        .accounts
        .register(register_request("ana", None))
        .await
        .context("register")?;
    assert_eq!(started.mfa_method, MfaMethod::Email);
    assert!(started.mfa_required);
    assert!(started.totp_setup.is_none());

    let gate = harness
        .accounts
        .require_verified_session(&started.session_token)
        .await;
    assert!(matches!(gate, Err(EngineError::Unauthorized(_))));

    let code = harness.nth_code("ana@example.com", 1).await?;
    let verified = harness
        .accounts
        .verify_session_mfa(&started.session_token, &code)
        .await
        .context("verify")?;
    assert!(verified.session_verified);
    assert!(verified.setup_completed);
    assert_eq!(verified.backup_codes.len(), 8);
    let user = harness
        .accounts
        .store()
        .get_user(&started.user_id)
        .await?
        .ok_or_else(|| anyhow!("user missing"))?;
    assert!(!user.is_temporary());

    let principal = harness
        .accounts
        .require_verified_session(&started.session_token)
        .await
        .context("gate")?;
    assert_eq!(principal.email, "ana@example.com");
    Ok(())
}

#[tokio::test]
async fn duplicate_email_is_rejected() -> Result<()> {
    let harness = Harness::new();
    harness.accounts.register(register_request("ana", None)).await?;
    let mut again = register_request("ana", None);
    again.email = "  ANA@example.com ".to_string();
    let error = harness
        .accounts
        .register(again)
        .await
        .err()
        .ok_or_else(|| anyhow!("duplicate registration accepted"))?;
    assert_eq!(error.code(), "conflict");
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_unauthorized() -> Result<()> {
    let harness = Harness::new();
    harness.accounts.register(register_request("ana", None)).await?;
    let result = harness
        .accounts
        .start_session(StartSessionRequest {
            email: "ana@example.com".to_string(),
            password: "not the password".to_string(),
        })
        .await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));
    Ok(())
}

#[tokio::test]
async fn five_wrong_codes_lock_out_even_the_right_one() -> Result<()> {
    let harness = Harness::new();
    let started = harness.accounts.register(register_request("ana", None)).await?;
    let code = harness.nth_code("ana@example.com", 1).await?;
    let wrong = if code == "000000" { "111111" } else { "000000" };

    for _ in 0..5 {
        let error = harness
            .accounts
            .verify_session_mfa(&started.session_token, wrong)
            .await
            .err()
            .ok_or_else(|| anyhow!("wrong code accepted"))?;
        assert_eq!(error, EngineError::InvalidCode);
    }
    let locked = harness
        .accounts
        .verify_session_mfa(&started.session_token, &code)
        .await;
    assert!(matches!(locked, Err(EngineError::RateLimited { .. })));

    let notice = harness
        .notifier
        .wait_for(|intent| matches!(intent, NotificationIntent::MfaLockedOut { .. }))
        .await;
    assert!(notice.is_some());
    Ok(())
}

#[tokio::test]
async fn lockout_lifts_after_cool_down() -> Result<()> {
    let harness = Harness::new();
    let started = harness.accounts.register(register_request("ana", None)).await?;
    let code = harness.nth_code("ana@example.com", 1).await?;
    let wrong = if code == "000000" { "111111" } else { "000000" };
    for _ in 0..5 {
        let _ = harness
            .accounts
            .verify_session_mfa(&started.session_token, wrong)
            .await;
    }

    harness.clock.advance(Duration::minutes(15));
    harness.accounts.resend_code(&started.session_token).await?;
    let fresh = harness.nth_code("ana@example.com", 2).await?;
    let verified = harness
        .accounts
        .verify_session_mfa(&started.session_token, &fresh)
        .await
        .context("verify after cool-down")?;
    assert!(verified.session_verified);
    Ok(())
}

#[tokio::test]
async fn concurrent_failures_are_all_counted() -> Result<()> {
    let harness = Harness::new();
    let started = harness.accounts.register(register_request("ana", None)).await?;
    let code = harness.nth_code("ana@example.com", 1).await?;
    let wrong = if code == "000000" { "111111" } else { "000000" };

    let token = started.session_token.as_str();
    let accounts = &harness.accounts;
    let (a, b, c, d, e) = tokio::join!(
        accounts.verify_session_mfa(token, wrong),
        accounts.verify_session_mfa(token, wrong),
        accounts.verify_session_mfa(token, wrong),
        accounts.verify_session_mfa(token, wrong),
        accounts.verify_session_mfa(token, wrong),
    );
    for result in [a, b, c, d, e] {
        assert_eq!(result.err(), Some(EngineError::InvalidCode));
    }

    let user = harness
        .accounts
        .store()
        .find_user_by_email("ana@example.com")
        .await?
        .ok_or_else(|| anyhow!("user missing"))?;
    assert_eq!(user.mfa.failed_attempts, 5);
    Ok(())
}

#[tokio::test]
async fn expired_code_does_not_count_as_a_failure() -> Result<()> {
    let harness = Harness::new();
    let started = harness.accounts.register(register_request("ana", None)).await?;
    let code = harness.nth_code("ana@example.com", 1).await?;
    harness.clock.advance(Duration::minutes(10));

    let error = harness
        .accounts
        .verify_session_mfa(&started.session_token, &code)
        .await
        .err()
        .ok_or_else(|| anyhow!("expired code accepted"))?;
    assert_eq!(error, EngineError::ExpiredCode);

    let user = harness
        .accounts
        .store()
        .find_user_by_email("ana@example.com")
        .await?
        .ok_or_else(|| anyhow!("user missing"))?;
    assert_eq!(user.mfa.failed_attempts, 0);
    Ok(())
}

#[tokio::test]
async fn totp_registration_completes_with_the_first_code() -> Result<()> {
    let harness = Harness::new();
    let started = harness
        .accounts
        .register(register_request("ben", Some("totp")))
        .await?;
    let setup = started
        .totp_setup
        .clone()
        .ok_or_else(|| anyhow!("totp setup missing"))?;
    assert!(setup.provisioning_uri.starts_with("otpauth://totp/"));

    let policy = &harness.config.mfa_policy;
    let step = totp::time_step(harness.clock_now().timestamp(), policy.totp_step_seconds);
    let code = totp::totp_code(&setup.secret, step)?;
    let verified = harness
        .accounts
        .verify_session_mfa(&started.session_token, &code)
        .await?;
    assert!(verified.setup_completed);

    let second = harness
        .accounts
        .start_session(StartSessionRequest {
            email: "ben@example.com".to_string(),
            password: "correct horse battery".to_string(),
        })
        .await?;
    let replay = harness
        .accounts
        .verify_session_mfa(&second.session_token, &code)
        .await;
    assert_eq!(replay.err(), Some(EngineError::InvalidCode));
    Ok(())
}

#[tokio::test]
async fn backup_code_verifies_a_new_session_once() -> Result<()> {
    let harness = Harness::new();
    let started = harness.accounts.register(register_request("ana", None)).await?;
    let code = harness.nth_code("ana@example.com", 1).await?;
    let verified = harness
        .accounts
        .verify_session_mfa(&started.session_token, &code)
        .await?;
    let backup = verified.backup_codes[0].clone();

    let session = harness
        .accounts
        .start_session(StartSessionRequest {
            email: "ana@example.com".to_string(),
            password: "correct horse battery".to_string(),
        })
        .await?;
    let used = harness
        .accounts
        .use_backup_code(&session.session_token, &backup)
        .await?;
    assert_eq!(used.backup_codes_remaining, 7);
    assert!(used.backup_codes.is_empty());

    let reuse = harness
        .accounts
        .use_backup_code(&session.session_token, &backup)
        .await;
    assert_eq!(reuse.err(), Some(EngineError::InvalidCode));
    Ok(())
}

#[tokio::test]
async fn sessions_expire_after_the_ttl() -> Result<()> {
    let harness = Harness::new();
    let (token, _) = harness.verified_session("ana").await?;
    harness
        .clock
        .advance(Duration::seconds(harness.config.session_ttl_seconds));
    let result = harness.accounts.require_verified_session(&token).await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));
    Ok(())
}

#[tokio::test]
async fn mfa_cannot_be_disabled_but_can_move_to_totp() -> Result<()> {
    let harness = Harness::new();
    let (_, principal) = harness.verified_session("ana").await?;

    let refused = harness
        .accounts
        .change_mfa_method(
            &principal,
            ChangeMfaMethodRequest {
                method: "email".to_string(),
                enabled: false,
            },
        )
        .await;
    assert_eq!(
        refused.err().map(|error| error.code()),
        Some("validation_error")
    );

    let changed = harness
        .accounts
        .change_mfa_method(
            &principal,
            ChangeMfaMethodRequest {
                method: "totp".to_string(),
                enabled: true,
            },
        )
        .await?;
    assert!(changed.enabled);
    assert_eq!(changed.method, MfaMethod::Email);
    let setup = changed
        .totp_setup
        .ok_or_else(|| anyhow!("enrollment missing"))?;

    let policy = &harness.config.mfa_policy;
    let step = totp::time_step(harness.clock_now().timestamp(), policy.totp_step_seconds);
    let code = totp::totp_code(&setup.secret, step)?;
    let confirmed = harness
        .accounts
        .confirm_totp_enrollment(&principal, &code)
        .await?;
    assert!(!confirmed.setup_completed);

    let user = harness
        .accounts
        .store()
        .get_user(&principal.user_id)
        .await?
        .ok_or_else(|| anyhow!("user missing"))?;
    assert_eq!(user.mfa.method, MfaMethod::Totp);
    assert!(user.mfa.enabled);
    Ok(())
}

#[tokio::test]
async fn administrative_reset_clears_the_lockout() -> Result<()> {
    let harness = Harness::new();
    let started = harness.accounts.register(register_request("ana", None)).await?;
    let code = harness.nth_code("ana@example.com", 1).await?;
    let wrong = if code == "000000" { "111111" } else { "000000" };
    for _ in 0..5 {
        let _ = harness
            .accounts
            .verify_session_mfa(&started.session_token, wrong)
            .await;
    }

    harness.accounts.reset_mfa_lockout("ana@example.com").await?;
    let verified = harness
        .accounts
        .verify_session_mfa(&started.session_token, &code)
        .await?;
    assert!(verified.session_verified);

    let missing = harness.accounts.reset_mfa_lockout("nobody@example.com").await;
    assert_eq!(missing.err(), Some(EngineError::NotFound("user")));
    Ok(())
}
