use anyhow::{Result, anyhow};
use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header::RETRY_AFTER},
};
use chrono::Duration;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use super::build_router;
use crate::config::Config;
use crate::testing::Harness;

fn test_harness(mutate_config: impl FnOnce(&mut Config)) -> Harness {
    let mut config = Config::local();
    config.request_timeout_ms = 5_000;
    mutate_config(&mut config);
    Harness::with_config(config)
}

fn request(
    method: Method,
    uri: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> Result<Request<Body>> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => builder.body(Body::empty())?,
    };
    Ok(request)
}

async fn send(
    harness: &Harness,
    request: Request<Body>,
) -> Result<(StatusCode, axum::http::HeaderMap, Value)> {
    let response = build_router(harness.state.clone()).oneshot(request).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let collected = response.into_body().collect().await?;
    let bytes = collected.to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, headers, json))
}

fn field<'a>(json: &'a Value, key: &str) -> Result<&'a str> {
    json.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing string field {key} in {json}"))
}

#[tokio::test]
async fn health_endpoint_is_public() -> Result<()> {
    let harness = test_harness(|_| {});
    let (status, headers, json) =
        send(&harness, request(Method::GET, "/healthz", None, None)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.get("status").and_then(Value::as_str), Some("ok"));
    assert!(headers.contains_key("x-request-id"));
    Ok(())
}

#[tokio::test]
async fn pool_routes_require_a_verified_session() -> Result<()> {
    let harness = test_harness(|_| {});
    let (status, _, json) = send(&harness, request(Method::GET, "/v1/pools", None, None)?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(field(&json, "error")?, "unauthorized");

    let (status, _, started) = send(
        &harness,
        request(
            Method::POST,
            "/v1/accounts",
            None,
            Some(json!({
                "email": "ana@example.com",
                "name": "Ana",
                "password": "correct horse battery",
            })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let token = field(&started, "session_token")?.to_string();

    let (status, _, _) = send(
        &harness,
        request(Method::GET, "/v1/pools", Some(&token), None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn pool_lifecycle_over_http() -> Result<()> {
    let harness = test_harness(|_| {});
    let (admin_token, _) = harness.verified_session("ana").await?;
    let (bea_token, _) = harness.verified_session("bea").await?;

    let (status, _, pool) = send(
        &harness,
        request(
            Method::POST,
            "/v1/pools",
            Some(&admin_token),
            Some(json!({
                "name": "Friday tanda",
                "contribution_amount_minor": 800,
                "total_members": 2,
                "frequency": "weekly",
            })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let pool_id = field(&pool, "pool_id")?.to_string();
    assert_eq!(field(&pool, "status")?, "forming");

    let (status, _, issued) = send(
        &harness,
        request(
            Method::POST,
            &format!("/v1/pools/{pool_id}/invitations"),
            Some(&admin_token),
            Some(json!({ "email": "bea@example.com" })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let invitation_token = field(&issued, "token")?.to_string();

    let (status, _, view) = send(
        &harness,
        request(
            Method::GET,
            &format!("/v1/invitations/{invitation_token}"),
            None,
            None,
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(view.get("token").is_none());

    let (status, _, _) = send(
        &harness,
        request(
            Method::POST,
            &format!("/v1/invitations/{invitation_token}/accept"),
            Some(&bea_token),
            None,
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _, json) = send(
        &harness,
        request(
            Method::POST,
            &format!("/v1/pools/{pool_id}/payouts"),
            Some(&admin_token),
            Some(json!({ "round": 1 })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(field(&json, "error")?, "contributions_incomplete");

    for token in [&admin_token, &bea_token] {
        let (status, _, record) = send(
            &harness,
            request(
                Method::POST,
                &format!("/v1/pools/{pool_id}/contributions"),
                Some(token),
                Some(json!({ "payment_method": "cashapp" })),
            )?,
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        let member_id = field(&record, "member_id")?;
        let (status, _, verified) = send(
            &harness,
            request(
                Method::POST,
                &format!("/v1/pools/{pool_id}/contributions/{member_id}/verify"),
                Some(&admin_token),
                None,
            )?,
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&verified, "status")?, "ADMIN_VERIFIED");
    }

    let (status, _, receipt) = send(
        &harness,
        request(
            Method::POST,
            &format!("/v1/pools/{pool_id}/payouts"),
            Some(&admin_token),
            Some(json!({ "round": 1 })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt.get("amount_minor").and_then(Value::as_i64), Some(1_600));

    let (status, _, json) = send(
        &harness,
        request(
            Method::POST,
            &format!("/v1/pools/{pool_id}/payouts"),
            Some(&admin_token),
            Some(json!({ "round": 1 })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(field(&json, "error")?, "already_paid_out");

    let (status, _, json) = send(
        &harness,
        request(
            Method::GET,
            &format!("/v1/pools/{pool_id}/payment-display?method=wire"),
            Some(&bea_token),
            None,
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(field(&json, "error")?, "invalid_payment_method");

    let (status, _, pools) = send(
        &harness,
        request(Method::GET, "/v1/pools", Some(&bea_token), None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let listed = pools
        .get("pools")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("pools missing"))?;
    assert_eq!(listed.len(), 1);
    assert_eq!(
        listed[0].get("current_round").and_then(Value::as_u64),
        Some(2)
    );
    Ok(())
}

#[tokio::test]
async fn locked_out_session_gets_retry_after() -> Result<()> {
    let harness = test_harness(|_| {});
    let (_, _, started) = send(
        &harness,
        request(
            Method::POST,
            "/v1/accounts",
            None,
            Some(json!({
                "email": "ana@example.com",
                "name": "Ana",
                "password": "correct horse battery",
            })),
        )?,
    )
    .await?;
    let token = field(&started, "session_token")?.to_string();
    let code = harness.nth_code("ana@example.com", 1).await?;
    let wrong = if code == "000000" { "111111" } else { "000000" };

    for _ in 0..5 {
        let (status, _, json) = send(
            &harness,
            request(
                Method::POST,
                "/v1/sessions/mfa/verify",
                Some(&token),
                Some(json!({ "code": wrong })),
            )?,
        )
        .await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(field(&json, "error")?, "invalid_code");
    }

    let (status, headers, json) = send(
        &harness,
        request(
            Method::POST,
            "/v1/sessions/mfa/verify",
            Some(&token),
            Some(json!({ "code": code })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(field(&json, "error")?, "rate_limited");
    let retry_after = headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok())
        .ok_or_else(|| anyhow!("retry-after missing"))?;
    assert!(retry_after > 0 && retry_after <= 15 * 60);
    Ok(())
}

#[tokio::test]
async fn invitation_lookup_statuses() -> Result<()> {
    let harness = test_harness(|_| {});
    let (admin_token, _) = harness.verified_session("ana").await?;
    let (outsider_token, _) = harness.verified_session("zed").await?;
    let (_, _, pool) = send(
        &harness,
        request(
            Method::POST,
            "/v1/pools",
            Some(&admin_token),
            Some(json!({
                "name": "Later",
                "contribution_amount_minor": 500,
                "total_members": 3,
                "frequency": "monthly",
            })),
        )?,
    )
    .await?;
    let invitations_uri = format!("/v1/pools/{}/invitations", field(&pool, "pool_id")?);

    let (status, _, _) = send(
        &harness,
        request(
            Method::POST,
            &invitations_uri,
            Some(&outsider_token),
            Some(json!({ "email": "cal@example.com" })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, json) = send(
        &harness,
        request(Method::GET, "/v1/invitations/not-a-token", None, None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(field(&json, "field")?, "token");

    let (status, _, issued) = send(
        &harness,
        request(
            Method::POST,
            &invitations_uri,
            Some(&admin_token),
            Some(json!({ "email": "cal@example.com" })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    harness.clock.advance(Duration::days(8));

    let (status, _, json) = send(
        &harness,
        request(
            Method::GET,
            &format!("/v1/invitations/{}", field(&issued, "token")?),
            None,
            None,
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(field(&json, "error")?, "expired_invitation");
    Ok(())
}

#[tokio::test]
async fn internal_cleanup_is_disabled_without_a_token() -> Result<()> {
    let harness = test_harness(|_| {});
    let (status, _, _) = send(
        &harness,
        request(Method::POST, "/internal/v1/invitations/cleanup", None, None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn internal_cleanup_checks_the_token() -> Result<()> {
    let harness = test_harness(|config| {
        config.internal_token = Some("ops-secret".to_string());
    });
    let (status, _, _) = send(
        &harness,
        request(
            Method::POST,
            "/internal/v1/invitations/cleanup",
            Some("guess"),
            None,
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, json) = send(
        &harness,
        request(
            Method::POST,
            "/internal/v1/invitations/cleanup",
            Some("ops-secret"),
            None,
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.get("expired").and_then(Value::as_u64), Some(0));
    Ok(())
}
