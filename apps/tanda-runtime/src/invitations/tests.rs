use anyhow::{Context, Result, anyhow};
use chrono::Duration;
use tanda_core::{EngineError, InvitationStatus, NotificationIntent};

use crate::accounts::types::Principal;
use crate::invitations::types::{IssueInvitationRequest, RejectInvitationRequest};
use crate::pools::types::CreatePoolRequest;
use crate::testing::Harness;

fn invite(email: &str) -> IssueInvitationRequest {
    IssueInvitationRequest {
        email: email.to_string(),
    }
}

async fn pool_for(harness: &Harness, admin: &Principal, total_members: u32) -> Result<String> {
    let view = harness
        .pools
        .create_pool(
            admin,
            CreatePoolRequest {
                name: "Block party".to_string(),
                contribution_amount_minor: 500,
                total_members,
                frequency: "weekly".to_string(),
            },
        )
        .await?;
    Ok(view.summary.pool_id)
}

#[tokio::test]
async fn issued_invitation_validates_and_accepts() -> Result<()> {
    let harness = Harness::new();
    let (_, admin) = harness.verified_session("ana").await?;
    let (_, bea) = harness.verified_session("bea").await?;
    let pool_id = pool_for(&harness, &admin, 3).await?;

    let issued = harness
        .invitations
        .issue(&admin, &pool_id, invite(" Bea@Example.com "))
        .await
        .context("issue")?;
    assert_eq!(issued.email, "bea@example.com");
    assert_eq!(issued.status, InvitationStatus::Pending);
    assert_eq!(issued.expires_at, harness.clock_now() + Duration::days(7));
    assert_eq!(issued.token.len(), 64);

    let delivered = harness.invitation_token("bea@example.com").await?;
    assert_eq!(delivered, issued.token);

    let view = harness.invitations.validate(&issued.token).await?;
    assert_eq!(view.pool_name, "Block party");

    let accepted = harness.invitations.accept(&bea, &issued.token).await?;
    assert_eq!(accepted.pool_id, pool_id);
    assert_eq!(accepted.invitation_status, InvitationStatus::Accepted);
    assert_eq!(accepted.member.position, 2);
    assert_eq!(accepted.member.user_id.as_deref(), Some(bea.user_id.as_str()));

    let user = harness
        .state
        .accounts()
        .store()
        .get_user(&bea.user_id)
        .await?
        .ok_or_else(|| anyhow!("user missing"))?;
    assert_eq!(user.pool_ids, vec![pool_id.clone()]);
    let listed = harness.pools.pools_for_user(&bea).await?;
    assert_eq!(listed.pools.len(), 1);

    let again = harness.invitations.accept(&bea, &issued.token).await;
    assert_eq!(
        again.err(),
        Some(EngineError::AlreadyResolved { status: "accepted" })
    );
    Ok(())
}

#[tokio::test]
async fn only_the_admin_may_invite() -> Result<()> {
    let harness = Harness::new();
    let (pool_id, members) = harness.filled_pool(2, 500).await?;
    let result = harness
        .invitations
        .issue(&members[1], &pool_id, invite("cal@example.com"))
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));
    Ok(())
}

#[tokio::test]
async fn members_and_pending_invitees_cannot_be_invited_twice() -> Result<()> {
    let harness = Harness::new();
    let (_, admin) = harness.verified_session("ana").await?;
    let pool_id = pool_for(&harness, &admin, 4).await?;

    let member = harness
        .invitations
        .issue(&admin, &pool_id, invite("ana@example.com"))
        .await;
    assert_eq!(
        member.err(),
        Some(EngineError::DuplicateMember {
            email: "ana@example.com".to_string()
        })
    );

    harness
        .invitations
        .issue(&admin, &pool_id, invite("bea@example.com"))
        .await?;
    let pending = harness
        .invitations
        .issue(&admin, &pool_id, invite("BEA@example.com"))
        .await;
    assert_eq!(
        pending.err(),
        Some(EngineError::DuplicateInvitation {
            email: "bea@example.com".to_string()
        })
    );
    Ok(())
}

#[tokio::test]
async fn stale_invitation_expires_on_read_and_can_be_reissued() -> Result<()> {
    let harness = Harness::new();
    let (_, admin) = harness.verified_session("ana").await?;
    let pool_id = pool_for(&harness, &admin, 3).await?;
    let first = harness
        .invitations
        .issue(&admin, &pool_id, invite("bea@example.com"))
        .await?;

    harness.clock.advance(Duration::days(7));
    let validated = harness.invitations.validate(&first.token).await;
    assert_eq!(validated.err(), Some(EngineError::ExpiredInvitation));

    let stored = harness
        .invitations
        .store()
        .get_by_token(&first.token)
        .await?
        .ok_or_else(|| anyhow!("invitation missing"))?;
    assert_eq!(stored.status, InvitationStatus::Expired);

    let second = harness
        .invitations
        .issue(&admin, &pool_id, invite("bea@example.com"))
        .await?;
    assert_ne!(second.token, first.token);
    Ok(())
}

#[tokio::test]
async fn cleanup_sweeps_each_expired_invitation_once() -> Result<()> {
    let harness = Harness::new();
    let (_, admin) = harness.verified_session("ana").await?;
    let pool_id = pool_for(&harness, &admin, 4).await?;
    for email in ["bea@example.com", "cal@example.com"] {
        harness
            .invitations
            .issue(&admin, &pool_id, invite(email))
            .await?;
    }
    harness.clock.advance(Duration::days(3));
    let fresh = harness
        .invitations
        .issue(&admin, &pool_id, invite("dee@example.com"))
        .await?;

    harness.clock.advance(Duration::days(5));
    assert_eq!(harness.invitations.cleanup_expired().await?.expired, 2);
    assert_eq!(harness.invitations.cleanup_expired().await?.expired, 0);
    harness.invitations.validate(&fresh.token).await?;
    Ok(())
}

#[tokio::test]
async fn accept_requires_the_invited_email() -> Result<()> {
    let harness = Harness::new();
    let (_, admin) = harness.verified_session("ana").await?;
    let (_, mallory) = harness.verified_session("mallory").await?;
    let pool_id = pool_for(&harness, &admin, 3).await?;
    let issued = harness
        .invitations
        .issue(&admin, &pool_id, invite("bea@example.com"))
        .await?;

    let result = harness.invitations.accept(&mallory, &issued.token).await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));
    let view = harness.invitations.validate(&issued.token).await?;
    assert_eq!(view.status, InvitationStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn rejected_invitation_cannot_be_accepted() -> Result<()> {
    let harness = Harness::new();
    let (_, admin) = harness.verified_session("ana").await?;
    let (_, bea) = harness.verified_session("bea").await?;
    let pool_id = pool_for(&harness, &admin, 3).await?;
    let issued = harness
        .invitations
        .issue(&admin, &pool_id, invite("bea@example.com"))
        .await?;

    let rejected = harness
        .invitations
        .reject(
            &issued.token,
            RejectInvitationRequest {
                reason: Some("  not this year ".to_string()),
            },
        )
        .await?;
    assert_eq!(rejected.status, InvitationStatus::Rejected);

    let accept = harness.invitations.accept(&bea, &issued.token).await;
    assert_eq!(
        accept.err(),
        Some(EngineError::AlreadyResolved { status: "rejected" })
    );
    let seen = harness
        .notifier
        .wait_for(|intent| matches!(intent, NotificationIntent::InvitationRejected { .. }))
        .await;
    assert!(seen.is_some());
    Ok(())
}

async fn pool_ids_of(harness: &Harness, principal: &Principal) -> Result<Vec<String>> {
    let user = harness
        .state
        .accounts()
        .store()
        .get_user(&principal.user_id)
        .await?
        .ok_or_else(|| anyhow!("user missing"))?;
    Ok(user.pool_ids)
}

#[tokio::test]
async fn expired_invitation_cannot_be_accepted() -> Result<()> {
    let harness = Harness::new();
    let (_, admin) = harness.verified_session("ana").await?;
    let (_, bea) = harness.verified_session("bea").await?;
    let pool_id = pool_for(&harness, &admin, 3).await?;
    let issued = harness
        .invitations
        .issue(&admin, &pool_id, invite("bea@example.com"))
        .await?;

    harness.clock.advance(Duration::days(7));
    let accept = harness.invitations.accept(&bea, &issued.token).await;
    assert_eq!(accept.err(), Some(EngineError::ExpiredInvitation));

    let pool = harness.pools.load_pool(&pool_id).await?;
    assert_eq!(pool.members.len(), 1);
    assert!(pool_ids_of(&harness, &bea).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn deadline_passing_during_accept_still_completes_the_join() -> Result<()> {
    let harness = Harness::new();
    let (_, admin) = harness.verified_session("ana").await?;
    let (_, bea) = harness.verified_session("bea").await?;
    let pool_id = pool_for(&harness, &admin, 3).await?;
    let issued = harness
        .invitations
        .issue(&admin, &pool_id, invite("bea@example.com"))
        .await?;

    harness
        .clock
        .advance(Duration::days(7) - Duration::seconds(2));
    harness.clock.tick_on_read(Duration::seconds(1));
    let accepted = harness
        .invitations
        .accept(&bea, &issued.token)
        .await
        .context("accept across the deadline")?;
    harness.clock.tick_on_read(Duration::zero());

    assert_eq!(accepted.invitation_status, InvitationStatus::Accepted);
    assert_eq!(accepted.member.position, 2);
    assert_eq!(pool_ids_of(&harness, &bea).await?, vec![pool_id.clone()]);
    let stored = harness
        .invitations
        .store()
        .get_by_token(&issued.token)
        .await?
        .ok_or_else(|| anyhow!("invitation missing"))?;
    assert_eq!(stored.status, InvitationStatus::Accepted);
    assert_eq!(stored.accepted_by.as_deref(), Some(bea.user_id.as_str()));
    Ok(())
}

#[tokio::test]
async fn accept_finishes_a_join_interrupted_after_admission() -> Result<()> {
    let harness = Harness::new();
    let (_, admin) = harness.verified_session("ana").await?;
    let (_, bea) = harness.verified_session("bea").await?;
    let pool_id = pool_for(&harness, &admin, 3).await?;
    let issued = harness
        .invitations
        .issue(&admin, &pool_id, invite("bea@example.com"))
        .await?;

    let admitted = harness
        .pools
        .admit_member(&pool_id, &bea.identity())
        .await?;
    assert!(pool_ids_of(&harness, &bea).await?.is_empty());

    harness.clock.advance(Duration::days(8));
    let accepted = harness.invitations.accept(&bea, &issued.token).await?;
    assert_eq!(accepted.invitation_status, InvitationStatus::Accepted);
    assert_eq!(accepted.member.member_id, admitted.member_id);
    assert_eq!(harness.pools.load_pool(&pool_id).await?.members.len(), 2);
    assert_eq!(pool_ids_of(&harness, &bea).await?, vec![pool_id.clone()]);

    let again = harness.invitations.accept(&bea, &issued.token).await;
    assert_eq!(
        again.err(),
        Some(EngineError::AlreadyResolved { status: "accepted" })
    );
    assert_eq!(pool_ids_of(&harness, &bea).await?, vec![pool_id]);
    Ok(())
}

#[tokio::test]
async fn admitted_member_is_reported_when_the_invitation_was_rejected() -> Result<()> {
    let harness = Harness::new();
    let (_, admin) = harness.verified_session("ana").await?;
    let (_, bea) = harness.verified_session("bea").await?;
    let pool_id = pool_for(&harness, &admin, 3).await?;
    let issued = harness
        .invitations
        .issue(&admin, &pool_id, invite("bea@example.com"))
        .await?;

    harness
        .pools
        .admit_member(&pool_id, &bea.identity())
        .await?;
    harness
        .invitations
        .reject(&issued.token, RejectInvitationRequest::default())
        .await?;

    let accepted = harness.invitations.accept(&bea, &issued.token).await?;
    assert_eq!(accepted.invitation_status, InvitationStatus::Rejected);
    assert_eq!(accepted.member.position, 2);
    assert_eq!(pool_ids_of(&harness, &bea).await?, vec![pool_id]);
    Ok(())
}

#[tokio::test]
async fn last_seat_goes_to_the_first_acceptor() -> Result<()> {
    let harness = Harness::new();
    let (_, admin) = harness.verified_session("ana").await?;
    let (_, bea) = harness.verified_session("bea").await?;
    let (_, cal) = harness.verified_session("cal").await?;
    let pool_id = pool_for(&harness, &admin, 2).await?;

    let for_bea = harness
        .invitations
        .issue(&admin, &pool_id, invite("bea@example.com"))
        .await?;
    let for_cal = harness
        .invitations
        .issue(&admin, &pool_id, invite("cal@example.com"))
        .await?;

    harness.invitations.accept(&bea, &for_bea.token).await?;
    let late = harness.invitations.accept(&cal, &for_cal.token).await;
    assert_eq!(late.err(), Some(EngineError::PoolFull { max_members: 2 }));

    let more = harness
        .invitations
        .issue(&admin, &pool_id, invite("dee@example.com"))
        .await;
    assert_eq!(more.err(), Some(EngineError::PoolFull { max_members: 2 }));
    Ok(())
}

#[tokio::test]
async fn malformed_token_is_rejected_before_lookup() -> Result<()> {
    let harness = Harness::new();
    let result = harness.invitations.validate("not-a-token").await;
    assert!(matches!(result, Err(EngineError::Validation { .. })));
    let unknown = harness.invitations.validate(&"a".repeat(64)).await;
    assert_eq!(unknown.err(), Some(EngineError::NotFound("invitation")));
    Ok(())
}
