#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    accounts::{AccountService, store::AccountStore},
    clock::Clock,
    config::Config,
    db::TandaDb,
    invitations::{InvitationService, store::InvitationStore},
    notifications::{LogNotifier, NotificationDispatcher, Notifier},
    pools::{PoolService, store::PoolStore},
    retry::RetryPolicy,
    server::{AppState, build_router},
};

pub mod accounts;
pub mod clock;
pub mod config;
pub mod db;
pub mod invitations;
pub mod notifications;
pub mod pools;
pub mod retry;
pub mod server;

#[cfg(test)]
mod testing;

/// Store backends for one runtime instance.
pub struct Stores {
    pub pools: Arc<dyn PoolStore>,
    pub invitations: Arc<dyn InvitationStore>,
    pub accounts: Arc<dyn AccountStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Self {
            pools: pools::store::memory(),
            invitations: invitations::store::memory(),
            accounts: accounts::store::memory(),
        }
    }

    pub fn postgres(db: Arc<TandaDb>) -> Self {
        Self {
            pools: pools::store::postgres(db.clone()),
            invitations: invitations::store::postgres(db.clone()),
            accounts: accounts::store::postgres(db),
        }
    }
}

/// Wires services over the given stores. Spawns the notification worker, so
/// it must run inside a tokio runtime.
pub fn assemble_state(
    config: Config,
    stores: Stores,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
) -> AppState {
    let retry = RetryPolicy::from_config(&config);
    let notifications =
        NotificationDispatcher::spawn(notifier, config.notification_queue_capacity);

    let accounts = AccountService::new(
        stores.accounts.clone(),
        clock.clone(),
        notifications.clone(),
        retry,
        config.mfa_policy.clone(),
    )
    .with_issuer(config.mfa_issuer.clone())
    .with_session_ttl_seconds(config.session_ttl_seconds);
    let pools = PoolService::new(
        stores.pools,
        stores.accounts.clone(),
        clock.clone(),
        notifications.clone(),
        retry,
        config.pool_policy.clone(),
    );
    let invitations = InvitationService::new(
        stores.invitations,
        pools.clone(),
        stores.accounts,
        clock,
        notifications,
    );
    AppState::new(config, accounts, pools, invitations)
}

pub async fn build_app_state(config: Config) -> Result<AppState> {
    let stores = match config.db_url.clone() {
        Some(url) => Stores::postgres(Arc::new(TandaDb::connect(url.as_str()).await?)),
        None => {
            tracing::warn!("no DB_URL configured; using in-memory stores");
            Stores::memory()
        }
    };
    Ok(assemble_state(
        config,
        stores,
        clock::system(),
        Arc::new(LogNotifier),
    ))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_app_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "tanda runtime listening"
    );
    axum::serve(listener, build_app(config).await?).await?;
    Ok(())
}
