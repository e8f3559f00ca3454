use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

const SCHEMA_MIGRATION: &str = include_str!("../migrations/0001_tanda_schema.sql");

#[derive(Clone)]
pub struct TandaDb {
    client: Arc<Mutex<Client>>,
}

impl TandaDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "tanda postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    /// Applies the schema. Statements are idempotent so this can run on every
    /// deploy.
    pub async fn migrate(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(SCHEMA_MIGRATION)
            .await
            .context("apply tanda schema migration")?;
        tracing::info!("tanda schema migration applied");
        Ok(())
    }
}
