//! # Postgres Substrate
//!
//! Substrate implementation over a shared Postgres instance: one relay
//! table with an expiry column for the keyed payloads, `LISTEN`/`NOTIFY`
//! for the topic, and `DELETE .. RETURNING` for the single-consumer take.
//!
//! Ordering note: `set_and_publish` runs the insert and the `pg_notify`
//! inside one transaction. Postgres only delivers the notification after
//! commit, so a subscriber can never observe the message before the stored
//! row is visible.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{OperatorError, Result};

use super::Substrate;

const RELAY_TABLE_DDL: &str = "\
CREATE TABLE IF NOT EXISTS relay_results (
    key        TEXT PRIMARY KEY,
    payload    BYTEA NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
)";

/// Substrate adapter backed by a shared Postgres instance.
#[derive(Debug, Clone)]
pub struct PostgresSubstrate {
    pool: PgPool,
}

impl PostgresSubstrate {
    /// Connect and make sure the relay table exists.
    pub async fn connect(uri: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(uri)
            .await
            .map_err(|e| OperatorError::substrate(format!("connect: {e}")))?;
        sqlx::query(RELAY_TABLE_DDL)
            .execute(&pool)
            .await
            .map_err(|e| OperatorError::substrate(format!("schema: {e}")))?;
        info!("connected to substrate");
        Ok(Self { pool })
    }

    /// Spawn the background sweep that drops expired relay rows. Reads
    /// already filter on `expires_at`, so the sweep only bounds table
    /// growth for results nobody ever consumed.
    pub fn spawn_pruner(&self, interval: Duration) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match sqlx::query("DELETE FROM relay_results WHERE expires_at <= now()")
                    .execute(&pool)
                    .await
                {
                    Ok(done) if done.rows_affected() > 0 => {
                        debug!(pruned = done.rows_affected(), "pruned expired relay results");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "relay result prune failed"),
                }
            }
        });
    }
}

#[async_trait]
impl Substrate for PostgresSubstrate {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        sqlx::query(
            "INSERT INTO relay_results (key, payload, expires_at) \
             VALUES ($1, $2, now() + make_interval(secs => $3)) \
             ON CONFLICT (key) DO UPDATE \
             SET payload = EXCLUDED.payload, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| OperatorError::substrate(format!("set: {e}")))?;
        Ok(())
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            "DELETE FROM relay_results WHERE key = $1 AND expires_at > now() RETURNING payload",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OperatorError::substrate(format!("get_and_delete: {e}")))?;
        Ok(row.map(|row| row.get::<Vec<u8>, _>("payload")))
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic)
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(|e| OperatorError::substrate(format!("publish: {e}")))?;
        Ok(())
    }

    async fn set_and_publish(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        topic: &str,
        message: &str,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| OperatorError::substrate(format!("begin: {e}")))?;
        sqlx::query(
            "INSERT INTO relay_results (key, payload, expires_at) \
             VALUES ($1, $2, now() + make_interval(secs => $3)) \
             ON CONFLICT (key) DO UPDATE \
             SET payload = EXCLUDED.payload, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&mut *tx)
        .await
        .map_err(|e| OperatorError::substrate(format!("set: {e}")))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic)
            .bind(message)
            .execute(&mut *tx)
            .await
            .map_err(|e| OperatorError::substrate(format!("publish: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| OperatorError::substrate(format!("commit: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| OperatorError::substrate(format!("listener: {e}")))?;
        listener
            .listen(topic)
            .await
            .map_err(|e| OperatorError::substrate(format!("listen: {e}")))?;
        info!(topic = %topic, "subscribed to substrate topic");

        let (sender, receiver) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = listener.into_stream();
            while let Some(notification) = stream.next().await {
                match notification {
                    Ok(notification) => {
                        debug!(
                            channel = %notification.channel(),
                            payload = %notification.payload(),
                            "substrate notification"
                        );
                        if sender.send(notification.payload().to_string()).await.is_err() {
                            warn!("subscription receiver dropped, stopping listener");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "substrate subscription lost");
                        break;
                    }
                }
            }
        });
        Ok(receiver)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| OperatorError::substrate(format!("ping: {e}")))?;
        Ok(())
    }
}
