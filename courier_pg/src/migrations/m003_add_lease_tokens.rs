//! Migration 003: a fresh token per lease, so only the current holder can settle a message.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Adds `courier_messages.lease_token`, drawn from `courier_lease_tokens` on every lease.
pub struct AddLeaseTokens;

#[async_trait]
impl Migration for AddLeaseTokens {
    fn version(&self) -> i64 {
        3
    }

    fn name(&self) -> &'static str {
        "add_lease_tokens"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query("CREATE SEQUENCE IF NOT EXISTS courier_lease_tokens")
            .execute(&mut **tx)
            .await?;

        sqlx::query("ALTER TABLE courier_messages ADD COLUMN IF NOT EXISTS lease_token BIGINT")
            .execute(&mut **tx)
            .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_courier_messages_lease_token
            ON courier_messages (lease_token)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
