//! Migration 001: the queue table every broker queue lives in.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates `courier_messages` and the index consumers fetch through.
pub struct CreateMessagesTable;

#[async_trait]
impl Migration for CreateMessagesTable {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "create_messages_table"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        // `leased_until` is NULL while a message is ready and set while a consumer holds it
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS courier_messages (
                id BIGSERIAL PRIMARY KEY,
                queue VARCHAR(64) NOT NULL,
                body BYTEA NOT NULL,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                leased_until TIMESTAMPTZ
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_courier_messages_queue
            ON courier_messages (queue, id)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
