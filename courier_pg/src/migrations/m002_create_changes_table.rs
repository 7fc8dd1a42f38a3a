//! Migration 002: durable change records.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates `courier_changes`, keyed by upstream transaction id.
pub struct CreateChangesTable;

#[async_trait]
impl Migration for CreateChangesTable {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &'static str {
        "create_changes_table"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS courier_changes (
                transaction_id BIGINT PRIMARY KEY,
                entity_ids JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
