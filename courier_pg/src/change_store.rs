use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::changes::ChangeRecord;
use courier_core::collaborators::{ChangeStore, CollaboratorResult};
use courier_core::error::CollaboratorError;
use courier_core::payload::TransactionId;
use log::debug;
use sqlx::{Error as SqlxError, PgPool};

/// Change records stored in the `courier_changes` table.
///
/// Inserting a record whose transaction id already exists is a no-op, so a redelivered batch of
/// changes can be persisted again safely.
#[derive(Debug, Clone)]
pub struct PgChangeStore {
    pool: PgPool,
}

impl PgChangeStore {
    /// Creates a store over `pool`. Run the migrations first.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The `limit` most recent records, newest first.
    pub async fn latest(&self, limit: i64) -> CollaboratorResult<Vec<ChangeRecord>> {
        let rows: Vec<(i64, serde_json::Value, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT transaction_id, entity_ids, created_at
            FROM courier_changes
            ORDER BY transaction_id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter()
            .map(|(transaction_id, entity_ids, created_at)| {
                Ok(ChangeRecord {
                    transaction_id: transaction_id as TransactionId,
                    entity_ids: serde_json::from_value(entity_ids).map_err(|e| {
                        CollaboratorError::terminal(format!(
                            "change {} has malformed entity ids: {}",
                            transaction_id, e
                        ))
                    })?,
                    created_at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ChangeStore for PgChangeStore {
    async fn insert_many(
        &self,
        records: &[ChangeRecord],
    ) -> CollaboratorResult<Vec<TransactionId>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut transaction_ids = Vec::with_capacity(records.len());
        let mut entity_ids = Vec::with_capacity(records.len());
        let mut created_ats = Vec::with_capacity(records.len());
        for record in records {
            let transaction_id = i64::try_from(record.transaction_id).map_err(|_| {
                CollaboratorError::validation(format!(
                    "transaction id {} is out of range",
                    record.transaction_id
                ))
            })?;
            let ids = serde_json::to_value(&record.entity_ids)
                .map_err(|e| CollaboratorError::validation(e.to_string()))?;
            transaction_ids.push(transaction_id);
            entity_ids.push(ids);
            created_ats.push(record.created_at);
        }

        let inserted: Vec<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO courier_changes (transaction_id, entity_ids, created_at)
            SELECT * FROM UNNEST($1::BIGINT[], $2::JSONB[], $3::TIMESTAMPTZ[])
            ON CONFLICT (transaction_id) DO NOTHING
            RETURNING transaction_id
            "#,
        )
        .bind(&transaction_ids)
        .bind(&entity_ids)
        .bind(&created_ats)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        debug!(
            "Persisted {} of {} change record(s)",
            inserted.len(),
            records.len()
        );
        Ok(inserted
            .into_iter()
            .map(|(id,)| id as TransactionId)
            .collect())
    }
}

/// Maps a database failure onto the retry classification of the pipeline.
fn classify(error: SqlxError) -> CollaboratorError {
    match &error {
        SqlxError::Io(_) | SqlxError::PoolTimedOut | SqlxError::PoolClosed => {
            CollaboratorError::transient(error.to_string())
        }
        // Integrity constraint violations (SQLSTATE class 23) will not pass on retry
        SqlxError::Database(db) if db.code().is_some_and(|code| code.starts_with("23")) => {
            CollaboratorError::validation(error.to_string())
        }
        _ => CollaboratorError::unclassified(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::error::ErrorKind;

    #[test]
    fn connection_failures_are_transient() {
        assert_eq!(classify(SqlxError::PoolTimedOut).kind, ErrorKind::Transient);
        assert_eq!(classify(SqlxError::RowNotFound).kind, ErrorKind::Unclassified);
    }
}
