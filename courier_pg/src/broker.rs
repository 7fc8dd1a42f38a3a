use async_trait::async_trait;
use courier_core::broker::{Broker, BrokerError, DeliveryTag, FetchRequest, RawMessage};
use courier_core::queue::QueueName;
use log::debug;
use sqlx::{Error as SqlxError, PgPool};
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Errors raised by [`PgBroker`].
#[derive(Debug, thiserror::Error)]
pub enum PgBrokerError {
    /// An error occurred with the SQLx library.
    #[error("SQLx error: {0}")]
    Sqlx(#[from] SqlxError),
    /// The tag cannot name a row of `courier_messages`.
    #[error("delivery tag {0} is out of range")]
    InvalidTag(DeliveryTag),
}

impl From<PgBrokerError> for BrokerError {
    fn from(error: PgBrokerError) -> Self {
        match error {
            PgBrokerError::Sqlx(
                e @ (SqlxError::Io(_) | SqlxError::PoolTimedOut | SqlxError::PoolClosed),
            ) => BrokerError::Unavailable(e.to_string()),
            other => BrokerError::Backend(other.to_string()),
        }
    }
}

/// Durable queues stored in the `courier_messages` table.
///
/// A fetch leases rows with `FOR UPDATE SKIP LOCKED`, so any number of processes can consume the
/// same queue. A lease that is neither acked nor released expires after the visibility timeout and
/// the message is delivered again. Every lease draws a new token from `courier_lease_tokens` and
/// that token is the delivery tag, so a consumer whose lease expired cannot settle the message
/// after someone else leased it. Fetching polls: an empty queue is re-checked every poll
/// interval until the fetch's wait runs out.
///
/// Run [`Migrator`](crate::migrations::Migrator) before using the broker.
#[derive(Debug, Clone)]
pub struct PgBroker {
    pool: PgPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgBroker {
    /// Creates a broker with a five minute visibility timeout and a 100ms poll interval.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            visibility_timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Sets how long a lease lasts before the message is redelivered.
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Sets how often an empty queue is re-checked during a fetch.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Number of messages in `queue`, leased ones included.
    pub async fn depth(&self, queue: QueueName) -> Result<u64, PgBrokerError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM courier_messages WHERE queue = $1")
                .bind(queue.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    /// Deletes every message of `queue`. Returns how many were deleted.
    pub async fn purge(&self, queue: QueueName) -> Result<u64, PgBrokerError> {
        let result = sqlx::query("DELETE FROM courier_messages WHERE queue = $1")
            .bind(queue.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert(&self, queue: QueueName, body: Vec<u8>) -> Result<(), PgBrokerError> {
        sqlx::query("INSERT INTO courier_messages (queue, body) VALUES ($1, $2)")
            .bind(queue.as_str())
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Leases what is available right now, within the prefetch window.
    async fn lease(
        &self,
        queue: QueueName,
        request: FetchRequest,
    ) -> Result<Vec<RawMessage>, PgBrokerError> {
        let mut tx = self.pool.begin().await?;

        let (in_flight,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM courier_messages
            WHERE queue = $1 AND leased_until > NOW()
            "#,
        )
        .bind(queue.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let room = (request.prefetch as i64).saturating_sub(in_flight);
        let limit = room.min(request.max_messages as i64);
        if limit <= 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut rows: Vec<(i64, i64, Vec<u8>)> = sqlx::query_as(
            r#"
            WITH candidates AS (
                SELECT id FROM courier_messages
                WHERE queue = $1 AND (leased_until IS NULL OR leased_until <= NOW())
                ORDER BY id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE courier_messages m
            SET leased_until = NOW() + make_interval(secs => $3),
                lease_token = nextval('courier_lease_tokens')
            FROM candidates c
            WHERE m.id = c.id
            RETURNING m.id, m.lease_token, m.body
            "#,
        )
        .bind(queue.as_str())
        .bind(limit)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        rows.sort_by_key(|(id, _, _)| *id);
        Ok(rows
            .into_iter()
            .map(|(_, token, body)| RawMessage {
                tag: token as DeliveryTag,
                body,
            })
            .collect())
    }

    async fn settle(
        &self,
        sql: &str,
        queue: QueueName,
        tag: DeliveryTag,
    ) -> Result<bool, PgBrokerError> {
        let token = i64::try_from(tag).map_err(|_| PgBrokerError::InvalidTag(tag))?;
        let result = sqlx::query(sql)
            .bind(token)
            .bind(queue.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(&self, queue: QueueName, body: Vec<u8>) -> Result<(), BrokerError> {
        Ok(self.insert(queue, body).await?)
    }

    async fn fetch(
        &self,
        queue: QueueName,
        request: FetchRequest,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        let deadline = Instant::now() + request.wait;
        loop {
            let messages = self.lease(queue, request).await?;
            if !messages.is_empty() {
                debug!("Leased {} message(s) from '{}'", messages.len(), queue);
                return Ok(messages);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, queue: QueueName, tag: DeliveryTag) -> Result<(), BrokerError> {
        let settled = self
            .settle(
                "DELETE FROM courier_messages WHERE lease_token = $1 AND queue = $2",
                queue,
                tag,
            )
            .await?;
        if !settled {
            return Err(BrokerError::UnknownDelivery { queue, tag });
        }
        Ok(())
    }

    async fn release(&self, queue: QueueName, tag: DeliveryTag) -> Result<(), BrokerError> {
        let settled = self
            .settle(
                r#"
                UPDATE courier_messages SET leased_until = NULL, lease_token = NULL
                WHERE lease_token = $1 AND queue = $2
                "#,
                queue,
                tag,
            )
            .await?;
        if !settled {
            return Err(BrokerError::UnknownDelivery { queue, tag });
        }
        Ok(())
    }
}
