use super::mappers::{parse_delivery, to_i32_u32};
use super::types::WorkQueueRow;
use crate::channel::{Delivery, WorkChannel};
use crate::db::SchedulerDb;
use crate::error::{Result, SchedulerError};
use crate::ports::PortFuture;
use crate::types::AgentType;
use std::time::{Duration, Instant};

const QUEUE_POLL_STEP: Duration = Duration::from_millis(250);

impl SchedulerDb {
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn enqueue_agent(&self, agent_type: &AgentType, attempt: u32) -> Result<()> {
        sqlx::query("INSERT INTO agent_work_queue (agent_type, attempt) VALUES ($1, $2)")
            .bind(agent_type.value())
            .bind(to_i32_u32(attempt))
            .execute(self.pool())
            .await
            .map(|_result| ())
            .map_err(|e| SchedulerError::ChannelError(format!("Failed to enqueue agent: {e}")))
    }

    /// Claim and remove the oldest queued message, skipping rows other consumers hold.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn claim_next_delivery(&self) -> Result<Option<Delivery>> {
        sqlx::query_as::<_, WorkQueueRow>(
            "DELETE FROM agent_work_queue
             WHERE id = (
                 SELECT id FROM agent_work_queue
                 ORDER BY id
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             RETURNING agent_type, attempt",
        )
        .fetch_optional(self.pool())
        .await
        .map(|row| row.map(parse_delivery))
        .map_err(|e| SchedulerError::ChannelError(format!("Failed to claim delivery: {e}")))
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn queued_delivery_count(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM agent_work_queue")
            .fetch_one(self.pool())
            .await
            .map_err(|e| SchedulerError::ChannelError(format!("Failed to count queue: {e}")))
    }

    async fn poll_next_delivery(&self, wait: Duration) -> Result<Option<Delivery>> {
        let started = Instant::now();
        loop {
            if let Some(delivery) = self.claim_next_delivery().await? {
                return Ok(Some(delivery));
            }
            let remaining = wait.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(QUEUE_POLL_STEP)).await;
        }
    }
}

impl WorkChannel for SchedulerDb {
    fn publish<'a>(&'a self, agent_type: &'a AgentType) -> PortFuture<'a, ()> {
        Box::pin(self.enqueue_agent(agent_type, 1))
    }

    fn next_delivery(&self, wait: Duration) -> PortFuture<'_, Option<Delivery>> {
        Box::pin(self.poll_next_delivery(wait))
    }

    fn redeliver(&self, delivery: Delivery) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.enqueue_agent(&delivery.agent_type, delivery.attempt)
                .await
        })
    }
}
