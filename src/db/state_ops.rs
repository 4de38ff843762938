#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::mappers::{parse_agent_state, state_names};
use super::types::AgentStateRow;
use crate::db::SchedulerDb;
use crate::error::{Result, SchedulerError};
use crate::ports::PortFuture;
use crate::store::{AgentStateStore, LockAttempt};
use crate::types::{AgentExecutionState, AgentState, AgentType, NEVER_RUN_DURATION_MS};
use sqlx::Acquire;
use std::time::Duration;

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

const AGENT_STATE_COLUMNS: &str = "agent_type, current_state, last_execution_time, \
     last_transition_time, last_duration, data_processed";

fn is_lock_timeout(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE))
}

impl SchedulerDb {
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn get_agent_state(&self, agent_type: &AgentType) -> Result<Option<AgentState>> {
        sqlx::query_as::<_, AgentStateRow>(&format!(
            "SELECT {AGENT_STATE_COLUMNS} FROM agent_state WHERE agent_type = $1"
        ))
        .bind(agent_type.value())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| SchedulerError::DatabaseError(format!("Failed to get agent state: {e}")))
        .and_then(|row| row.map(parse_agent_state).transpose())
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn list_agent_states(
        &self,
        states: &[AgentExecutionState],
    ) -> Result<Vec<AgentState>> {
        sqlx::query_as::<_, AgentStateRow>(&format!(
            "SELECT {AGENT_STATE_COLUMNS}
             FROM agent_state
             WHERE current_state = ANY($1)
             ORDER BY last_execution_time ASC, agent_type ASC"
        ))
        .bind(state_names(states))
        .fetch_all(self.pool())
        .await
        .map_err(|e| SchedulerError::DatabaseError(format!("Failed to list agent states: {e}")))
        .and_then(|rows| rows.into_iter().map(parse_agent_state).collect())
    }

    async fn upsert_agent(
        &self,
        agent_type: &AgentType,
        target: AgentExecutionState,
        now_ms: i64,
    ) -> Result<u64> {
        sqlx::query(
            "INSERT INTO agent_state
                 (agent_type, current_state, last_execution_time, last_transition_time, last_duration, data_processed)
             VALUES ($1, $2, 0, $3, $4, -1)
             ON CONFLICT (agent_type) DO UPDATE
                 SET current_state = EXCLUDED.current_state,
                     last_transition_time = EXCLUDED.last_transition_time
                 WHERE agent_state.current_state NOT IN ('DELETED', 'PENDING', 'FINISHED', 'RUNNING')",
        )
        .bind(agent_type.value())
        .bind(target.as_str())
        .bind(now_ms)
        .bind(NEVER_RUN_DURATION_MS)
        .execute(self.pool())
        .await
        .map(|result| result.rows_affected())
        .map_err(|e| SchedulerError::DatabaseError(format!("Failed to upsert agent: {e}")))
    }

    async fn lock_agent_row(
        &self,
        agent_type: &AgentType,
        target: AgentExecutionState,
        wait: Duration,
        now_ms: i64,
    ) -> Result<LockAttempt> {
        // lock_timeout = 0 would mean "wait forever"
        let wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| SchedulerError::DatabaseError(format!("Failed to begin tx: {e}")))?;

        let conn = tx
            .acquire()
            .await
            .map_err(|e| SchedulerError::DatabaseError(format!("Failed to acquire tx conn: {e}")))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{wait_ms}ms"))
            .execute(&mut *conn)
            .await
            .map_err(|e| SchedulerError::DatabaseError(format!("Failed to set lock timeout: {e}")))?;

        let current = match sqlx::query_scalar::<_, String>(
            "SELECT current_state FROM agent_state WHERE agent_type = $1 FOR UPDATE",
        )
        .bind(agent_type.value())
        .fetch_optional(&mut *conn)
        .await
        {
            Ok(current) => current,
            Err(e) if is_lock_timeout(&e) => return Ok(LockAttempt::TimedOut),
            Err(e) => {
                return Err(SchedulerError::DatabaseError(format!(
                    "Failed to lock agent row: {e}"
                )))
            }
        };

        let attempt = match current.as_deref() {
            None => LockAttempt::NotFound,
            Some(state) if state == AgentExecutionState::Deleted.as_str() => {
                LockAttempt::MarkedForDeletion
            }
            Some(_) => {
                sqlx::query(
                    "UPDATE agent_state
                     SET current_state = $2, last_transition_time = $3
                     WHERE agent_type = $1",
                )
                .bind(agent_type.value())
                .bind(target.as_str())
                .bind(now_ms)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    SchedulerError::DatabaseError(format!("Failed to transition locked row: {e}"))
                })?;
                LockAttempt::Transitioned
            }
        };

        tx.commit()
            .await
            .map_err(|e| SchedulerError::DatabaseError(format!("Failed to commit tx: {e}")))
            .map(|()| attempt)
    }

    async fn transition_agent(
        &self,
        agent_type: &AgentType,
        target: AgentExecutionState,
        now_ms: i64,
    ) -> Result<u64> {
        sqlx::query(
            "UPDATE agent_state
             SET current_state = $2, last_transition_time = $3
             WHERE agent_type = $1 AND current_state <> 'DELETED'",
        )
        .bind(agent_type.value())
        .bind(target.as_str())
        .bind(now_ms)
        .execute(self.pool())
        .await
        .map(|result| result.rows_affected())
        .map_err(|e| SchedulerError::DatabaseError(format!("Failed to transition agent: {e}")))
    }

    async fn complete_agent(
        &self,
        agent_type: &AgentType,
        duration_ms: i64,
        items: i64,
        now_ms: i64,
    ) -> Result<u64> {
        sqlx::query(
            "UPDATE agent_state
             SET current_state = 'FINISHED',
                 last_duration = $2,
                 last_execution_time = $3,
                 last_transition_time = $3,
                 data_processed = $4
             WHERE agent_type = $1 AND current_state <> 'DELETED'",
        )
        .bind(agent_type.value())
        .bind(duration_ms)
        .bind(now_ms)
        .bind(items)
        .execute(self.pool())
        .await
        .map(|result| result.rows_affected())
        .map_err(|e| SchedulerError::DatabaseError(format!("Failed to complete agent: {e}")))
    }

    async fn purge_agent(&self, agent_type: &AgentType) -> Result<u64> {
        sqlx::query("DELETE FROM agent_state WHERE agent_type = $1 AND current_state = 'DELETED'")
            .bind(agent_type.value())
            .execute(self.pool())
            .await
            .map(|result| result.rows_affected())
            .map_err(|e| SchedulerError::DatabaseError(format!("Failed to purge agent: {e}")))
    }
}

impl AgentStateStore for SchedulerDb {
    fn get<'a>(&'a self, agent_type: &'a AgentType) -> PortFuture<'a, Option<AgentState>> {
        Box::pin(self.get_agent_state(agent_type))
    }

    fn upsert_unless_protected<'a>(
        &'a self,
        agent_type: &'a AgentType,
        target: AgentExecutionState,
        now_ms: i64,
    ) -> PortFuture<'a, u64> {
        Box::pin(self.upsert_agent(agent_type, target, now_ms))
    }

    fn lock_and_transition<'a>(
        &'a self,
        agent_type: &'a AgentType,
        target: AgentExecutionState,
        wait: Duration,
        now_ms: i64,
    ) -> PortFuture<'a, LockAttempt> {
        Box::pin(self.lock_agent_row(agent_type, target, wait, now_ms))
    }

    fn transition_unless_deleted<'a>(
        &'a self,
        agent_type: &'a AgentType,
        target: AgentExecutionState,
        now_ms: i64,
    ) -> PortFuture<'a, u64> {
        Box::pin(self.transition_agent(agent_type, target, now_ms))
    }

    fn complete_unless_deleted<'a>(
        &'a self,
        agent_type: &'a AgentType,
        duration_ms: i64,
        items: i64,
        now_ms: i64,
    ) -> PortFuture<'a, u64> {
        Box::pin(self.complete_agent(agent_type, duration_ms, items, now_ms))
    }

    fn mark_deleted<'a>(&'a self, agent_type: &'a AgentType, now_ms: i64) -> PortFuture<'a, u64> {
        Box::pin(self.transition_agent(agent_type, AgentExecutionState::Deleted, now_ms))
    }

    fn purge_deleted<'a>(&'a self, agent_type: &'a AgentType) -> PortFuture<'a, u64> {
        Box::pin(self.purge_agent(agent_type))
    }

    fn list_in<'a>(
        &'a self,
        states: &'a [AgentExecutionState],
    ) -> PortFuture<'a, Vec<AgentState>> {
        Box::pin(self.list_agent_states(states))
    }
}
