#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Sole authority over agent lifecycle rows.
//!
//! Every mutation is a single conditional, row-scoped store operation. Nothing
//! here coordinates across rows or across processes: concurrent callers race
//! on the guards, and the guards alone keep DELETED rows out of scheduling.

use crate::clock::Clock;
use crate::error::Result;
use crate::store::{AgentStateStore, LockAttempt};
use crate::types::{AgentExecutionState, AgentState, AgentType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on how long `acquire_lock` waits for a row lock.
pub const MAX_AGENT_DURATION: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct StateMachine {
    store: Arc<dyn AgentStateStore>,
    clock: Arc<dyn Clock>,
}

impl StateMachine {
    #[must_use]
    pub fn new(store: Arc<dyn AgentStateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[must_use]
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// # Errors
    /// Returns an error if the store read fails.
    pub async fn get(&self, agent_type: &AgentType) -> Result<Option<AgentState>> {
        self.store.get(agent_type).await
    }

    /// Ensure a row exists; move it to `target` only from NOT_STARTED or FAILED.
    ///
    /// Rows already PENDING, RUNNING, FINISHED or DELETED are left untouched, so
    /// repeated calls are a no-op for agents that are scheduled or in flight.
    /// Store failures are logged and swallowed; the next tick repeats the call.
    pub async fn create_or_update_agent(&self, agent_type: &AgentType, target: AgentExecutionState) {
        match self
            .store
            .upsert_unless_protected(agent_type, target, self.now_ms())
            .await
        {
            Ok(0) => debug!(agent_type = %agent_type, target = %target, "agent state left unchanged"),
            Ok(_) => debug!(agent_type = %agent_type, target = %target, "agent state upserted"),
            Err(e) => warn!(agent_type = %agent_type, target = %target, error = %e, "failed to upsert agent state"),
        }
    }

    /// Best-effort move to `target` under a row lock held for at most
    /// `min(timeout, MAX_AGENT_DURATION)`.
    ///
    /// Returns whether the transition was confirmed. `false` never means another
    /// runner owns the agent; the lock is advisory and callers proceed anyway.
    pub async fn acquire_lock(
        &self,
        agent_type: &AgentType,
        timeout: Duration,
        target: AgentExecutionState,
    ) -> bool {
        let wait = timeout.min(MAX_AGENT_DURATION);
        match self
            .store
            .lock_and_transition(agent_type, target, wait, self.now_ms())
            .await
        {
            Ok(LockAttempt::Transitioned) => true,
            Ok(LockAttempt::TimedOut) => {
                warn!(
                    agent_type = %agent_type,
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "timed out waiting for agent row lock"
                );
                false
            }
            Ok(LockAttempt::NotFound) => {
                warn!(agent_type = %agent_type, "no state row to lock");
                false
            }
            Ok(LockAttempt::MarkedForDeletion) => {
                debug!(agent_type = %agent_type, "agent marked for deletion; lock not taken");
                false
            }
            Err(e) => {
                warn!(agent_type = %agent_type, error = %e, "failed to acquire agent row lock");
                false
            }
        }
    }

    /// Returns the number of rows changed; 0 when the row is DELETED or absent.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn change_state_unless_marked_for_deletion(
        &self,
        agent_type: &AgentType,
        target: AgentExecutionState,
    ) -> Result<u64> {
        self.store
            .transition_unless_deleted(agent_type, target, self.now_ms())
            .await
    }

    /// Record a successful run: FINISHED plus duration, completion time and item count.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn mark_agent_completed(
        &self,
        agent_type: &AgentType,
        duration_ms: i64,
        result_count: i64,
    ) -> Result<u64> {
        self.store
            .complete_unless_deleted(agent_type, duration_ms, result_count, self.now_ms())
            .await
    }

    /// Mark an agent DELETED. A second call reports 0 rows.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn disable(&self, agent_type: &AgentType) -> Result<u64> {
        let affected = self.store.mark_deleted(agent_type, self.now_ms()).await?;
        if affected == 0 {
            warn!(agent_type = %agent_type, "agent already disabled or unknown");
        }
        Ok(affected)
    }

    /// Remove a DELETED row for good.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn delete(&self, agent_type: &AgentType) -> Result<u64> {
        self.store.purge_deleted(agent_type).await
    }

    /// # Errors
    /// Returns an error if the store read fails.
    pub async fn list_agents_filtered_where_in(
        &self,
        states: &[AgentExecutionState],
    ) -> Result<Vec<AgentState>> {
        self.store.list_in(states).await
    }
}
