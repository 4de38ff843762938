use super::{AgentStateStore, LockAttempt};
use crate::ports::PortFuture;
use crate::types::{AgentExecutionState, AgentState, AgentType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Process-local state table with the same guard semantics as the Postgres store.
///
/// The table mutex stands in for the row lock: `lock_and_transition` waits on it
/// for at most the requested budget.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAgentStateStore {
    rows: Arc<Mutex<HashMap<AgentType, AgentState>>>,
}

impl InMemoryAgentStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a row as-is. Intended for restoring snapshots and seeding fixtures.
    pub async fn put_row(&self, row: AgentState) {
        self.rows.lock().await.insert(row.agent_type.clone(), row);
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

impl AgentStateStore for InMemoryAgentStateStore {
    fn get<'a>(&'a self, agent_type: &'a AgentType) -> PortFuture<'a, Option<AgentState>> {
        Box::pin(async move { Ok(self.rows.lock().await.get(agent_type).cloned()) })
    }

    fn upsert_unless_protected<'a>(
        &'a self,
        agent_type: &'a AgentType,
        target: AgentExecutionState,
        now_ms: i64,
    ) -> PortFuture<'a, u64> {
        Box::pin(async move {
            let mut rows = self.rows.lock().await;
            match rows.get_mut(agent_type) {
                None => {
                    rows.insert(
                        agent_type.clone(),
                        AgentState::new(agent_type.clone(), target, now_ms),
                    );
                    Ok(1)
                }
                Some(row) if row.current_state.accepts_upsert() => {
                    row.current_state = target;
                    row.last_transition_time = now_ms;
                    Ok(1)
                }
                Some(_) => Ok(0),
            }
        })
    }

    fn lock_and_transition<'a>(
        &'a self,
        agent_type: &'a AgentType,
        target: AgentExecutionState,
        wait: Duration,
        now_ms: i64,
    ) -> PortFuture<'a, LockAttempt> {
        Box::pin(async move {
            let Ok(mut rows) = tokio::time::timeout(wait, self.rows.lock()).await else {
                return Ok(LockAttempt::TimedOut);
            };
            Ok(match rows.get_mut(agent_type) {
                None => LockAttempt::NotFound,
                Some(row) if row.current_state.is_terminal() => LockAttempt::MarkedForDeletion,
                Some(row) => {
                    row.current_state = target;
                    row.last_transition_time = now_ms;
                    LockAttempt::Transitioned
                }
            })
        })
    }

    fn transition_unless_deleted<'a>(
        &'a self,
        agent_type: &'a AgentType,
        target: AgentExecutionState,
        now_ms: i64,
    ) -> PortFuture<'a, u64> {
        Box::pin(async move {
            let mut rows = self.rows.lock().await;
            Ok(match rows.get_mut(agent_type) {
                Some(row) if !row.current_state.is_terminal() => {
                    row.current_state = target;
                    row.last_transition_time = now_ms;
                    1
                }
                _ => 0,
            })
        })
    }

    fn complete_unless_deleted<'a>(
        &'a self,
        agent_type: &'a AgentType,
        duration_ms: i64,
        items: i64,
        now_ms: i64,
    ) -> PortFuture<'a, u64> {
        Box::pin(async move {
            let mut rows = self.rows.lock().await;
            Ok(match rows.get_mut(agent_type) {
                Some(row) if !row.current_state.is_terminal() => {
                    row.current_state = AgentExecutionState::Finished;
                    row.last_duration = duration_ms;
                    row.last_execution_time = now_ms;
                    row.last_transition_time = now_ms;
                    row.data_processed = items;
                    1
                }
                _ => 0,
            })
        })
    }

    fn mark_deleted<'a>(&'a self, agent_type: &'a AgentType, now_ms: i64) -> PortFuture<'a, u64> {
        self.transition_unless_deleted(agent_type, AgentExecutionState::Deleted, now_ms)
    }

    fn purge_deleted<'a>(&'a self, agent_type: &'a AgentType) -> PortFuture<'a, u64> {
        Box::pin(async move {
            let mut rows = self.rows.lock().await;
            let deleted = rows
                .get(agent_type)
                .is_some_and(|row| row.current_state.is_terminal());
            if deleted {
                rows.remove(agent_type);
            }
            Ok(u64::from(deleted))
        })
    }

    fn list_in<'a>(
        &'a self,
        states: &'a [AgentExecutionState],
    ) -> PortFuture<'a, Vec<AgentState>> {
        Box::pin(async move {
            let mut matching = self
                .rows
                .lock()
                .await
                .values()
                .filter(|row| states.contains(&row.current_state))
                .cloned()
                .collect::<Vec<_>>();
            matching.sort_by(|a, b| {
                a.last_execution_time
                    .cmp(&b.last_execution_time)
                    .then_with(|| a.agent_type.cmp(&b.agent_type))
            });
            Ok(matching)
        })
    }
}
