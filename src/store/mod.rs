//! Persistence port for agent state rows.
//!
//! Each method is one atomic, row-scoped operation carrying its own guard; the
//! [`StateMachine`](crate::state_machine::StateMachine) is the only caller.

mod memory;

pub use memory::InMemoryAgentStateStore;

use crate::ports::PortFuture;
use crate::types::{AgentExecutionState, AgentState, AgentType};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    Transitioned,
    NotFound,
    MarkedForDeletion,
    /// The row lock could not be taken within the wait budget.
    TimedOut,
}

pub trait AgentStateStore: Send + Sync {
    fn get<'a>(&'a self, agent_type: &'a AgentType) -> PortFuture<'a, Option<AgentState>>;

    /// Insert a fresh row, or move an existing row whose state accepts upserts.
    fn upsert_unless_protected<'a>(
        &'a self,
        agent_type: &'a AgentType,
        target: AgentExecutionState,
        now_ms: i64,
    ) -> PortFuture<'a, u64>;

    fn lock_and_transition<'a>(
        &'a self,
        agent_type: &'a AgentType,
        target: AgentExecutionState,
        wait: Duration,
        now_ms: i64,
    ) -> PortFuture<'a, LockAttempt>;

    fn transition_unless_deleted<'a>(
        &'a self,
        agent_type: &'a AgentType,
        target: AgentExecutionState,
        now_ms: i64,
    ) -> PortFuture<'a, u64>;

    fn complete_unless_deleted<'a>(
        &'a self,
        agent_type: &'a AgentType,
        duration_ms: i64,
        items: i64,
        now_ms: i64,
    ) -> PortFuture<'a, u64>;

    fn mark_deleted<'a>(&'a self, agent_type: &'a AgentType, now_ms: i64) -> PortFuture<'a, u64>;

    fn purge_deleted<'a>(&'a self, agent_type: &'a AgentType) -> PortFuture<'a, u64>;

    /// Rows in any of `states`, oldest `last_execution_time` first.
    fn list_in<'a>(
        &'a self,
        states: &'a [AgentExecutionState],
    ) -> PortFuture<'a, Vec<AgentState>>;
}
