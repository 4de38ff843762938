#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::identifiers::AgentType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `last_duration` of an agent that has never completed a run.
pub const NEVER_RUN_DURATION_MS: i64 = i64::MAX;

/// `data_processed` of a run whose agent does not report item counts.
pub const UNKNOWN_ITEM_COUNT: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentExecutionState {
    NotStarted,
    Pending,
    Running,
    Finished,
    Failed,
    Deleted,
}

impl AgentExecutionState {
    pub const ALL: [Self; 6] = [
        Self::NotStarted,
        Self::Pending,
        Self::Running,
        Self::Finished,
        Self::Failed,
        Self::Deleted,
    ];

    /// States that `create_or_update_agent` must not overwrite.
    pub const PROTECTED_FROM_UPSERT: [Self; 4] =
        [Self::Deleted, Self::Pending, Self::Finished, Self::Running];

    /// States the control loop considers for due-agent dispatch.
    pub const DISPATCHABLE: [Self; 3] = [Self::Finished, Self::NotStarted, Self::Failed];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Deleted => "DELETED",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    #[must_use]
    pub fn accepts_upsert(&self) -> bool {
        !Self::PROTECTED_FROM_UPSERT.contains(self)
    }
}

impl fmt::Display for AgentExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for AgentExecutionState {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "NOT_STARTED" => Ok(Self::NotStarted),
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            "FAILED" => Ok(Self::Failed),
            "DELETED" => Ok(Self::Deleted),
            _ => Err(format!("Unknown agent state: {s}")),
        }
    }
}

/// One row of the shared agent state table. All times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub agent_type: AgentType,
    pub current_state: AgentExecutionState,
    pub last_execution_time: i64,
    pub last_transition_time: i64,
    pub last_duration: i64,
    pub data_processed: i64,
}

impl AgentState {
    /// Row inserted the first time an agent type is seen.
    #[must_use]
    pub const fn new(agent_type: AgentType, state: AgentExecutionState, now_ms: i64) -> Self {
        Self {
            agent_type,
            current_state: state,
            last_execution_time: 0,
            last_transition_time: now_ms,
            last_duration: NEVER_RUN_DURATION_MS,
            data_processed: UNKNOWN_ITEM_COUNT,
        }
    }

    #[must_use]
    pub const fn has_completed_run(&self) -> bool {
        self.last_duration != NEVER_RUN_DURATION_MS
    }

    #[must_use]
    pub const fn millis_since_execution(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.last_execution_time)
    }

    #[must_use]
    pub const fn millis_since_transition(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.last_transition_time)
    }
}
