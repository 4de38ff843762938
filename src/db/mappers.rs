use super::types::{AgentStateRow, WorkQueueRow};
use crate::channel::Delivery;
use crate::error::{Result, SchedulerError};
use crate::types::{AgentExecutionState, AgentState, AgentType};

pub fn parse_agent_state(row: AgentStateRow) -> Result<AgentState> {
    let current_state = AgentExecutionState::try_from(row.current_state.as_str())
        .map_err(SchedulerError::DatabaseError)?;

    Ok(AgentState {
        agent_type: AgentType::new(row.agent_type),
        current_state,
        last_execution_time: row.last_execution_time,
        last_transition_time: row.last_transition_time,
        last_duration: row.last_duration,
        data_processed: row.data_processed,
    })
}

pub fn parse_delivery(row: WorkQueueRow) -> Delivery {
    Delivery {
        agent_type: AgentType::new(row.agent_type),
        attempt: to_u32_i32(row.attempt).max(1),
    }
}

pub fn state_names(states: &[AgentExecutionState]) -> Vec<String> {
    states
        .iter()
        .map(|state| state.as_str().to_string())
        .collect()
}

pub fn to_u32_i32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

pub fn to_i32_u32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
