use sqlx::FromRow;

#[derive(FromRow)]
pub(crate) struct AgentStateRow {
    pub(crate) agent_type: String,
    pub(crate) current_state: String,
    pub(crate) last_execution_time: i64,
    pub(crate) last_transition_time: i64,
    pub(crate) last_duration: i64,
    pub(crate) data_processed: i64,
}

#[derive(FromRow)]
pub(crate) struct WorkQueueRow {
    pub(crate) agent_type: String,
    pub(crate) attempt: i32,
}
