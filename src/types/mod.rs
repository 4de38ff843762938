mod agent_types;
mod identifiers;
mod outcome;

pub use agent_types::{AgentExecutionState, AgentState, NEVER_RUN_DURATION_MS, UNKNOWN_ITEM_COUNT};
pub use identifiers::AgentType;
pub use outcome::{FailureReason, RunOutcome};
