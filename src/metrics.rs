//! Observational sink for runner metrics. Nothing recorded here feeds back
//! into scheduling.

use crate::types::{AgentExecutionState, AgentType};
use std::fmt;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Wall time of the whole run.
    ExecutionDuration,
    /// Wall time of `Measurable::load_data`.
    LoadDuration,
    /// Wall time of `Measurable::persist`.
    PersistDuration,
    ItemsProcessed,
    /// Counter of finished/failed runs, tagged with the resulting state.
    AgentsProcessed,
}

impl Metric {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ExecutionDuration => "agent.execution.duration",
            Self::LoadDuration => "agent.load.duration",
            Self::PersistDuration => "agent.persist.duration",
            Self::ItemsProcessed => "agent.items.processed",
            Self::AgentsProcessed => "agent.processed",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub trait MetricsSink: Send + Sync {
    fn record_timer(&self, metric: Metric, agent_type: &AgentType, elapsed: Duration);

    fn record_gauge(&self, metric: Metric, agent_type: &AgentType, value: i64);

    fn increment(&self, metric: Metric, agent_type: &AgentType, state: AgentExecutionState);
}

/// Emits every measurement as a structured `tracing` event on the `metrics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_timer(&self, metric: Metric, agent_type: &AgentType, elapsed: Duration) {
        info!(
            target: "metrics",
            metric = metric.name(),
            agent_type = %agent_type,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "timer"
        );
    }

    fn record_gauge(&self, metric: Metric, agent_type: &AgentType, value: i64) {
        info!(target: "metrics", metric = metric.name(), agent_type = %agent_type, value, "gauge");
    }

    fn increment(&self, metric: Metric, agent_type: &AgentType, state: AgentExecutionState) {
        info!(
            target: "metrics",
            metric = metric.name(),
            agent_type = %agent_type,
            state = %state,
            "counter"
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_timer(&self, _metric: Metric, _agent_type: &AgentType, _elapsed: Duration) {}

    fn record_gauge(&self, _metric: Metric, _agent_type: &AgentType, _value: i64) {}

    fn increment(&self, _metric: Metric, _agent_type: &AgentType, _state: AgentExecutionState) {}
}
