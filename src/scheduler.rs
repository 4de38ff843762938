//! Periodic reconciliation between the registered agents and their stored state.
//!
//! Any number of schedulers may tick against the same store. There is no
//! leader: each pass only issues conditional, per-row transitions, so racing
//! ticks at worst publish an agent twice, which runners tolerate.

use crate::agent::{AgentRegistry, IntervalProvider, NodeStatusProvider, NodeSwitch, Runnable};
use crate::channel::WorkChannel;
use crate::error::{Result, SchedulerError};
use crate::state_machine::StateMachine;
use crate::types::{AgentExecutionState, AgentState, AgentType};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlLoopConfig {
    pub tick_interval: Duration,
    /// How long a DELETED row is kept before it is purged.
    pub deleted_retention: Duration,
    /// How long an agent may sit in PENDING before its message is assumed lost.
    pub pending_staleness: Duration,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(15),
            deleted_retention: Duration::from_secs(3 * 60 * 60),
            pending_staleness: Duration::from_secs(20 * 60),
        }
    }
}

/// What one tick did. `failures` counts per-agent errors that were logged and skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub recovered_running: usize,
    pub dispatched: usize,
    pub purged: usize,
    pub recovered_pending: usize,
    pub failures: usize,
}

impl TickReport {
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.recovered_running == 0
            && self.dispatched == 0
            && self.purged == 0
            && self.recovered_pending == 0
            && self.failures == 0
    }
}

/// Compile an enabled-agent pattern. It must match the whole lowercased agent type.
///
/// # Errors
/// Returns `ConfigError` if the pattern is not a valid regular expression.
pub fn enabled_agent_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
        SchedulerError::ConfigError(format!("Invalid enabled_agent_pattern {pattern:?}: {e}"))
    })
}

pub struct AgentScheduler {
    state: StateMachine,
    channel: Arc<dyn WorkChannel>,
    registry: Arc<dyn AgentRegistry>,
    intervals: Arc<dyn IntervalProvider>,
    node_status: Arc<dyn NodeStatusProvider>,
    enabled_agents: Option<Regex>,
    config: ControlLoopConfig,
}

impl AgentScheduler {
    #[must_use]
    pub fn new(
        state: StateMachine,
        channel: Arc<dyn WorkChannel>,
        registry: Arc<dyn AgentRegistry>,
        intervals: Arc<dyn IntervalProvider>,
        config: ControlLoopConfig,
    ) -> Self {
        Self {
            state,
            channel,
            registry,
            intervals,
            node_status: Arc::new(NodeSwitch::default()),
            enabled_agents: None,
            config,
        }
    }

    #[must_use]
    pub fn with_node_status(mut self, node_status: Arc<dyn NodeStatusProvider>) -> Self {
        self.node_status = node_status;
        self
    }

    /// Only agent types matching `pattern` are accepted by `schedule`.
    #[must_use]
    pub fn with_enabled_agents(mut self, pattern: Regex) -> Self {
        self.enabled_agents = Some(pattern);
        self
    }

    fn is_enabled(&self, agent_type: &AgentType) -> bool {
        self.enabled_agents
            .as_ref()
            .map_or(true, |pattern| pattern.is_match(&agent_type.value().to_lowercase()))
    }

    /// Register an agent for scheduling. Safe to repeat. Returns `false` when
    /// the agent type is filtered out by the enabled-agent pattern.
    pub async fn schedule(&self, agent: &dyn Runnable) -> bool {
        let agent_type = agent.agent_type();
        if !self.is_enabled(agent_type) {
            debug!(
                agent_type = %agent_type,
                pattern = self.enabled_agents.as_ref().map(Regex::as_str),
                "agent is not enabled; not scheduling"
            );
            return false;
        }
        self.state
            .create_or_update_agent(agent_type, AgentExecutionState::NotStarted)
            .await;
        true
    }

    /// Mark an agent DELETED; returns `false` if it already was.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn unschedule(&self, agent: &dyn Runnable) -> Result<bool> {
        self.state
            .disable(agent.agent_type())
            .await
            .map(|affected| affected > 0)
    }

    /// One reconciliation tick: four independent passes over the state table.
    /// A disabled node skips the tick entirely.
    pub async fn run(&self) -> TickReport {
        let mut report = TickReport::default();
        if !self.node_status.is_node_enabled() {
            debug!("node disabled; skipping scheduler tick");
            return report;
        }

        self.recover_stuck_running(&mut report).await;
        self.dispatch_due_agents(&mut report).await;
        self.collect_deleted_agents(&mut report).await;
        self.recover_stuck_pending(&mut report).await;

        if report.is_idle() {
            debug!("scheduler tick found nothing to do");
        } else {
            info!(
                recovered_running = report.recovered_running,
                dispatched = report.dispatched,
                purged = report.purged,
                recovered_pending = report.recovered_pending,
                failures = report.failures,
                "scheduler tick complete"
            );
        }
        report
    }

    /// Tick every `tick_interval` until `shutdown` fires.
    pub async fn run_until_cancelled(&self, shutdown: CancellationToken) {
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis(),
            deleted_retention_secs = self.config.deleted_retention.as_secs(),
            pending_staleness_secs = self.config.pending_staleness.as_secs(),
            "agent scheduler started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("agent scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.run().await;
                }
            }
        }
    }

    async fn list(&self, states: &[AgentExecutionState], report: &mut TickReport) -> Vec<AgentState> {
        match self.state.list_agents_filtered_where_in(states).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, ?states, "failed to list agents; skipping pass");
                report.failures += 1;
                Vec::new()
            }
        }
    }

    async fn recover_stuck_running(&self, report: &mut TickReport) {
        let rows = self.list(&[AgentExecutionState::Running], report).await;
        let now_ms = self.state.now_ms();
        for row in rows {
            match self.recover_running_agent(&row, now_ms).await {
                Ok(true) => report.recovered_running += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(agent_type = %row.agent_type, error = %e, "failed to recover running agent");
                    report.failures += 1;
                }
            }
        }
    }

    async fn recover_running_agent(&self, row: &AgentState, now_ms: i64) -> Result<bool> {
        let Some(agent) = self.registry.resolve(&row.agent_type) else {
            debug!(agent_type = %row.agent_type, "running agent not registered here; skipping");
            return Ok(false);
        };
        let timeout_ms = self.intervals.interval(agent.as_ref()).timeout_ms();
        if row.millis_since_transition(now_ms) < timeout_ms {
            return Ok(false);
        }

        let affected = self
            .state
            .change_state_unless_marked_for_deletion(&row.agent_type, AgentExecutionState::Pending)
            .await?;
        if affected == 0 {
            return Ok(false);
        }

        // The original run may still be alive; both copies are allowed to finish.
        warn!(
            agent_type = %row.agent_type,
            running_for_ms = row.millis_since_transition(now_ms),
            timeout_ms,
            "agent exceeded its timeout; re-dispatching"
        );
        self.channel.publish(&row.agent_type).await?;
        Ok(true)
    }

    async fn dispatch_due_agents(&self, report: &mut TickReport) {
        let rows = self
            .list(&AgentExecutionState::DISPATCHABLE, report)
            .await;
        let now_ms = self.state.now_ms();
        for row in rows {
            match self.dispatch_agent(&row, now_ms).await {
                Ok(true) => report.dispatched += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(agent_type = %row.agent_type, error = %e, "failed to dispatch agent");
                    report.failures += 1;
                }
            }
        }
    }

    async fn dispatch_agent(&self, row: &AgentState, now_ms: i64) -> Result<bool> {
        let Some(agent) = self.registry.resolve(&row.agent_type) else {
            debug!(agent_type = %row.agent_type, "agent not registered here; skipping");
            return Ok(false);
        };
        let interval = self.intervals.interval(agent.as_ref());
        if row.millis_since_execution(now_ms) < interval.interval_ms() {
            return Ok(false);
        }
        if row.current_state == AgentExecutionState::Failed
            && row.millis_since_transition(now_ms) < interval.error_interval_ms()
        {
            debug!(agent_type = %row.agent_type, "failed agent still inside its error interval");
            return Ok(false);
        }

        self.state
            .create_or_update_agent(&row.agent_type, AgentExecutionState::Pending)
            .await;
        self.channel.publish(&row.agent_type).await?;
        debug!(agent_type = %row.agent_type, previous_state = %row.current_state, "agent dispatched");
        Ok(true)
    }

    async fn collect_deleted_agents(&self, report: &mut TickReport) {
        let rows = self.list(&[AgentExecutionState::Deleted], report).await;
        let now_ms = self.state.now_ms();
        let retention_ms = duration_ms(self.config.deleted_retention);
        for row in rows
            .iter()
            .filter(|row| row.millis_since_transition(now_ms) > retention_ms)
        {
            match self.state.delete(&row.agent_type).await {
                Ok(0) => {}
                Ok(_) => {
                    info!(agent_type = %row.agent_type, "purged deleted agent");
                    report.purged += 1;
                }
                Err(e) => {
                    warn!(agent_type = %row.agent_type, error = %e, "failed to purge deleted agent");
                    report.failures += 1;
                }
            }
        }
    }

    async fn recover_stuck_pending(&self, report: &mut TickReport) {
        let rows = self.list(&[AgentExecutionState::Pending], report).await;
        let now_ms = self.state.now_ms();
        let staleness_ms = duration_ms(self.config.pending_staleness);
        for row in rows
            .iter()
            .filter(|row| row.millis_since_transition(now_ms) > staleness_ms)
        {
            match self.republish_pending_agent(row).await {
                Ok(true) => report.recovered_pending += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(agent_type = %row.agent_type, error = %e, "failed to re-publish pending agent");
                    report.failures += 1;
                }
            }
        }
    }

    async fn republish_pending_agent(&self, row: &AgentState) -> Result<bool> {
        let affected = self
            .state
            .change_state_unless_marked_for_deletion(&row.agent_type, AgentExecutionState::Pending)
            .await?;
        if affected == 0 {
            return Ok(false);
        }
        warn!(agent_type = %row.agent_type, "pending agent was never picked up; re-publishing");
        self.channel.publish(&row.agent_type).await?;
        Ok(true)
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests;
