#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Work-channel consumer side: run one dispatched agent and record the result.
//!
//! A run always ends in FINISHED or FAILED from the runner's point of view.
//! The agent executes on its own task. When it outlives the interval
//! provider's timeout the runner records FAILED and stops waiting, but the
//! task is left alone: whatever it reports when it ends is written last. A
//! runner that dies mid-run is recovered by the control loop instead.

use crate::agent::{AgentRegistry, IntervalProvider, Runnable};
use crate::channel::{Delivery, WorkChannel};
use crate::error::Result;
use crate::metrics::{Metric, MetricsSink};
use crate::state_machine::{StateMachine, MAX_AGENT_DURATION};
use crate::types::{
    AgentExecutionState, AgentType, FailureReason, RunOutcome, NEVER_RUN_DURATION_MS,
    UNKNOWN_ITEM_COUNT,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_PERCENT_MAX_OVER_NORMAL_DURATION: f64 = 1.5;
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(1);

/// How long to wait for the row lock: `last_duration * multiplier`, capped at
/// `MAX_AGENT_DURATION`. Agents without a recorded duration get the cap.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn lock_budget(last_duration_ms: i64, percent_max_over_normal_duration: f64) -> Duration {
    if last_duration_ms == NEVER_RUN_DURATION_MS || last_duration_ms < 0 {
        return MAX_AGENT_DURATION;
    }
    let secs = last_duration_ms as f64 / 1000.0 * percent_max_over_normal_duration;
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs.min(MAX_AGENT_DURATION.as_secs_f64()))
}

pub struct AgentRunner {
    state: StateMachine,
    registry: Arc<dyn AgentRegistry>,
    intervals: Arc<dyn IntervalProvider>,
    metrics: Arc<dyn MetricsSink>,
    percent_max_over_normal_duration: f64,
}

impl AgentRunner {
    #[must_use]
    pub fn new(
        state: StateMachine,
        registry: Arc<dyn AgentRegistry>,
        intervals: Arc<dyn IntervalProvider>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            state,
            registry,
            intervals,
            metrics,
            percent_max_over_normal_duration: DEFAULT_PERCENT_MAX_OVER_NORMAL_DURATION,
        }
    }

    #[must_use]
    pub fn with_percent_max_over_normal_duration(mut self, multiplier: f64) -> Self {
        self.percent_max_over_normal_duration = multiplier;
        self
    }

    /// Handle one dispatched agent type.
    ///
    /// Agent failures come back as `RunOutcome::Failed`; the row has already
    /// been moved to FAILED by then. A timed-out agent keeps running in the
    /// background and records its own result when it ends.
    ///
    /// # Errors
    /// Returns an error only if the agent's state row cannot be read.
    pub async fn run_agent(&self, agent_type: &AgentType) -> Result<RunOutcome> {
        let Some(agent) = self.registry.resolve(agent_type) else {
            warn!(agent_type = %agent_type, "received unregistered agent type; dropping message");
            return Ok(RunOutcome::Unregistered);
        };

        let last_duration_ms = match self.state.get(agent_type).await? {
            Some(row) if row.current_state.is_terminal() => {
                debug!(agent_type = %agent_type, "agent marked for deletion; not running");
                return Ok(RunOutcome::Skipped);
            }
            Some(row) => row.last_duration,
            None => NEVER_RUN_DURATION_MS,
        };
        let interval = self.intervals.interval(agent.as_ref());

        let budget = lock_budget(last_duration_ms, self.percent_max_over_normal_duration);
        if !self
            .state
            .acquire_lock(agent_type, budget, AgentExecutionState::Running)
            .await
        {
            warn!(agent_type = %agent_type, "RUNNING transition not confirmed; executing anyway");
        }

        let recorder = RunRecorder {
            agent_type: agent_type.clone(),
            state: self.state.clone(),
            metrics: self.metrics.clone(),
        };
        let execution = tokio::spawn(recorder.clone().run_to_completion(agent));

        Ok(match tokio::time::timeout(interval.timeout, execution).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => {
                recorder
                    .fail(FailureReason::error(format!("agent task aborted: {join_error}")))
                    .await
            }
            Err(_) => {
                warn!(
                    agent_type = %agent_type,
                    timeout_ms = interval.timeout_ms(),
                    "agent exceeded its timeout; it keeps running and reports when done"
                );
                recorder
                    .fail(FailureReason::timed_out(interval.timeout))
                    .await
            }
        })
    }
}

/// Everything a detached execution needs to write its own result.
#[derive(Clone)]
struct RunRecorder {
    agent_type: AgentType,
    state: StateMachine,
    metrics: Arc<dyn MetricsSink>,
}

impl RunRecorder {
    async fn run_to_completion(self, agent: Arc<dyn Runnable>) -> RunOutcome {
        let started_ms = self.state.now_ms();
        match self.execute(agent.as_ref()).await {
            Ok(items) => self.finish(self.elapsed_ms(started_ms), items).await,
            Err(e) => self.fail(FailureReason::error(e.to_string())).await,
        }
    }

    /// Run the agent and return how many items it cached, or `UNKNOWN_ITEM_COUNT`.
    async fn execute(&self, agent: &dyn Runnable) -> Result<i64> {
        let Some(measurable) = agent.measurable() else {
            agent.run().await?;
            return Ok(UNKNOWN_ITEM_COUNT);
        };
        let agent_type = &self.agent_type;

        let load_started = self.state.now_ms();
        let data = measurable.load_data().await?;
        self.metrics
            .record_timer(Metric::LoadDuration, agent_type, self.elapsed(load_started));

        let persist_started = self.state.now_ms();
        let items = measurable.persist(data).await?;
        self.metrics.record_timer(
            Metric::PersistDuration,
            agent_type,
            self.elapsed(persist_started),
        );
        self.metrics
            .record_gauge(Metric::ItemsProcessed, agent_type, items);
        Ok(items)
    }

    async fn finish(&self, duration_ms: i64, items: i64) -> RunOutcome {
        let agent_type = &self.agent_type;
        if let Err(e) = self
            .state
            .mark_agent_completed(agent_type, duration_ms, items)
            .await
        {
            warn!(agent_type = %agent_type, error = %e, "failed to record agent completion");
        }
        self.metrics.record_timer(
            Metric::ExecutionDuration,
            agent_type,
            Duration::from_millis(u64::try_from(duration_ms).unwrap_or(0)),
        );
        self.metrics.increment(
            Metric::AgentsProcessed,
            agent_type,
            AgentExecutionState::Finished,
        );
        info!(agent_type = %agent_type, duration_ms, items, "agent finished");
        RunOutcome::Finished { duration_ms, items }
    }

    async fn fail(&self, reason: FailureReason) -> RunOutcome {
        let agent_type = &self.agent_type;
        if let Err(e) = self
            .state
            .change_state_unless_marked_for_deletion(agent_type, AgentExecutionState::Failed)
            .await
        {
            warn!(agent_type = %agent_type, error = %e, "failed to record agent failure");
        }
        self.metrics.increment(
            Metric::AgentsProcessed,
            agent_type,
            AgentExecutionState::Failed,
        );
        error!(agent_type = %agent_type, reason = %reason, "agent run failed");
        RunOutcome::Failed { reason }
    }

    fn elapsed_ms(&self, started_ms: i64) -> i64 {
        self.state.now_ms().saturating_sub(started_ms).max(0)
    }

    fn elapsed(&self, started_ms: i64) -> Duration {
        Duration::from_millis(u64::try_from(self.elapsed_ms(started_ms)).unwrap_or(0))
    }
}

/// Pulls deliveries off a work channel and hands them to an `AgentRunner`.
///
/// A failed run is put back on the channel while its attempt number is within
/// `max_redeliveries`; after that the message is dropped and the FAILED row is
/// picked up again by the control loop on its next due tick.
pub struct RunnerWorker {
    id: Uuid,
    channel: Arc<dyn WorkChannel>,
    runner: Arc<AgentRunner>,
    max_redeliveries: u32,
    poll_wait: Duration,
}

impl RunnerWorker {
    #[must_use]
    pub fn new(channel: Arc<dyn WorkChannel>, runner: Arc<AgentRunner>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel,
            runner,
            max_redeliveries: 0,
            poll_wait: DEFAULT_POLL_WAIT,
        }
    }

    #[must_use]
    pub const fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }

    #[must_use]
    pub const fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Run one delivery and apply the redelivery policy.
    ///
    /// # Errors
    /// Propagates the runner's infrastructure error after the redelivery decision.
    pub async fn handle(&self, delivery: Delivery) -> Result<RunOutcome> {
        let result = self.runner.run_agent(&delivery.agent_type).await;
        let should_retry = match &result {
            Ok(outcome) => outcome.is_failed(),
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    agent_type = %delivery.agent_type,
                    error = %e,
                    "runner could not process delivery"
                );
                true
            }
        };

        if should_retry && delivery.attempt <= self.max_redeliveries {
            info!(
                worker_id = %self.id,
                agent_type = %delivery.agent_type,
                attempt = delivery.attempt,
                "redelivering failed run"
            );
            let agent_type = delivery.agent_type.clone();
            if let Err(e) = self.channel.redeliver(delivery.next_attempt()).await {
                warn!(worker_id = %self.id, agent_type = %agent_type, error = %e, "failed to redeliver");
            }
        }
        result
    }

    /// Consume deliveries until `shutdown` fires. A run in progress is allowed
    /// to finish. Returns how many deliveries were handled.
    pub async fn run_until_cancelled(&self, shutdown: CancellationToken) -> usize {
        info!(worker_id = %self.id, "runner worker started");
        let mut handled = 0_usize;

        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => break,
                next = self.channel.next_delivery(self.poll_wait) => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.handle(delivery).await {
                        debug!(worker_id = %self.id, error = %e, "delivery ended with an error");
                    }
                    handled += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "failed to poll work channel");
                    tokio::time::sleep(self.poll_wait).await;
                }
            }
        }

        info!(worker_id = %self.id, handled, "runner worker stopped");
        handled
    }
}
