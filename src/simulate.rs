//! In-memory end-to-end run: one control loop and a pool of runner workers
//! sharing a state table and work channel, driven by synthetic agents.

use agent_scheduler::ports::PortFuture;
use agent_scheduler::{
    AgentExecutionState, AgentRunner, AgentScheduler, AgentState, AgentType, CollectedData,
    DefaultIntervalProvider, InMemoryAgentStateStore,
    InProcessChannel, Measurable, Runnable, RunnerWorker, SchedulerError, SchedulerSettings,
    StateMachine, StaticRegistry, SystemClock, TracingMetrics,
};
use futures_util::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Fetches `index + 1` items; every seventh agent fails to load.
struct SyntheticAgent {
    agent_type: AgentType,
    index: usize,
}

impl SyntheticAgent {
    fn new(index: usize) -> Self {
        Self {
            agent_type: AgentType::new(format!("synthetic:{index:03}")),
            index,
        }
    }

    fn load_latency(&self) -> Duration {
        Duration::from_millis(50 + 25 * u64::try_from(self.index % 8).unwrap_or(0))
    }
}

impl Runnable for SyntheticAgent {
    fn agent_type(&self) -> &AgentType {
        &self.agent_type
    }

    fn run(&self) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.load_data().await?;
            Ok(())
        })
    }

    fn measurable(&self) -> Option<&dyn Measurable> {
        Some(self)
    }
}

impl Measurable for SyntheticAgent {
    fn load_data(&self) -> PortFuture<'_, CollectedData> {
        Box::pin(async move {
            tokio::time::sleep(self.load_latency()).await;
            if self.index % 7 == 6 {
                return Err(SchedulerError::AgentError(format!(
                    "{} upstream rejected the request",
                    self.agent_type
                )));
            }
            let items = (0..=self.index)
                .map(|seq| json!({ "agent": self.agent_type.value(), "seq": seq }))
                .collect();
            Ok(CollectedData::new(items))
        })
    }

    fn persist(&self, data: CollectedData) -> PortFuture<'_, i64> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(i64::try_from(data.len()).unwrap_or(i64::MAX))
        })
    }
}

pub async fn run(
    settings: &SchedulerSettings,
    agents: usize,
    seconds: u64,
) -> agent_scheduler::Result<Vec<AgentState>> {
    let store = InMemoryAgentStateStore::new();
    let channel = Arc::new(InProcessChannel::new());
    let state = StateMachine::new(Arc::new(store.clone()), Arc::new(SystemClock));
    let registry = Arc::new(StaticRegistry::new());
    let intervals = Arc::new(DefaultIntervalProvider::new(settings.default_interval()));

    let mut scheduler = AgentScheduler::new(
        state.clone(),
        channel.clone(),
        registry.clone(),
        intervals.clone(),
        settings.control_loop(),
    );
    if let Some(pattern) = settings.enabled_agents()? {
        scheduler = scheduler.with_enabled_agents(pattern);
    }
    let scheduler = Arc::new(scheduler);
    for index in 0..agents {
        let agent = Arc::new(SyntheticAgent::new(index));
        if scheduler.schedule(agent.as_ref()).await {
            registry.register(agent);
        }
    }

    let runner = Arc::new(
        AgentRunner::new(state.clone(), registry, intervals, Arc::new(TracingMetrics))
            .with_percent_max_over_normal_duration(settings.percent_max_over_normal_duration),
    );
    let shutdown = CancellationToken::new();

    let mut tasks = Vec::with_capacity(settings.runner_workers + 1);
    tasks.push(tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        async move {
            scheduler.run_until_cancelled(shutdown).await;
            0
        }
    }));
    for _ in 0..settings.runner_workers {
        let worker = RunnerWorker::new(channel.clone(), runner.clone())
            .with_max_redeliveries(settings.max_redeliveries)
            .with_poll_wait(settings.poll_wait());
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            worker.run_until_cancelled(shutdown).await
        }));
    }

    info!(agents, seconds, workers = settings.runner_workers, "simulation started");
    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted; stopping simulation"),
    }
    shutdown.cancel();

    let handled: usize = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| {
            joined.map_err(|e| SchedulerError::Internal(format!("Simulation task failed: {e}")))
        })
        .sum::<agent_scheduler::Result<usize>>()?;
    info!(handled, "simulation finished");

    state
        .list_agents_filtered_where_in(&AgentExecutionState::ALL)
        .await
}
