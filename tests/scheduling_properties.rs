//! End-to-end scheduling behaviour on the in-memory store: control loop,
//! work channel and runner wired together, driven by a manual clock.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use agent_scheduler::ports::PortFuture;
use agent_scheduler::{
    AgentExecutionState, AgentInterval, AgentRunner, AgentScheduler, AgentState, AgentStateStore,
    AgentType, CollectedData, ControlLoopConfig, DefaultIntervalProvider, InMemoryAgentStateStore,
    InProcessChannel, ManualClock, Measurable, NoopMetrics, RunOutcome, Runnable, StateMachine,
    StaticRegistry,
};
use futures_util::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Large enough that a never-run agent (last execution at 0) is immediately due.
const T0: i64 = 1_700_000_000_000;
const AGENT: &str = "aws:prod:us-east-1";

/// Takes 30 seconds of manual-clock time and caches 42 items.
struct CachingAgent {
    agent_type: AgentType,
    clock: Arc<ManualClock>,
}

impl Runnable for CachingAgent {
    fn agent_type(&self) -> &AgentType {
        &self.agent_type
    }

    fn run(&self) -> PortFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn measurable(&self) -> Option<&dyn Measurable> {
        Some(self)
    }
}

impl Measurable for CachingAgent {
    fn load_data(&self) -> PortFuture<'_, CollectedData> {
        Box::pin(async move {
            self.clock.advance(Duration::from_secs(25));
            Ok(CollectedData::new(vec![json!({ "kind": "cluster" }); 42]))
        })
    }

    fn persist(&self, data: CollectedData) -> PortFuture<'_, i64> {
        Box::pin(async move {
            self.clock.advance(Duration::from_secs(5));
            Ok(i64::try_from(data.len()).unwrap())
        })
    }
}

struct World {
    clock: Arc<ManualClock>,
    store: InMemoryAgentStateStore,
    channel: InProcessChannel,
    registry: StaticRegistry,
    state: StateMachine,
    intervals: Arc<DefaultIntervalProvider>,
}

impl World {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(T0));
        let store = InMemoryAgentStateStore::new();
        let state = StateMachine::new(Arc::new(store.clone()), clock.clone());
        Self {
            clock,
            store,
            channel: InProcessChannel::new(),
            registry: StaticRegistry::new(),
            state,
            intervals: Arc::new(DefaultIntervalProvider::new(AgentInterval::new(
                Duration::from_secs(60),
                Duration::from_secs(300),
            ))),
        }
    }

    fn scheduler(&self) -> AgentScheduler {
        AgentScheduler::new(
            self.state.clone(),
            Arc::new(self.channel.clone()),
            Arc::new(self.registry.clone()),
            self.intervals.clone(),
            ControlLoopConfig::default(),
        )
    }

    fn runner(&self) -> AgentRunner {
        AgentRunner::new(
            self.state.clone(),
            Arc::new(self.registry.clone()),
            self.intervals.clone(),
            Arc::new(NoopMetrics),
        )
    }

    fn caching_agent(&self, name: &str) -> Arc<CachingAgent> {
        let agent = Arc::new(CachingAgent {
            agent_type: AgentType::new(name),
            clock: self.clock.clone(),
        });
        self.registry.register(agent.clone());
        agent
    }

    fn at_second(&self, second: i64) {
        self.clock.set_ms(T0 + second * 1_000);
    }

    async fn row(&self, name: &str) -> Option<AgentState> {
        self.store.get(&AgentType::new(name)).await.unwrap()
    }

    async fn published(&self) -> Vec<String> {
        self.channel
            .drain()
            .await
            .into_iter()
            .map(|delivery| delivery.agent_type.value().to_string())
            .collect()
    }
}

#[tokio::test]
async fn agent_cycles_through_dispatch_run_and_redispatch() {
    let world = World::new();
    let scheduler = world.scheduler();
    let runner = world.runner();
    let agent = world.caching_agent(AGENT);
    scheduler.schedule(agent.as_ref()).await;

    // t=0: due immediately.
    let tick = scheduler.run().await;
    assert_eq!(tick.dispatched, 1);
    assert_eq!(world.row(AGENT).await.unwrap().current_state, AgentExecutionState::Pending);
    assert_eq!(world.published().await, vec![AGENT]);

    // t=1: runner picks it up and finishes at t=31.
    world.at_second(1);
    let outcome = runner.run_agent(&AgentType::new(AGENT)).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished { duration_ms: 30_000, items: 42 });
    let row = world.row(AGENT).await.unwrap();
    assert_eq!(row.current_state, AgentExecutionState::Finished);
    assert_eq!(row.last_duration, 30_000);
    assert_eq!(row.data_processed, 42);
    assert_eq!(row.last_execution_time, T0 + 31_000);

    // t=61: only 30s since the last execution.
    world.at_second(61);
    assert_eq!(scheduler.run().await.dispatched, 0);
    assert!(world.published().await.is_empty());

    // t=92: 61s since the last execution.
    world.at_second(92);
    assert_eq!(scheduler.run().await.dispatched, 1);
    assert_eq!(world.published().await, vec![AGENT]);
}

#[tokio::test]
async fn crashed_runner_is_recovered_once_timeout_elapses() {
    let world = World::new();
    let scheduler = world.scheduler();
    let agent = world.caching_agent(AGENT);
    scheduler.schedule(agent.as_ref()).await;
    scheduler.run().await;
    world.published().await;

    // t=1: a runner takes the agent and dies without reporting back.
    world.at_second(1);
    assert!(
        world
            .state
            .acquire_lock(&AgentType::new(AGENT), Duration::from_secs(1), AgentExecutionState::Running)
            .await
    );

    world.at_second(300);
    assert_eq!(scheduler.run().await.recovered_running, 0);
    assert!(world.published().await.is_empty());

    world.at_second(301);
    let tick = scheduler.run().await;
    assert_eq!(tick.recovered_running, 1);
    assert_eq!(world.published().await, vec![AGENT]);
    assert_eq!(world.row(AGENT).await.unwrap().current_state, AgentExecutionState::Pending);

    // Recovery moved the transition time forward; the next tick leaves it alone.
    world.at_second(302);
    assert!(scheduler.run().await.is_idle());
}

#[tokio::test]
async fn deleted_agents_are_never_scheduled_or_run_and_are_eventually_purged() {
    let world = World::new();
    let scheduler = world.scheduler();
    let runner = world.runner();
    let agent = world.caching_agent(AGENT);
    scheduler.schedule(agent.as_ref()).await;
    assert!(scheduler.unschedule(agent.as_ref()).await.unwrap());

    scheduler.schedule(agent.as_ref()).await;
    world.at_second(120);
    let tick = scheduler.run().await;
    assert_eq!(tick.dispatched, 0);
    assert_eq!(
        runner.run_agent(&AgentType::new(AGENT)).await.unwrap(),
        RunOutcome::Skipped
    );
    assert!(!world
        .state
        .acquire_lock(&AgentType::new(AGENT), Duration::from_secs(1), AgentExecutionState::Running)
        .await);
    assert_eq!(
        world
            .state
            .change_state_unless_marked_for_deletion(&AgentType::new(AGENT), AgentExecutionState::Pending)
            .await
            .unwrap(),
        0
    );
    assert_eq!(world.row(AGENT).await.unwrap().current_state, AgentExecutionState::Deleted);

    // Just under three hours after deletion the row is still there.
    world.at_second(3 * 60 * 60);
    assert_eq!(scheduler.run().await.purged, 0);

    world.at_second(3 * 60 * 60 + 1);
    assert_eq!(scheduler.run().await.purged, 1);
    assert!(world.row(AGENT).await.is_none());
}

#[tokio::test]
async fn concurrent_registration_creates_one_row() {
    let world = World::new();
    let agent = world.caching_agent(AGENT);
    let schedulers = (0..8).map(|_| world.scheduler()).collect::<Vec<_>>();

    join_all(schedulers.iter().map(|scheduler| scheduler.schedule(agent.as_ref()))).await;

    assert_eq!(world.store.len().await, 1);
    assert_eq!(
        world.row(AGENT).await.unwrap().current_state,
        AgentExecutionState::NotStarted
    );
}

#[tokio::test]
async fn least_recently_executed_agent_is_dispatched_first() {
    let world = World::new();
    let scheduler = world.scheduler();
    for (name, last_execution_s) in [("b", -70), ("a", -600), ("c", -10)] {
        world.caching_agent(name);
        let mut row = AgentState::new(AgentType::new(name), AgentExecutionState::Finished, T0);
        row.last_execution_time = T0 + last_execution_s * 1_000;
        world.store.put_row(row).await;
    }

    let tick = scheduler.run().await;

    assert_eq!(tick.dispatched, 2);
    assert_eq!(world.published().await, vec!["a", "b"]);
}

#[tokio::test]
async fn racing_schedulers_may_duplicate_but_never_lose_a_dispatch() {
    let world = World::new();
    let first = world.scheduler();
    let second = world.scheduler();
    let agent = world.caching_agent(AGENT);
    first.schedule(agent.as_ref()).await;

    let (a, b) = tokio::join!(first.run(), second.run());

    let published = world.published().await;
    assert!((1..=2).contains(&published.len()));
    assert_eq!(a.dispatched + b.dispatched, published.len());
    assert_eq!(world.row(AGENT).await.unwrap().current_state, AgentExecutionState::Pending);
}

#[tokio::test]
async fn lost_message_for_pending_agent_is_republished() {
    let world = World::new();
    let scheduler = world.scheduler();
    let agent = world.caching_agent(AGENT);
    scheduler.schedule(agent.as_ref()).await;
    scheduler.run().await;
    // The broker drops the message.
    world.published().await;

    world.at_second(20 * 60);
    assert_eq!(scheduler.run().await.recovered_pending, 0);

    world.at_second(20 * 60 + 1);
    assert_eq!(scheduler.run().await.recovered_pending, 1);
    assert_eq!(world.published().await, vec![AGENT]);
}
