#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use super::{enabled_agent_pattern, AgentScheduler, ControlLoopConfig, TickReport};
use crate::agent::{AgentInterval, DefaultIntervalProvider, NodeSwitch, Runnable, StaticRegistry};
use crate::channel::{Delivery, InProcessChannel, WorkChannel};
use crate::clock::ManualClock;
use crate::error::SchedulerError;
use crate::ports::PortFuture;
use crate::state_machine::StateMachine;
use crate::store::{AgentStateStore, InMemoryAgentStateStore, LockAttempt};
use crate::types::{AgentExecutionState, AgentState, AgentType};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BASE_MS: i64 = 1_700_000_000_000;
const MINUTE_MS: i64 = 60_000;

struct Noop(AgentType);

impl Runnable for Noop {
    fn agent_type(&self) -> &AgentType {
        &self.0
    }

    fn run(&self) -> PortFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Channel that refuses to publish one agent type.
struct FlakyChannel {
    inner: InProcessChannel,
    refuse: AgentType,
}

impl WorkChannel for FlakyChannel {
    fn publish<'a>(&'a self, agent_type: &'a AgentType) -> PortFuture<'a, ()> {
        Box::pin(async move {
            if *agent_type == self.refuse {
                return Err(SchedulerError::ChannelError("broker unavailable".to_string()));
            }
            self.inner.publish(agent_type).await
        })
    }

    fn next_delivery(&self, wait: Duration) -> PortFuture<'_, Option<Delivery>> {
        self.inner.next_delivery(wait)
    }

    fn redeliver(&self, delivery: Delivery) -> PortFuture<'_, ()> {
        self.inner.redeliver(delivery)
    }
}

/// Store whose listing of one state always fails.
struct BrokenListingStore {
    inner: InMemoryAgentStateStore,
    broken: AgentExecutionState,
}

impl AgentStateStore for BrokenListingStore {
    fn get<'a>(&'a self, agent_type: &'a AgentType) -> PortFuture<'a, Option<AgentState>> {
        self.inner.get(agent_type)
    }

    fn upsert_unless_protected<'a>(
        &'a self,
        agent_type: &'a AgentType,
        target: AgentExecutionState,
        now_ms: i64,
    ) -> PortFuture<'a, u64> {
        self.inner.upsert_unless_protected(agent_type, target, now_ms)
    }

    fn lock_and_transition<'a>(
        &'a self,
        agent_type: &'a AgentType,
        target: AgentExecutionState,
        wait: Duration,
        now_ms: i64,
    ) -> PortFuture<'a, LockAttempt> {
        self.inner.lock_and_transition(agent_type, target, wait, now_ms)
    }

    fn transition_unless_deleted<'a>(
        &'a self,
        agent_type: &'a AgentType,
        target: AgentExecutionState,
        now_ms: i64,
    ) -> PortFuture<'a, u64> {
        self.inner.transition_unless_deleted(agent_type, target, now_ms)
    }

    fn complete_unless_deleted<'a>(
        &'a self,
        agent_type: &'a AgentType,
        duration_ms: i64,
        items: i64,
        now_ms: i64,
    ) -> PortFuture<'a, u64> {
        self.inner
            .complete_unless_deleted(agent_type, duration_ms, items, now_ms)
    }

    fn mark_deleted<'a>(&'a self, agent_type: &'a AgentType, now_ms: i64) -> PortFuture<'a, u64> {
        self.inner.mark_deleted(agent_type, now_ms)
    }

    fn purge_deleted<'a>(&'a self, agent_type: &'a AgentType) -> PortFuture<'a, u64> {
        self.inner.purge_deleted(agent_type)
    }

    fn list_in<'a>(
        &'a self,
        states: &'a [AgentExecutionState],
    ) -> PortFuture<'a, Vec<AgentState>> {
        if states.contains(&self.broken) {
            return Box::pin(async {
                Err(SchedulerError::DatabaseError("connection reset".to_string()))
            });
        }
        self.inner.list_in(states)
    }
}

struct Harness {
    scheduler: AgentScheduler,
    store: InMemoryAgentStateStore,
    channel: InProcessChannel,
    registry: StaticRegistry,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        let store = InMemoryAgentStateStore::new();
        let channel = InProcessChannel::new();
        Self::build(Arc::new(store.clone()), store, channel.clone(), Arc::new(channel))
    }

    fn build(
        backing: Arc<dyn AgentStateStore>,
        store: InMemoryAgentStateStore,
        channel: InProcessChannel,
        publisher: Arc<dyn WorkChannel>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(BASE_MS));
        let registry = StaticRegistry::new();
        let intervals = DefaultIntervalProvider::new(AgentInterval::new(
            Duration::from_secs(60),
            Duration::from_secs(300),
        ))
        .with_override(
            AgentType::new("quick-retry"),
            AgentInterval::new(Duration::from_secs(60), Duration::from_secs(300))
                .with_error_interval(Duration::from_secs(10)),
        );
        let scheduler = AgentScheduler::new(
            StateMachine::new(backing, clock.clone()),
            publisher,
            Arc::new(registry.clone()),
            Arc::new(intervals),
            ControlLoopConfig::default(),
        );
        Self {
            scheduler,
            store,
            channel,
            registry,
            clock,
        }
    }

    async fn seed(&self, name: &str, state: AgentExecutionState, last_execution: i64, last_transition: i64) {
        self.registry.register(Arc::new(Noop(AgentType::new(name))));
        let mut row = AgentState::new(AgentType::new(name), state, last_transition);
        row.last_execution_time = last_execution;
        self.store.put_row(row).await;
    }

    async fn state_of(&self, name: &str) -> Option<AgentExecutionState> {
        self.store
            .get(&AgentType::new(name))
            .await
            .unwrap()
            .map(|row| row.current_state)
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
async fn dispatch_enqueues_most_overdue_agents_first() {
    let h = Harness::new();
    h.seed("recent", AgentExecutionState::Finished, BASE_MS - 2 * MINUTE_MS, BASE_MS).await;
    h.seed("stale", AgentExecutionState::Finished, BASE_MS - 10 * MINUTE_MS, BASE_MS).await;
    h.seed("new", AgentExecutionState::NotStarted, 0, BASE_MS).await;

    let report = h.scheduler.run().await;

    assert_eq!(report.dispatched, 3);
    assert_eq!(h.published().await, vec!["new", "stale", "recent"]);
    assert_eq!(h.state_of("new").await, Some(AgentExecutionState::Pending));
}

#[tokio::test]
async fn dispatch_skips_agents_inside_their_interval() {
    let h = Harness::new();
    h.seed("fresh", AgentExecutionState::Finished, BASE_MS - 30_000, BASE_MS).await;

    let report = h.scheduler.run().await;

    assert_eq!(report, TickReport::default());
    assert!(h.published().await.is_empty());
}

#[tokio::test]
async fn failed_agents_are_moved_to_pending_when_due() {
    let h = Harness::new();
    h.seed("broken", AgentExecutionState::Failed, 0, BASE_MS - MINUTE_MS).await;

    h.scheduler.run().await;

    assert_eq!(h.state_of("broken").await, Some(AgentExecutionState::Pending));
    assert_eq!(h.published().await, vec!["broken"]);
}

#[tokio::test]
async fn failed_agents_wait_out_their_error_interval() {
    let h = Harness::new();
    h.seed("broken", AgentExecutionState::Failed, 0, BASE_MS - 1_000).await;
    h.seed("quick-retry", AgentExecutionState::Failed, 0, BASE_MS - 1_000).await;

    assert_eq!(h.scheduler.run().await.dispatched, 0);

    h.clock.advance(Duration::from_secs(9));
    assert_eq!(h.scheduler.run().await.dispatched, 1);
    assert_eq!(h.published().await, vec!["quick-retry"]);
    assert_eq!(h.state_of("broken").await, Some(AgentExecutionState::Failed));

    h.clock.advance(Duration::from_secs(50));
    assert_eq!(h.scheduler.run().await.dispatched, 1);
    assert_eq!(h.published().await, vec!["broken"]);
}

#[tokio::test]
async fn disabled_node_skips_the_whole_tick() {
    let switch = NodeSwitch::new(false);
    let mut h = Harness::new();
    h.scheduler = h.scheduler.with_node_status(Arc::new(switch.clone()));
    h.seed("new", AgentExecutionState::NotStarted, 0, BASE_MS).await;
    h.seed("gone", AgentExecutionState::Deleted, 0, BASE_MS - 4 * 60 * MINUTE_MS).await;

    assert_eq!(h.scheduler.run().await, TickReport::default());
    assert!(h.published().await.is_empty());
    assert_eq!(h.state_of("gone").await, Some(AgentExecutionState::Deleted));

    switch.set_enabled(true);
    let report = h.scheduler.run().await;
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.purged, 1);
}

#[tokio::test]
async fn schedule_ignores_agents_outside_the_enabled_pattern() {
    let mut h = Harness::new();
    h.scheduler = h
        .scheduler
        .with_enabled_agents(enabled_agent_pattern("aws:.*").unwrap());

    assert!(h.scheduler.schedule(&Noop(AgentType::new("AWS:prod:us-east-1"))).await);
    assert!(!h.scheduler.schedule(&Noop(AgentType::new("gcp:prod"))).await);
    assert!(!h.scheduler.schedule(&Noop(AgentType::new("legacy-aws:prod"))).await);

    assert_eq!(h.store.len().await, 1);
    assert_eq!(
        h.state_of("AWS:prod:us-east-1").await,
        Some(AgentExecutionState::NotStarted)
    );
}

#[test]
fn invalid_enabled_pattern_is_a_config_error() {
    let err = enabled_agent_pattern("aws:(").unwrap_err();
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn unregistered_agents_are_skipped() {
    let h = Harness::new();
    let mut row = AgentState::new(AgentType::new("orphan"), AgentExecutionState::NotStarted, BASE_MS);
    row.last_execution_time = 0;
    h.store.put_row(row).await;

    let report = h.scheduler.run().await;

    assert_eq!(report.dispatched, 0);
    assert_eq!(h.state_of("orphan").await, Some(AgentExecutionState::NotStarted));
}

#[tokio::test]
async fn stuck_running_agent_is_recovered_with_one_message() {
    let h = Harness::new();
    h.seed("stuck", AgentExecutionState::Running, BASE_MS - 10 * MINUTE_MS, BASE_MS - 5 * MINUTE_MS).await;
    h.seed("busy", AgentExecutionState::Running, BASE_MS - 10 * MINUTE_MS, BASE_MS - MINUTE_MS).await;

    let report = h.scheduler.run().await;

    assert_eq!(report.recovered_running, 1);
    assert_eq!(h.published().await, vec!["stuck"]);
    assert_eq!(h.state_of("stuck").await, Some(AgentExecutionState::Pending));
    assert_eq!(h.state_of("busy").await, Some(AgentExecutionState::Running));
}

#[tokio::test]
async fn deleted_agents_are_purged_only_after_retention() {
    let h = Harness::new();
    let hour_ms = 60 * MINUTE_MS;
    h.seed("old", AgentExecutionState::Deleted, 0, BASE_MS - 4 * hour_ms).await;
    h.seed("young", AgentExecutionState::Deleted, 0, BASE_MS - hour_ms).await;

    let report = h.scheduler.run().await;

    assert_eq!(report.purged, 1);
    assert_eq!(h.state_of("old").await, None);
    assert_eq!(h.state_of("young").await, Some(AgentExecutionState::Deleted));
    assert!(h.published().await.is_empty());
}

#[tokio::test]
async fn stale_pending_agents_are_refreshed_and_republished() {
    let h = Harness::new();
    h.seed("lost", AgentExecutionState::Pending, 0, BASE_MS - 21 * MINUTE_MS).await;
    h.seed("queued", AgentExecutionState::Pending, 0, BASE_MS - MINUTE_MS).await;

    let report = h.scheduler.run().await;

    assert_eq!(report.recovered_pending, 1);
    assert_eq!(h.published().await, vec!["lost"]);
    let refreshed = h.store.get(&AgentType::new("lost")).await.unwrap().unwrap();
    assert_eq!(refreshed.last_transition_time, BASE_MS);
}

#[tokio::test]
async fn publish_failure_does_not_abort_the_pass() {
    let store = InMemoryAgentStateStore::new();
    let channel = InProcessChannel::new();
    let flaky = FlakyChannel {
        inner: channel.clone(),
        refuse: AgentType::new("bad"),
    };
    let h = Harness::build(Arc::new(store.clone()), store, channel, Arc::new(flaky));
    h.seed("bad", AgentExecutionState::NotStarted, 0, BASE_MS).await;
    h.seed("good", AgentExecutionState::NotStarted, 1, BASE_MS).await;

    let report = h.scheduler.run().await;

    assert_eq!(report.failures, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.published().await, vec!["good"]);
}

#[tokio::test]
async fn listing_failure_skips_only_that_pass() {
    let store = InMemoryAgentStateStore::new();
    let channel = InProcessChannel::new();
    let broken = BrokenListingStore {
        inner: store.clone(),
        broken: AgentExecutionState::Running,
    };
    let h = Harness::build(Arc::new(broken), store, channel.clone(), Arc::new(channel));
    h.seed("due", AgentExecutionState::NotStarted, 0, BASE_MS).await;

    let report = h.scheduler.run().await;

    assert_eq!(report.failures, 1);
    assert_eq!(report.dispatched, 1);
}

#[tokio::test]
async fn schedule_is_idempotent_and_unschedule_detects_repeats() {
    let h = Harness::new();
    let agent = Noop(AgentType::new("a"));

    h.scheduler.schedule(&agent).await;
    h.scheduler.schedule(&agent).await;
    assert_eq!(h.store.len().await, 1);
    assert_eq!(h.state_of("a").await, Some(AgentExecutionState::NotStarted));

    assert!(h.scheduler.unschedule(&agent).await.unwrap());
    assert!(!h.scheduler.unschedule(&agent).await.unwrap());

    h.scheduler.schedule(&agent).await;
    assert_eq!(h.state_of("a").await, Some(AgentExecutionState::Deleted));
}

#[tokio::test]
async fn loop_stops_when_cancelled() {
    let h = Harness::new();
    let token = CancellationToken::new();
    token.cancel();

    let stopped = tokio::time::timeout(
        Duration::from_secs(1),
        h.scheduler.run_until_cancelled(token),
    )
    .await;
    assert!(stopped.is_ok());
}

#[tokio::test]
async fn finished_agent_becomes_due_once_its_interval_elapses() {
    let h = Harness::new();
    h.seed("cycle", AgentExecutionState::Finished, BASE_MS, BASE_MS).await;

    assert_eq!(h.scheduler.run().await.dispatched, 0);

    h.clock.advance(Duration::from_secs(60));
    let report = h.scheduler.run().await;

    assert_eq!(report.dispatched, 1);
    assert_eq!(h.published().await, vec!["cycle"]);
    // FINISHED is protected from the dispatch upsert; only the message goes out.
    assert_eq!(h.state_of("cycle").await, Some(AgentExecutionState::Finished));
}
