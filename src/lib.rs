pub mod agent;
pub mod channel;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod runner;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod types;

pub use agent::{
    AgentInterval, AgentRegistry, CollectedData, DefaultIntervalProvider, IntervalProvider,
    Measurable, NodeStatusProvider, NodeSwitch, Runnable, StaticRegistry,
};
pub use channel::{Delivery, InProcessChannel, WorkChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_settings, SchedulerSettings};
pub use db::SchedulerDb;
pub use error::{Result, SchedulerError};
pub use metrics::{Metric, MetricsSink, NoopMetrics, TracingMetrics};
pub use runner::{AgentRunner, RunnerWorker};
pub use scheduler::{enabled_agent_pattern, AgentScheduler, ControlLoopConfig, TickReport};
pub use state_machine::{StateMachine, MAX_AGENT_DURATION};
pub use store::{AgentStateStore, InMemoryAgentStateStore, LockAttempt};
pub use types::*;
