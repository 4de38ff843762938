//! Capabilities an agent exposes to the scheduler, and the external lookups
//! (registry, interval provider) the scheduler consumes.

use crate::ports::PortFuture;
use crate::types::AgentType;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

/// A recurring unit of collection work.
pub trait Runnable: Send + Sync {
    fn agent_type(&self) -> &AgentType;

    /// Run one collection cycle end to end.
    fn run(&self) -> PortFuture<'_, ()>;

    /// Agents that report how much they cached opt in here.
    fn measurable(&self) -> Option<&dyn Measurable> {
        None
    }
}

/// Split execution for agents that account for their results: the runner times
/// `load_data` and `persist` separately and records the persisted item count.
pub trait Measurable: Send + Sync {
    fn load_data(&self) -> PortFuture<'_, CollectedData>;

    /// Store a loaded batch and return how many items were cached.
    fn persist(&self, data: CollectedData) -> PortFuture<'_, i64>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedData {
    pub items: Vec<Value>,
}

impl CollectedData {
    #[must_use]
    pub const fn new(items: Vec<Value>) -> Self {
        Self { items }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Maps an agent type to a runnable instance. Absence means "skip", not failure.
pub trait AgentRegistry: Send + Sync {
    fn resolve(&self, agent_type: &AgentType) -> Option<Arc<dyn Runnable>>;
}

#[derive(Default, Clone)]
pub struct StaticRegistry {
    agents: Arc<RwLock<HashMap<AgentType, Arc<dyn Runnable>>>>,
}

impl StaticRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: Arc<dyn Runnable>) {
        match self.agents.write() {
            Ok(mut agents) => {
                agents.insert(agent.agent_type().clone(), agent);
            }
            Err(_) => warn!(agent_type = %agent.agent_type(), "registry lock poisoned; agent not registered"),
        }
    }

    pub fn deregister(&self, agent_type: &AgentType) -> Option<Arc<dyn Runnable>> {
        self.agents
            .write()
            .ok()
            .and_then(|mut agents| agents.remove(agent_type))
    }

    #[must_use]
    pub fn agent_types(&self) -> Vec<AgentType> {
        let mut types = self
            .agents
            .read()
            .map(|agents| agents.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        types.sort();
        types
    }
}

impl AgentRegistry for StaticRegistry {
    fn resolve(&self, agent_type: &AgentType) -> Option<Arc<dyn Runnable>> {
        self.agents
            .read()
            .ok()
            .and_then(|agents| agents.get(agent_type).cloned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentInterval {
    /// Minimum spacing between completed runs.
    pub interval: Duration,
    /// Minimum spacing between a failure and the next attempt.
    pub error_interval: Duration,
    /// How long a run may stay RUNNING before it is considered stuck.
    pub timeout: Duration,
}

impl AgentInterval {
    /// Retries after a failure wait the same `interval` unless overridden.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            error_interval: interval,
            timeout,
        }
    }

    #[must_use]
    pub const fn with_error_interval(mut self, error_interval: Duration) -> Self {
        self.error_interval = error_interval;
        self
    }

    #[must_use]
    pub fn interval_ms(&self) -> i64 {
        duration_ms(self.interval)
    }

    #[must_use]
    pub fn error_interval_ms(&self) -> i64 {
        duration_ms(self.error_interval)
    }

    #[must_use]
    pub fn timeout_ms(&self) -> i64 {
        duration_ms(self.timeout)
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub trait IntervalProvider: Send + Sync {
    fn interval(&self, agent: &dyn Runnable) -> AgentInterval;
}

/// One interval for every agent, with optional per-type overrides.
#[derive(Debug, Clone)]
pub struct DefaultIntervalProvider {
    default: AgentInterval,
    overrides: HashMap<AgentType, AgentInterval>,
}

impl DefaultIntervalProvider {
    #[must_use]
    pub fn new(default: AgentInterval) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_override(mut self, agent_type: AgentType, interval: AgentInterval) -> Self {
        self.overrides.insert(agent_type, interval);
        self
    }
}

impl IntervalProvider for DefaultIntervalProvider {
    fn interval(&self, agent: &dyn Runnable) -> AgentInterval {
        self.overrides
            .get(agent.agent_type())
            .copied()
            .unwrap_or(self.default)
    }
}

/// Whether this node should take part in scheduling right now.
pub trait NodeStatusProvider: Send + Sync {
    fn is_node_enabled(&self) -> bool;
}

/// Shared on/off switch; enabled unless turned off.
#[derive(Debug, Clone)]
pub struct NodeSwitch {
    enabled: Arc<AtomicBool>,
}

impl Default for NodeSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NodeSwitch {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl NodeStatusProvider for NodeSwitch {
    fn is_node_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}
