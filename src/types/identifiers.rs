use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a scheduled agent, e.g. `aws:prod:us-east-1:ClusterCachingAgent`.
///
/// Used both as the state-store primary key and as the work-channel payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentType(String);

impl AgentType {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
