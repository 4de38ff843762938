use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    TimedOut { timeout_ms: u64 },
    Error { message: String },
}

impl FailureReason {
    #[must_use]
    pub fn timed_out(timeout: Duration) -> Self {
        Self::TimedOut {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut { timeout_ms } => {
                write!(f, "execution exceeded timeout of {timeout_ms} ms")
            }
            Self::Error { message } => write!(f, "{message}"),
        }
    }
}

/// Result of handling one work-channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Finished { duration_ms: i64, items: i64 },
    Failed { reason: FailureReason },
    /// The registry no longer knows this agent type; the message was dropped.
    Unregistered,
    /// The agent is marked for deletion; nothing was executed.
    Skipped,
}

impl RunOutcome {
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}
