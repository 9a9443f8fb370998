use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::action::ActionKind;

/// Events emitted by a [`WorkflowSession`](crate::WorkflowSession) on every
/// state transition.
///
/// UI layers subscribe to these instead of driving the state machine
/// themselves.
///
/// # Example
///
/// ```ignore
/// let mut events = session.subscribe();
/// while let Some(event) = events.next().await {
///     match event {
///         SessionEvent::PollAttempt { attempt, max_attempts, .. } => {
///             render_progress(attempt, max_attempts);
///         }
///         SessionEvent::Succeeded { value, .. } => render_link(&value),
///         _ => {}
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Trigger call is being made
    Submitted {
        target: String,
        action: ActionKind,
        #[serde(with = "system_time_serde")]
        timestamp: SystemTime,
    },

    /// A status read finished without finding the result
    PollAttempt {
        target: String,
        attempt: u32,
        max_attempts: u32,
        #[serde(with = "system_time_serde")]
        timestamp: SystemTime,
    },

    /// Completion field observed
    Succeeded {
        target: String,
        /// Value of the completion field (e.g. contract URL)
        value: String,
        #[serde(with = "duration_serde")]
        duration: Duration,
        #[serde(with = "system_time_serde")]
        timestamp: SystemTime,
    },

    /// Token or trigger failure
    Failed {
        target: String,
        error: String,
        recoverable: bool,
        #[serde(with = "system_time_serde")]
        timestamp: SystemTime,
    },

    /// Attempt budget exhausted; the workflow may still finish later
    TimedOut {
        target: String,
        attempts: u32,
        #[serde(with = "system_time_serde")]
        timestamp: SystemTime,
    },

    /// Session returned to idle
    Reset {
        target: String,
        #[serde(with = "system_time_serde")]
        timestamp: SystemTime,
    },
}

impl SessionEvent {
    pub fn submitted(target: impl Into<String>, action: ActionKind) -> Self {
        Self::Submitted {
            target: target.into(),
            action,
            timestamp: SystemTime::now(),
        }
    }

    pub fn poll_attempt(target: impl Into<String>, attempt: u32, max_attempts: u32) -> Self {
        Self::PollAttempt {
            target: target.into(),
            attempt,
            max_attempts,
            timestamp: SystemTime::now(),
        }
    }

    pub fn succeeded(target: impl Into<String>, value: impl Into<String>, duration: Duration) -> Self {
        Self::Succeeded {
            target: target.into(),
            value: value.into(),
            duration,
            timestamp: SystemTime::now(),
        }
    }

    pub fn failed(target: impl Into<String>, error: impl Into<String>, recoverable: bool) -> Self {
        Self::Failed {
            target: target.into(),
            error: error.into(),
            recoverable,
            timestamp: SystemTime::now(),
        }
    }

    pub fn timed_out(target: impl Into<String>, attempts: u32) -> Self {
        Self::TimedOut {
            target: target.into(),
            attempts,
            timestamp: SystemTime::now(),
        }
    }

    pub fn reset(target: impl Into<String>) -> Self {
        Self::Reset {
            target: target.into(),
            timestamp: SystemTime::now(),
        }
    }

    /// Get the target record id from this event
    pub fn target(&self) -> &str {
        match self {
            Self::Submitted { target, .. } => target,
            Self::PollAttempt { target, .. } => target,
            Self::Succeeded { target, .. } => target,
            Self::Failed { target, .. } => target,
            Self::TimedOut { target, .. } => target,
            Self::Reset { target, .. } => target,
        }
    }

    pub fn timestamp(&self) -> SystemTime {
        match self {
            Self::Submitted { timestamp, .. } => *timestamp,
            Self::PollAttempt { timestamp, .. } => *timestamp,
            Self::Succeeded { timestamp, .. } => *timestamp,
            Self::Failed { timestamp, .. } => *timestamp,
            Self::TimedOut { timestamp, .. } => *timestamp,
            Self::Reset { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string (for testing assertions)
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Submitted { .. } => "Submitted",
            Self::PollAttempt { .. } => "PollAttempt",
            Self::Succeeded { .. } => "Succeeded",
            Self::Failed { .. } => "Failed",
            Self::TimedOut { .. } => "TimedOut",
            Self::Reset { .. } => "Reset",
        }
    }

    /// Whether this event ends the session's automatic progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::TimedOut { .. }
        )
    }
}

// Serde helpers for SystemTime and Duration
mod system_time_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let duration = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_secs(secs))
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
