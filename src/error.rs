use thiserror::Error;

/// Relay error types
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Token refresh failed ({status}): {body}")]
    RefreshFailed { status: u16, body: String },

    #[error("Missing required fields: {}", missing.join(", "))]
    ValidationError { missing: Vec<String> },

    #[error("Trigger request failed ({status}): {body}")]
    TriggerFailed { status: u16, body: String },

    #[error("Timed out after {attempts} poll attempts")]
    TimedOut { attempts: u32 },

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the user can reasonably retry the same action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TriggerFailed { .. } | Self::TimedOut { .. } | Self::Http(_)
        )
    }

    /// Whether the tenant must go through the authorization flow again.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(self, Self::NotAuthorized(_) | Self::RefreshFailed { .. })
    }

    /// Upstream HTTP status carried by this error, if any.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::RefreshFailed { status, .. } | Self::TriggerFailed { status, .. } => {
                Some(*status)
            }
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
