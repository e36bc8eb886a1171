//! Controller error taxonomy
//!
//! Every failure the controller can observe maps onto one of these variants.
//! Only exhausted bootstrap budgets and ambiguous quorum loss reach the
//! operator; the rest are healed on a later cycle.

use std::time::Duration;

/// Errors raised by the controller and its external collaborators
#[derive(Debug, Clone, thiserror::Error)]
pub enum HiveError {
    /// A bounded wait ran out of attempts
    #[error("timed out waiting for {what} after {attempts} attempts")]
    RecoverableTimeout { what: String, attempts: u32 },

    /// An external dependency is briefly unreachable, retried next cycle
    #[error("temporarily unavailable: {0}")]
    TransientUnavailable(String),

    /// The manager set cannot form a majority
    #[error("quorum lost: {0}")]
    QuorumLost(String),

    /// A required configuration value or handoff file is absent
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Configuration file present but unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Observed replicas diverge from the plan
    #[error("capacity mismatch for {workload}: desired {desired}, observed {observed}")]
    CapacityMismatch {
        workload: String,
        desired: u32,
        observed: u32,
    },

    /// External command exited non-zero
    #[error("command `{command}` failed (exit {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// External call exceeded its per-call timeout
    #[error("`{0}` did not finish within {1:?}")]
    CallTimeout(String, Duration),

    /// Response could not be parsed
    #[error("invalid response from {source_name}: {detail}")]
    InvalidResponse { source_name: String, detail: String },

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(String),
}

impl HiveError {
    /// Whether this condition must be surfaced to a human
    pub fn is_operator_visible(&self) -> bool {
        matches!(self, HiveError::RecoverableTimeout { .. })
    }

    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HiveError::TransientUnavailable(_)
                | HiveError::CallTimeout(..)
                | HiveError::CommandFailed { .. }
                | HiveError::QuorumLost(_)
        )
    }

    /// Stable short name, used in the bootstrap journal
    pub fn kind(&self) -> &'static str {
        match self {
            HiveError::RecoverableTimeout { .. } => "recoverable-timeout",
            HiveError::TransientUnavailable(_) => "transient-unavailable",
            HiveError::QuorumLost(_) => "quorum-lost",
            HiveError::ConfigurationMissing(_) => "configuration-missing",
            HiveError::InvalidConfig(_) => "invalid-config",
            HiveError::CapacityMismatch { .. } => "capacity-mismatch",
            HiveError::CommandFailed { .. } => "command-failed",
            HiveError::CallTimeout(..) => "call-timeout",
            HiveError::InvalidResponse { .. } => "invalid-response",
            HiveError::Io(_) => "io",
        }
    }

    pub fn invalid_response(source_name: &str, detail: impl Into<String>) -> Self {
        HiveError::InvalidResponse {
            source_name: source_name.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<std::io::Error> for HiveError {
    fn from(err: std::io::Error) -> Self {
        HiveError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for HiveError {
    fn from(err: serde_json::Error) -> Self {
        HiveError::invalid_response("json", err.to_string())
    }
}

impl From<reqwest::Error> for HiveError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            HiveError::TransientUnavailable(err.to_string())
        } else {
            HiveError::invalid_response("http", err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_are_operator_visible() {
        let timeout = HiveError::RecoverableTimeout {
            what: "join token".to_string(),
            attempts: 60,
        };
        assert!(timeout.is_operator_visible());
        assert!(!HiveError::TransientUnavailable("docker".into()).is_operator_visible());
        assert!(!HiveError::ConfigurationMissing("lb".into()).is_operator_visible());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(HiveError::TransientUnavailable("x".into()).is_retryable());
        assert!(HiveError::CallTimeout("docker".into(), Duration::from_secs(1)).is_retryable());
        assert!(!HiveError::ConfigurationMissing("x".into()).is_retryable());
    }

    #[test]
    fn test_quorum_message() {
        let err = HiveError::QuorumLost("1 of 3 managers ready, 2 required".to_string());
        assert_eq!(
            err.to_string(),
            "quorum lost: 1 of 3 managers ready, 2 required"
        );
    }
}
