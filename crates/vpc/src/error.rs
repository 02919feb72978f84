//! Error types.
//!
//! [`RemoteError`] is what a single remote API call reported. [`VpcError`] is
//! what an operation of this crate reports to its caller, after retries,
//! waits and teardown tolerance have been applied.

use thiserror::Error;

/// Remote error codes that signal rate limiting.
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
];

/// Errors reported by a single call to the remote API.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The API rejected the call because of rate limiting.
    #[error("throttled: {code} - {message}")]
    Throttled { code: String, message: String },

    /// The referenced resource does not exist (or is not visible yet).
    #[error("not found: {code} - {message}")]
    NotFound { code: String, message: String },

    /// Any other error response.
    #[error("API error: {code} - {message}")]
    Api { code: String, message: String },

    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RemoteError {
    /// Classify a remote error code.
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();

        if THROTTLING_CODES.contains(&code.as_str()) {
            Self::Throttled { code, message }
        } else if code.ends_with(".NotFound") {
            Self::NotFound { code, message }
        } else {
            Self::Api { code, message }
        }
    }

    /// Remote error code, when the API supplied one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Throttled { code, .. } | Self::NotFound { code, .. } | Self::Api { code, .. } => {
                Some(code)
            }
            Self::Http(_) | Self::Serialization(_) => None,
        }
    }

    #[must_use]
    pub fn is_throttling(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors that can occur while provisioning or reconciling environments.
#[derive(Error, Debug)]
pub enum VpcError {
    /// Malformed or missing configuration. Never retried.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No free block of the requested size is left in the parent block.
    #[error("No free /{prefix_len} block left in {parent} for {requester}")]
    AddressSpaceExhausted {
        requester: String,
        parent: String,
        prefix_len: u8,
    },

    /// Throttling persisted past the retry ceiling.
    #[error("{operation} still throttled after {elapsed_secs}s: {source}")]
    RemoteUnavailable {
        operation: String,
        elapsed_secs: u64,
        #[source]
        source: RemoteError,
    },

    /// A wait or keep-trying loop ran out of time.
    #[error("Timed out after {elapsed_secs}s waiting for {what}")]
    Timeout { what: String, elapsed_secs: u64 },

    /// A waited-on resource entered a state it will never leave.
    #[error("{what} entered terminal state '{state}'")]
    TerminalState { what: String, state: String },

    /// A remote call failed with a non-retryable error.
    #[error("{operation} failed: {source}")]
    Remote {
        operation: String,
        #[source]
        source: RemoteError,
    },

    /// No live environment matches the given name or id.
    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    /// More than one live environment carries the same name.
    #[error("Found {count} environments named {name}")]
    DuplicateEnvironment { name: String, count: usize },

    /// An external collaborator failed.
    #[error("Collaborator '{name}' failed: {source}")]
    Collaborator {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl VpcError {
    /// Whether this error is a remote "not found" for the resource acted upon.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Remote { source, .. } if source.is_not_found())
    }

    /// Remote error code carried by this error, if any.
    #[must_use]
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::Remote { source, .. } | Self::RemoteUnavailable { source, .. } => source.code(),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = VpcError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_classification() {
        assert!(RemoteError::from_code("RequestLimitExceeded", "slow down").is_throttling());
        assert!(RemoteError::from_code("Throttling", "").is_throttling());
        assert!(RemoteError::from_code("InvalidVpcID.NotFound", "gone").is_not_found());
        assert!(RemoteError::from_code("InvalidRoute.NotFound", "gone").is_not_found());

        let other = RemoteError::from_code("DependencyViolation", "in use");
        assert!(!other.is_throttling());
        assert!(!other.is_not_found());
        assert_eq!(other.code(), Some("DependencyViolation"));
    }

    #[test]
    fn test_not_found_only_for_remote_errors() {
        let err = VpcError::Remote {
            operation: "DeleteSubnet".into(),
            source: RemoteError::from_code("InvalidSubnetID.NotFound", "gone"),
        };
        assert!(err.is_not_found());
        assert_eq!(err.remote_code(), Some("InvalidSubnetID.NotFound"));

        assert!(!VpcError::EnvironmentNotFound("ci".into()).is_not_found());
    }
}
