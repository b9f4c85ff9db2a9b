//! Error types for mesh-kube operations

use std::fmt;

use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad connection handle or misuse of the cache lifecycle. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Stream drops, timeouts and other recoverable network failures
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Remote command failed; captured output is kept for diagnosis
    #[error("{}", format_remote(.target, .message, .stderr))]
    RemoteExecution {
        target: String,
        message: String,
        stdout: String,
        stderr: String,
    },

    /// Failures of a multi-target operation, one per target
    #[error("{} targets failed: {}", .0.len(), join_failures(.0))]
    Aggregate(Vec<TargetError>),

    /// Manifest could not be parsed or applied
    #[error("manifest {origin}: {message}")]
    Manifest { origin: String, message: String },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Local I/O failure, including interrupted log streams
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request over a port forward failed
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a transient network error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a manifest error for the given file or document
    pub fn manifest(origin: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            origin: origin.into(),
            message: msg.into(),
        }
    }

    /// Whether a caller may reasonably retry the operation
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork(_) | Self::Io(_) => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            Self::Kube(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Whether the API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(resp)) if resp.code == 404)
    }
}

/// Failure of a single target within a fan-out operation
#[derive(Debug)]
pub struct TargetError {
    pub target: String,
    pub error: Error,
}

impl TargetError {
    pub fn new(target: impl Into<String>, error: Error) -> Self {
        Self {
            target: target.into(),
            error,
        }
    }
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.error)
    }
}

fn format_remote(target: &str, message: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        format!("error exec'ing into {target}: {message}")
    } else {
        format!("error exec'ing into {target}: {message}\n{stderr}")
    }
}

fn join_failures(failures: &[TargetError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
