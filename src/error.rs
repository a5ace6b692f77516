//! Error types for the Elassandra operator
//!
//! Errors are classified so that callers can decide whether a failure is
//! fatal to a single entity (configuration), recoverable (connectivity) or
//! should simply be retried on the next reconciliation pass.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// CQL statement failed on an established session
    #[error("CQL error: {0}")]
    CqlError(String),

    /// No CQL session could be opened (unreachable cluster, refused connection)
    #[error("CQL connection error: {0}")]
    ConnectionError(String),

    /// CQL credentials were rejected
    #[error("CQL authentication failed for role {role}: {message}")]
    AuthenticationError { role: String, message: String },

    /// Invalid operator or resource configuration (bad credentials, missing secret key, ...)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid resource spec
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A plugin failed during one of its lifecycle calls
    #[error("Plugin {plugin} failed: {message}")]
    PluginError { plugin: String, message: String },

    /// HTTP call to a node agent, reaper or webhook endpoint failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Task could not be resolved or executed
    #[error("Task error: {0}")]
    TaskError(String),

    /// Finalizer handling failed
    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

impl Error {
    /// Configuration errors abort only the entity being processed
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::ConfigError(_) | Error::ValidationError(_))
    }

    /// Connectivity errors are expected while a datacenter is starting
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::ConnectionError(_) | Error::AuthenticationError { .. }
        )
    }

    /// Whether the failed operation may succeed on a later pass
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code >= 500 || e.code == 429,
            Error::KubeError(_) => true,
            Error::CqlError(_) | Error::ConnectionError(_) | Error::HttpError(_) => true,
            Error::AuthenticationError { .. } => true,
            Error::FinalizerError(_) => true,
            Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::PluginError { .. }
            | Error::SerializationError(_)
            | Error::TaskError(_) => false,
        }
    }

    /// Whether this error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }

    /// Short label used for the error-kind metric dimension
    pub fn metric_kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::CqlError(_) => "cql",
            Error::ConnectionError(_) | Error::AuthenticationError { .. } => "connectivity",
            Error::ConfigError(_) | Error::ValidationError(_) => "config",
            Error::PluginError { .. } => "plugin",
            Error::HttpError(_) => "http",
            Error::SerializationError(_) => "serialization",
            Error::TaskError(_) => "task",
            Error::FinalizerError(_) => "finalizer",
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        match e {
            kube::runtime::finalizer::Error::ApplyFailed(err)
            | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
