use thiserror::Error;

/// Unified error type for the chained-query library
#[derive(Debug, Error)]
pub enum ChainedQueryError {
    /// A hook was used without an enclosing provider scope
    #[error("Cannot use useChainedQuery outside ChainedQueryProvider")]
    MissingProvider,

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A fetch operation settled with an error
    #[error("Query {key} failed: {message}")]
    QueryFailed { key: String, message: String },

    /// A mutation settled with an error
    #[error("Mutation {key} failed: {message}")]
    MutationFailed { key: String, message: String },
}

impl ChainedQueryError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a query failure error
    pub fn query_failed<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::QueryFailed {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a mutation failure error
    pub fn mutation_failed<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::MutationFailed {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Check if error is recoverable
    ///
    /// Usage and configuration errors need the caller to change how the
    /// library is composed; operation failures can be retried.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::MissingProvider | Self::Configuration { .. } => false,
            Self::QueryFailed { .. } | Self::MutationFailed { .. } => true,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::MissingProvider => "usage",
            Self::Configuration { .. } => "configuration",
            Self::QueryFailed { .. } => "query",
            Self::MutationFailed { .. } => "mutation",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ChainedQueryError>;
