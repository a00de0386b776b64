//! # Error Handling
//!
//! This module provides error handling for the meshwire xDS client. It
//! defines the crate-wide error type using `thiserror`, covering the five
//! failure kinds surfaced to resource watchers (transport, validation,
//! does-not-exist, bootstrap, dependency) plus the ambient plumbing errors.

/// Custom result type for meshwire operations
pub type Result<T> = std::result::Result<T, MeshwireError>;

/// Main error type for the meshwire xDS client
#[derive(thiserror::Error, Debug)]
pub enum MeshwireError {
    /// Transient transport errors: connection failed, stream ended
    /// unexpectedly, deadline. Watchers keep serving any cached value.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// A resource payload was well-formed but failed a semantic invariant.
    /// NACKed to the server; never retried.
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// The server reported (or the does-not-exist timer concluded) that a
    /// subscribed resource does not exist.
    #[error("Resource does not exist: {resource_type} '{name}'")]
    DoesNotExist { resource_type: String, name: String },

    /// Bootstrap / configuration errors, fatal at client construction
    #[error("Bootstrap error: {message}")]
    Bootstrap {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Dependency-graph errors: aggregate-cluster cycles, missing virtual
    /// host, max expansion depth exceeded
    #[error("Dependency error: {message}")]
    Dependency { message: String },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Parsing/decoding errors (resource names, protobuf envelopes)
    #[error("Parse error: {context}")]
    Parse {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal invariant violations
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Alias used throughout the crate
pub type Error = MeshwireError;

impl MeshwireError {
    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create a does-not-exist error
    pub fn does_not_exist<T: Into<String>, N: Into<String>>(resource_type: T, name: N) -> Self {
        Self::DoesNotExist { resource_type: resource_type.into(), name: name.into() }
    }

    /// Create a bootstrap error
    pub fn bootstrap<S: Into<String>>(message: S) -> Self {
        Self::Bootstrap { message: message.into(), source: None }
    }

    /// Create a bootstrap error with source
    pub fn bootstrap_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Bootstrap { message: message.into(), source: Some(source) }
    }

    /// Create a dependency-graph error
    pub fn dependency<S: Into<String>>(message: S) -> Self {
        Self::Dependency { message: message.into() }
    }

    /// Create an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }

    /// Create a serialization error with context
    pub fn serialization<S: Into<String>>(source: serde_json::Error, context: S) -> Self {
        Self::Serialization { source, context: context.into() }
    }

    /// Create a parse error
    pub fn parse<S: Into<String>>(context: S) -> Self {
        Self::Parse { context: context.into(), source: None }
    }

    /// Create a parse error with source
    pub fn parse_with_source<S: Into<String>>(
        context: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Parse { context: context.into(), source: Some(source) }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Whether a previously delivered value remains usable after this error.
    ///
    /// Transient errors never invalidate cached data; watchers that already
    /// received a value keep treating it as current.
    pub fn is_transient(&self) -> bool {
        matches!(self, MeshwireError::Transport { .. } | MeshwireError::Validation { .. })
    }
}

impl From<tonic::Status> for MeshwireError {
    fn from(status: tonic::Status) -> Self {
        MeshwireError::Transport {
            message: format!("gRPC status {}: {}", status.code(), status.message()),
        }
    }
}

impl From<tonic::transport::Error> for MeshwireError {
    fn from(err: tonic::transport::Error) -> Self {
        MeshwireError::Transport { message: format!("connection failed: {}", err) }
    }
}

impl From<prost::DecodeError> for MeshwireError {
    fn from(err: prost::DecodeError) -> Self {
        MeshwireError::Parse { context: "protobuf decode".to_string(), source: Some(Box::new(err)) }
    }
}
