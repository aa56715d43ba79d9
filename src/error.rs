use thiserror::Error;

/// Errors that can occur during publish/subscribe operations
#[derive(Error, Debug)]
pub enum PubSubError {
    /// A session to the broker could not be opened
    #[error("connection error: {0}")]
    Connection(String),

    /// The broker rejected or failed to acknowledge a publish
    #[error("publish error: {0}")]
    Publish(String),

    /// An established consume session failed while listening
    #[error("session error: {0}")]
    Session(String),

    /// A message could not be rendered into a wire payload
    #[error("failed to encode {type_name}: {reason}")]
    Encode {
        type_name: &'static str,
        reason: String,
    },

    /// A wire payload could not be turned back into a message
    #[error("failed to decode {type_name}: {reason}")]
    Decode {
        type_name: &'static str,
        reason: String,
    },

    /// The operation is not supported by this provider configuration
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// No live subscription exists for the group
    #[error("no active subscription for group: {0}")]
    NotSubscribed(String),

    /// Group names must not be empty
    #[error("group name must not be empty")]
    EmptyGroupName,

    /// Failure reported by an application message handler
    #[error("handler error: {0}")]
    Handler(String),

    /// Required configuration value missing
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// Conflicting configuration values
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    /// The requested broker is unknown or was not compiled in
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
}

/// Result type alias for publish/subscribe operations
pub type Result<T> = std::result::Result<T, PubSubError>;
