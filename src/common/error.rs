//! Error types for the coordinator and its collaborators.

use std::fmt;

use thiserror::Error;
use tokio::time::Instant;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

/// Reason attached to a rate-limit rejection from the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitReason {
    /// The user holds too many subscriptions.
    UserSubscriptionLimit,
    /// The server connection holds too many subscriptions.
    ServerSubscriptionLimit,
    /// The user holds too many subscriptions on this server connection.
    UserServerSubscriptionLimit,
    /// Any other throttling reason reported by the service.
    Other(String),
}

impl RateLimitReason {
    /// Map a wire reason code to a reason.
    pub fn from_code(code: &str) -> Self {
        match code {
            "user_subscription_limit" => Self::UserSubscriptionLimit,
            "server_subscription_limit" => Self::ServerSubscriptionLimit,
            "user_server_subscription_limit" => Self::UserServerSubscriptionLimit,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire reason code for this reason.
    pub fn code(&self) -> &str {
        match self {
            Self::UserSubscriptionLimit => "user_subscription_limit",
            Self::ServerSubscriptionLimit => "server_subscription_limit",
            Self::UserServerSubscriptionLimit => "user_server_subscription_limit",
            Self::Other(code) => code,
        }
    }

    /// Subscription limits are permanent for the socket that hit them.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::UserSubscriptionLimit
                | Self::ServerSubscriptionLimit
                | Self::UserServerSubscriptionLimit
        )
    }
}

impl fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Failure returned by a transport subscribe call.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Rate limited: {reason}")]
    RateLimited {
        reason: RateLimitReason,
        /// Earliest time the service recommends retrying, if it sent one.
        retry_at: Option<Instant>,
    },

    #[error("Subscribe failed: {message}")]
    Failed { message: String },
}

/// Coordinator-level errors. These never reach lifecycle handler callers;
/// they are logged by the task that produced them.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Entity '{entity_id}' still has an active retry loop")]
    StillDraining { entity_id: String },
}

/// Result type alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;
