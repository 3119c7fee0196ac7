//! Error types for broker client operations.
//!
//! Errors are `Clone` because a single failed append is reported to every
//! write handle that was part of the batch.

use std::fmt;

use thiserror::Error;

/// The result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// The kind of broker resource an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// A stream.
    Stream,
    /// A subscription.
    Subscription,
    /// A named consumer attached to a subscription.
    Consumer,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Subscription => write!(f, "subscription"),
            Self::Consumer => write!(f, "consumer"),
        }
    }
}

/// Errors returned by broker client operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The named resource does not exist (or no longer exists).
    #[error("{resource} not found: {name}")]
    NotFound {
        /// Kind of resource.
        resource: Resource,
        /// Name or identifier that was looked up.
        name: String,
    },

    /// The named resource already exists.
    #[error("{resource} already exists: {name}")]
    AlreadyExists {
        /// Kind of resource.
        resource: Resource,
        /// Name or identifier that collided.
        name: String,
    },

    /// A record exceeds the broker's maximum record size.
    #[error("record too large: {size} bytes exceeds limit of {max} bytes")]
    RecordTooLarge {
        /// Size of the offending record payload.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// An argument was rejected before reaching the broker.
    #[error("invalid argument {name}: {reason}")]
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: String,
    },

    /// The producer was closed before the write could be accepted.
    #[error("producer closed")]
    ProducerClosed,

    /// The node behind this client cannot be reached.
    #[error("node unavailable: {address}")]
    Unavailable {
        /// Address of the unreachable node.
        address: String,
    },

    /// The broker answered with something the contract does not allow.
    #[error("protocol violation: {message}")]
    Protocol {
        /// Description of the unexpected response.
        message: String,
    },
}

impl ClientError {
    /// Returns true for errors of the not-found class.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the error reports an oversized record.
    #[must_use]
    pub const fn is_size_limit(&self) -> bool {
        matches!(self, Self::RecordTooLarge { .. })
    }

    /// Returns true if the error reports a name collision.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Shorthand for a missing stream.
    #[must_use]
    pub fn stream_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            resource: Resource::Stream,
            name: name.into(),
        }
    }

    /// Shorthand for a missing subscription.
    #[must_use]
    pub fn subscription_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: Resource::Subscription,
            name: id.into(),
        }
    }
}
