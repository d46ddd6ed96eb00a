//! Error types for the relay protocol.
//!
//! Every failure is local to the channel that caused it: none of these
//! variants is allowed to poison the namespace registry or stop the server.

use std::time::Duration;

use thiserror::Error;

use crate::message::AckId;

/// Failures raised by the namespace registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The id was never allocated, or its namespace has been reclaimed.
    #[error("unknown namespace '{namespace}'")]
    UnknownNamespace {
        /// Identifier the caller tried to use.
        namespace: String,
    },
}

/// Failures around correlation tokens.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AckError {
    /// The token was already resolved, or was never issued on this channel.
    #[error("acknowledgement {id} was already resolved or never issued")]
    DuplicateAcknowledgement {
        /// Offending correlation token.
        id: AckId,
    },

    /// The channel closed before the far side answered.
    #[error("channel closed before acknowledgement {id} was answered")]
    OrphanedAcknowledgement {
        /// Correlation token that will never resolve.
        id: AckId,
    },

    /// The caller-side timeout wrapper gave up waiting.
    #[error("acknowledgement {id} not answered within {after:?}")]
    TimedOut {
        /// Correlation token that was awaited.
        id: AckId,
        /// How long the caller waited.
        after: Duration,
    },
}

/// An inbound event the receiving channel refuses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// A required positional payload is missing.
    #[error("malformed '{event}' envelope: expected {expected} argument(s), got {found}")]
    Malformed {
        /// Wire name of the event.
        event: String,
        /// Minimum number of positional payloads.
        expected: usize,
        /// Number actually received.
        found: usize,
    },

    /// The event name is not part of the protocol.
    #[error("unknown event '{event}'")]
    UnknownEvent {
        /// Wire name that was received.
        event: String,
    },

    /// A valid envelope arrived on a channel that does not accept it.
    #[error("event '{event}' is not accepted on namespace '{nsp}'")]
    Unexpected {
        /// Wire name of the event.
        event: String,
        /// Namespace path of the receiving channel.
        nsp: String,
    },

    /// The channel already has a full queue of events waiting for dispatch.
    #[error("channel overloaded, '{event}' dropped ({capacity} events already queued)")]
    Overloaded {
        /// Wire name of the dropped event.
        event: String,
        /// Inbound queue capacity.
        capacity: usize,
    },
}

/// Failures of a live channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The writer side is gone; nothing more can be sent.
    #[error("channel '{nsp}' is closed")]
    Closed {
        /// Namespace path of the channel.
        nsp: String,
    },

    /// Waiting for an acknowledgement failed.
    #[error(transparent)]
    Ack(#[from] AckError),
}

/// Failures seen by the client session driver.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach the server.
    #[error("failed to connect to {addr}")]
    Connect {
        /// Address that was dialled.
        addr: std::net::SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The server refused to attach the channel to the namespace.
    #[error("server rejected namespace '{nsp}': {message}")]
    ConnectRejected {
        /// Namespace path that was requested.
        nsp: String,
        /// Reason sent by the server.
        message: String,
    },

    /// The server did not follow the connect handshake.
    #[error("unexpected handshake reply on '{nsp}': {detail}")]
    Handshake {
        /// Namespace path that was requested.
        nsp: String,
        /// What went wrong.
        detail: String,
    },

    /// The preflight acknowledgement did not carry a namespace.
    #[error("invalid preflight response: {0}")]
    InvalidPreflightResponse(String),

    /// Socket I/O failed during the handshake.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The channel failed after it was established.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Invalid server configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Namespace ids this short collide too easily.
    #[error("namespace length must be at least {min}, got {actual}")]
    NamespaceTooShort {
        /// Smallest accepted length.
        min: usize,
        /// Configured length.
        actual: usize,
    },

    /// A timeout of zero would fail every wait immediately.
    #[error("{name} must be greater than zero")]
    ZeroTimeout {
        /// Name of the offending setting.
        name: &'static str,
    },
}
