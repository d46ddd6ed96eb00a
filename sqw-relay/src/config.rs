//! Validated server configuration.

use std::{net::SocketAddr, time::Duration};

use crate::{
    cli::ServerArgs, error::ConfigError, registry::DEFAULT_NAMESPACE_LEN,
    service::DEFAULT_RELAY_ACK_TIMEOUT,
};

pub const MIN_NAMESPACE_LEN: usize = 4;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_UNJOINED_NAMESPACE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub namespace_len: usize,
    pub relay_ack_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long an allocated namespace may stay without anyone joining it.
    pub unjoined_namespace_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
            namespace_len: DEFAULT_NAMESPACE_LEN,
            relay_ack_timeout: DEFAULT_RELAY_ACK_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            unjoined_namespace_ttl: DEFAULT_UNJOINED_NAMESPACE_TTL,
        }
    }
}

impl ServerConfig {
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.namespace_len < MIN_NAMESPACE_LEN {
            return Err(ConfigError::NamespaceTooShort {
                min: MIN_NAMESPACE_LEN,
                actual: self.namespace_len,
            });
        }
        if self.relay_ack_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout {
                name: "relay acknowledgement timeout",
            });
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout {
                name: "handshake timeout",
            });
        }
        if self.unjoined_namespace_ttl.is_zero() {
            return Err(ConfigError::ZeroTimeout {
                name: "unjoined namespace timeout",
            });
        }
        Ok(self)
    }
}

impl TryFrom<&ServerArgs> for ServerConfig {
    type Error = ConfigError;

    fn try_from(args: &ServerArgs) -> Result<Self, Self::Error> {
        Self {
            listen: args.listen,
            namespace_len: args.namespace_len,
            relay_ack_timeout: Duration::from_millis(args.relay_timeout_ms),
            handshake_timeout: Duration::from_millis(args.handshake_timeout_ms),
            unjoined_namespace_ttl: Duration::from_millis(args.unjoined_timeout_ms),
        }
        .validate()
    }
}
