//! Typed protocol envelopes.
//!
//! On the wire every message is a named event with positional arguments. Here
//! each event kind becomes one variant with a fixed field list, and the
//! acknowledgement travels separately as an explicit correlation token.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::EnvelopeError, message::Payload, registry::NamespaceId};

pub const ROOT_NAMESPACE: &str = "/";

pub const PREFLIGHT_EVENT: &str = "sqw:client_preflight";
pub const BROADCAST_EVENT: &str = "sqw:broadcast";
pub const REQUEST_EVENT: &str = "sqw:request";
pub const DATA_EVENT: &str = "sqw:data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Preflight,
    Broadcast,
    Request,
    DataPush,
}

impl EventKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            PREFLIGHT_EVENT => Some(Self::Preflight),
            BROADCAST_EVENT => Some(Self::Broadcast),
            REQUEST_EVENT => Some(Self::Request),
            DATA_EVENT => Some(Self::DataPush),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Preflight => PREFLIGHT_EVENT,
            Self::Broadcast => BROADCAST_EVENT,
            Self::Request => REQUEST_EVENT,
            Self::DataPush => DATA_EVENT,
        }
    }
}

/// Options sent with a preflight. Currently empty; unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreflightRequest {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreflightResponse {
    pub ns: NamespaceId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Preflight(PreflightRequest),
    Broadcast { payload: Payload },
    Request { name: Payload, body: Payload },
    DataPush { args: Vec<Payload> },
}

impl Envelope {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Preflight(_) => EventKind::Preflight,
            Self::Broadcast { .. } => EventKind::Broadcast,
            Self::Request { .. } => EventKind::Request,
            Self::DataPush { .. } => EventKind::DataPush,
        }
    }

    /// Builds an envelope from a wire event.
    ///
    /// Arguments beyond the ones a kind declares are dropped. A preflight
    /// whose options do not parse is treated as a preflight with defaults.
    pub fn decode(event: &str, args: Vec<Payload>) -> Result<Self, EnvelopeError> {
        let kind = EventKind::from_name(event).ok_or_else(|| EnvelopeError::UnknownEvent {
            event: event.to_string(),
        })?;

        match kind {
            EventKind::Preflight => {
                let request = args
                    .into_iter()
                    .next()
                    .and_then(|payload| match payload {
                        Payload::Json(value) => serde_json::from_value(value).ok(),
                        Payload::Binary(_) => None,
                    })
                    .unwrap_or_default();
                Ok(Self::Preflight(request))
            }
            EventKind::Broadcast => {
                let [payload] = take_positional::<1>(kind, args)?;
                Ok(Self::Broadcast { payload })
            }
            EventKind::Request => {
                let [name, body] = take_positional::<2>(kind, args)?;
                Ok(Self::Request { name, body })
            }
            EventKind::DataPush => Ok(Self::DataPush { args }),
        }
    }

    pub fn encode(self) -> (&'static str, Vec<Payload>) {
        let kind = self.kind();
        let args = match self {
            Self::Preflight(request) => {
                vec![Payload::Json(serde_json::to_value(request).unwrap_or_default())]
            }
            Self::Broadcast { payload } => vec![payload],
            Self::Request { name, body } => vec![name, body],
            Self::DataPush { args } => args,
        };
        (kind.name(), args)
    }
}

fn take_positional<const N: usize>(
    kind: EventKind,
    args: Vec<Payload>,
) -> Result<[Payload; N], EnvelopeError> {
    let found = args.len();
    if found < N {
        return Err(EnvelopeError::Malformed {
            event: kind.name().to_string(),
            expected: N,
            found,
        });
    }
    if found > N {
        debug!(event = kind.name(), extra = found - N, "dropping surplus arguments");
    }

    let taken: Vec<Payload> = args.into_iter().take(N).collect();
    taken.try_into().map_err(|_| EnvelopeError::Malformed {
        event: kind.name().to_string(),
        expected: N,
        found,
    })
}
