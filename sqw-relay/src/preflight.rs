//! Preflight handshake on the root channel `/`.
//!
//! A client connects to `/`, emits `sqw:client_preflight` with an
//! acknowledgement, and receives `{ ns }`. A repeated preflight on the same
//! channel returns the namespace already issued to it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelHandle, ChannelTasks, InboundEvents},
    envelope::{Envelope, PreflightRequest, PreflightResponse, ROOT_NAMESPACE},
    error::EnvelopeError,
    message::Payload,
    registry::{NamespaceId, NamespaceRegistry},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightState {
    Connected,
    AwaitingPreflightRequest,
    NamespaceIssued(NamespaceId),
    Disconnected,
}

#[derive(Debug)]
pub struct PreflightHandler {
    registry: Arc<NamespaceRegistry>,
    state: PreflightState,
}

impl PreflightHandler {
    pub fn new(registry: Arc<NamespaceRegistry>) -> Self {
        Self {
            registry,
            state: PreflightState::Connected,
        }
    }

    pub fn state(&self) -> &PreflightState {
        &self.state
    }

    pub fn on_connect(&mut self) {
        if self.state == PreflightState::Connected {
            self.state = PreflightState::AwaitingPreflightRequest;
        }
    }

    /// Allocates a namespace on the first preflight and repeats it afterwards.
    /// Returns `None` once the channel has disconnected.
    pub async fn on_preflight(&mut self, _request: PreflightRequest) -> Option<PreflightResponse> {
        match &self.state {
            PreflightState::Disconnected => return None,
            PreflightState::NamespaceIssued(ns) => {
                return Some(PreflightResponse { ns: ns.clone() });
            }
            PreflightState::Connected | PreflightState::AwaitingPreflightRequest => {}
        }

        let ns = self.registry.allocate().await;
        self.state = PreflightState::NamespaceIssued(ns.clone());
        Some(PreflightResponse { ns })
    }

    pub fn on_disconnect(&mut self) {
        self.state = PreflightState::Disconnected;
    }
}

/// Serves the root channel until it closes.
pub async fn run_root_channel(
    channel: ChannelHandle,
    mut events: InboundEvents,
    tasks: ChannelTasks,
    registry: Arc<NamespaceRegistry>,
) {
    let mut handler = PreflightHandler::new(registry);
    handler.on_connect();

    while let Some(inbound) = events.recv().await {
        let responder = channel.responder(inbound.ack);

        match Envelope::decode(&inbound.event, inbound.args) {
            Ok(Envelope::Preflight(request)) => {
                if !responder.requested() {
                    warn!(sid = channel.sid(), "preflight without acknowledgement ignored");
                    continue;
                }

                info!(sid = channel.sid(), ?request, "client preflight");
                let Some(response) = handler.on_preflight(request).await else {
                    break;
                };
                match serde_json::to_value(&response) {
                    Ok(value) => responder.send(vec![Payload::Json(value)]).await,
                    Err(err) => warn!(error = %err, "failed to encode preflight response"),
                }
            }
            Ok(other) => {
                let err = EnvelopeError::Unexpected {
                    event: other.kind().name().to_string(),
                    nsp: ROOT_NAMESPACE.to_string(),
                };
                responder.reject(&err).await;
            }
            Err(err) => responder.reject(&err).await,
        }
    }

    if let Err(err) = tasks.reader.await {
        debug!(?err, "root reader task failed");
    }
    handler.on_disconnect();
    debug!(sid = channel.sid(), state = ?handler.state(), "root channel closed");
}
