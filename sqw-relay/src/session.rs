//! Per-namespace channel handling.
//!
//! A session is one channel bound to one namespace for its whole life. Its
//! inbound events are handled one at a time, so the reply to a call is queued
//! before the next event on that channel is looked at.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    channel::{ChannelHandle, ChannelTasks, InboundEvent, InboundEvents},
    envelope::Envelope,
    error::EnvelopeError,
    registry::{Departure, NamespaceId, NamespaceRegistry},
    service::NamespaceService,
};

#[derive(Debug, Clone)]
pub struct Session {
    namespace: NamespaceId,
    channel: ChannelHandle,
    registry: Arc<NamespaceRegistry>,
}

impl Session {
    pub fn new(
        namespace: NamespaceId,
        channel: ChannelHandle,
        registry: Arc<NamespaceRegistry>,
    ) -> Self {
        Self {
            namespace,
            channel,
            registry,
        }
    }

    pub fn namespace(&self) -> &NamespaceId {
        &self.namespace
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    pub fn sid(&self) -> &str {
        self.channel.sid()
    }

    pub fn registry(&self) -> &Arc<NamespaceRegistry> {
        &self.registry
    }

    /// Other channels currently joined to the same namespace.
    pub async fn peers(&self) -> Vec<ChannelHandle> {
        self.registry
            .peers(self.namespace.as_str(), self.sid())
            .await
            .unwrap_or_default()
    }
}

/// Drives a joined session until its channel closes, then leaves the
/// namespace.
///
/// Leaving waits only for the channel reader, not for handlers still in
/// flight, so a hung handler cannot keep a namespace alive.
pub async fn run_session(
    session: Session,
    events: InboundEvents,
    tasks: ChannelTasks,
    service: Arc<dyn NamespaceService>,
) {
    service.on_join(&session);
    info!(namespace = %session.namespace, sid = session.sid(), "session joined");

    let dispatcher = tokio::spawn(dispatch(session.clone(), events, Arc::clone(&service)));

    if let Err(err) = tasks.reader.await {
        debug!(?err, "session reader task failed");
    }

    let departure = session
        .registry
        .leave(session.namespace.as_str(), session.sid())
        .await;
    service.on_leave(&session);
    info!(namespace = %session.namespace, sid = session.sid(), ?departure, "session left");

    if departure == Departure::NotMember {
        debug!(sid = session.sid(), "session was not registered at teardown");
    }
    if let Err(err) = dispatcher.await {
        debug!(?err, "session dispatcher task failed");
    }
}

async fn dispatch(session: Session, mut events: InboundEvents, service: Arc<dyn NamespaceService>) {
    while let Some(inbound) = events.recv().await {
        handle_event(&session, inbound, service.as_ref()).await;
    }
}

async fn handle_event(session: &Session, inbound: InboundEvent, service: &dyn NamespaceService) {
    let responder = session.channel.responder(inbound.ack);

    match Envelope::decode(&inbound.event, inbound.args) {
        Ok(Envelope::Broadcast { payload }) => {
            debug!(sid = session.sid(), %payload, "broadcast");
            let reply = service.on_broadcast(session.clone(), payload).await;
            responder.send(reply).await;
        }
        Ok(Envelope::Request { name, body }) => {
            debug!(sid = session.sid(), %name, "request");
            let reply = service.on_request(session.clone(), name, body).await;
            responder.send(reply).await;
        }
        Ok(other) => {
            let err = EnvelopeError::Unexpected {
                event: other.kind().name().to_string(),
                nsp: session.channel.nsp().to_string(),
            };
            responder.reject(&err).await;
        }
        Err(err) => responder.reject(&err).await,
    }
}
