//! Server-side namespace logic.
//!
//! Every inbound `sqw:broadcast` and `sqw:request` has exactly one receiver:
//! the [`NamespaceService`] installed on the server. Whatever it returns is
//! the acknowledgement sent back to the caller.

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, join_all};
use serde_json::json;
use tracing::debug;

use crate::{error::ChannelError, message::Payload, session::Session};

pub const DEFAULT_RELAY_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub trait NamespaceService: Send + Sync + 'static {
    fn on_join(&self, _session: &Session) {}

    fn on_leave(&self, _session: &Session) {}

    fn on_broadcast(&self, session: Session, payload: Payload) -> BoxFuture<'static, Vec<Payload>>;

    fn on_request(
        &self,
        session: Session,
        name: Payload,
        body: Payload,
    ) -> BoxFuture<'static, Vec<Payload>>;
}

/// Forwards each call to the other members of the caller's namespace as a
/// `sqw:data` push and answers with what they replied.
///
/// Push arguments are `[{"id": <caller sid>}, ..payloads]`. The reply holds one
/// `{"id": <peer sid>, "data": [..]}` object per peer that answered within the
/// acknowledgement timeout.
#[derive(Debug, Clone)]
pub struct RelayService {
    ack_timeout: Duration,
}

impl Default for RelayService {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_ACK_TIMEOUT)
    }
}

impl RelayService {
    pub fn new(ack_timeout: Duration) -> Self {
        Self { ack_timeout }
    }

    async fn relay(session: Session, payloads: Vec<Payload>, ack_timeout: Duration) -> Vec<Payload> {
        let peers = session.peers().await;
        if peers.is_empty() {
            debug!(sid = session.sid(), "no peers to relay to");
            return Vec::new();
        }

        let mut args = Vec::with_capacity(payloads.len() + 1);
        args.push(Payload::Json(json!({ "id": session.sid() })));
        args.extend(payloads);

        let pushes = peers.into_iter().map(|peer| {
            let args = args.clone();
            async move {
                let sid = peer.sid().to_string();
                let reply: Result<Vec<Payload>, ChannelError> = match peer.push_data(args).await {
                    Ok(pending) => pending.with_timeout(ack_timeout).await.map_err(Into::into),
                    Err(err) => Err(err),
                };
                (sid, reply)
            }
        });

        join_all(pushes)
            .await
            .into_iter()
            .filter_map(|(sid, reply)| match reply {
                Ok(data) => Some(Payload::Json(json!({ "id": sid, "data": data }))),
                Err(err) => {
                    debug!(peer = %sid, error = %err, "peer did not answer relay");
                    None
                }
            })
            .collect()
    }
}

impl NamespaceService for RelayService {
    fn on_broadcast(&self, session: Session, payload: Payload) -> BoxFuture<'static, Vec<Payload>> {
        Self::relay(session, vec![payload], self.ack_timeout).boxed()
    }

    fn on_request(
        &self,
        session: Session,
        name: Payload,
        body: Payload,
    ) -> BoxFuture<'static, Vec<Payload>> {
        Self::relay(session, vec![name, body], self.ack_timeout).boxed()
    }
}
