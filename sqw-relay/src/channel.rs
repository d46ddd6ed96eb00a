//! Logical channels over a framed byte stream.
//!
//! [`attach`] splits a connection into two tasks:
//!
//! - a writer that drains a bounded queue of outbound [`Packet`]s, and
//! - a reader that resolves inbound `ack` packets straight into the
//!   channel's [`PendingAcks`] and forwards `event` packets, in arrival order,
//!   to the single dispatch loop that owns the [`InboundEvents`] receiver.
//!
//! Acks bypass the dispatch loop, so a handler may await a reply from its own
//! channel without stalling it. For the same reason the reader never waits on
//! the event queue: when it is full, the event is refused with an error ack.
//!
//! When the reader stops (EOF, a `disconnect` from either side, or an I/O
//! error) it discards the pending table and closes the event stream, which
//! ends the dispatch loop. A local [`ChannelHandle::disconnect`] stops the
//! reader without waiting for the peer.

use std::sync::Arc;

use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::{
        Notify,
        mpsc::{self, error::TrySendError},
    },
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    ack::{AckFuture, PendingAcks},
    envelope::Envelope,
    error::{ChannelError, EnvelopeError},
    message::{AckId, Packet, Payload, read_message, write_message},
};

const OUTBOUND_CAPACITY: usize = 128;
pub const INBOUND_CAPACITY: usize = 64;

pub type SessionId = String;

/// An inbound event waiting for the dispatch loop.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub event: String,
    pub args: Vec<Payload>,
    pub ack: Option<AckId>,
}

pub type InboundEvents = mpsc::Receiver<InboundEvent>;

/// Cloneable sending side of a channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    sid: SessionId,
    nsp: String,
    outbound: mpsc::Sender<Packet>,
    pending: Arc<PendingAcks>,
    closing: Arc<Notify>,
}

impl ChannelHandle {
    pub(crate) fn new(sid: SessionId, nsp: String, outbound: mpsc::Sender<Packet>) -> Self {
        Self {
            sid,
            nsp,
            outbound,
            pending: Arc::new(PendingAcks::new()),
            closing: Arc::new(Notify::new()),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn nsp(&self) -> &str {
        &self.nsp
    }

    pub fn pending(&self) -> &PendingAcks {
        &self.pending
    }

    pub fn is_connected(&self) -> bool {
        !self.outbound.is_closed() && !self.pending.is_closed()
    }

    pub(crate) async fn send_packet(&self, packet: Packet) -> Result<(), ChannelError> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| ChannelError::Closed {
                nsp: self.nsp.clone(),
            })
    }

    /// Fire-and-forget send.
    pub async fn emit(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let (event, args) = envelope.encode();
        self.send_packet(Packet::Event {
            event: event.to_string(),
            args,
            ack: None,
        })
        .await
    }

    /// Sends an envelope and returns a future for the far side's reply.
    pub async fn emit_with_ack(&self, envelope: Envelope) -> Result<AckFuture, ChannelError> {
        let (event, args) = envelope.encode();
        let (id, reply) = self.pending.register();

        let sent = self
            .send_packet(Packet::Event {
                event: event.to_string(),
                args,
                ack: Some(id),
            })
            .await;
        if let Err(err) = sent {
            self.pending.forget(id);
            return Err(err);
        }

        Ok(reply)
    }

    /// Server-initiated `sqw:data`. The returned future resolves when the
    /// client's handler answers; it fails if the channel closes first.
    pub async fn push_data(&self, args: Vec<Payload>) -> Result<AckFuture, ChannelError> {
        self.emit_with_ack(Envelope::DataPush { args }).await
    }

    pub fn responder(&self, ack: Option<AckId>) -> AckResponder {
        AckResponder {
            id: ack,
            channel: self.clone(),
        }
    }

    /// Closes the channel from this side.
    ///
    /// Outstanding acknowledgements are orphaned before this returns and the
    /// reader stops without waiting for the peer. The writer then sends
    /// `disconnect` and shuts the stream down.
    pub async fn disconnect(&self) {
        self.pending.discard();
        self.closing.notify_one();
        if self.send_packet(Packet::Disconnect).await.is_err() {
            debug!(sid = %self.sid, nsp = %self.nsp, "channel already closed");
        }
    }
}

/// Answers one inbound event. Consuming `send` makes double replies impossible.
#[derive(Debug)]
pub struct AckResponder {
    id: Option<AckId>,
    channel: ChannelHandle,
}

impl AckResponder {
    pub fn requested(&self) -> bool {
        self.id.is_some()
    }

    /// Sends the reply if one was requested. A closed channel drops it.
    pub async fn send(self, args: Vec<Payload>) {
        let Some(id) = self.id else {
            return;
        };
        if let Err(err) = self.channel.send_packet(Packet::Ack { id, args }).await {
            debug!(id, error = %err, "dropping acknowledgement for closed channel");
        }
    }

    /// Refuses an envelope. A caller waiting for an acknowledgement receives
    /// `{"error": ...}` instead of hanging.
    pub async fn reject(self, err: &EnvelopeError) {
        warn!(sid = %self.channel.sid, nsp = %self.channel.nsp, error = %err, "rejecting envelope");
        self.send(vec![Payload::Json(serde_json::json!({ "error": err.to_string() }))])
            .await;
    }
}

/// Tasks backing one attached channel.
#[derive(Debug)]
pub struct ChannelTasks {
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

/// Starts the reader and writer tasks for an already-handshaken stream.
pub fn attach<R, W>(
    reader: R,
    writer: W,
    sid: SessionId,
    nsp: String,
) -> (ChannelHandle, InboundEvents, ChannelTasks)
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let handle = ChannelHandle::new(sid, nsp, outbound_tx);

    let writer = tokio::spawn(run_writer(writer, outbound_rx));
    let reader = tokio::spawn(run_reader(reader, handle.clone(), inbound_tx));

    (handle, inbound_rx, ChannelTasks { reader, writer })
}

async fn run_writer<W>(mut writer: W, mut outbound: mpsc::Receiver<Packet>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = outbound.recv().await {
        let closing = matches!(packet, Packet::Disconnect);
        if let Err(err) = write_message(&mut writer, &packet).await {
            debug!(?err, "failed to write packet");
            break;
        }
        if closing {
            break;
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(?err, "failed to shut down channel writer");
    }
}

async fn run_reader<R>(
    mut reader: R,
    handle: ChannelHandle,
    inbound: mpsc::Sender<InboundEvent>,
) where
    R: AsyncBufRead + Unpin,
{
    loop {
        let frame = select! {
            biased;
            _ = handle.closing.notified() => {
                debug!(sid = %handle.sid, "channel closed locally");
                break;
            }
            frame = read_message::<_, Packet>(&mut reader) => frame,
        };

        match frame {
            Ok(Some(Packet::Ack { id, args })) => {
                if let Err(err) = handle.pending.resolve(id, args) {
                    warn!(sid = %handle.sid, error = %err, "ignoring acknowledgement");
                }
            }
            Ok(Some(Packet::Event { event, args, ack })) => {
                match inbound.try_send(InboundEvent { event, args, ack }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(refused)) => {
                        let err = EnvelopeError::Overloaded {
                            event: refused.event,
                            capacity: INBOUND_CAPACITY,
                        };
                        handle.responder(refused.ack).reject(&err).await;
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Ok(Some(Packet::Disconnect)) | Ok(None) => break,
            Ok(Some(other)) => {
                warn!(sid = %handle.sid, packet = ?other, "unexpected packet on open channel");
            }
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                warn!(sid = %handle.sid, error = %err, "skipping malformed frame");
            }
            Err(err) => {
                debug!(sid = %handle.sid, ?err, "channel read failed");
                break;
            }
        }
    }

    handle.pending.discard();
    // Best effort: a full queue means the writer is still busy and will stop
    // once every handle is dropped.
    let _ = handle.outbound.try_send(Packet::Disconnect);
    debug!(sid = %handle.sid, nsp = %handle.nsp, "channel reader finished");
}
