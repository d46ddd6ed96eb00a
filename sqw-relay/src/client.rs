//! Client side of the protocol.
//!
//! [`ClientChannel`] is one connection to one namespace path. Inbound
//! `sqw:data` pushes go to a [`DataHandler`] whose return value is always sent
//! back as the acknowledgement, so a push can never be left unanswered by a
//! handler that finishes.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};
use tokio::{
    io::{self, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelHandle, InboundEvents, attach},
    cli::ClientArgs,
    envelope::{Envelope, PreflightRequest, PreflightResponse, ROOT_NAMESPACE},
    error::{ChannelError, ClientError, EnvelopeError},
    message::{Packet, Payload, display_args, read_message, write_message},
    registry::NamespaceId,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Answers server-initiated data pushes.
pub trait DataHandler: Send + Sync + 'static {
    fn on_data(&self, args: Vec<Payload>) -> BoxFuture<'static, Vec<Payload>>;
}

impl<F, Fut> DataHandler for F
where
    F: Fn(Vec<Payload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<Payload>> + Send + 'static,
{
    fn on_data(&self, args: Vec<Payload>) -> BoxFuture<'static, Vec<Payload>> {
        (self)(args).boxed()
    }
}

#[derive(Debug)]
pub struct ClientChannel {
    channel: ChannelHandle,
    reader: JoinHandle<()>,
    reader_done: bool,
    dispatcher: JoinHandle<()>,
}

impl ClientChannel {
    /// Opens a channel to `nsp` (`/` or `/<namespace>`).
    pub async fn connect<H>(addr: SocketAddr, nsp: &str, handler: H) -> Result<Self, ClientError>
    where
        H: DataHandler,
    {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr, source })?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        write_message(
            &mut writer,
            &Packet::Connect {
                nsp: nsp.to_string(),
            },
        )
        .await?;

        let reply = tokio::time::timeout(CONNECT_TIMEOUT, read_message::<_, Packet>(&mut reader))
            .await
            .map_err(|_| ClientError::Handshake {
                nsp: nsp.to_string(),
                detail: format!("no reply within {CONNECT_TIMEOUT:?}"),
            })??;

        let sid = match reply {
            Some(Packet::Connected { sid, .. }) => sid,
            Some(Packet::ConnectError { message, .. }) => {
                return Err(ClientError::ConnectRejected {
                    nsp: nsp.to_string(),
                    message,
                });
            }
            Some(other) => {
                return Err(ClientError::Handshake {
                    nsp: nsp.to_string(),
                    detail: format!("unexpected packet {other:?}"),
                });
            }
            None => {
                return Err(ClientError::Handshake {
                    nsp: nsp.to_string(),
                    detail: "connection closed".to_string(),
                });
            }
        };

        debug!(%addr, nsp, sid = %sid, "channel connected");
        let (channel, events, tasks) = attach(reader, writer, sid, nsp.to_string());
        let dispatcher = tokio::spawn(dispatch(channel.clone(), events, Arc::new(handler)));

        Ok(Self {
            channel,
            reader: tasks.reader,
            reader_done: false,
            dispatcher,
        })
    }

    /// Opens the root channel, which never receives data pushes.
    pub async fn connect_root(addr: SocketAddr) -> Result<Self, ClientError> {
        Self::connect(addr, ROOT_NAMESPACE, |_args: Vec<Payload>| async { Vec::new() }).await
    }

    pub fn sid(&self) -> &str {
        self.channel.sid()
    }

    pub fn nsp(&self) -> &str {
        self.channel.nsp()
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Asks the server for a namespace. Only meaningful on the root channel.
    pub async fn preflight(&self) -> Result<NamespaceId, ClientError> {
        let reply = self
            .channel
            .emit_with_ack(Envelope::Preflight(PreflightRequest::default()))
            .await?
            .await
            .map_err(ChannelError::from)?;
        parse_preflight(reply)
    }

    /// `sqw:broadcast` with an acknowledgement.
    pub async fn broadcast(&self, payload: Payload) -> Result<Vec<Payload>, ClientError> {
        self.call(Envelope::Broadcast { payload }).await
    }

    /// `sqw:broadcast` without asking for an acknowledgement.
    pub async fn broadcast_detached(&self, payload: Payload) -> Result<(), ClientError> {
        self.channel.emit(Envelope::Broadcast { payload }).await?;
        Ok(())
    }

    /// `sqw:request` with an acknowledgement.
    pub async fn request(&self, name: Payload, body: Payload) -> Result<Vec<Payload>, ClientError> {
        self.call(Envelope::Request { name, body }).await
    }

    async fn call(&self, envelope: Envelope) -> Result<Vec<Payload>, ClientError> {
        let reply = self
            .channel
            .emit_with_ack(envelope)
            .await?
            .await
            .map_err(ChannelError::from)?;
        Ok(reply)
    }

    /// Resolves once the server side has closed the channel.
    pub async fn closed(&mut self) {
        if self.reader_done {
            return;
        }
        if let Err(err) = (&mut self.reader).await {
            debug!(?err, "client reader task failed");
        }
        self.reader_done = true;
    }

    /// Sends `disconnect`, then waits briefly for the channel tasks to wind down.
    pub async fn disconnect(mut self) {
        self.channel.disconnect().await;
        if tokio::time::timeout(DISCONNECT_GRACE, self.closed()).await.is_err() {
            debug!(nsp = self.nsp(), "server did not close the channel in time");
            self.reader.abort();
        }
        self.dispatcher.abort();
    }
}

/// Full handshake: preflight on `/`, drop the root channel, join `/<ns>`.
pub async fn connect_with_preflight<H>(
    addr: SocketAddr,
    handler: H,
) -> Result<(NamespaceId, ClientChannel), ClientError>
where
    H: DataHandler,
{
    let root = ClientChannel::connect_root(addr).await?;
    let ns = root.preflight().await?;
    root.disconnect().await;

    let channel = ClientChannel::connect(addr, &ns.path(), handler).await?;
    Ok((ns, channel))
}

fn parse_preflight(reply: Vec<Payload>) -> Result<NamespaceId, ClientError> {
    let value = reply
        .into_iter()
        .next()
        .and_then(|payload| match payload {
            Payload::Json(value) => Some(value),
            Payload::Binary(_) => None,
        })
        .ok_or_else(|| ClientError::InvalidPreflightResponse("missing payload".to_string()))?;

    serde_json::from_value::<PreflightResponse>(value)
        .map(|response| response.ns)
        .map_err(|err| ClientError::InvalidPreflightResponse(err.to_string()))
}

async fn dispatch(channel: ChannelHandle, mut events: InboundEvents, handler: Arc<dyn DataHandler>) {
    while let Some(inbound) = events.recv().await {
        let responder = channel.responder(inbound.ack);

        match Envelope::decode(&inbound.event, inbound.args) {
            Ok(Envelope::DataPush { args }) => {
                let reply = handler.on_data(args).await;
                responder.send(reply).await;
            }
            Ok(other) => {
                let err = EnvelopeError::Unexpected {
                    event: other.kind().name().to_string(),
                    nsp: channel.nsp().to_string(),
                };
                responder.reject(&err).await;
            }
            Err(err) => responder.reject(&err).await,
        }
    }
}

/// Reference client used by the `client` subcommand.
pub async fn run(args: ClientArgs) -> Result<()> {
    let reply = args.reply.clone();
    let handler = move |data: Vec<Payload>| {
        let reply = reply.clone();
        async move {
            if let Err(error) = write_stdout(&format!("*** data: {}", display_args(&data))).await {
                warn!(?error, "failed to print data push");
            }
            vec![Payload::binary(reply.into_bytes())]
        }
    };

    let mut session = establish_session(&args, handler).await?;

    let response = session
        .broadcast(Payload::binary(args.message.clone().into_bytes()))
        .await?;
    write_stdout(&format!("*** broadcast response: {}", display_args(&response))).await?;

    let response = session
        .request(
            Payload::text("hello!"),
            Payload::binary(b"Some really cool request".to_vec()),
        )
        .await?;
    write_stdout(&format!("*** request response: {}", display_args(&response))).await?;

    let interrupted = select! {
        _ = session.closed() => false,
        ctrl_c = tokio::signal::ctrl_c() => {
            handle_ctrl_c(ctrl_c);
            true
        }
    };

    if interrupted {
        session.disconnect().await;
        write_stdout("*** disconnected").await?;
    } else {
        write_stdout("*** server closed the connection").await?;
    }

    Ok(())
}

async fn establish_session<H>(args: &ClientArgs, handler: H) -> Result<ClientChannel>
where
    H: DataHandler,
{
    match &args.namespace {
        Some(namespace) => {
            let namespace = NamespaceId::from_path(namespace)
                .ok_or_else(|| anyhow::anyhow!("namespace must not be empty"))?;
            info!(%namespace, "connecting to namespace");
            let session = ClientChannel::connect(args.server, &namespace.path(), handler).await?;
            write_stdout(&format!("*** joined namespace: {namespace}")).await?;
            Ok(session)
        }
        None => {
            info!("connecting with preflight");
            let (namespace, session) = connect_with_preflight(args.server, handler).await?;
            write_stdout(&format!("*** namespace: {namespace}")).await?;
            Ok(session)
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
