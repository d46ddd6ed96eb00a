use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    sync::{Mutex, watch},
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelHandle, SessionId, attach},
    config::ServerConfig,
    envelope::ROOT_NAMESPACE,
    error::RegistryError,
    message::{Packet, read_message, write_message},
    preflight::run_root_channel,
    registry::{NamespaceId, NamespaceRegistry},
    service::{NamespaceService, RelayService},
    session::{Session, run_session},
};

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

struct ServerState {
    registry: Arc<NamespaceRegistry>,
    service: Arc<dyn NamespaceService>,
    config: ServerConfig,
    roots: Mutex<HashMap<SessionId, ChannelHandle>>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let service = Arc::new(RelayService::new(config.relay_ack_timeout));
        Self::with_service(listener, config, service)
    }

    pub fn with_service(
        listener: TcpListener,
        config: ServerConfig,
        service: Arc<dyn NamespaceService>,
    ) -> Self {
        let registry = Arc::new(NamespaceRegistry::new(config.namespace_len));
        let (shutdown, _) = watch::channel(false);
        Self {
            listener,
            state: Arc::new(ServerState {
                registry,
                service,
                config,
                roots: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared registry, for pushing data to namespace members from outside
    /// the dispatch loops.
    pub fn registry(&self) -> Arc<NamespaceRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        // `interval` panics on a zero period.
        let mut sweep = interval(state.config.unjoined_namespace_ttl.max(Duration::from_millis(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
                _ = sweep.tick() => {
                    state
                        .registry
                        .sweep_unjoined(state.config.unjoined_namespace_ttl)
                        .await;
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &Arc<ServerState>) {
    info!("server shutting down");
    state.shutdown.send_replace(true);

    let roots: Vec<ChannelHandle> = state.roots.lock().await.values().cloned().collect();
    for root in roots {
        root.disconnect().await;
    }
    state.registry.disconnect_all().await;
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, state).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    let mut shutdown = state.shutdown.subscribe();
    if *shutdown.borrow_and_update() {
        return Ok(());
    }

    let handshake = tokio::time::timeout(
        state.config.handshake_timeout,
        perform_handshake(&mut reader),
    );
    let nsp = select! {
        result = handshake => match result {
            Ok(result) => result?,
            Err(_) => {
                debug!(?peer, "no connect packet before handshake timeout");
                return Ok(());
            }
        },
        _ = shutdown.changed() => {
            debug!(?peer, "server shut down during handshake");
            return Ok(());
        }
    };

    let sid = nanoid::nanoid!();
    let Some(namespace) = NamespaceId::from_path(&nsp) else {
        let (channel, events, tasks) = attach(reader, writer, sid, ROOT_NAMESPACE.to_string());
        accept(&channel).await?;
        info!(?peer, sid = channel.sid(), "client connected on root");

        let sid = channel.sid().to_string();
        state.roots.lock().await.insert(sid.clone(), channel.clone());
        if *state.shutdown.borrow() {
            // Registered after the shutdown snapshot was taken.
            channel.disconnect().await;
        }
        run_root_channel(channel, events, tasks, Arc::clone(&state.registry)).await;
        state.roots.lock().await.remove(&sid);
        return Ok(());
    };

    if !state.registry.contains(namespace.as_str()).await {
        reject(&mut writer, &nsp, &namespace).await?;
        info!(?peer, namespace = %namespace, "rejected join for unknown namespace");
        return Ok(());
    }

    let (channel, events, tasks) = attach(reader, writer, sid, namespace.path());
    if let Err(err) = state.registry.join(namespace.as_str(), channel.clone()).await {
        // Reclaimed between the check and the join.
        channel
            .send_packet(Packet::ConnectError {
                nsp: nsp.clone(),
                message: err.to_string(),
            })
            .await?;
        channel.disconnect().await;
        return Err(err).context("join failed");
    }
    accept(&channel).await?;
    if *state.shutdown.borrow() {
        channel.disconnect().await;
    }

    info!(?peer, namespace = %namespace, sid = channel.sid(), "client connected");
    let session = Session::new(namespace, channel, Arc::clone(&state.registry));
    run_session(session, events, tasks, Arc::clone(&state.service)).await;

    Ok(())
}

async fn perform_handshake<R>(reader: &mut R) -> Result<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match read_message::<_, Packet>(reader).await? {
        Some(Packet::Connect { nsp }) => Ok(nsp),
        Some(other) => anyhow::bail!("expected connect packet first, got {other:?}"),
        None => anyhow::bail!("connection closed before handshake"),
    }
}

async fn accept(channel: &ChannelHandle) -> Result<()> {
    channel
        .send_packet(Packet::Connected {
            nsp: channel.nsp().to_string(),
            sid: channel.sid().to_string(),
        })
        .await?;
    Ok(())
}

async fn reject<W>(writer: &mut W, nsp: &str, namespace: &NamespaceId) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let message = RegistryError::UnknownNamespace {
        namespace: namespace.to_string(),
    }
    .to_string();
    write_message(
        writer,
        &Packet::ConnectError {
            nsp: nsp.to_string(),
            message,
        },
    )
    .await?;
    write_message(writer, &Packet::Disconnect).await?;
    Ok(())
}
