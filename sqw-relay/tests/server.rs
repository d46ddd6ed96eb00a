use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use serde_json::json;
use sqw_relay::{
    client::{ClientChannel, connect_with_preflight},
    config::ServerConfig,
    envelope::{BROADCAST_EVENT, PREFLIGHT_EVENT, REQUEST_EVENT, ROOT_NAMESPACE},
    error::{AckError, ClientError},
    message::{Packet, Payload, read_message, write_message},
    registry::{NamespaceId, NamespaceRegistry},
    server::Server,
};
use tokio::{
    io::BufReader,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    registry: Arc<NamespaceRegistry>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        Self::start_with(ServerConfig::default()).await
    }

    async fn start_with(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let config = ServerConfig {
            listen: addr,
            relay_ack_timeout: Duration::from_millis(500),
            ..config
        };
        let server = Server::new(listener, config);
        let registry = server.registry();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown,
            task,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }

    async fn wait_reclaimed(&self, ns: &NamespaceId) -> Result<()> {
        timeout(WAIT, async {
            while self.registry.contains(ns.as_str()).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        Ok(())
    }
}

fn ignore_data(_args: Vec<Payload>) -> futures::future::Ready<Vec<Payload>> {
    futures::future::ready(Vec::new())
}

#[tokio::test]
async fn preflight_then_join_the_issued_namespace() -> Result<()> {
    let server = TestServer::start().await?;

    let root = ClientChannel::connect_root(server.addr).await?;
    let ns = timeout(WAIT, root.preflight()).await??;
    root.disconnect().await;
    assert!(server.registry.contains(ns.as_str()).await);

    let session = ClientChannel::connect(server.addr, &ns.path(), ignore_data).await?;
    assert_eq!(session.nsp(), ns.path());
    assert_eq!(server.registry.members(ns.as_str()).await?.len(), 1);

    session.disconnect().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn independent_clients_get_distinct_namespaces() -> Result<()> {
    let server = TestServer::start().await?;

    let (first_ns, first) = connect_with_preflight(server.addr, ignore_data).await?;
    let (second_ns, second) = connect_with_preflight(server.addr, ignore_data).await?;
    assert_ne!(first_ns, second_ns);

    first.disconnect().await;
    second.disconnect().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_namespace_is_rejected() -> Result<()> {
    let server = TestServer::start().await?;

    let err = ClientChannel::connect(server.addr, "/abc123", ignore_data)
        .await
        .expect_err("namespace was never allocated");
    match err {
        ClientError::ConnectRejected { nsp, message } => {
            assert_eq!(nsp, "/abc123");
            assert!(message.contains("unknown namespace"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn reclaimed_namespace_cannot_be_rejoined() -> Result<()> {
    let server = TestServer::start().await?;

    let (ns, session) = connect_with_preflight(server.addr, ignore_data).await?;
    session.disconnect().await;
    server.wait_reclaimed(&ns).await?;

    let err = ClientChannel::connect(server.addr, &ns.path(), ignore_data)
        .await
        .expect_err("namespace was reclaimed");
    assert!(matches!(err, ClientError::ConnectRejected { .. }));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn broadcast_and_request_are_acknowledged() -> Result<()> {
    let server = TestServer::start().await?;
    let (_ns, session) = connect_with_preflight(server.addr, ignore_data).await?;

    // Alone in the namespace, so the relay has nobody to ask.
    let reply = timeout(WAIT, session.broadcast(Payload::text("Hello world!"))).await??;
    assert!(reply.is_empty());

    let reply = timeout(
        WAIT,
        session.request(Payload::text("hello!"), Payload::binary(b"body".to_vec())),
    )
    .await??;
    assert!(reply.is_empty());

    session.disconnect().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn data_push_resolves_with_the_client_reply() -> Result<()> {
    let server = TestServer::start().await?;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let handler = move |args: Vec<Payload>| {
        let _ = seen_tx.send(args);
        async { vec![Payload::text("Thanks!")] }
    };
    let (ns, session) = connect_with_preflight(server.addr, handler).await?;

    let members = server.registry.members(ns.as_str()).await?;
    assert_eq!(members.len(), 1);
    let reply = members[0].push_data(vec![Payload::text("x")]).await?;

    let answer = timeout(WAIT, reply).await??;
    assert_eq!(answer, vec![Payload::text("Thanks!")]);
    let seen = timeout(WAIT, seen_rx.recv()).await?.expect("handler ran");
    assert_eq!(seen, vec![Payload::text("x")]);
    assert!(members[0].pending().is_empty());

    session.disconnect().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn disconnect_orphans_outstanding_data_push() -> Result<()> {
    let server = TestServer::start().await?;

    let handler = |_args: Vec<Payload>| futures::future::pending::<Vec<Payload>>();
    let (ns, session) = connect_with_preflight(server.addr, handler).await?;

    let member = server
        .registry
        .members(ns.as_str())
        .await?
        .pop()
        .expect("one member");
    let reply = member.push_data(vec![Payload::text("x")]).await?;
    let id = reply.id();

    session.disconnect().await;

    let outcome = timeout(WAIT, reply).await?;
    assert_eq!(outcome, Err(AckError::OrphanedAcknowledgement { id }));
    assert_eq!(
        member.pending().resolve(id, vec![]),
        Err(AckError::DuplicateAcknowledgement { id })
    );
    server.wait_reclaimed(&ns).await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn broadcast_is_relayed_to_other_members() -> Result<()> {
    let server = TestServer::start().await?;

    let (alice_ns, alice) = connect_with_preflight(server.addr, ignore_data).await?;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let bob_handler = move |args: Vec<Payload>| {
        let _ = seen_tx.send(args);
        async { vec![Payload::text("Thanks!")] }
    };
    let bob = ClientChannel::connect(server.addr, &alice_ns.path(), bob_handler).await?;

    let reply = timeout(WAIT, alice.broadcast(Payload::binary(b"Hello world!".to_vec()))).await??;
    assert_eq!(
        reply,
        vec![Payload::Json(json!({
            "id": bob.sid(),
            "data": [{"kind": "json", "value": "Thanks!"}],
        }))]
    );

    let pushed = timeout(WAIT, seen_rx.recv()).await?.expect("bob saw the push");
    assert_eq!(
        pushed,
        vec![
            Payload::Json(json!({ "id": alice.sid() })),
            Payload::binary(b"Hello world!".to_vec()),
        ]
    );

    // One member leaving keeps the namespace alive for the other.
    bob.disconnect().await;
    timeout(WAIT, async {
        while server.registry.members(alice_ns.as_str()).await.map(|m| m.len()).unwrap_or(0) != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert!(server.registry.contains(alice_ns.as_str()).await);

    alice.disconnect().await;
    server.wait_reclaimed(&alice_ns).await?;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_envelope_is_rejected_without_closing_the_channel() -> Result<()> {
    let server = TestServer::start().await?;
    let (ns, session) = connect_with_preflight(server.addr, ignore_data).await?;

    let (mut reader, mut writer) = raw_join(server.addr, &ns).await?;

    write_message(
        &mut writer,
        &Packet::Event {
            event: REQUEST_EVENT.into(),
            args: vec![Payload::text("only one")],
            ack: Some(1),
        },
    )
    .await?;
    write_message(
        &mut writer,
        &Packet::Event {
            event: BROADCAST_EVENT.into(),
            args: vec![Payload::text("Hello world!")],
            ack: Some(2),
        },
    )
    .await?;

    // Replies come back in the order the calls were made.
    let first = timeout(WAIT, read_message::<_, Packet>(&mut reader)).await??;
    match first {
        Some(Packet::Ack { id: 1, args }) => {
            let error = error_reply(&args);
            assert!(error.contains("malformed"), "{error}");
        }
        other => panic!("expected error ack, got {other:?}"),
    }

    let second = timeout(WAIT, read_message::<_, Packet>(&mut reader)).await??;
    match second {
        Some(Packet::Ack { id: 2, args }) => {
            // The other member answers with nothing.
            assert_eq!(args.len(), 1);
        }
        other => panic!("expected broadcast ack, got {other:?}"),
    }

    session.disconnect().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_reclaims_namespaces_of_silent_members() -> Result<()> {
    let server = TestServer::start().await?;

    let root = ClientChannel::connect_root(server.addr).await?;
    let ns = timeout(WAIT, root.preflight()).await??;
    root.disconnect().await;

    // Joined, but never reads, answers or closes on its own.
    let (mut reader, _writer) = raw_join(server.addr, &ns).await?;
    let member = server
        .registry
        .members(ns.as_str())
        .await?
        .pop()
        .expect("one member");
    let reply = member.push_data(vec![Payload::text("x")]).await?;
    let id = reply.id();

    let registry = Arc::clone(&server.registry);
    server.stop().await;

    assert_eq!(
        timeout(WAIT, reply).await?,
        Err(AckError::OrphanedAcknowledgement { id })
    );
    timeout(WAIT, async {
        while registry.contains(ns.as_str()).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert!(read_until_closed(&mut reader).await?);

    Ok(())
}

#[tokio::test]
async fn shutdown_closes_root_and_handshaking_connections() -> Result<()> {
    let server = TestServer::start().await?;

    let mut root = ClientChannel::connect_root(server.addr).await?;
    // Connected but never sends `connect`.
    let idle = TcpStream::connect(server.addr).await?;
    let (idle_reader, _idle_writer) = idle.into_split();
    let mut idle_reader = BufReader::new(idle_reader);
    // Let the server pick the idle connection up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.stop().await;

    timeout(WAIT, root.closed()).await?;
    let closed = timeout(WAIT, read_message::<_, Packet>(&mut idle_reader)).await??;
    assert_eq!(closed, None);

    Ok(())
}

#[tokio::test]
async fn root_channel_rejects_session_events() -> Result<()> {
    let server = TestServer::start().await?;
    let (mut reader, mut writer) = raw_connect(server.addr, ROOT_NAMESPACE).await?;

    write_message(
        &mut writer,
        &Packet::Event {
            event: BROADCAST_EVENT.into(),
            args: vec![Payload::text("Hello world!")],
            ack: Some(1),
        },
    )
    .await?;

    match timeout(WAIT, read_message::<_, Packet>(&mut reader)).await?? {
        Some(Packet::Ack { id: 1, args }) => {
            let error = error_reply(&args);
            assert!(error.contains("not accepted"), "{error}");
        }
        other => panic!("expected error ack, got {other:?}"),
    }
    assert!(server.registry.is_empty().await);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn preflight_without_acknowledgement_is_ignored() -> Result<()> {
    let server = TestServer::start().await?;
    let (mut reader, mut writer) = raw_connect(server.addr, ROOT_NAMESPACE).await?;

    write_message(
        &mut writer,
        &Packet::Event {
            event: PREFLIGHT_EVENT.into(),
            args: vec![Payload::Json(json!({}))],
            ack: None,
        },
    )
    .await?;
    // A later call on the same channel is answered first, so nothing was
    // sent for the preflight.
    write_message(
        &mut writer,
        &Packet::Event {
            event: REQUEST_EVENT.into(),
            args: vec![],
            ack: Some(2),
        },
    )
    .await?;

    match timeout(WAIT, read_message::<_, Packet>(&mut reader)).await?? {
        Some(Packet::Ack { id: 2, .. }) => {}
        other => panic!("expected the request ack, got {other:?}"),
    }
    assert!(server.registry.is_empty().await);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn client_leaving_mid_preflight_does_not_disturb_the_server() -> Result<()> {
    let server = TestServer::start().await?;

    let (reader, mut writer) = raw_connect(server.addr, ROOT_NAMESPACE).await?;
    write_message(
        &mut writer,
        &Packet::Event {
            event: PREFLIGHT_EVENT.into(),
            args: vec![Payload::Json(json!({}))],
            ack: Some(1),
        },
    )
    .await?;
    drop(writer);
    drop(reader);

    let (ns, session) = connect_with_preflight(server.addr, ignore_data).await?;
    assert!(server.registry.contains(ns.as_str()).await);
    let reply = timeout(WAIT, session.broadcast(Payload::text("still here"))).await??;
    assert!(reply.is_empty());

    session.disconnect().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn unjoined_namespace_is_reclaimed_after_the_grace_period() -> Result<()> {
    let server = TestServer::start_with(ServerConfig {
        unjoined_namespace_ttl: Duration::from_millis(100),
        ..ServerConfig::default()
    })
    .await?;

    let root = ClientChannel::connect_root(server.addr).await?;
    let ns = timeout(WAIT, root.preflight()).await??;
    root.disconnect().await;

    server.wait_reclaimed(&ns).await?;
    let err = ClientChannel::connect(server.addr, &ns.path(), ignore_data)
        .await
        .expect_err("namespace expired before anyone joined");
    assert!(matches!(err, ClientError::ConnectRejected { .. }));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_disconnects_members() -> Result<()> {
    let server = TestServer::start().await?;
    let (_ns, mut session) = connect_with_preflight(server.addr, ignore_data).await?;

    server.stop().await;
    timeout(WAIT, session.closed()).await?;

    Ok(())
}

async fn raw_join(
    addr: SocketAddr,
    ns: &NamespaceId,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    raw_connect(addr, &ns.path()).await
}

async fn raw_connect(
    addr: SocketAddr,
    path: &str,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_message(
        &mut writer,
        &Packet::Connect {
            nsp: path.to_string(),
        },
    )
    .await?;

    match read_message::<_, Packet>(&mut reader).await? {
        Some(Packet::Connected { nsp, .. }) => assert_eq!(nsp, path),
        other => panic!("unexpected handshake response: {other:?}"),
    }

    Ok((reader, writer))
}

fn error_reply(args: &[Payload]) -> String {
    args.first()
        .and_then(Payload::as_json)
        .and_then(|value| value.get("error"))
        .and_then(|value| value.as_str())
        .expect("error reply")
        .to_string()
}

/// Reads packets until `disconnect` or EOF, returning whether `disconnect` was seen.
async fn read_until_closed(reader: &mut BufReader<OwnedReadHalf>) -> Result<bool> {
    loop {
        match timeout(WAIT, read_message::<_, Packet>(reader)).await?? {
            Some(Packet::Disconnect) => return Ok(true),
            Some(_) => continue,
            None => return Ok(false),
        }
    }
}
