//! End-to-end: backend registers a lease over a real TCP control channel,
//! an SNI client gets routed and relayed to it.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use portal_backend::BackendSession;
use portal_common::protocol::LeaseSpec;
use portal_crypto::identity::Credential;
use portal_relay::config::RelayConfig;
use portal_relay::forward::relay_streams;
use portal_relay::registry::{now_unix_ms, DispatchError};
use portal_relay::session::{handle_backend, RelayState};
use portal_relay::sni;

const TIMEOUT: Duration = Duration::from_secs(10);

fn lease_spec(name: &str) -> LeaseSpec {
    LeaseSpec {
        name: name.to_string(),
        alpns: vec!["h2".to_string()],
        expires_unix_ms: now_unix_ms() + 60_000,
        metadata: BTreeMap::new(),
    }
}

/// Start a relay state plus its control listener; returns the state and
/// the control address.
async fn start_relay(config: RelayConfig) -> (Arc<RelayState>, SocketAddr) {
    let state = RelayState::new(Credential::generate(), config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                return;
            };
            tokio::spawn(handle_backend(accept_state.clone(), stream, peer));
        }
    });

    (state, addr)
}

async fn connect_backend(addr: SocketAddr, cred: &Credential) -> BackendSession {
    let stream = TcpStream::connect(addr).await.unwrap();
    BackendSession::connect(stream, cred, TIMEOUT).await.unwrap()
}

#[tokio::test]
async fn lease_registration_and_dispatch() {
    let (state, addr) = start_relay(RelayConfig::default()).await;

    let backend_cred = Credential::generate();
    let backend_id = backend_cred.id();
    let backend = connect_backend(addr, &backend_cred).await;

    let status = backend.register(lease_spec("my-service")).await.unwrap();
    assert_eq!(status, portal_common::LeaseStatus::Ok);
    assert_eq!(state.registry.lease_count(), 1);
    assert!(state.registry.lookup_by_name("my-service").is_some());

    // Dispatch a stream to the backend and echo through it.
    let server = tokio::spawn(async move {
        let incoming = backend.next_incoming().await.unwrap();
        assert_eq!(incoming.offer.alpn, "h2");
        let mut stream = incoming.accept().await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.shutdown().await.unwrap();
        backend
    });

    let entry = state.registry.lookup_by_id(&backend_id).unwrap();
    let mut dispatched = state
        .registry
        .open_stream(&entry, "198.51.100.1:5000", "h2")
        .await
        .unwrap();
    dispatched.write_all(b"echo").await.unwrap();
    let mut buf = [0u8; 4];
    dispatched.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"echo");

    // Closing the backend session destroys the lease.
    let backend = server.await.unwrap();
    backend.close().await;
    for _ in 0..50 {
        if state.registry.lease_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.registry.lease_count(), 0);
}

#[tokio::test]
async fn refresh_rename_and_delete_over_control() {
    let (state, addr) = start_relay(RelayConfig::default()).await;

    let backend_cred = Credential::generate();
    let backend = connect_backend(addr, &backend_cred).await;

    assert_eq!(
        backend.register(lease_spec("first-name")).await.unwrap(),
        portal_common::LeaseStatus::Ok
    );

    // Plain refresh keeps the lease in place.
    assert_eq!(
        backend.refresh(lease_spec("first-name")).await.unwrap(),
        portal_common::LeaseStatus::Ok
    );
    assert!(state.registry.lookup_by_name("first-name").is_some());

    // A renamed refresh is an atomic update: the old name frees up.
    assert_eq!(
        backend.refresh(lease_spec("second-name")).await.unwrap(),
        portal_common::LeaseStatus::Ok
    );
    assert!(state.registry.lookup_by_name("first-name").is_none());
    assert!(state.registry.lookup_by_name("second-name").is_some());

    // Delete is idempotent; refreshing afterwards reports the lease gone.
    assert_eq!(
        backend.delete().await.unwrap(),
        portal_common::LeaseStatus::Ok
    );
    assert_eq!(
        backend.delete().await.unwrap(),
        portal_common::LeaseStatus::Ok
    );
    assert_eq!(state.registry.lease_count(), 0);
    assert_eq!(
        backend.refresh(lease_spec("second-name")).await.unwrap(),
        portal_common::LeaseStatus::Expired
    );

    // The session can register fresh after a delete.
    assert_eq!(
        backend.register(lease_spec("third-name")).await.unwrap(),
        portal_common::LeaseStatus::Ok
    );
}

#[tokio::test]
async fn declined_offer_refuses_the_dispatch() {
    let (state, addr) = start_relay(RelayConfig::default()).await;

    let backend_cred = Credential::generate();
    let backend_id = backend_cred.id();
    let backend = connect_backend(addr, &backend_cred).await;
    assert_eq!(
        backend.register(lease_spec("picky")).await.unwrap(),
        portal_common::LeaseStatus::Ok
    );

    let server = tokio::spawn(async move {
        let incoming = backend.next_incoming().await.unwrap();
        incoming.decline().await.unwrap();
        backend
    });

    let entry = state.registry.lookup_by_id(&backend_id).unwrap();
    let err = state
        .registry
        .open_stream(&entry, "198.51.100.2:6000", "h2")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Refused));

    // The refused slot was released; a second dispatch still reaches the
    // backend.
    let backend = server.await.unwrap();
    assert_eq!(state.conn_limits.active_count(&backend_id), 0);

    let server = tokio::spawn(async move {
        let incoming = backend.next_incoming().await.unwrap();
        let mut stream = incoming.accept().await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    });
    let mut dispatched = state
        .registry
        .open_stream(&entry, "198.51.100.2:6001", "h2")
        .await
        .unwrap();
    dispatched.write_all(b"ok").await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn refresh_loop_outlives_the_ttl() {
    let config = RelayConfig {
        lease_ttl: Duration::from_secs(3),
        ..RelayConfig::default()
    };
    let (state, addr) = start_relay(config).await;

    let backend_cred = Credential::generate();
    let backend = Arc::new(connect_backend(addr, &backend_cred).await);
    assert_eq!(
        backend.register(lease_spec("durable")).await.unwrap(),
        portal_common::LeaseStatus::Ok
    );

    let refresher = {
        let backend = backend.clone();
        tokio::spawn(async move {
            backend
                .run_refresh_loop(lease_spec("durable"), Duration::from_secs(3))
                .await;
        })
    };

    // Well past the TTL: without the loop this sweep would reap the lease.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(state.registry.sweep_expired(), 0);
    assert!(state.registry.lookup_by_name("durable").is_some());

    // Closing the session ends the loop and destroys the lease.
    backend.close().await;
    tokio::time::timeout(Duration::from_secs(5), refresher)
        .await
        .expect("refresh loop should stop after close")
        .unwrap();
    for _ in 0..50 {
        if state.registry.lease_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.registry.lease_count(), 0);
}

#[tokio::test]
async fn duplicate_name_rejected_across_backends() {
    let (_state, addr) = start_relay(RelayConfig::default()).await;

    let first_cred = Credential::generate();
    let first = connect_backend(addr, &first_cred).await;
    assert_eq!(
        first.register(lease_spec("shared")).await.unwrap(),
        portal_common::LeaseStatus::Ok
    );

    let second_cred = Credential::generate();
    let second = connect_backend(addr, &second_cred).await;
    assert_eq!(
        second.register(lease_spec("Shared")).await.unwrap(),
        portal_common::LeaseStatus::AlreadyInUse
    );
}

/// Minimal ClientHello carrying `sni` (mirrors the router's unit tests).
fn build_client_hello(sni: &str) -> Vec<u8> {
    let name = sni.as_bytes();
    let mut entry = Vec::new();
    entry.push(0x00);
    entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
    entry.extend_from_slice(name);

    let mut ext_data = Vec::new();
    ext_data.extend_from_slice(&(entry.len() as u16).to_be_bytes());
    ext_data.extend_from_slice(&entry);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&0u16.to_be_bytes());
    extensions.extend_from_slice(&(ext_data.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&ext_data);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0u8; 32]);
    body.push(0);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1);
    body.push(0x00);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(0x01);
    let len = (body.len() as u32).to_be_bytes();
    handshake.extend_from_slice(&len[1..]);
    handshake.extend_from_slice(&body);

    let mut record = Vec::new();
    record.push(0x16);
    record.extend_from_slice(&[0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[tokio::test]
async fn sni_client_reaches_backend_with_bytes_intact() {
    let config = RelayConfig {
        sni_domain: Some("portal.test".to_string()),
        ..RelayConfig::default()
    };
    let (state, addr) = start_relay(config).await;

    // Backend registers; the relay installs the svc.portal.test route.
    let backend_cred = Credential::generate();
    let backend = connect_backend(addr, &backend_cred).await;
    assert_eq!(
        backend.register(lease_spec("svc")).await.unwrap(),
        portal_common::LeaseStatus::Ok
    );
    assert_eq!(state.sni_router.route_count(), 1);

    // Backend serves one stream: assert the ClientHello arrived verbatim,
    // then answer.
    let hello = build_client_hello("svc.portal.test");
    let expected_hello = hello.clone();
    let server = tokio::spawn(async move {
        let incoming = backend.next_incoming().await.unwrap();
        let mut stream = incoming.accept().await.unwrap();

        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(&received[..expected_hello.len()], &expected_hello[..]);
        assert_eq!(&received[expected_hello.len()..], b"payload");

        stream.write_all(b"answer").await.unwrap();
        stream.shutdown().await.unwrap();
    });

    // SNI ingress listener wired like main().
    let sni_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sni_addr = sni_listener.local_addr().unwrap();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let dispatch_state = state.clone();
    let on_connection = move |conn, lease_id, peer: SocketAddr| {
        let state = dispatch_state.clone();
        async move {
            let Some(entry) = state.registry.lookup_by_id(&lease_id) else {
                return;
            };
            let alpn = entry.lease().alpns.first().cloned().unwrap_or_default();
            if let Ok(lease_stream) = state
                .registry
                .open_stream(&entry, &peer.to_string(), &alpn)
                .await
            {
                let bucket = state.bandwidth.get_bucket(entry.id());
                relay_streams(conn, lease_stream, bucket).await;
            }
        }
    };
    tokio::spawn(sni::accept_loop(
        sni_listener,
        state.sni_router.clone(),
        on_connection,
        stop_rx,
    ));

    // Client: raw TCP, TLS ClientHello + payload, then read the answer.
    let mut client = TcpStream::connect(sni_addr).await.unwrap();
    client.write_all(&hello).await.unwrap();
    client.write_all(b"payload").await.unwrap();
    client.shutdown().await.unwrap();

    let mut answer = Vec::new();
    client.read_to_end(&mut answer).await.unwrap();
    assert_eq!(answer, b"answer");

    server.await.unwrap();
}

#[tokio::test]
async fn unmatched_sni_gets_plain_close() {
    let (state, _addr) = start_relay(RelayConfig::default()).await;

    let sni_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sni_addr = sni_listener.local_addr().unwrap();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let on_connection = move |_conn: sni::PeekStream<TcpStream>, _lease, _peer| async move {
        panic!("nothing should match");
    };
    tokio::spawn(sni::accept_loop(
        sni_listener,
        state.sni_router.clone(),
        on_connection,
        stop_rx,
    ));

    let mut client = TcpStream::connect(sni_addr).await.unwrap();
    client
        .write_all(&build_client_hello("nobody.home"))
        .await
        .unwrap();

    // The relay closes without writing anything.
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}
