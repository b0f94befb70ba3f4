// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Connections over real QUIC endpoints on the loopback interface

use std::{net::SocketAddr, time::Duration};

use quicmux::{
  AcceptError, Connection, ConnectionState, Dialer, ListenConfig, Listener, SessionError,
  StreamDirection, DEFAULT_CLOSE_CODE, DEFAULT_CLOSE_MESSAGE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const PROTOCOL: &str = "quicmux-loopback";

fn init_tracing() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quinn=warn,quinn_proto=warn,debug"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_test_writer()
    .try_init();
}

/// A listener on an ephemeral loopback port, and a dialer trusting its certificate
fn endpoints() -> (Listener, Dialer) {
  let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
  let certificate = rustls::Certificate(cert.serialize_der().unwrap());
  let private_key = rustls::PrivateKey(cert.serialize_private_key_der());

  let listener = ListenConfig::new(PROTOCOL, vec![certificate.clone()], private_key)
    .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
    .unwrap();

  let mut roots = rustls::RootCertStore::empty();
  roots.add(&certificate).unwrap();
  let tls_config = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let dialer = Dialer {
    tls_config: Some(tls_config),
    ..Dialer::new(PROTOCOL)
  };
  (listener, dialer)
}

async fn connect(listener: &Listener, dialer: &Dialer) -> (Connection, Connection) {
  let addr = listener.local_addr().unwrap();
  let (client, server) = tokio::join!(dialer.dial(addr, "localhost"), listener.accept());
  (client.unwrap(), server.unwrap())
}

#[tokio::test]
async fn ping_pong() {
  init_tracing();
  let fut = async move {
    let (listener, dialer) = endpoints();
    let (client, server) = connect(&listener, &dialer).await;
    assert_eq!(client.remote_addr(), listener.local_addr().unwrap());

    let responder = tokio::task::spawn(async move {
      let mut stream = server.accept_stream().await.unwrap();
      assert_eq!(stream.direction(), StreamDirection::Bidirectional);
      let mut request = Vec::new();
      stream.read_to_end(&mut request).await.unwrap();
      assert_eq!(request, b"ping");
      stream.write_all(b"pong").await.unwrap();
      stream.close().await.unwrap();
      // Hold the connection until the client is done with it
      server.closed().await
    });

    let mut stream = client.open_stream(false).await.unwrap();
    // Empty writes succeed without sending anything
    assert_eq!(stream.write(b"").await.unwrap(), 0);
    stream.write_all(b"ping").await.unwrap();
    stream.close().await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"pong");

    client.close().unwrap();
    assert_eq!(client.closed().await, Some(SessionError::LocallyClosed));
    assert_eq!(
      responder.await.unwrap(),
      Some(SessionError::ApplicationClosed {
        code: DEFAULT_CLOSE_CODE,
        reason: DEFAULT_CLOSE_MESSAGE.into(),
      })
    );
  };
  tokio::time::timeout(Duration::from_secs(10), fut)
    .await
    .expect("Loopback ping-pong may be deadlocked");
}

#[tokio::test]
async fn mixed_stream_classes() {
  const PER_CLASS: u8 = 3;
  init_tracing();
  let fut = async move {
    let (listener, dialer) = endpoints();
    let (client, server) = connect(&listener, &dialer).await;

    for i in 0..PER_CLASS {
      for unidirectional in [false, true] {
        let mut stream = client.open_stream(unidirectional).await.unwrap();
        assert_eq!(stream.can_receive(), !unidirectional);
        stream.write_all(&[i]).await.unwrap();
        stream.close().await.unwrap();
      }
    }

    let (mut bidirectional, mut receive_only) = (Vec::new(), Vec::new());
    for _ in 0..(PER_CLASS * 2) {
      let mut stream = server.accept_stream().await.unwrap();
      let mut content = Vec::new();
      stream.read_to_end(&mut content).await.unwrap();
      match stream.direction() {
        StreamDirection::Bidirectional => bidirectional.extend(content),
        StreamDirection::ReceiveOnly => receive_only.extend(content),
        StreamDirection::SendOnly => panic!("Peers cannot initiate send-only streams"),
      }
    }
    let expected: Vec<u8> = (0..PER_CLASS).collect();
    assert_eq!(bidirectional, expected);
    assert_eq!(receive_only, expected);

    // Nothing further arrives, and giving up on the wait loses nothing
    let cancel = CancellationToken::new();
    let canceller = {
      let cancel = cancel.clone();
      tokio::task::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
      })
    };
    assert_eq!(
      server
        .accept_stream_with_cancellation(&cancel)
        .await
        .unwrap_err(),
      AcceptError::Cancelled
    );
    canceller.await.unwrap();

    server.close_with_error(7, "done").unwrap();
    assert_eq!(
      client.accept_stream().await.unwrap_err(),
      AcceptError::Terminated(SessionError::ApplicationClosed {
        code: 7,
        reason: "done".into(),
      })
    );
  };
  tokio::time::timeout(Duration::from_secs(10), fut)
    .await
    .expect("Loopback stream delivery may be deadlocked");
}

#[tokio::test]
async fn datagrams() {
  init_tracing();
  let fut = async move {
    let (listener, dialer) = endpoints();
    let (client, server) = connect(&listener, &dialer).await;
    assert!(client.supports_datagrams());
    assert!(server.supports_datagrams());

    // Datagrams are unreliable even on loopback, so keep sending until one lands
    let stop = CancellationToken::new();
    let sender = {
      let client = client.clone();
      let stop = stop.clone();
      tokio::task::spawn(async move {
        while !stop.is_cancelled() {
          client.write_datagram(&b"datagram"[..]).unwrap();
          tokio::time::sleep(Duration::from_millis(20)).await;
        }
      })
    };
    let received = server.read_datagram().await.unwrap();
    stop.cancel();
    sender.await.unwrap();
    assert_eq!(&received[..], b"datagram");
    client.close().unwrap();
  };
  tokio::time::timeout(Duration::from_secs(10), fut)
    .await
    .expect("Loopback datagrams may be deadlocked");
}

#[tokio::test]
async fn listener_close_stops_accepting() {
  init_tracing();
  let (listener, dialer) = endpoints();
  let (client, server) = connect(&listener, &dialer).await;

  listener.close();
  assert!(matches!(
    listener.accept().await,
    Err(quicmux::ListenError::Closed)
  ));

  // Established connections keep working
  let mut stream = client.open_stream(true).await.unwrap();
  stream.write_all(b"still open").await.unwrap();
  stream.close().await.unwrap();
  let mut inbound = tokio::time::timeout(Duration::from_secs(10), server.accept_stream())
    .await
    .expect("Established connection must survive listener close")
    .unwrap();
  let mut content = String::new();
  inbound.read_to_string(&mut content).await.unwrap();
  assert_eq!(content, "still open");
}

#[tokio::test]
async fn rejected_close_code_keeps_connection_open() {
  init_tracing();
  let fut = async move {
    let (listener, dialer) = endpoints();
    let (client, server) = connect(&listener, &dialer).await;

    // QUIC error codes are limited to 62 bits
    let unrepresentable = 1 << 62;
    assert_eq!(
      client.close_with_error(unrepresentable, "bad"),
      Err(SessionError::InvalidCloseCode(unrepresentable))
    );
    assert_eq!(client.state(), ConnectionState::Open);

    let mut outbound = server.open_stream(true).await.unwrap();
    outbound.write_all(b"hello").await.unwrap();
    outbound.close().await.unwrap();

    let mut inbound = client.accept_stream().await.unwrap();
    assert_eq!(inbound.direction(), StreamDirection::ReceiveOnly);
    let mut content = Vec::new();
    inbound.read_to_end(&mut content).await.unwrap();
    assert_eq!(content, b"hello");

    client.close().unwrap();
    assert_eq!(client.closed().await, Some(SessionError::LocallyClosed));
  };
  tokio::time::timeout(Duration::from_secs(10), fut)
    .await
    .expect("Loopback close may be deadlocked");
}
