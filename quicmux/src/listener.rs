// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Accepts inbound QUIC sessions and wraps each in a [Connection]

use std::{net::SocketAddr, sync::Arc};

use futures::{stream::BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
  config::{alpn_protocols, TransportSettings},
  connection::Connection,
  error::{ConfigError, ListenError},
  session::QuinnSession,
};

/// Credentials and parameters for accepting connections
#[derive(Debug, Clone)]
pub struct ListenConfig {
  pub certificate_chain: Vec<rustls::Certificate>,
  pub private_key: rustls::PrivateKey,
  pub transport: TransportSettings,
  /// Placed first in the ALPN list offered to clients
  pub protocol: Option<String>,
  /// Additional ALPN protocols, following `protocol`
  pub alpn_protocols: Vec<Vec<u8>>,
}

impl ListenConfig {
  pub fn new<P: Into<String>>(
    protocol: P,
    certificate_chain: Vec<rustls::Certificate>,
    private_key: rustls::PrivateKey,
  ) -> Self {
    Self {
      certificate_chain,
      private_key,
      transport: TransportSettings::default(),
      protocol: Some(protocol.into()),
      alpn_protocols: Vec::new(),
    }
  }

  pub fn server_config(&self) -> Result<quinn::ServerConfig, ConfigError> {
    let alpn_protocols = alpn_protocols(self.protocol.as_deref(), &self.alpn_protocols)?;
    let mut crypto = rustls::ServerConfig::builder()
      .with_safe_defaults()
      .with_no_client_auth()
      .with_single_cert(self.certificate_chain.clone(), self.private_key.clone())?;
    crypto.alpn_protocols = alpn_protocols;

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(self.transport.to_transport_config()?));
    Ok(config)
  }

  /// Validates the configuration, then binds a UDP socket at `addr`
  pub fn bind(&self, addr: SocketAddr) -> Result<Listener, ListenError> {
    let config = self.server_config()?;
    let endpoint = quinn::Endpoint::server(config, addr)?;
    tracing::debug!(addr = ?endpoint.local_addr().ok(), "Listening for QUIC connections");
    Ok(Listener::from_endpoint(endpoint))
  }
}

/// Binds `addr` and accepts connections negotiating `protocol`
pub fn listen(
  protocol: &str,
  addr: SocketAddr,
  certificate_chain: Vec<rustls::Certificate>,
  private_key: rustls::PrivateKey,
) -> Result<Listener, ListenError> {
  ListenConfig::new(protocol, certificate_chain, private_key).bind(addr)
}

/// Produces a [Connection] for every peer completing its handshake
#[derive(Debug)]
pub struct Listener {
  endpoint: quinn::Endpoint,
  closed: CancellationToken,
}

impl Listener {
  /// Accepts on an endpoint that already has a server configuration
  pub fn from_endpoint(endpoint: quinn::Endpoint) -> Self {
    Self {
      endpoint,
      closed: CancellationToken::new(),
    }
  }

  pub fn endpoint(&self) -> &quinn::Endpoint {
    &self.endpoint
  }

  pub fn local_addr(&self) -> Result<SocketAddr, ListenError> {
    Ok(self.endpoint.local_addr()?)
  }

  /// Waits for the next peer to complete its handshake.
  ///
  /// Peers whose handshakes fail are logged and skipped. Returns
  /// [ListenError::Closed] once the listener or its endpoint is closed.
  pub async fn accept(&self) -> Result<Connection, ListenError> {
    loop {
      let connecting = tokio::select! {
        biased;
        _ = self.closed.cancelled() => None,
        connecting = self.endpoint.accept() => connecting,
      }
      .ok_or(ListenError::Closed)?;
      let remote = connecting.remote_address();
      match connecting.await {
        Ok(connection) => {
          let session = QuinnSession::from_endpoint(connection, &self.endpoint);
          return Ok(Connection::new(session));
        }
        Err(error) => {
          tracing::debug!(%remote, %error, "Skipping peer that failed its handshake");
        }
      }
    }
  }

  /// As [Listener::accept], failing with [ListenError::Cancelled] if `cancel` fires first.
  ///
  /// A handshake in progress when `cancel` fires is abandoned.
  pub async fn accept_with_cancellation(
    &self,
    cancel: &CancellationToken,
  ) -> Result<Connection, ListenError> {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(ListenError::Cancelled),
      accepted = self.accept() => accepted,
    }
  }

  /// Accepted connections, ending when the listener closes
  pub fn incoming(&self) -> BoxStream<'_, Connection> {
    futures::stream::unfold(self, |listener| async move {
      match listener.accept().await {
        Ok(connection) => Some((connection, listener)),
        Err(error) => {
          tracing::trace!(%error, "Incoming connection stream ended");
          None
        }
      }
    })
    .boxed()
  }

  /// Stops accepting new connections; established connections are unaffected
  pub fn close(&self) {
    self.endpoint.set_server_config(None);
    self.closed.cancel();
  }

  pub fn is_closed(&self) -> bool {
    self.closed.is_cancelled()
  }

  /// Waits until every connection on the endpoint has been closed and drained
  pub async fn wait_idle(&self) {
    self.endpoint.wait_idle().await
  }
}
