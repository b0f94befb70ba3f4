// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Outbound QUIC connections

use std::{
  net::{Ipv4Addr, Ipv6Addr, SocketAddr},
  sync::Arc,
};

use crate::{
  config::{alpn_protocols, native_root_certificates, TransportSettings},
  connection::Connection,
  error::{ConfigError, DialError},
  session::QuinnSession,
};

/// Options for connecting to a peer
///
/// Methods may be called concurrently, but not while fields are being modified.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
  /// TLS configuration; platform trust roots are used when absent
  pub tls_config: Option<rustls::ClientConfig>,
  pub transport: TransportSettings,
  /// Placed first in the ALPN list; required unless `tls_config` already lists protocols
  pub protocol: Option<String>,
  /// Local address for endpoints created by [Dialer::dial]; unspecified by default
  pub bind_addr: Option<SocketAddr>,
}

impl Dialer {
  pub fn new<P: Into<String>>(protocol: P) -> Self {
    Self {
      protocol: Some(protocol.into()),
      ..Default::default()
    }
  }

  pub fn client_config(&self) -> Result<quinn::ClientConfig, ConfigError> {
    let preconfigured = self
      .tls_config
      .as_ref()
      .map(|tls| tls.alpn_protocols.clone())
      .unwrap_or_default();
    let alpn_protocols = alpn_protocols(self.protocol.as_deref(), &preconfigured)?;

    let mut crypto = match &self.tls_config {
      Some(tls) => tls.clone(),
      None => rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(native_root_certificates()?)
        .with_no_client_auth(),
    };
    crypto.alpn_protocols = alpn_protocols;

    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(self.transport.to_transport_config()?));
    Ok(config)
  }

  /// Connects to `addr` from a new endpoint, verifying the peer as `server_name`
  pub async fn dial(&self, addr: SocketAddr, server_name: &str) -> Result<Connection, DialError> {
    let config = self.client_config()?;
    let bind_addr = self.bind_addr.unwrap_or_else(|| unspecified_for(&addr));
    let endpoint = quinn::Endpoint::client(bind_addr)?;
    self.connect(&endpoint, config, addr, server_name).await
  }

  /// Resolves a `host:port` pair and connects to its first address, using `host` as the server name
  pub async fn dial_host(&self, host: &str) -> Result<Connection, DialError> {
    let server_name = server_name_of(host);
    let addr = tokio::net::lookup_host(host)
      .await
      .map_err(|e| DialError::Resolve(format!("{}: {}", host, e)))?
      .next()
      .ok_or_else(|| DialError::Resolve(host.to_string()))?;
    tracing::trace!(host, %addr, "Resolved dial target");
    self.dial(addr, server_name).await
  }

  /// Connects through an existing endpoint, sharing its socket with other connections
  pub async fn client(
    &self,
    endpoint: &quinn::Endpoint,
    addr: SocketAddr,
    server_name: &str,
  ) -> Result<Connection, DialError> {
    let config = self.client_config()?;
    self.connect(endpoint, config, addr, server_name).await
  }

  async fn connect(
    &self,
    endpoint: &quinn::Endpoint,
    config: quinn::ClientConfig,
    addr: SocketAddr,
    server_name: &str,
  ) -> Result<Connection, DialError> {
    let connection = endpoint
      .connect_with(config, addr, server_name)?
      .await
      .map_err(|e| DialError::Handshake(e.into()))?;
    tracing::debug!(%addr, server_name, "Connected");
    Ok(Connection::new(QuinnSession::from_endpoint(
      connection, endpoint,
    )))
  }
}

/// Resolves `host` and connects to it, negotiating `protocol`
pub async fn dial(protocol: &str, host: &str) -> Result<Connection, DialError> {
  Dialer::new(protocol).dial_host(host).await
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
  match addr {
    SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
    SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
  }
}

/// The host portion of `host:port`, without IPv6 brackets
fn server_name_of(host: &str) -> &str {
  let name = match host.rsplit_once(':') {
    Some((name, port)) if port.parse::<u16>().is_ok() => name,
    _ => host,
  };
  name.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
  use std::net::SocketAddr;

  use super::{server_name_of, unspecified_for, Dialer};
  use crate::error::{ConfigError, DialError};

  #[test]
  fn server_names() {
    assert_eq!(server_name_of("example.com:443"), "example.com");
    assert_eq!(server_name_of("[::1]:4433"), "::1");
    assert_eq!(server_name_of("localhost"), "localhost");
  }

  #[test]
  fn unspecified_bind_matches_family() {
    let v4: SocketAddr = "192.0.2.1:443".parse().unwrap();
    let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
    assert!(unspecified_for(&v4).is_ipv4());
    assert!(unspecified_for(&v6).is_ipv6());
    assert_eq!(unspecified_for(&v6).port(), 0);
  }

  #[tokio::test]
  async fn missing_protocol_fails_before_connecting() {
    let dialer = Dialer::default();
    let result = dialer
      .dial("127.0.0.1:9".parse().unwrap(), "localhost")
      .await;
    assert!(matches!(
      result,
      Err(DialError::Config(ConfigError::NoProtocol))
    ));
  }
}
