// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Transport, TLS, and credential configuration shared by dialers and listeners

use std::{path::Path, time::Duration};

use crate::error::ConfigError;

/// Transport parameters applied to every connection of a dialer or listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
  pub keep_alive_interval: Option<Duration>,
  pub max_idle_timeout: Option<Duration>,
  /// Whether to accept unreliable datagrams; peers must both enable them
  pub datagrams: bool,
  pub max_concurrent_bidi_streams: u32,
  pub max_concurrent_uni_streams: u32,
}

impl Default for TransportSettings {
  fn default() -> Self {
    Self {
      keep_alive_interval: Some(Duration::from_secs(5)),
      max_idle_timeout: Some(Duration::from_secs(30)),
      datagrams: true,
      max_concurrent_bidi_streams: 100,
      max_concurrent_uni_streams: 100,
    }
  }
}

impl TransportSettings {
  pub fn to_transport_config(&self) -> Result<quinn::TransportConfig, ConfigError> {
    let max_idle_timeout = self
      .max_idle_timeout
      .map(quinn::IdleTimeout::try_from)
      .transpose()
      .map_err(|e| ConfigError::InvalidTransport(format!("max idle timeout: {}", e)))?;

    let mut transport = quinn::TransportConfig::default();
    transport
      .keep_alive_interval(self.keep_alive_interval)
      .max_idle_timeout(max_idle_timeout)
      .max_concurrent_bidi_streams(self.max_concurrent_bidi_streams.into())
      .max_concurrent_uni_streams(self.max_concurrent_uni_streams.into());
    if !self.datagrams {
      transport.datagram_receive_buffer_size(None);
    }
    Ok(transport)
  }
}

/// Builds the ALPN list for a handshake, placing `protocol` ahead of any preconfigured entries
///
/// Fails with [ConfigError::NoProtocol] if the resulting list would be empty.
pub fn alpn_protocols(
  protocol: Option<&str>,
  preconfigured: &[Vec<u8>],
) -> Result<Vec<Vec<u8>>, ConfigError> {
  let protocols: Vec<Vec<u8>> = protocol
    .filter(|p| !p.is_empty())
    .map(|p| p.as_bytes().to_vec())
    .into_iter()
    .chain(preconfigured.iter().cloned())
    .collect();
  if protocols.is_empty() {
    return Err(ConfigError::NoProtocol);
  }
  Ok(protocols)
}

/// Trust roots from the platform certificate store
pub fn native_root_certificates() -> Result<rustls::RootCertStore, ConfigError> {
  let native = rustls_native_certs::load_native_certs()?;
  let mut roots = rustls::RootCertStore::empty();
  let (added, ignored) =
    roots.add_parsable_certificates(&native.into_iter().map(|c| c.0).collect::<Vec<_>>());
  tracing::trace!(added, ignored, "Loaded native root certificates");
  Ok(roots)
}

pub fn parse_certificate_chain(pem: &[u8]) -> Result<Vec<rustls::Certificate>, ConfigError> {
  let chain = rustls_pemfile::certs(&mut &pem[..])?;
  if chain.is_empty() {
    return Err(ConfigError::Pem("no certificates found".into()));
  }
  Ok(chain.into_iter().map(rustls::Certificate).collect())
}

/// Parses the first PKCS#8, PKCS#1 (RSA), or SEC1 (EC) private key in `pem`
pub fn parse_private_key(pem: &[u8]) -> Result<rustls::PrivateKey, ConfigError> {
  let mut reader = &pem[..];
  loop {
    match rustls_pemfile::read_one(&mut reader)? {
      Some(rustls_pemfile::Item::PKCS8Key(key))
      | Some(rustls_pemfile::Item::RSAKey(key))
      | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
      Some(_) => continue,
      None => return Err(ConfigError::Pem("no private key found".into())),
    }
  }
}

pub fn load_certificate_chain<P: AsRef<Path>>(
  path: P,
) -> Result<Vec<rustls::Certificate>, ConfigError> {
  parse_certificate_chain(&std::fs::read(path)?)
}

pub fn load_private_key<P: AsRef<Path>>(path: P) -> Result<rustls::PrivateKey, ConfigError> {
  parse_private_key(&std::fs::read(path)?)
}
