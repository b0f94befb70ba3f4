// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::net::SocketAddr;
use std::path::Path;

/// Longest protocol identifier representable in a TLS ALPN extension
const MAX_PROTOCOL_LENGTH: usize = 255;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).is_file() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  v.to_socket_addrs()
    .with_context(|| format!("Failed resolving {}", v))?
    .next()
    .context("No addresses were resolved from the given host")
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| format!("{:#}", e))
}

pub fn validate_protocol(v: &str) -> Result<(), String> {
  match v.len() {
    0 => Err(String::from("A protocol identifier must not be empty")),
    n if n > MAX_PROTOCOL_LENGTH => Err(format!(
      "Protocol identifiers are limited to {} bytes",
      MAX_PROTOCOL_LENGTH
    )),
    _ => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use super::{parse_socketaddr, validate_existing_file, validate_protocol, validate_socketaddr};

  #[test]
  fn socket_addresses() {
    assert_eq!(
      parse_socketaddr("127.0.0.1:4433").unwrap(),
      "127.0.0.1:4433".parse().unwrap()
    );
    assert!(validate_socketaddr("127.0.0.1").is_err());
    assert!(validate_socketaddr("[::1]:4433").is_ok());
  }

  #[test]
  fn protocols() {
    assert!(validate_protocol("quicmux-echo").is_ok());
    assert!(validate_protocol("").is_err());
    assert!(validate_protocol(&"p".repeat(256)).is_err());
  }

  #[test]
  fn files() {
    let manifest = concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml");
    assert!(validate_existing_file(manifest).is_ok());
    assert!(validate_existing_file("/definitely/not/a/real/file.pem").is_err());
    assert!(validate_existing_file(&std::env::temp_dir().to_string_lossy()).is_err());
  }
}
