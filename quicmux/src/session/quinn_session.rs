// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![forbid(unused_imports, dead_code)]
use std::net::SocketAddr;

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt, TryFutureExt};

use crate::{
  error::SessionError,
  session::{RecvHalf, SendHalf, Session},
};

/// A [Session] backed by a quinn connection
#[derive(Debug, Clone)]
pub struct QuinnSession {
  connection: quinn::Connection,
  local_addr: Option<SocketAddr>,
}

impl QuinnSession {
  pub fn new(connection: quinn::Connection, local_addr: Option<SocketAddr>) -> Self {
    Self {
      connection,
      local_addr,
    }
  }

  /// Wraps a connection produced by `endpoint`, recording the endpoint's bound address
  pub fn from_endpoint(connection: quinn::Connection, endpoint: &quinn::Endpoint) -> Self {
    Self::new(connection, endpoint.local_addr().ok())
  }

  pub fn connection(&self) -> &quinn::Connection {
    &self.connection
  }

  pub fn into_inner(self) -> quinn::Connection {
    self.connection
  }
}

fn box_bi((send, recv): (quinn::SendStream, quinn::RecvStream)) -> (SendHalf, RecvHalf) {
  (Box::new(send), Box::new(recv))
}

impl Session for QuinnSession {
  fn accept_bi(&self) -> BoxFuture<'static, Result<(SendHalf, RecvHalf), SessionError>> {
    let connection = self.connection.clone();
    async move { connection.accept_bi().await }
      .map_ok(box_bi)
      .map_err(Into::into)
      .boxed()
  }

  fn accept_uni(&self) -> BoxFuture<'static, Result<RecvHalf, SessionError>> {
    let connection = self.connection.clone();
    async move { connection.accept_uni().await }
      .map_ok(|recv| Box::new(recv) as RecvHalf)
      .map_err(Into::into)
      .boxed()
  }

  fn open_bi(&self) -> BoxFuture<'static, Result<(SendHalf, RecvHalf), SessionError>> {
    let connection = self.connection.clone();
    async move { connection.open_bi().await }
      .map_ok(box_bi)
      .map_err(Into::into)
      .boxed()
  }

  fn open_uni(&self) -> BoxFuture<'static, Result<SendHalf, SessionError>> {
    let connection = self.connection.clone();
    async move { connection.open_uni().await }
      .map_ok(|send| Box::new(send) as SendHalf)
      .map_err(Into::into)
      .boxed()
  }

  fn close(&self, code: u64, reason: &[u8]) -> Result<(), SessionError> {
    let code = quinn::VarInt::from_u64(code).map_err(|_| SessionError::InvalidCloseCode(code))?;
    self.connection.close(code, reason);
    Ok(())
  }

  fn local_addr(&self) -> Option<SocketAddr> {
    self.local_addr
  }

  fn remote_addr(&self) -> SocketAddr {
    self.connection.remote_address()
  }

  fn read_datagram(&self) -> BoxFuture<'static, Result<Bytes, SessionError>> {
    let connection = self.connection.clone();
    async move { connection.read_datagram().await }
      .map_err(Into::into)
      .boxed()
  }

  fn send_datagram(&self, data: Bytes) -> Result<(), SessionError> {
    self.connection.send_datagram(data).map_err(Into::into)
  }

  fn supports_datagrams(&self) -> bool {
    self.connection.max_datagram_size().is_some()
  }
}
