// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The seam between quicmux and the transport engine providing streams

use std::net::SocketAddr;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SessionError;

pub mod duplex;
pub mod quinn_session;

pub use self::quinn_session::QuinnSession;

/// The send half of a transport stream; shutting it down signals end-of-stream to the peer
pub type SendHalf = Box<dyn AsyncWrite + Send + Unpin + 'static>;
/// The receive half of a transport stream
pub type RecvHalf = Box<dyn AsyncRead + Send + Unpin + 'static>;

/// An established, multiplexed session with a peer.
///
/// Implementations must tolerate concurrent calls to every method; the
/// connection layer adds no serialization of its own.
#[cfg_attr(test, mockall::automock)]
pub trait Session: Send + Sync + 'static {
  /// Waits for the peer to open a bidirectional stream
  fn accept_bi(&self) -> BoxFuture<'static, Result<(SendHalf, RecvHalf), SessionError>>;

  /// Waits for the peer to open a stream that only it may send on
  fn accept_uni(&self) -> BoxFuture<'static, Result<RecvHalf, SessionError>>;

  fn open_bi(&self) -> BoxFuture<'static, Result<(SendHalf, RecvHalf), SessionError>>;

  fn open_uni(&self) -> BoxFuture<'static, Result<SendHalf, SessionError>>;

  /// Closes the session with an application-defined code and reason.
  ///
  /// Repeated calls are permitted; whether they fail is up to the transport.
  fn close(&self, code: u64, reason: &[u8]) -> Result<(), SessionError>;

  fn local_addr(&self) -> Option<SocketAddr>;

  fn remote_addr(&self) -> SocketAddr;

  fn read_datagram(&self) -> BoxFuture<'static, Result<Bytes, SessionError>>;

  fn send_datagram(&self, data: Bytes) -> Result<(), SessionError>;

  /// If both peers negotiated unreliable datagram support
  fn supports_datagrams(&self) -> bool;
}
