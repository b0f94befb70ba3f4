// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Ownership of a transport session and coordination of its streams
//!
//! A [Connection] starts multiplexing inbound streams as soon as it is
//! built. Outbound streams are opened directly against the session.

use std::{
  net::SocketAddr,
  sync::{Arc, Weak},
};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  error::{AcceptError, SessionError},
  multiplexer::{InboundMultiplexer, InboundStreams},
  session::Session,
  stream::DirectionalStream,
  util::shutdown::ShutdownSignal,
};

mod id;
pub use self::id::{ConnectionId, MonotonicAtomicGenerator};

/// Application close code used by [Connection::close]
pub const DEFAULT_CLOSE_CODE: u64 = 0;
/// Reason sent to the peer by [Connection::close]
pub const DEFAULT_CLOSE_MESSAGE: &str = "closed";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
  /// Accepting and opening streams
  Open,
  /// Shutdown was requested but inbound multiplexing has not yet stopped
  Closing,
  /// Inbound multiplexing has stopped and its terminal error is final
  Closed,
}

pub(crate) struct ConnectionInner {
  id: ConnectionId,
  session: Arc<dyn Session>,
  inbound: InboundStreams,
  shutdown: ShutdownSignal,
}

impl ConnectionInner {
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.session.local_addr()
  }

  pub fn remote_addr(&self) -> SocketAddr {
    self.session.remote_addr()
  }
}

impl Drop for ConnectionInner {
  fn drop(&mut self) {
    // Stops the multiplexer task, which holds the last other session handle
    if self.shutdown.raise() {
      tracing::trace!(id = %self.id, "Connection dropped without being closed");
    }
  }
}

/// An established session to a peer, shared between clones of this handle
///
/// Must be created within a tokio runtime, as inbound stream multiplexing
/// runs as a background task for the lifetime of the connection.
#[derive(Clone)]
pub struct Connection {
  inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("id", &self.inner.id)
      .field("remote_addr", &self.inner.remote_addr())
      .field("state", &self.state())
      .finish_non_exhaustive()
  }
}

impl Connection {
  pub fn new<S: Session>(session: S) -> Self {
    Self::from_session(Arc::new(session))
  }

  pub fn from_session(session: Arc<dyn Session>) -> Self {
    let id = ConnectionId::next();
    let remote = session.remote_addr();
    let shutdown = ShutdownSignal::new();
    let shutdown_listener = shutdown.listener();

    let mut multiplexer = None;
    let inner = Arc::new_cyclic(|connection: &Weak<ConnectionInner>| {
      let (created, inbound) =
        InboundMultiplexer::new(session.clone(), connection.clone(), shutdown_listener);
      multiplexer = Some(created);
      ConnectionInner {
        id,
        session,
        inbound,
        shutdown,
      }
    });
    if let Some(multiplexer) = multiplexer {
      tokio::task::spawn(
        multiplexer
          .run()
          .instrument(tracing::debug_span!("connection", %id, %remote)),
      );
    }
    tracing::trace!(%id, %remote, "Connection established");
    Self { inner }
  }

  pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
    Self { inner }
  }

  pub fn id(&self) -> ConnectionId {
    self.inner.id
  }

  /// The underlying transport session; closing it directly bypasses this connection's shutdown
  pub fn session(&self) -> &Arc<dyn Session> {
    &self.inner.session
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.inner.local_addr()
  }

  pub fn remote_addr(&self) -> SocketAddr {
    self.inner.remote_addr()
  }

  pub fn state(&self) -> ConnectionState {
    if self.inner.inbound.is_drained() {
      ConnectionState::Closed
    } else if self.inner.shutdown.is_raised() {
      ConnectionState::Closing
    } else {
      ConnectionState::Open
    }
  }

  /// Waits for the next peer-initiated stream, bidirectional or receive-only.
  ///
  /// Dropping the returned future never discards a stream; it remains queued
  /// for the next caller. Once inbound multiplexing has stopped, every call
  /// returns the same [AcceptError::Terminated] immediately.
  pub async fn accept_stream(&self) -> Result<DirectionalStream, AcceptError> {
    self.inner.inbound.next().await
  }

  /// As [Connection::accept_stream], failing with [AcceptError::Cancelled]
  /// if `cancel` fires first. Only this caller is affected by the cancellation.
  pub async fn accept_stream_with_cancellation(
    &self,
    cancel: &CancellationToken,
  ) -> Result<DirectionalStream, AcceptError> {
    self.inner.inbound.next_with_cancellation(cancel).await
  }

  /// Opens an outbound stream; send-only when `unidirectional`, otherwise bidirectional
  pub async fn open_stream(&self, unidirectional: bool) -> Result<DirectionalStream, SessionError> {
    let connection = Arc::downgrade(&self.inner);
    if unidirectional {
      let send = self.inner.session.open_uni().await?;
      Ok(DirectionalStream::send_only(connection, send))
    } else {
      let (send, recv) = self.inner.session.open_bi().await?;
      Ok(DirectionalStream::bidirectional(connection, send, recv))
    }
  }

  /// Closes with [DEFAULT_CLOSE_CODE] and [DEFAULT_CLOSE_MESSAGE]
  pub fn close(&self) -> Result<(), SessionError> {
    self.close_with_error(DEFAULT_CLOSE_CODE, DEFAULT_CLOSE_MESSAGE)
  }

  /// Stops inbound multiplexing and closes the session with an application-defined code.
  ///
  /// Safe to call any number of times from any number of tasks. Every call
  /// is forwarded to the session, so repeated closes report whatever the
  /// session reports. Multiplexing stops with the first close the session
  /// accepts; a rejected close leaves the connection open.
  pub fn close_with_error(&self, code: u64, message: &str) -> Result<(), SessionError> {
    self.inner.session.close(code, message.as_bytes())?;
    if self.inner.shutdown.raise() {
      tracing::trace!(id = %self.inner.id, code, reason = message, "Connection shutdown raised");
    }
    Ok(())
  }

  /// Resolves once inbound multiplexing has stopped, with the error that stopped it
  pub async fn closed(&self) -> Option<SessionError> {
    self.inner.inbound.drained().await.session_error().cloned()
  }

  pub async fn read_datagram(&self) -> Result<Bytes, SessionError> {
    self.inner.session.read_datagram().await
  }

  pub fn write_datagram(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
    self.inner.session.send_datagram(data.into())
  }

  /// If both peers negotiated unreliable datagram support
  pub fn supports_datagrams(&self) -> bool {
    self.inner.session.supports_datagrams()
  }
}
