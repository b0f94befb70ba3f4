// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Streams whose send and receive capabilities are fixed when they are created
use std::{
  future::Future,
  io::Error as IOError,
  net::SocketAddr,
  pin::Pin,
  sync::Weak,
  task::{Context, Poll},
};

use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
  time::{Instant, Sleep},
};

use crate::{
  connection::{Connection, ConnectionInner},
  error::StreamError,
  session::{RecvHalf, SendHalf},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StreamDirection {
  Bidirectional,
  SendOnly,
  ReceiveOnly,
}

/// An absolute point in time after which an operation fails
#[derive(Default)]
struct Deadline {
  at: Option<Instant>,
  timer: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
  fn set(&mut self, at: Option<Instant>) {
    self.at = at;
    self.timer = None;
  }

  /// Registers for wakeup at the deadline; returns `true` once it has passed
  fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
    let at = match self.at {
      Some(at) => at,
      None => return false,
    };
    if Instant::now() >= at {
      return true;
    }
    let timer = self
      .timer
      .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(at)));
    timer.as_mut().poll(cx).is_ready()
  }
}

/// A logical stream within a [Connection] that may be bidirectional,
/// send-only, or receive-only.
///
/// Operations needing a capability the stream lacks fail with
/// [StreamError::WriteOnly] or [StreamError::ReadOnly] instead of reaching
/// the transport. Through the `AsyncRead`/`AsyncWrite` traits the same
/// failures surface as [std::io::ErrorKind::Unsupported].
pub struct DirectionalStream {
  connection: Weak<ConnectionInner>,
  send: Option<SendHalf>,
  recv: Option<RecvHalf>,
  read_deadline: Deadline,
  write_deadline: Deadline,
}

impl std::fmt::Debug for DirectionalStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DirectionalStream")
      .field("direction", &self.direction())
      .field("read_deadline", &self.read_deadline.at)
      .field("write_deadline", &self.write_deadline.at)
      .finish_non_exhaustive()
  }
}

impl DirectionalStream {
  pub(crate) fn bidirectional(
    connection: Weak<ConnectionInner>,
    send: SendHalf,
    recv: RecvHalf,
  ) -> Self {
    Self::from_halves(connection, Some(send), Some(recv))
  }

  pub(crate) fn send_only(connection: Weak<ConnectionInner>, send: SendHalf) -> Self {
    Self::from_halves(connection, Some(send), None)
  }

  pub(crate) fn receive_only(connection: Weak<ConnectionInner>, recv: RecvHalf) -> Self {
    Self::from_halves(connection, None, Some(recv))
  }

  fn from_halves(
    connection: Weak<ConnectionInner>,
    send: Option<SendHalf>,
    recv: Option<RecvHalf>,
  ) -> Self {
    Self {
      connection,
      send,
      recv,
      read_deadline: Deadline::default(),
      write_deadline: Deadline::default(),
    }
  }

  /// The connection this stream belongs to, if it is still alive
  pub fn connection(&self) -> Option<Connection> {
    self.connection.upgrade().map(Connection::from_inner)
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.connection.upgrade().and_then(|c| c.local_addr())
  }

  pub fn remote_addr(&self) -> Option<SocketAddr> {
    self.connection.upgrade().map(|c| c.remote_addr())
  }

  pub fn can_send(&self) -> bool {
    self.send.is_some()
  }

  pub fn can_receive(&self) -> bool {
    self.recv.is_some()
  }

  pub fn direction(&self) -> StreamDirection {
    match (self.can_send(), self.can_receive()) {
      (true, true) => StreamDirection::Bidirectional,
      (true, false) => StreamDirection::SendOnly,
      _ => StreamDirection::ReceiveOnly,
    }
  }

  /// Reads into `buf`, returning 0 once the peer has finished sending
  pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
    if !self.can_receive() {
      return Err(StreamError::WriteOnly);
    }
    AsyncReadExt::read(self, buf).await.map_err(Into::into)
  }

  pub async fn write(&mut self, data: &[u8]) -> Result<usize, StreamError> {
    if !self.can_send() {
      return Err(StreamError::ReadOnly);
    }
    AsyncWriteExt::write(self, data).await.map_err(Into::into)
  }

  /// Finishes the send side, signalling end-of-stream to the peer.
  ///
  /// Receive-only streams have nothing to finish, so this is a no-op for them.
  pub async fn close(&mut self) -> Result<(), StreamError> {
    if !self.can_send() {
      return Ok(());
    }
    AsyncWriteExt::shutdown(self).await.map_err(Into::into)
  }

  /// Sets both read and write deadlines; only valid on bidirectional streams.
  ///
  /// `None` clears the deadlines.
  pub fn set_deadline(&mut self, deadline: Option<Instant>) -> Result<(), StreamError> {
    if !self.can_send() {
      return Err(StreamError::ReadOnly);
    }
    if !self.can_receive() {
      return Err(StreamError::WriteOnly);
    }
    self.read_deadline.set(deadline);
    self.write_deadline.set(deadline);
    Ok(())
  }

  pub fn set_read_deadline(&mut self, deadline: Option<Instant>) -> Result<(), StreamError> {
    if !self.can_receive() {
      return Err(StreamError::WriteOnly);
    }
    self.read_deadline.set(deadline);
    Ok(())
  }

  pub fn set_write_deadline(&mut self, deadline: Option<Instant>) -> Result<(), StreamError> {
    if !self.can_send() {
      return Err(StreamError::ReadOnly);
    }
    self.write_deadline.set(deadline);
    Ok(())
  }

  /// Releases the underlying transport halves
  pub fn into_parts(self) -> (Option<SendHalf>, Option<RecvHalf>) {
    (self.send, self.recv)
  }
}

impl AsyncRead for DirectionalStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = self.get_mut();
    let recv = match this.recv.as_mut() {
      Some(recv) => recv,
      None => return Poll::Ready(Err(StreamError::WriteOnly.into_io())),
    };
    if this.read_deadline.poll_expired(cx) {
      return Poll::Ready(Err(StreamError::DeadlineExceeded.into_io()));
    }
    AsyncRead::poll_read(Pin::new(recv), cx, buf)
  }
}

impl AsyncWrite for DirectionalStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    let this = self.get_mut();
    let send = match this.send.as_mut() {
      Some(send) => send,
      None => return Poll::Ready(Err(StreamError::ReadOnly.into_io())),
    };
    if this.write_deadline.poll_expired(cx) {
      return Poll::Ready(Err(StreamError::DeadlineExceeded.into_io()));
    }
    AsyncWrite::poll_write(Pin::new(send), cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    let this = self.get_mut();
    let send = match this.send.as_mut() {
      Some(send) => send,
      None => return Poll::Ready(Ok(())),
    };
    if this.write_deadline.poll_expired(cx) {
      return Poll::Ready(Err(StreamError::DeadlineExceeded.into_io()));
    }
    AsyncWrite::poll_flush(Pin::new(send), cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    let this = self.get_mut();
    let send = match this.send.as_mut() {
      Some(send) => send,
      // Only the writer may signal end-of-stream
      None => return Poll::Ready(Ok(())),
    };
    if this.write_deadline.poll_expired(cx) {
      return Poll::Ready(Err(StreamError::DeadlineExceeded.into_io()));
    }
    AsyncWrite::poll_shutdown(Pin::new(send), cx)
  }
}
