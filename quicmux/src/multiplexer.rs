// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Merges peer-initiated bidirectional and receive-only streams into one queue
//!
//! Two acceptance loops run against the same session and hand their streams
//! to a single bounded queue. A loop only accepts from the session while some
//! caller is waiting for a stream, so unclaimed streams stay with the
//! transport. When either loop fails, both stop; the first failure becomes
//! the terminal error, which is recorded before the queue is closed so that
//! any consumer observing the closed queue can read it.

use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch, Mutex, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
  connection::ConnectionInner,
  error::{AcceptError, SessionError},
  session::Session,
  stream::DirectionalStream,
  util::shutdown::ShutdownListener,
};

/// Streams accepted ahead of the consumer; acceptance stalls once this many are waiting
///
/// Streams are only accepted on behalf of a waiting caller, so the queue holds
/// one only when a caller gives up between acceptance and delivery.
pub const DELIVERY_QUEUE_DEPTH: usize = 1;

/// The producing half: owns the acceptance loops and the only queue sender
pub(crate) struct InboundMultiplexer {
  session: Arc<dyn Session>,
  connection: Weak<ConnectionInner>,
  delivery: mpsc::Sender<DirectionalStream>,
  demand: watch::Receiver<usize>,
  terminal: Arc<RwLock<Option<SessionError>>>,
  shutdown: ShutdownListener,
  drained: CancellationToken,
}

/// The consuming half, shared by every caller accepting on a connection
pub(crate) struct InboundStreams {
  queue: Mutex<mpsc::Receiver<DirectionalStream>>,
  /// Count of callers currently waiting in [InboundStreams::next]
  demand: watch::Sender<usize>,
  terminal: Arc<RwLock<Option<SessionError>>>,
  drained: CancellationToken,
}

/// Registers a waiting caller for as long as it is held
struct Demand<'a>(&'a watch::Sender<usize>);

impl<'a> Demand<'a> {
  fn register(demand: &'a watch::Sender<usize>) -> Self {
    demand.send_modify(|waiting| *waiting += 1);
    Self(demand)
  }
}

impl Drop for Demand<'_> {
  fn drop(&mut self) {
    self.0.send_modify(|waiting| *waiting = waiting.saturating_sub(1));
  }
}

/// Waits until some caller wants a stream; `false` once every caller is gone
async fn wait_for_demand(demand: &mut watch::Receiver<usize>) -> bool {
  loop {
    if *demand.borrow_and_update() > 0 {
      return true;
    }
    if demand.changed().await.is_err() {
      return false;
    }
  }
}

impl InboundMultiplexer {
  pub fn new(
    session: Arc<dyn Session>,
    connection: Weak<ConnectionInner>,
    shutdown: ShutdownListener,
  ) -> (Self, InboundStreams) {
    let (delivery, queue) = mpsc::channel(DELIVERY_QUEUE_DEPTH);
    let (demand, waiting) = watch::channel(0);
    let terminal = Arc::new(RwLock::new(None));
    let drained = CancellationToken::new();
    let multiplexer = Self {
      session,
      connection,
      delivery,
      demand: waiting,
      terminal: terminal.clone(),
      shutdown,
      drained: drained.clone(),
    };
    let streams = InboundStreams {
      queue: Mutex::new(queue),
      demand,
      terminal,
      drained,
    };
    (multiplexer, streams)
  }

  /// Accepts streams until either loop fails or shutdown is requested
  pub async fn run(self) {
    let group = self.shutdown.child_token();
    let first_error = OnceCell::new();

    let bidirectional = self.accept_loop(
      "bidirectional",
      &group,
      &first_error,
      |session| session.accept_bi(),
      |connection, (send, recv)| DirectionalStream::bidirectional(connection, send, recv),
    );
    let receive_only = self.accept_loop(
      "receive-only",
      &group,
      &first_error,
      |session| session.accept_uni(),
      DirectionalStream::receive_only,
    );
    tokio::join!(bidirectional, receive_only);

    let terminal_error = first_error.into_inner();
    tracing::debug!(error = ?terminal_error, "Inbound stream multiplexing terminated");
    *self.terminal.write().await = terminal_error;

    let Self {
      delivery, drained, ..
    } = self;
    // Consumers observing the closed queue may now read the terminal error
    drop(delivery);
    drained.cancel();
  }

  async fn accept_loop<T, Accept, Wrap>(
    &self,
    class: &'static str,
    group: &CancellationToken,
    first_error: &OnceCell<SessionError>,
    accept: Accept,
    wrap: Wrap,
  ) where
    Accept: Fn(&dyn Session) -> BoxFuture<'static, Result<T, SessionError>>,
    Wrap: Fn(Weak<ConnectionInner>, T) -> DirectionalStream,
  {
    let mut demand = self.demand.clone();
    let error = loop {
      tokio::select! {
        biased;
        _ = group.cancelled() => break SessionError::LocallyClosed,
        wanted = wait_for_demand(&mut demand) => {
          if !wanted {
            // Every consumer is gone
            break SessionError::LocallyClosed;
          }
        }
      }
      let accepted = tokio::select! {
        biased;
        _ = group.cancelled() => break SessionError::LocallyClosed,
        accepted = accept(&*self.session) => accepted,
      };
      let stream = match accepted {
        Ok(raw) => wrap(self.connection.clone(), raw),
        Err(e) => break e,
      };
      tokio::select! {
        biased;
        _ = group.cancelled() => break SessionError::LocallyClosed,
        delivered = self.delivery.send(stream) => {
          if delivered.is_err() {
            // Every consumer is gone
            break SessionError::LocallyClosed;
          }
        }
      }
      tracing::trace!(class, "Delivered inbound stream");
    };
    tracing::debug!(class, error = %error, "Inbound acceptance loop stopped");
    if first_error.set(error).is_ok() {
      group.cancel();
    }
  }
}

impl InboundStreams {
  /// Waits for the next inbound stream of either class.
  ///
  /// Cancel-safe: dropping the future never loses a queued stream.
  pub async fn next(&self) -> Result<DirectionalStream, AcceptError> {
    let _demand = Demand::register(&self.demand);
    let mut queue = self.queue.lock().await;
    match queue.recv().await {
      Some(stream) => Ok(stream),
      None => Err(self.terminal_error().await),
    }
  }

  pub async fn next_with_cancellation(
    &self,
    cancel: &CancellationToken,
  ) -> Result<DirectionalStream, AcceptError> {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(AcceptError::Cancelled),
      next = self.next() => next,
    }
  }

  /// The error that ended multiplexing, as reported to accepting callers
  pub async fn terminal_error(&self) -> AcceptError {
    match self.terminal.read().await.as_ref() {
      Some(e) => AcceptError::Terminated(e.clone()),
      None => AcceptError::Closed,
    }
  }

  /// If both acceptance loops have stopped and the queue is closed
  pub fn is_drained(&self) -> bool {
    self.drained.is_cancelled()
  }

  pub async fn drained(&self) -> AcceptError {
    self.drained.cancelled().await;
    self.terminal_error().await
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc, Weak,
    },
    time::Duration,
  };

  use futures::FutureExt;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio_util::sync::CancellationToken;

  use super::{InboundMultiplexer, InboundStreams, DELIVERY_QUEUE_DEPTH};
  use crate::{
    error::{AcceptError, SessionError},
    session::{duplex, MockSession, RecvHalf, SendHalf, Session},
    stream::StreamDirection,
    util::shutdown::ShutdownSignal,
  };

  fn start(session: Arc<dyn Session>) -> (ShutdownSignal, InboundStreams) {
    let shutdown = ShutdownSignal::new();
    let (multiplexer, streams) = InboundMultiplexer::new(session, Weak::new(), shutdown.listener());
    tokio::task::spawn(multiplexer.run());
    (shutdown, streams)
  }

  #[tokio::test]
  async fn delivers_every_stream_preserving_per_class_order() {
    const PER_CLASS: u8 = 4;
    let fut = async move {
      let duplex::EntangledSessions {
        listener,
        connector,
      } = duplex::channel();
      let (_shutdown, streams) = start(Arc::new(listener));

      for i in 0..PER_CLASS {
        let (mut send, _recv) = connector.open_bi().await.unwrap();
        send.write_all(&[i]).await.unwrap();
        send.shutdown().await.unwrap();
        let mut send = connector.open_uni().await.unwrap();
        send.write_all(&[i]).await.unwrap();
        send.shutdown().await.unwrap();
      }

      let (mut bidirectional, mut receive_only) = (Vec::new(), Vec::new());
      for _ in 0..(PER_CLASS * 2) {
        let mut stream = streams.next().await.unwrap();
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

      // Nothing further is queued
      assert!(tokio::time::timeout(Duration::from_millis(50), streams.next())
        .await
        .is_err());
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("Multiplexer may be deadlocked");
  }

  #[tokio::test]
  async fn transport_failure_is_terminal_and_replayed() {
    let mut session = MockSession::new();
    session
      .expect_accept_bi()
      .times(1)
      .returning(|| futures::future::ready(Err(SessionError::Reset)).boxed());
    session
      .expect_accept_uni()
      .returning(|| futures::future::pending().boxed());
    let (_shutdown, streams) = start(Arc::new(session));

    let expected = AcceptError::Terminated(SessionError::Reset);
    for _ in 0..3 {
      let result = tokio::time::timeout(Duration::from_secs(5), streams.next())
        .await
        .expect("Accept after termination must not block");
      assert_eq!(result.unwrap_err(), expected);
    }
    assert!(streams.is_drained());
    assert_eq!(streams.drained().await, expected);
  }

  #[tokio::test]
  async fn shutdown_stops_both_loops() {
    let mut session = MockSession::new();
    session
      .expect_accept_bi()
      .returning(|| futures::future::pending().boxed());
    session
      .expect_accept_uni()
      .returning(|| futures::future::pending().boxed());
    let (shutdown, streams) = start(Arc::new(session));
    assert!(!streams.is_drained());

    shutdown.raise();
    let terminal = tokio::time::timeout(Duration::from_secs(5), streams.drained())
      .await
      .expect("Shutdown must stop the acceptance loops");
    assert_eq!(terminal, AcceptError::Terminated(SessionError::LocallyClosed));
    assert_eq!(
      streams.next().await.unwrap_err(),
      AcceptError::Terminated(SessionError::LocallyClosed)
    );
  }

  #[tokio::test]
  async fn cancelled_accept_does_not_consume_later_streams() {
    let duplex::EntangledSessions {
      listener,
      connector,
    } = duplex::channel();
    let (_shutdown, streams) = start(Arc::new(listener));

    let cancel = CancellationToken::new();
    let canceller = {
      let cancel = cancel.clone();
      tokio::task::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
      })
    };
    assert_eq!(
      streams.next_with_cancellation(&cancel).await.unwrap_err(),
      AcceptError::Cancelled
    );
    canceller.await.unwrap();

    connector.open_uni().await.unwrap();
    let fresh = CancellationToken::new();
    let stream = tokio::time::timeout(
      Duration::from_secs(5),
      streams.next_with_cancellation(&fresh),
    )
    .await
    .expect("Stream must be delivered to the next caller")
    .unwrap();
    assert_eq!(stream.direction(), StreamDirection::ReceiveOnly);
  }

  #[tokio::test]
  async fn slow_consumers_throttle_acceptance() {
    let accepted = Arc::new(AtomicUsize::new(0));
    let mut session = MockSession::new();
    {
      let accepted = accepted.clone();
      session.expect_accept_bi().returning(move || {
        accepted.fetch_add(1, Ordering::SeqCst);
        let (near, far) = tokio::io::duplex(8);
        let (recv, send) = tokio::io::split(near);
        drop(far);
        futures::future::ready(Ok((Box::new(send) as SendHalf, Box::new(recv) as RecvHalf)))
          .boxed()
      });
    }
    session
      .expect_accept_uni()
      .returning(|| futures::future::pending().boxed());
    let (shutdown, streams) = start(Arc::new(session));

    tokio::time::sleep(Duration::from_millis(50)).await;
    // Nobody has asked for a stream yet
    assert_eq!(accepted.load(Ordering::SeqCst), 0);

    streams.next().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    // The delivered stream, plus at most one accepted before the caller left
    assert!(accepted.load(Ordering::SeqCst) <= DELIVERY_QUEUE_DEPTH + 1);

    streams.next().await.unwrap();
    shutdown.raise();
  }
}
