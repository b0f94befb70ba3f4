// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-memory [Session] pairs, for exercising connections without a network

#![forbid(unused_imports, dead_code)]
use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use tokio::sync::{
  mpsc::{self, UnboundedReceiver, UnboundedSender},
  watch, Mutex,
};

use crate::{
  error::SessionError,
  session::{RecvHalf, SendHalf, Session},
};

/// Buffer size of each in-memory pipe backing a stream
pub const PIPE_BUFFER_SIZE: usize = 8192;
/// Largest datagram a [DuplexSession] accepts
pub const MAX_DATAGRAM_SIZE: usize = 1200;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DuplexSide {
  Connect,
  Listen,
}

#[derive(Debug, Clone)]
enum Closure {
  Open,
  Closed {
    by: DuplexSide,
    code: u64,
    reason: String,
  },
  Dropped {
    by: DuplexSide,
  },
}

impl Closure {
  fn error_for(&self, side: DuplexSide) -> Option<SessionError> {
    match self {
      Closure::Open => None,
      Closure::Closed { by, .. } | Closure::Dropped { by } if *by == side => {
        Some(SessionError::LocallyClosed)
      }
      Closure::Closed { code, reason, .. } => Some(SessionError::ApplicationClosed {
        code: *code,
        reason: reason.clone(),
      }),
      Closure::Dropped { .. } => Some(peer_gone()),
    }
  }
}

fn peer_gone() -> SessionError {
  SessionError::ConnectionClosed("peer session dropped".into())
}

/// Resolves with this side's view of the shared closure once it is no longer open
async fn closed(mut closure: watch::Receiver<Closure>, side: DuplexSide) -> SessionError {
  loop {
    let current = closure.borrow().error_for(side);
    if let Some(e) = current {
      return e;
    }
    if closure.changed().await.is_err() {
      return peer_gone();
    }
  }
}

/// Waits on a shared inbox until an item arrives or the session closes
fn receive_or_closed<T: Send + 'static>(
  inbox: Arc<Mutex<UnboundedReceiver<T>>>,
  closure: watch::Receiver<Closure>,
  side: DuplexSide,
) -> BoxFuture<'static, Result<T, SessionError>> {
  async move {
    let next = async {
      let mut inbox = inbox.lock().await;
      inbox.recv().await
    };
    tokio::select! {
      biased;
      e = closed(closure, side) => Err(e),
      item = next => item.ok_or_else(peer_gone),
    }
  }
  .boxed()
}

/// One end of an in-memory session pair produced by [channel]
///
/// Streams are `tokio::io::duplex` pipes; closing the session does not
/// interrupt streams that were already handed out.
pub struct DuplexSession {
  side: DuplexSide,
  local_addr: SocketAddr,
  remote_addr: SocketAddr,
  datagrams_enabled: bool,
  bi_to_remote: UnboundedSender<(SendHalf, RecvHalf)>,
  bi_incoming: Arc<Mutex<UnboundedReceiver<(SendHalf, RecvHalf)>>>,
  uni_to_remote: UnboundedSender<RecvHalf>,
  uni_incoming: Arc<Mutex<UnboundedReceiver<RecvHalf>>>,
  datagrams_to_remote: UnboundedSender<Bytes>,
  datagrams_incoming: Arc<Mutex<UnboundedReceiver<Bytes>>>,
  closure: Arc<watch::Sender<Closure>>,
}

impl std::fmt::Debug for DuplexSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DuplexSession")
      .field("side", &self.side)
      .field("local_addr", &self.local_addr)
      .field("remote_addr", &self.remote_addr)
      .finish_non_exhaustive()
  }
}

impl DuplexSession {
  pub fn side(&self) -> DuplexSide {
    self.side
  }

  fn check_open(&self) -> Result<(), SessionError> {
    match self.closure.borrow().error_for(self.side) {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

impl Drop for DuplexSession {
  fn drop(&mut self) {
    let side = self.side;
    self.closure.send_modify(|closure| {
      if let Closure::Open = closure {
        *closure = Closure::Dropped { by: side };
      }
    });
  }
}

impl Session for DuplexSession {
  fn accept_bi(&self) -> BoxFuture<'static, Result<(SendHalf, RecvHalf), SessionError>> {
    receive_or_closed(
      self.bi_incoming.clone(),
      self.closure.subscribe(),
      self.side,
    )
  }

  fn accept_uni(&self) -> BoxFuture<'static, Result<RecvHalf, SessionError>> {
    receive_or_closed(
      self.uni_incoming.clone(),
      self.closure.subscribe(),
      self.side,
    )
  }

  fn open_bi(&self) -> BoxFuture<'static, Result<(SendHalf, RecvHalf), SessionError>> {
    let opened = self.check_open().and_then(|_| {
      let (local, remote) = tokio::io::duplex(PIPE_BUFFER_SIZE);
      let (local_recv, local_send) = tokio::io::split(local);
      let (remote_recv, remote_send) = tokio::io::split(remote);
      self
        .bi_to_remote
        .send((Box::new(remote_send) as SendHalf, Box::new(remote_recv) as RecvHalf))
        .map_err(|_| peer_gone())?;
      Ok((Box::new(local_send) as SendHalf, Box::new(local_recv) as RecvHalf))
    });
    futures::future::ready(opened).boxed()
  }

  fn open_uni(&self) -> BoxFuture<'static, Result<SendHalf, SessionError>> {
    let opened = self.check_open().and_then(|_| {
      let (local, remote) = tokio::io::duplex(PIPE_BUFFER_SIZE);
      self
        .uni_to_remote
        .send(Box::new(remote) as RecvHalf)
        .map_err(|_| peer_gone())?;
      Ok(Box::new(local) as SendHalf)
    });
    futures::future::ready(opened).boxed()
  }

  fn close(&self, code: u64, reason: &[u8]) -> Result<(), SessionError> {
    let side = self.side;
    let reason = String::from_utf8_lossy(reason).into_owned();
    self.closure.send_modify(move |closure| {
      if let Closure::Open = closure {
        *closure = Closure::Closed {
          by: side,
          code,
          reason,
        };
      }
    });
    Ok(())
  }

  fn local_addr(&self) -> Option<SocketAddr> {
    Some(self.local_addr)
  }

  fn remote_addr(&self) -> SocketAddr {
    self.remote_addr
  }

  fn read_datagram(&self) -> BoxFuture<'static, Result<Bytes, SessionError>> {
    if !self.datagrams_enabled {
      return futures::future::ready(Err(SessionError::DatagramsUnsupported)).boxed();
    }
    receive_or_closed(
      self.datagrams_incoming.clone(),
      self.closure.subscribe(),
      self.side,
    )
  }

  fn send_datagram(&self, data: Bytes) -> Result<(), SessionError> {
    self.check_open()?;
    if !self.datagrams_enabled {
      return Err(SessionError::DatagramsUnsupported);
    }
    if data.len() > MAX_DATAGRAM_SIZE {
      return Err(SessionError::DatagramTooLarge);
    }
    // Unreliable delivery; a vanished peer simply never reads it
    let _ = self.datagrams_to_remote.send(data);
    Ok(())
  }

  fn supports_datagrams(&self) -> bool {
    self.datagrams_enabled
  }
}

/// Two entangled [DuplexSession]s; streams opened on one are accepted on the other
pub struct EntangledSessions {
  pub listener: DuplexSession,
  pub connector: DuplexSession,
}

impl From<EntangledSessions> for (DuplexSession, DuplexSession) {
  fn from(sessions: EntangledSessions) -> Self {
    (sessions.listener, sessions.connector)
  }
}

pub fn channel() -> EntangledSessions {
  channel_with_datagrams(true)
}

/// Produces an entangled session pair, optionally negotiating datagram support
pub fn channel_with_datagrams(datagrams_enabled: bool) -> EntangledSessions {
  let listen_addr = SocketAddr::from(([127, 0, 0, 1], 4433));
  let connect_addr = SocketAddr::from(([127, 0, 0, 1], 50000));
  let (closure, _) = watch::channel(Closure::Open);
  let closure = Arc::new(closure);

  let (listener_bi_up, connector_bi_down) = mpsc::unbounded_channel();
  let (connector_bi_up, listener_bi_down) = mpsc::unbounded_channel();
  let (listener_uni_up, connector_uni_down) = mpsc::unbounded_channel();
  let (connector_uni_up, listener_uni_down) = mpsc::unbounded_channel();
  let (listener_dgram_up, connector_dgram_down) = mpsc::unbounded_channel();
  let (connector_dgram_up, listener_dgram_down) = mpsc::unbounded_channel();

  let listener = DuplexSession {
    side: DuplexSide::Listen,
    local_addr: listen_addr,
    remote_addr: connect_addr,
    datagrams_enabled,
    bi_to_remote: listener_bi_up,
    bi_incoming: Arc::new(Mutex::new(listener_bi_down)),
    uni_to_remote: listener_uni_up,
    uni_incoming: Arc::new(Mutex::new(listener_uni_down)),
    datagrams_to_remote: listener_dgram_up,
    datagrams_incoming: Arc::new(Mutex::new(listener_dgram_down)),
    closure: closure.clone(),
  };
  let connector = DuplexSession {
    side: DuplexSide::Connect,
    local_addr: connect_addr,
    remote_addr: listen_addr,
    datagrams_enabled,
    bi_to_remote: connector_bi_up,
    bi_incoming: Arc::new(Mutex::new(connector_bi_down)),
    uni_to_remote: connector_uni_up,
    uni_incoming: Arc::new(Mutex::new(connector_uni_down)),
    datagrams_to_remote: connector_dgram_up,
    datagrams_incoming: Arc::new(Mutex::new(connector_dgram_down)),
    closure,
  };
  EntangledSessions {
    listener,
    connector,
  }
}
