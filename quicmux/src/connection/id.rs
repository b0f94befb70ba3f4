// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identifier for a [Connection](super::Connection), used to correlate log output
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
  pub fn new(inner: u64) -> ConnectionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }

  /// Allocates the next identifier from the process-wide generator
  pub fn next() -> ConnectionId {
    CONNECTION_IDS.next()
  }
}

impl From<u64> for ConnectionId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<ConnectionId> for u64 {
  fn from(id: ConnectionId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("ConnectionId").field(&self.inner()).finish()
  }
}

impl std::fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.inner())
  }
}

static CONNECTION_IDS: MonotonicAtomicGenerator = MonotonicAtomicGenerator::new(0);

pub struct MonotonicAtomicGenerator {
  next: AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub const fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> ConnectionId {
    ConnectionId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}
