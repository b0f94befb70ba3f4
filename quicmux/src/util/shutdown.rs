// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// A one-shot shutdown trigger, safe to raise from any number of callers
///
/// Only the first call to [ShutdownSignal::raise] has an effect; observers
/// hold a [ShutdownListener] and cannot raise the signal themselves.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
  raised: AtomicBool,
  token: CancellationToken,
}

impl ShutdownSignal {
  pub fn new() -> Self {
    Self::default()
  }

  /// Raises the signal, returning `true` only for the call that raised it
  pub fn raise(&self) -> bool {
    let won = self
      .raised
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok();
    if won {
      self.token.cancel();
    }
    won
  }

  pub fn is_raised(&self) -> bool {
    self.raised.load(Ordering::Acquire)
  }

  pub fn listener(&self) -> ShutdownListener {
    ShutdownListener {
      token: self.token.clone(),
    }
  }
}

/// Observes a [ShutdownSignal] without the ability to raise it
///
/// Child tokens can be produced from it, allowing a group of tasks to be
/// stopped together either by the signal or by one of their own members.
#[derive(Debug, Clone)]
#[repr(transparent)]
pub struct ShutdownListener {
  token: CancellationToken,
}

impl ShutdownListener {
  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }
}
